// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::ids::fmt_sites;
use crate::{
    AgreementConfig, Decision, Event, ForwardedReport, Mailbox, Message, Outbound,
    SafeTxnOracle, SiteId, Suspicion,
};
use std::collections::BTreeSet;
use std::mem;
use tracing::{debug, info, trace, warn};

/// Runs agreement rounds back to back for one site.
///
/// Between rounds the arbiter holds no mailbox. The first suspicion or report
/// for the current membership opens one; when it decides, the membership
/// shrinks to the decided survivors and the next round starts empty.
///
/// Reports are routed by the membership they were written against:
///
///   - the current membership: delivered to the open round;
///   - a strict subset of it: from a peer that has already decided and moved
///     on. Held back and replayed once this site catches up;
///   - anything else: left over from an earlier round, and dropped.
#[derive(Clone, Debug)]
pub struct Arbiter {
    pub id: SiteId,
    config: AgreementConfig,
    membership: BTreeSet<SiteId>,
    round: u64,
    mailbox: Option<Mailbox>,
    deferred: Vec<ForwardedReport>,
    history: Vec<Decision>,
}

impl Arbiter {
    pub fn new(id: SiteId, membership: BTreeSet<SiteId>, config: AgreementConfig) -> Self {
        Arbiter {
            id,
            config,
            membership,
            round: 0,
            mailbox: None,
            deferred: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn membership(&self) -> &BTreeSet<SiteId> {
        &self.membership
    }

    /// Number of rounds decided so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.history
    }

    pub fn mailbox(&self) -> Option<&Mailbox> {
        self.mailbox.as_ref()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// False once a decision has excluded this site.
    pub fn is_member(&self) -> bool {
        self.membership.contains(&self.id)
    }

    /// Feeds a wire message to the arbiter. Heartbeats carry nothing for the
    /// mailbox and stop here.
    pub fn handle(&mut self, message: Message, oracle: &dyn SafeTxnOracle, outgoing: &mut Vec<Outbound>) {
        let kind = message.kind();
        let from = message.sender();
        match message.into_forwarded() {
            Some(fwd) => self.step(Event::Inbound(fwd), oracle, outgoing),
            None => trace!(site = %self.id, from = %from, kind, "no report in message"),
        }
    }

    pub fn step(&mut self, event: Event, oracle: &dyn SafeTxnOracle, outgoing: &mut Vec<Outbound>) {
        if !self.is_member() {
            trace!(site = %self.id, "no longer a member, ignoring {:?}", event);
            return;
        }
        match event {
            Event::Suspect(s) => {
                if s.site == self.id || !self.membership.contains(&s.site) {
                    debug!(site = %self.id, suspect = %s.site, "suspected site not a member");
                    return;
                }
                self.open().step(Event::Suspect(s), oracle, outgoing);
            }
            Event::Inbound(fwd) => {
                if let Err(e) = fwd.report.validate() {
                    warn!(site = %self.id, from = %fwd.reporting_hsid, error = %e, "dropping malformed report");
                    return;
                }
                let theirs = fwd.report.membership();
                if theirs == self.membership {
                    self.open().step(Event::Inbound(fwd), oracle, outgoing);
                } else if theirs.is_subset(&self.membership) {
                    self.defer(fwd);
                    return;
                } else {
                    debug!(
                        site = %self.id,
                        reporter = %fwd.report.reporting_site,
                        membership = %fmt_sites(theirs.iter()),
                        "dropping report from an earlier round"
                    );
                    return;
                }
            }
            Event::Tick => match &mut self.mailbox {
                Some(mb) => mb.step(Event::Tick, oracle, outgoing),
                None => return,
            },
        }
        self.conclude(oracle, outgoing);
    }

    fn open(&mut self) -> &mut Mailbox {
        let id = self.id;
        let round = self.round;
        let membership = &self.membership;
        let interval = self.config.heartbeat_interval;
        self.mailbox.get_or_insert_with(|| {
            info!(site = %id, round, members = %fmt_sites(membership.iter()), "opening agreement round");
            Mailbox::new(id, membership.clone(), interval)
        })
    }

    fn defer(&mut self, fwd: ForwardedReport) {
        if self.deferred.len() >= self.config.defer_limit {
            warn!(
                site = %self.id,
                reporter = %fwd.report.reporting_site,
                limit = self.config.defer_limit,
                "too many reports held for a later round, dropping"
            );
            return;
        }
        debug!(site = %self.id, reporter = %fwd.report.reporting_site, "holding report for a later round");
        self.deferred.push(fwd);
    }

    // Closes the open round if it has decided, installs the new membership,
    // and replays anything that was waiting for it. A decision adopted from a
    // peer may leave out failures this site saw itself; those are suspected
    // afresh in the next round.
    fn conclude(&mut self, oracle: &dyn SafeTxnOracle, outgoing: &mut Vec<Outbound>) {
        let (decision, carried) = match &self.mailbox {
            Some(mb) => match mb.decision() {
                Some(d) => {
                    let carried: Vec<Suspicion> = mb
                        .witnessed()
                        .difference(&d.failed)
                        .map(|s| Suspicion {
                            site: *s,
                            observed_at: mb.now(),
                        })
                        .collect();
                    (d.clone(), carried)
                }
                None => return,
            },
            None => return,
        };
        self.mailbox = None;
        self.membership = decision.survivors.clone();
        self.round += 1;
        self.history.push(decision);
        info!(
            site = %self.id,
            round = self.round,
            members = %fmt_sites(self.membership.iter()),
            "installed new membership"
        );
        for s in carried {
            debug!(site = %self.id, suspect = %s.site, "carrying suspicion into the next round");
            self.step(Event::Suspect(s), oracle, outgoing);
        }
        for fwd in mem::take(&mut self.deferred) {
            self.step(Event::Inbound(fwd), oracle, outgoing);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LogicalTime, Report, TxnId};
    use std::collections::BTreeMap;

    fn sites(ids: &[i64]) -> BTreeSet<SiteId> {
        ids.iter().map(|i| SiteId(*i)).collect()
    }

    fn report(reporter: i64, members: &[i64], failed: &[i64]) -> Message {
        let marks: BTreeMap<SiteId, TxnId> = failed.iter().map(|s| (SiteId(*s), TxnId(1))).collect();
        Message::Report(Report::new(
            SiteId(reporter),
            &sites(members),
            sites(failed),
            marks,
        ))
    }

    fn suspect(site: i64) -> Event {
        Event::Suspect(Suspicion {
            site: SiteId(site),
            observed_at: LogicalTime(1),
        })
    }

    fn oracle() -> impl SafeTxnOracle {
        |_s: SiteId| TxnId(1)
    }

    fn arbiter(id: i64, members: &[i64]) -> Arbiter {
        let mut cfg = AgreementConfig::default();
        cfg.heartbeat_interval = 0;
        Arbiter::new(SiteId(id), sites(members), cfg)
    }

    #[test]
    fn subsequent_failures_run_separate_rounds() {
        let o = oracle();
        let mut out = vec![];
        let mut a = arbiter(1, &[1, 2, 3, 4]);
        a.step(suspect(4), &o, &mut out);
        a.handle(report(2, &[1, 2, 3, 4], &[4]), &o, &mut out);
        a.handle(report(3, &[1, 2, 3, 4], &[4]), &o, &mut out);
        assert_eq!(a.round(), 1);
        assert_eq!(a.membership(), &sites(&[1, 2, 3]));
        assert!(a.mailbox().is_none());

        a.step(suspect(3), &o, &mut out);
        a.handle(report(2, &[1, 2, 3], &[3]), &o, &mut out);
        assert_eq!(a.round(), 2);
        assert_eq!(a.membership(), &sites(&[1, 2]));
        let failed: Vec<_> = a.decisions().iter().map(|d| d.failed.clone()).collect();
        assert_eq!(failed, vec![sites(&[4]), sites(&[3])]);
    }

    #[test]
    fn next_round_reports_wait_for_this_round() {
        let o = oracle();
        let mut out = vec![];
        let mut a = arbiter(1, &[1, 2, 3, 4]);
        a.step(suspect(4), &o, &mut out);
        a.handle(report(2, &[1, 2, 3, 4], &[4]), &o, &mut out);
        // Site 2 already decided round one and now reports site 3 down.
        a.handle(report(2, &[1, 2, 3], &[3]), &o, &mut out);
        assert_eq!(a.deferred_len(), 1);
        assert_eq!(a.round(), 0);

        a.handle(report(3, &[1, 2, 3, 4], &[4]), &o, &mut out);
        assert_eq!(a.round(), 2);
        assert_eq!(a.deferred_len(), 0);
        assert_eq!(a.membership(), &sites(&[1, 2]));
        let decided = out
            .iter()
            .filter(|o| matches!(o, Outbound::Decided(_)))
            .count();
        assert_eq!(decided, 2);
    }

    #[test]
    fn leftovers_from_earlier_rounds_are_dropped() {
        let o = oracle();
        let mut out = vec![];
        let mut a = arbiter(1, &[1, 2, 3]);
        a.step(suspect(3), &o, &mut out);
        a.handle(report(2, &[1, 2, 3], &[3]), &o, &mut out);
        assert_eq!(a.round(), 1);
        out.clear();

        a.handle(report(2, &[1, 2, 3], &[3]), &o, &mut out);
        a.handle(report(9, &[1, 2, 9], &[9]), &o, &mut out);
        a.step(suspect(3), &o, &mut out);
        a.step(suspect(1), &o, &mut out);
        a.step(Event::Tick, &o, &mut out);
        assert!(out.is_empty());
        assert!(a.mailbox().is_none());
        assert_eq!(a.deferred_len(), 0);
    }

    #[test]
    fn deferral_is_bounded() {
        let o = oracle();
        let mut out = vec![];
        let mut cfg = AgreementConfig::default();
        cfg.defer_limit = 1;
        let mut a = Arbiter::new(SiteId(1), sites(&[1, 2, 3, 4]), cfg);
        a.handle(report(2, &[1, 2, 3], &[3]), &o, &mut out);
        a.handle(report(3, &[1, 2, 3], &[2]), &o, &mut out);
        assert_eq!(a.deferred_len(), 1);
    }

    #[test]
    fn heartbeats_do_not_open_rounds() {
        let o = oracle();
        let mut out = vec![];
        let mut a = arbiter(1, &[1, 2, 3]);
        a.handle(
            Message::Heartbeat {
                from: SiteId(2),
                at: LogicalTime(4),
            },
            &o,
            &mut out,
        );
        assert!(a.mailbox().is_none());
        assert!(out.is_empty());
    }

    #[test]
    fn evicted_site_stops_participating() {
        let o = oracle();
        let mut out = vec![];
        let mut a = arbiter(1, &[1, 2, 3]);
        let marks: BTreeMap<SiteId, TxnId> = vec![(SiteId(1), TxnId(1))].into_iter().collect();
        for r in &[2, 3] {
            a.handle(
                Message::Report(Report::new(SiteId(*r), &sites(&[1, 2, 3]), sites(&[1]), marks.clone())),
                &o,
                &mut out,
            );
        }
        assert_eq!(a.round(), 1);
        assert!(!a.is_member());
        out.clear();
        a.handle(report(2, &[2, 3], &[3]), &o, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn malformed_reports_are_not_held_back() {
        let o = oracle();
        let mut out = vec![];
        let mut a = arbiter(1, &[1, 2, 3, 4]);
        // Written against {1,2,3} but missing the watermark for 3.
        let unmarked = Report::new(SiteId(2), &sites(&[1, 2, 3]), sites(&[3]), BTreeMap::new());
        a.handle(Message::Report(unmarked), &o, &mut out);
        assert_eq!(a.deferred_len(), 0);
        assert!(a.mailbox().is_none());
        assert!(out.is_empty());
    }

    #[test]
    fn peer_decision_closes_round_and_late_suspicion_carries_over() {
        let o = oracle();
        let mut out = vec![];
        let mut a = arbiter(1, &[1, 2, 3, 4]);
        a.step(suspect(4), &o, &mut out);
        a.step(suspect(3), &o, &mut out);
        // Site 2 decided on 4 alone and has moved on to {1,2,3}.
        let marks: BTreeMap<SiteId, TxnId> = vec![(SiteId(4), TxnId(1))].into_iter().collect();
        let mut decided = Report::new(SiteId(2), &sites(&[1, 2, 3, 4]), sites(&[4]), marks);
        decided.decision = Some(decided.survivors.clone());
        a.handle(Message::Decision(decided), &o, &mut out);
        assert_eq!(a.round(), 1);
        assert_eq!(a.membership(), &sites(&[1, 2, 3]));
        let mb = a.mailbox().expect("suspicion of 3 should open the next round");
        assert_eq!(mb.witnessed(), &sites(&[3]));

        a.handle(report(2, &[1, 2, 3], &[3]), &o, &mut out);
        assert_eq!(a.round(), 2);
        assert_eq!(a.membership(), &sites(&[1, 2]));
        let failed: Vec<_> = a.decisions().iter().map(|d| d.failed.clone()).collect();
        assert_eq!(failed, vec![sites(&[4]), sites(&[3])]);
    }
}
