// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::ids::fmt_sites;
use crate::{
    ForwardedReport, Forwarder, LogicalTime, Message, Report, ReportStore, SafeTxnOracle,
    SiteId, Suspicion, TxnId,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, trace, warn};

// The mailbox is an explicit state machine rather than an async task: every
// input is an `Event`, every output is pushed onto a caller-supplied queue,
// and the whole thing can be cloned and driven step by step from tests.
//
// A mailbox lives for exactly one round. It starts out collecting and ends
// decided; nothing moves it back. The `Arbiter` opens a fresh one when the
// next failure shows up.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Collecting, // Gathering reports until every survivor has been heard from.
    Decided,    // Finished; the decision is fixed.
}

/// Inputs to a mailbox, delivered one at a time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// This site's link monitor lost its connection to a peer.
    Suspect(Suspicion),
    /// A report arrived, directly from its author or through a relay.
    Inbound(ForwardedReport),
    /// Time passed with nothing else happening.
    Tick,
}

/// Outputs from a mailbox, for the driver to act on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Hand `message` to the transport for `to`. Best effort.
    Send { to: SiteId, message: Message },
    /// The round is decided; tell the view manager.
    Decided(Decision),
}

/// The outcome of a round, as handed to the view manager.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Decision {
    pub survivors: BTreeSet<SiteId>,
    pub failed: BTreeSet<SiteId>,
    /// For each failed site, the highest txn id any survivor saw complete.
    /// Work above it is undetermined.
    pub safe_txn_ids: BTreeMap<SiteId, TxnId>,
}

/// One site's agreement mailbox for one round.
///
/// The mailbox folds this site's own suspicions and every report it hears
/// into its `ReportStore`, and gossips whatever it learns to the peers it can
/// still reach. It decides once every site not known to have failed has sent
/// a report naming all the failures known here. Failures are trusted as soon
/// as anyone credible reports them, and survivors are whatever is left, so
/// failed and surviving sets can never overlap.
///
/// There is no timeout. A mailbox that cannot hear from some survivor stays
/// collecting until someone else resolves the situation.
#[derive(Clone, Debug)]
pub struct Mailbox {
    pub id: SiteId,
    membership: BTreeSet<SiteId>,
    stage: Stage,
    store: ReportStore,
    // Failures this site saw itself, as opposed to ones it heard about.
    witnessed: BTreeSet<SiteId>,
    forwarder: Forwarder,
    decision: Option<Decision>,
    heartbeat_interval: u64,
    idle_ticks: u64,
    clock: LogicalTime,
}

impl Mailbox {
    pub fn new(id: SiteId, membership: BTreeSet<SiteId>, heartbeat_interval: u64) -> Self {
        Mailbox {
            id,
            membership,
            stage: Stage::Collecting,
            store: ReportStore::new(),
            witnessed: BTreeSet::new(),
            forwarder: Forwarder::new(id),
            decision: None,
            heartbeat_interval,
            idle_ticks: 0,
            clock: LogicalTime::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn is_decided(&self) -> bool {
        self.stage == Stage::Decided
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn membership(&self) -> &BTreeSet<SiteId> {
        &self.membership
    }

    pub fn store(&self) -> &ReportStore {
        &self.store
    }

    pub fn witnessed(&self) -> &BTreeSet<SiteId> {
        &self.witnessed
    }

    /// The latest logical time this mailbox has seen.
    pub fn now(&self) -> LogicalTime {
        self.clock
    }

    /// Every failure known here: what the stored reports say plus what this
    /// site saw itself.
    pub fn known_failed(&self) -> BTreeSet<SiteId> {
        let mut failed = self.store.union_failed();
        failed.extend(self.witnessed.iter().cloned());
        failed
    }

    /// Sites this site still believes are up, itself included.
    pub fn reachable(&self) -> BTreeSet<SiteId> {
        let failed = self.own_failed();
        self.membership.difference(&failed).cloned().collect()
    }

    /// Survivors whose report has not arrived yet, or does not yet cover
    /// every known failure.
    pub fn outstanding(&self) -> BTreeSet<SiteId> {
        let failed = self.known_failed();
        self.membership
            .difference(&failed)
            .filter(|s| match self.store.get(**s) {
                Some(r) => !r.covers(&failed),
                None => true,
            })
            .cloned()
            .collect()
    }

    // What goes in this site's own report. A site never lists itself as
    // failed even when a peer does.
    fn own_failed(&self) -> BTreeSet<SiteId> {
        let mut failed = self.known_failed();
        failed.remove(&self.id);
        failed
    }

    pub fn step(
        &mut self,
        event: Event,
        oracle: &dyn SafeTxnOracle,
        outgoing: &mut Vec<Outbound>,
    ) {
        if self.stage == Stage::Decided {
            trace!(site = %self.id, ?event, "round already decided, ignoring");
            return;
        }
        match event {
            Event::Suspect(s) => self.suspect(s, oracle, outgoing),
            Event::Inbound(fwd) => self.receive(fwd, oracle, outgoing),
            Event::Tick => self.tick(outgoing),
        }
    }

    pub fn step_all<I>(&mut self, events: I, oracle: &dyn SafeTxnOracle, outgoing: &mut Vec<Outbound>)
    where
        I: IntoIterator<Item = Event>,
    {
        for ev in events {
            self.step(ev, oracle, outgoing);
        }
    }

    fn suspect(&mut self, s: Suspicion, oracle: &dyn SafeTxnOracle, outgoing: &mut Vec<Outbound>) {
        if s.site == self.id || !self.membership.contains(&s.site) {
            debug!(site = %self.id, suspect = %s.site, "suspicion outside membership, ignoring");
            return;
        }
        if s.observed_at > self.clock {
            self.clock = s.observed_at;
        }
        let already = self.known_failed().contains(&s.site);
        self.witnessed.insert(s.site);
        if already {
            debug!(site = %self.id, suspect = %s.site, "failure already known");
            return;
        }
        info!(site = %self.id, suspect = %s.site, at = %s.observed_at, "suspecting peer");
        self.progress();
        self.refresh_own_report(oracle, outgoing);
        self.check_convergence(outgoing);
    }

    fn receive(
        &mut self,
        fwd: ForwardedReport,
        oracle: &dyn SafeTxnOracle,
        outgoing: &mut Vec<Outbound>,
    ) {
        let ForwardedReport {
            reporting_hsid: relay,
            report,
        } = fwd;
        if let Err(e) = report.validate() {
            warn!(site = %self.id, from = %relay, error = %e, "dropping malformed report");
            return;
        }
        if report.membership() != self.membership {
            warn!(
                site = %self.id,
                from = %relay,
                reporter = %report.reporting_site,
                "dropping report for a different membership"
            );
            return;
        }
        let reporter = report.reporting_site;
        if !self.store.merge(report) {
            return;
        }
        debug!(
            site = %self.id,
            reporter = %reporter,
            via = %relay,
            failed = %fmt_sites(self.store.union_failed().iter()),
            "merged report"
        );
        self.progress();
        if reporter != self.id {
            let reachable = self.reachable();
            if let Some(best) = self.store.get(reporter).cloned() {
                self.forwarder
                    .broadcast(&best, &reachable, Some(relay), outgoing);
                if best.is_decided() && !self.known_failed().contains(&reporter) {
                    self.adopt(best, outgoing);
                    return;
                }
            }
        }
        self.refresh_own_report(oracle, outgoing);
        self.check_convergence(outgoing);
    }

    // A decided report is frozen, so waiting for it to cover anything more
    // never ends. Two sites that decide a round decide it alike, so the
    // peer's decision is taken as this site's. Failures seen here that it
    // leaves out are the next round's business.
    fn adopt(&mut self, decided: Report, outgoing: &mut Vec<Outbound>) {
        let decision = Decision {
            survivors: decided.survivors,
            failed: decided.failed,
            safe_txn_ids: decided.safe_txn_ids,
        };
        info!(
            site = %self.id,
            from = %decided.reporting_site,
            survivors = %fmt_sites(decision.survivors.iter()),
            failed = %fmt_sites(decision.failed.iter()),
            "adopting decision reached by peer"
        );
        if decision.failed.contains(&self.id) {
            warn!(site = %self.id, "this site was declared failed");
        }
        self.stage = Stage::Decided;
        self.decision = Some(decision.clone());
        outgoing.push(Outbound::Decided(decision));
    }

    fn tick(&mut self, outgoing: &mut Vec<Outbound>) {
        self.clock = self.clock.next();
        self.idle_ticks += 1;
        if self.heartbeat_interval == 0 || self.idle_ticks % self.heartbeat_interval != 0 {
            return;
        }
        trace!(site = %self.id, idle = self.idle_ticks, "still collecting, sending heartbeats");
        for peer in self.reachable() {
            if peer == self.id {
                continue;
            }
            outgoing.push(Outbound::Send {
                to: peer,
                message: Message::Heartbeat {
                    from: self.id,
                    at: self.clock,
                },
            });
        }
    }

    fn progress(&mut self) {
        self.idle_ticks = 0;
    }

    // Rebuilds this site's own report from everything known, asking the
    // oracle for each failed site's watermark, and broadcasts it if it says
    // anything new.
    fn refresh_own_report(&mut self, oracle: &dyn SafeTxnOracle, outgoing: &mut Vec<Outbound>) {
        let failed = self.own_failed();
        let marks = failed
            .iter()
            .map(|s| (*s, oracle.highest_complete_txn_id(*s)))
            .collect();
        let own = Report::new(self.id, &self.membership, failed, marks);
        if !self.store.merge(own) {
            return;
        }
        if let Some(best) = self.store.get(self.id).cloned() {
            trace!(site = %self.id, failed = %fmt_sites(best.failed.iter()), "broadcasting own report");
            let reachable = self.reachable();
            self.forwarder.broadcast(&best, &reachable, None, outgoing);
        }
    }

    fn check_convergence(&mut self, outgoing: &mut Vec<Outbound>) {
        let failed = self.known_failed();
        if failed.is_empty() {
            return;
        }
        let outstanding = self.outstanding();
        if !outstanding.is_empty() {
            trace!(site = %self.id, waiting = %fmt_sites(outstanding.iter()), "not converged");
            return;
        }
        self.decide(failed, outgoing);
    }

    fn decide(&mut self, failed: BTreeSet<SiteId>, outgoing: &mut Vec<Outbound>) {
        let survivors: BTreeSet<SiteId> = self.membership.difference(&failed).cloned().collect();
        let safe_txn_ids = self.store.max_watermarks(&failed);
        let decision = Decision {
            survivors: survivors.clone(),
            failed: failed.clone(),
            safe_txn_ids: safe_txn_ids.clone(),
        };
        info!(
            site = %self.id,
            survivors = %fmt_sites(survivors.iter()),
            failed = %fmt_sites(failed.iter()),
            "agreement reached"
        );
        self.stage = Stage::Decided;
        self.decision = Some(decision.clone());

        if failed.contains(&self.id) {
            // A decision excluding this site cannot be carried in a report
            // by this site; peers decide without it.
            warn!(site = %self.id, "this site was declared failed");
        } else {
            let report = Report {
                reporting_site: self.id,
                failed,
                survivors: survivors.clone(),
                safe_txn_ids,
                decision: Some(survivors.clone()),
            };
            self.store.merge(report.clone());
            self.forwarder
                .broadcast_decision(&report, &survivors, outgoing);
        }
        outgoing.push(Outbound::Decided(decision));
    }
}
