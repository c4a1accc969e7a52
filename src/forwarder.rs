// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ForwardedReport, Message, Outbound, Report, SiteId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// Relays reports to every peer this site can still reach.
///
/// Sends are fire-and-forget: the forwarder only queues `Outbound::Send`s,
/// and whoever drains them absorbs delivery failures. Redelivery comes from
/// gossip, not retries: every time a site learns something new about a
/// reporter it relays the improved report again.
///
/// The forwarder remembers the best version of each reporter's report it has
/// handed to each peer, and skips sends that would tell a peer nothing new.
/// It also never sends a report to its own author or back to the site it was
/// just relayed from.
#[derive(Clone, Debug)]
pub struct Forwarder {
    id: SiteId,
    sent: BTreeMap<(SiteId, SiteId), Report>,
}

impl Forwarder {
    pub fn new(id: SiteId) -> Self {
        Forwarder {
            id,
            sent: BTreeMap::new(),
        }
    }

    /// Queues `report`, tagged with this site as relay, for every site in
    /// `reachable` that might not have it yet. `relayed_from` names the site
    /// the report just arrived from, if any.
    pub fn broadcast(
        &mut self,
        report: &Report,
        reachable: &BTreeSet<SiteId>,
        relayed_from: Option<SiteId>,
        outgoing: &mut Vec<Outbound>,
    ) {
        let author = report.reporting_site;
        for peer in reachable.iter().cloned() {
            if peer == self.id || peer == author || Some(peer) == relayed_from {
                continue;
            }
            if let Some(prev) = self.sent.get(&(peer, author)) {
                if prev.subsumes(report) {
                    trace!(to = %peer, reporter = %author, "peer already has this report");
                    continue;
                }
            }
            self.record(peer, report);
            outgoing.push(Outbound::Send {
                to: peer,
                message: Message::relay(ForwardedReport::new(self.id, report.clone())),
            });
        }
    }

    /// Queues this site's decision-bearing report once to every reachable
    /// survivor.
    pub fn broadcast_decision(
        &mut self,
        report: &Report,
        reachable: &BTreeSet<SiteId>,
        outgoing: &mut Vec<Outbound>,
    ) {
        debug_assert!(report.is_decided());
        for peer in reachable.iter().cloned() {
            if peer == self.id {
                continue;
            }
            self.record(peer, report);
            outgoing.push(Outbound::Send {
                to: peer,
                message: Message::Decision(report.clone()),
            });
        }
    }

    fn record(&mut self, peer: SiteId, report: &Report) {
        let key = (peer, report.reporting_site);
        let best = match self.sent.get(&key) {
            Some(prev) => prev.join(report),
            None => report.clone(),
        };
        self.sent.insert(key, best);
    }
}
