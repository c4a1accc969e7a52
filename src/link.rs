// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{LogicalTime, SiteId};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A local, unilateral observation that `site` became unreachable.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Suspicion {
    pub site: SiteId,
    pub observed_at: LogicalTime,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

#[derive(Clone, Copy, Debug)]
struct Link {
    state: LinkState,
    last_heard: LogicalTime,
}

/// Watches the point-to-point links from this site to each of its peers.
///
/// The owning transport tells the monitor whenever a frame arrives from a
/// peer (`heard_from`) and whenever a connection drops (`disconnected`). The
/// first drop of a link raises exactly one suspicion, which the caller hands
/// to its mailbox; a later reconnect does not take it back. Reinstating a peer is the business of whoever manages
/// membership, by calling `rearm` once a new view is in place.
#[derive(Clone, Debug)]
pub struct LinkMonitor {
    id: SiteId,
    clock: LogicalTime,
    links: BTreeMap<SiteId, Link>,
}

impl LinkMonitor {
    pub fn new(id: SiteId, peers: impl IntoIterator<Item = SiteId>) -> Self {
        let links = peers
            .into_iter()
            .filter(|p| *p != id)
            .map(|p| {
                (
                    p,
                    Link {
                        state: LinkState::Up,
                        last_heard: LogicalTime::default(),
                    },
                )
            })
            .collect();
        LinkMonitor {
            id,
            clock: LogicalTime::default(),
            links,
        }
    }

    pub fn now(&self) -> LogicalTime {
        self.clock
    }

    fn observe(&mut self) -> LogicalTime {
        self.clock = self.clock.next();
        self.clock
    }

    /// Records that something arrived from `peer`.
    pub fn heard_from(&mut self, peer: SiteId) {
        let now = self.observe();
        if let Some(link) = self.links.get_mut(&peer) {
            link.last_heard = now;
        }
    }

    /// Records that the connection to `peer` was lost. Returns the suspicion
    /// raised, or `None` if the link was already down or is not ours.
    pub fn disconnected(&mut self, peer: SiteId) -> Option<Suspicion> {
        let now = self.observe();
        let link = self.links.get_mut(&peer)?;
        if link.state == LinkState::Down {
            debug!(site = %self.id, peer = %peer, "link already down");
            return None;
        }
        link.state = LinkState::Down;
        let suspicion = Suspicion {
            site: peer,
            observed_at: now,
        };
        info!(site = %self.id, peer = %peer, at = %now, "lost link to peer");
        Some(suspicion)
    }

    pub fn state(&self, peer: SiteId) -> Option<LinkState> {
        self.links.get(&peer).map(|l| l.state)
    }

    pub fn last_heard(&self, peer: SiteId) -> Option<LogicalTime> {
        self.links.get(&peer).map(|l| l.last_heard)
    }

    /// Installs a new membership view: evicted peers are forgotten, and
    /// remaining peers are watched afresh.
    pub fn rearm(&mut self, members: impl IntoIterator<Item = SiteId>) {
        let now = self.clock;
        let id = self.id;
        self.links = members
            .into_iter()
            .filter(|p| *p != id)
            .map(|p| {
                (
                    p,
                    Link {
                        state: LinkState::Up,
                        last_heard: now,
                    },
                )
            })
            .collect();
    }

    pub fn peers(&self) -> impl Iterator<Item = SiteId> + '_ {
        self.links.keys().cloned()
    }
}
