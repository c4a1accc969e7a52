// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{AgreementConfig, Decision, Message, SendError, SiteId, TxnId};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Answers "how far is `site`'s work known to be durably complete here?".
///
/// Answers for a given site must not go down within a round. An oracle that
/// cannot answer yet should return `TxnId::MIN`: under-reporting only delays
/// agreement, over-reporting breaks it.
pub trait SafeTxnOracle: Send + Sync {
    fn highest_complete_txn_id(&self, site: SiteId) -> TxnId;
}

impl<F: Fn(SiteId) -> TxnId + Send + Sync> SafeTxnOracle for F {
    fn highest_complete_txn_id(&self, site: SiteId) -> TxnId {
        self(site)
    }
}

/// Point-to-point delivery to peers. Must not block for long: the mailbox
/// loop calls it inline.
pub trait Transport: Send + Sync {
    fn send(&self, to: SiteId, message: &Message) -> Result<(), SendError>;
}

/// Whoever acts on decisions: evicting failed sites, releasing their
/// resources and resuming transaction processing.
pub trait ViewListener: Send + Sync {
    fn on_decision(&self, decision: &Decision);
}

/// Everything one node's agreement machinery needs from its host. Built once
/// per node process and handed to the service.
#[derive(Clone)]
pub struct NodeContext {
    pub id: SiteId,
    pub membership: BTreeSet<SiteId>,
    pub config: AgreementConfig,
    pub oracle: Arc<dyn SafeTxnOracle>,
    pub transport: Arc<dyn Transport>,
    pub view: Arc<dyn ViewListener>,
}

impl NodeContext {
    pub fn new(
        id: SiteId,
        membership: impl IntoIterator<Item = SiteId>,
        oracle: Arc<dyn SafeTxnOracle>,
        transport: Arc<dyn Transport>,
        view: Arc<dyn ViewListener>,
    ) -> Self {
        NodeContext {
            id,
            membership: membership.into_iter().collect(),
            config: AgreementConfig::default(),
            oracle,
            transport,
            view,
        }
    }

    pub fn with_config(mut self, config: AgreementConfig) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("id", &self.id)
            .field("membership", &self.membership)
            .field("config", &self.config)
            .finish()
    }
}
