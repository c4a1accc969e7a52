// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::codec;
use crate::{
    Arbiter, Event, LinkMonitor, Message, NodeContext, Outbound, ServiceError, SiteId,
    Suspicion, WireError,
};
use bytes::BytesMut;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::StreamExt;
use tracing::{debug, info, info_span, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Suspect(Suspicion),
    Disconnected(SiteId),
    Deliver(Message),
    Tick,
    Shutdown,
}

/// The sending side of a node's agreement mailbox. Cheap to clone; hand one
/// to the transport's connection and receive paths and one to whatever
/// drives ticks.
#[derive(Clone, Debug)]
pub struct MailboxHandle {
    id: SiteId,
    max_frame_len: usize,
    tx: UnboundedSender<Command>,
}

impl MailboxHandle {
    pub fn id(&self) -> SiteId {
        self.id
    }

    fn send(&self, cmd: Command) -> Result<(), ServiceError> {
        self.tx.unbounded_send(cmd).map_err(|_| ServiceError::Closed)
    }

    pub fn suspect(&self, suspicion: Suspicion) -> Result<(), ServiceError> {
        self.send(Command::Suspect(suspicion))
    }

    /// Reports a lost connection to `peer`. The service's link monitor turns
    /// the first one per peer into a suspicion.
    pub fn disconnected(&self, peer: SiteId) -> Result<(), ServiceError> {
        self.send(Command::Disconnected(peer))
    }

    pub fn deliver(&self, message: Message) -> Result<(), ServiceError> {
        self.send(Command::Deliver(message))
    }

    /// Decodes one unframed message and delivers it. Malformed input is
    /// logged and dropped; only a closed mailbox is an error.
    pub fn deliver_bytes(&self, bytes: &[u8]) -> Result<(), ServiceError> {
        if bytes.len() > self.max_frame_len {
            warn!(site = %self.id, len = bytes.len(), "dropping oversized message");
            return Ok(());
        }
        match codec::decode(bytes) {
            Ok(message) => self.deliver(message),
            Err(e) => {
                warn!(site = %self.id, error = %e, "dropping undecodable message");
                Ok(())
            }
        }
    }

    /// Delivers every complete frame at the front of `buf`, leaving any
    /// partial frame in place. Returns how many messages were delivered.
    ///
    /// An oversized frame header means the stream cannot be resynchronized,
    /// so the buffer is discarded.
    pub fn deliver_frames(&self, buf: &mut BytesMut) -> Result<usize, ServiceError> {
        let mut delivered = 0;
        loop {
            match codec::decode_frame(buf, self.max_frame_len) {
                Ok(Some(message)) => {
                    self.deliver(message)?;
                    delivered += 1;
                }
                Ok(None) => return Ok(delivered),
                Err(e @ WireError::Oversized { .. }) => {
                    warn!(site = %self.id, error = %e, "discarding unframeable input");
                    buf.clear();
                    return Ok(delivered);
                }
                Err(e) => warn!(site = %self.id, error = %e, "dropping undecodable frame"),
            }
        }
    }

    pub fn tick(&self) -> Result<(), ServiceError> {
        self.send(Command::Tick)
    }

    pub fn shutdown(&self) -> Result<(), ServiceError> {
        self.send(Command::Shutdown)
    }
}

/// One node's agreement mailbox as a task: drains commands from its handles,
/// steps the `Arbiter`, and carries out what comes back through the node's
/// transport and view listener.
///
/// Every delivered message counts as liveness evidence for its sender in the
/// service's `LinkMonitor`, and the monitor is rearmed with the new membership
/// after each decision.
pub struct AgreementService {
    ctx: NodeContext,
    arbiter: Arbiter,
    links: LinkMonitor,
    rx: UnboundedReceiver<Command>,
}

impl AgreementService {
    pub fn new(ctx: NodeContext) -> (AgreementService, MailboxHandle) {
        let (tx, rx) = unbounded();
        let handle = MailboxHandle {
            id: ctx.id,
            max_frame_len: ctx.config.max_frame_len,
            tx,
        };
        let arbiter = Arbiter::new(ctx.id, ctx.membership.clone(), ctx.config.clone());
        let links = LinkMonitor::new(ctx.id, ctx.membership.iter().cloned());
        (
            AgreementService {
                ctx,
                arbiter,
                links,
                rx,
            },
            handle,
        )
    }

    pub fn arbiter(&self) -> &Arbiter {
        &self.arbiter
    }

    /// Runs until shut down or until every handle is dropped, and returns
    /// the arbiter for inspection.
    pub async fn run(mut self) -> Arbiter {
        while let Some(cmd) = self.rx.next().await {
            if !self.apply(cmd) {
                break;
            }
        }
        info!(site = %self.ctx.id, rounds = self.arbiter.round(), "agreement service stopped");
        self.arbiter
    }

    // Returns false once asked to stop.
    fn apply(&mut self, cmd: Command) -> bool {
        let span = info_span!("agreement", site = %self.ctx.id);
        let _enter = span.enter();
        let oracle = self.ctx.oracle.clone();
        let mut out = Vec::new();
        let round = self.arbiter.round();
        match cmd {
            Command::Suspect(s) => self.arbiter.step(Event::Suspect(s), &*oracle, &mut out),
            Command::Disconnected(peer) => {
                if let Some(s) = self.links.disconnected(peer) {
                    self.arbiter.step(Event::Suspect(s), &*oracle, &mut out);
                }
            }
            Command::Deliver(m) => {
                self.links.heard_from(m.sender());
                self.arbiter.handle(m, &*oracle, &mut out);
            }
            Command::Tick => self.arbiter.step(Event::Tick, &*oracle, &mut out),
            Command::Shutdown => return false,
        }
        if self.arbiter.round() != round {
            self.links.rearm(self.arbiter.membership().iter().cloned());
        }
        self.dispatch(out);
        true
    }

    fn dispatch(&self, out: Vec<Outbound>) {
        for o in out {
            match o {
                Outbound::Send { to, message } => {
                    if let Err(e) = self.ctx.transport.send(to, &message) {
                        debug!(to = %to, kind = message.kind(), error = %e, "send failed");
                    }
                }
                Outbound::Decided(decision) => self.ctx.view.on_decision(&decision),
            }
        }
    }
}
