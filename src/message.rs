// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ForwardedReport, LogicalTime, Report, SiteId};

/// Everything one site's agreement mailbox says to another's.
///
/// Reports travel either directly from their author (`Report`), or relayed
/// through an intermediary (`Forwarded`). A site that reaches a decision sends
/// its decision-bearing report once as `Decision`. `Heartbeat`s only tell the
/// receiver's link monitor that the sender is still around.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Message {
    Report(Report),
    Forwarded(ForwardedReport),
    Decision(Report),
    Heartbeat { from: SiteId, at: LogicalTime },
}

impl Message {
    /// Wraps a relayed report, collapsing to `Report` when the relay is the
    /// author so the redundant relay id is not carried.
    pub fn relay(fwd: ForwardedReport) -> Message {
        if fwd.is_direct() {
            Message::Report(fwd.report)
        } else {
            Message::Forwarded(fwd)
        }
    }

    /// The site that put this message on the wire.
    pub fn sender(&self) -> SiteId {
        match self {
            Message::Report(r) | Message::Decision(r) => r.reporting_site,
            Message::Forwarded(f) => f.reporting_hsid,
            Message::Heartbeat { from, .. } => *from,
        }
    }

    /// The report carried by this message, along with who relayed it.
    /// Heartbeats carry none.
    pub fn into_forwarded(self) -> Option<ForwardedReport> {
        match self {
            Message::Report(r) | Message::Decision(r) => {
                Some(ForwardedReport::new(r.reporting_site, r))
            }
            Message::Forwarded(f) => Some(f),
            Message::Heartbeat { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Report(_) => "report",
            Message::Forwarded(_) => "forwarded",
            Message::Decision(_) => "decision",
            Message::Heartbeat { .. } => "heartbeat",
        }
    }
}
