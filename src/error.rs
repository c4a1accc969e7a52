// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::SiteId;

/// A report whose contents contradict themselves or the round they claim to
/// belong to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReportError {
    #[error("site {0} is listed as both failed and surviving")]
    Overlap(SiteId),

    #[error("reporter {0} lists itself as failed")]
    SelfFailed(SiteId),

    #[error("reporter {0} is missing from its own survivor set")]
    ReporterMissing(SiteId),

    #[error("safe txn id given for {0}, which is not failed")]
    WatermarkForSurvivor(SiteId),

    #[error("no safe txn id given for failed site {0}")]
    MissingWatermark(SiteId),

    #[error("decision of {0} does not match its survivor set")]
    DecisionMismatch(SiteId),
}

/// Failure to decode (or frame) a wire message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated message: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unsupported wire version {0}")]
    Version(u8),

    #[error("unknown message tag {0}")]
    Tag(u8),

    #[error("unknown decision marker {0}")]
    Marker(u8),

    #[error("negative length {0}")]
    Length(i32),

    #[error("length {0} does not fit the wire format")]
    TooLong(usize),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    Oversized { len: usize, max: usize },

    #[error("decision message carries no decision")]
    Undecided,

    #[error("{0} trailing bytes after message")]
    Trailing(usize),

    #[error("malformed report: {0}")]
    Report(#[from] ReportError),
}

/// A transport could not hand a message to a peer. The forwarder logs and
/// absorbs these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("no route to {0}")]
    Unreachable(SiteId),

    #[error("connection to {0} closed")]
    Closed(SiteId),
}

/// Errors surfaced to callers of the mailbox handle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("agreement mailbox has shut down")]
    Closed,
}
