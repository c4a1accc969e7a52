// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements the small agreement protocol a cluster of sites runs
 * when some of its members stop answering. Every surviving site has to come
 * out of it with the same answer to two questions:
 *
 *   - Which sites failed, and which survived? Survivors form the new
 *     membership; the failed ones are evicted.
 *
 *   - For each failed site, how far was its work durably complete? This is
 *     the _safe txn id_: work at or below it can be kept, work above it is
 *     undetermined and has to be resolved by whoever owns recovery.
 *
 * Each site folds what it sees (its own lost links) and what it hears (other
 * sites' reports) into a store of per-reporter reports, gossips anything new
 * to every peer it can still reach, and decides once every site not known to
 * have failed has reported all the failures it knows about. Reports only ever
 * grow: failed sets by union, safe txn ids by max. That makes them a (join
 * semi-)lattice, and makes the store insensitive to the order, duplication
 * or relaying of messages.
 *
 * What you _don't_ get:
 *
 *   - Progress in every situation. There are no timeouts; a site that cannot
 *     hear from some survivor stays collecting until something changes.
 *
 *   - Protection against lying peers. Reports are trusted.
 *
 *   - Anything to do with the failed sites' transactions themselves. The
 *     decision hands watermarks to the host, who does the rest.
 *
 * The pieces, from the bottom up:
 *
 *   - `Report`, `ForwardedReport`, `Message` and the `codec` for moving them
 *     between sites.
 *   - `ReportStore`, the per-round merge of reports.
 *   - `Forwarder`, which relays reports to reachable peers.
 *   - `LinkMonitor`, which turns lost connections into `Suspicion`s.
 *   - `Mailbox`, the per-round state machine, and `Arbiter`, which strings
 *     rounds together as the membership shrinks.
 *   - `AgreementService`, an async driver around an `Arbiter` that talks to
 *     the host through a `NodeContext`.
 */

mod arbiter;
pub mod codec;
mod config;
mod context;
mod error;
mod forwarder;
mod ids;
mod link;
mod mailbox;
mod message;
mod report;
mod service;
mod store;


pub use arbiter::Arbiter;
pub use config::AgreementConfig;
pub use context::{NodeContext, SafeTxnOracle, Transport, ViewListener};
pub use error::{ReportError, SendError, ServiceError, WireError};
pub use forwarder::Forwarder;
pub use ids::{fmt_sites, LogicalTime, SiteId, TxnId};
pub use link::{LinkMonitor, LinkState, Suspicion};
pub use mailbox::{Decision, Event, Mailbox, Outbound, Stage};
pub use message::Message;
pub use report::{FailedLD, FailedLE, ForwardedReport, Report, WatermarkLD, WatermarkLE};
pub use service::{AgreementService, Command, MailboxHandle};
pub use store::ReportStore;

/// Installs a `tracing` subscriber writing to stderr, filtered by `RUST_LOG`
/// (`info` if unset). Safe to call more than once; later calls do nothing.
pub fn init_tracing() {
    use tracing_subscriber::fmt::time::ChronoUtc;
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_timer(ChronoUtc::rfc3339())
        .with_writer(std::io::stderr)
        .try_init();
}
