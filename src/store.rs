// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::report::WatermarkLE;
use crate::{Report, SiteId, TxnId};
use im::OrdMap as ArcOrdMap;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

/// The best-known report from each reporting site in the current round.
///
/// Entries are only ever replaced by a version that says at least as much,
/// so the store's content depends on which reports arrived, never on the
/// order they arrived in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportStore {
    reports: ArcOrdMap<SiteId, Report>,
}

impl ReportStore {
    pub fn new() -> Self {
        ReportStore::default()
    }

    /// Folds `incoming` into the entry for its reporter. Returns true if the
    /// stored state changed; stale and duplicate reports return false.
    pub fn merge(&mut self, incoming: Report) -> bool {
        let reporter = incoming.reporting_site;
        let merged = match self.reports.get(&reporter) {
            None => incoming,
            Some(existing) => {
                let joined = existing.join(&incoming);
                if &joined == existing {
                    trace!(reporter = %reporter, "report adds nothing, ignoring");
                    return false;
                }
                joined
            }
        };
        self.reports.insert(reporter, merged);
        true
    }

    pub fn get(&self, reporter: SiteId) -> Option<&Report> {
        self.reports.get(&reporter)
    }

    pub fn contains(&self, reporter: SiteId) -> bool {
        self.reports.contains_key(&reporter)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.is_empty()
    }

    pub fn reports(&self) -> impl Iterator<Item = &Report> {
        self.reports.values()
    }

    /// Every site any stored report names as failed.
    pub fn union_failed(&self) -> BTreeSet<SiteId> {
        self.reports
            .values()
            .flat_map(|r| r.failed.iter().cloned())
            .collect()
    }

    /// For each site in `failed`, the highest watermark any stored report
    /// gives for it. Sites nobody has a watermark for get `TxnId::MIN`.
    pub fn max_watermarks(&self, failed: &BTreeSet<SiteId>) -> BTreeMap<SiteId, TxnId> {
        failed
            .iter()
            .map(|site| {
                let best = self
                    .reports
                    .values()
                    .filter_map(|r| r.watermark(*site))
                    .fold(WatermarkLE::new_from(TxnId::MIN), |acc, t| {
                        &acc + &WatermarkLE::new_from(t)
                    });
                (*site, best.value)
            })
            .collect()
    }
}
