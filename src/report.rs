// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{ReportError, SiteId, TxnId};
use pergola::{BTreeSetWithUnion, LatticeElt, MaxDef};
use std::cmp;
use std::collections::{BTreeMap, BTreeSet};

/// The failed-set lattice: sets of sites joined by union. Failures only ever
/// accumulate.
pub type FailedLD = BTreeSetWithUnion<SiteId>;
pub type FailedLE = LatticeElt<FailedLD>;

/// The safe-txn-id lattice for a single failed site: joined by max, so a
/// watermark only ever rises.
pub type WatermarkLD = MaxDef<TxnId>;
pub type WatermarkLE = LatticeElt<WatermarkLD>;

/// A `Report` is one site's current belief about which sites failed, which
/// survived, and how far each failed site's work is known to be complete.
///
/// Reports from the same reporter are ordered by how much they say: a report
/// with a larger failed set, or higher watermarks, is more informative. Two
/// versions are combined with [`Report::join`], which is idempotent and
/// commutative, so the best-known version of a reporter's report does not
/// depend on the order copies of it arrive in.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Report {
    /// Author of the report.
    pub reporting_site: SiteId,
    /// Sites the author believes are down.
    pub failed: BTreeSet<SiteId>,
    /// Sites the author believes are up. Together with `failed` this covers
    /// the author's known membership.
    pub survivors: BTreeSet<SiteId>,
    /// Highest durably-complete txn id the author saw for each failed site.
    pub safe_txn_ids: BTreeMap<SiteId, TxnId>,
    /// Present once the author has decided; the decided survivor set.
    pub decision: Option<BTreeSet<SiteId>>,
}

impl Report {
    /// Builds an undecided report for `reporter`, deriving the survivors as
    /// the complement of `failed` within `membership`.
    pub fn new(
        reporter: SiteId,
        membership: &BTreeSet<SiteId>,
        failed: BTreeSet<SiteId>,
        safe_txn_ids: BTreeMap<SiteId, TxnId>,
    ) -> Report {
        let survivors = membership.difference(&failed).cloned().collect();
        Report {
            reporting_site: reporter,
            failed,
            survivors,
            safe_txn_ids,
            decision: None,
        }
    }

    /// The membership the report was written against.
    pub fn membership(&self) -> BTreeSet<SiteId> {
        let mut m: BTreeSet<SiteId> = self.failed.union(&self.survivors).cloned().collect();
        m.insert(self.reporting_site);
        m
    }

    pub fn is_decided(&self) -> bool {
        self.decision.is_some()
    }

    /// True if this report names every site in `failed` as failed.
    pub fn covers(&self, failed: &BTreeSet<SiteId>) -> bool {
        FailedLE::new_from(failed.clone()) <= FailedLE::new_from(self.failed.clone())
    }

    pub fn watermark(&self, site: SiteId) -> Option<TxnId> {
        self.safe_txn_ids.get(&site).cloned()
    }

    /// Checks the report is internally consistent: `failed` and `survivors`
    /// are disjoint, the reporter is among the survivors, every failed site (and only
    /// failed sites) carries a watermark, and a decision matches the survivor
    /// set it was derived from.
    pub fn validate(&self) -> Result<(), ReportError> {
        if let Some(s) = self.failed.intersection(&self.survivors).next() {
            return Err(ReportError::Overlap(*s));
        }
        if self.failed.contains(&self.reporting_site) {
            return Err(ReportError::SelfFailed(self.reporting_site));
        }
        if !self.survivors.contains(&self.reporting_site) {
            return Err(ReportError::ReporterMissing(self.reporting_site));
        }
        for s in self.safe_txn_ids.keys() {
            if !self.failed.contains(s) {
                return Err(ReportError::WatermarkForSurvivor(*s));
            }
        }
        for s in self.failed.iter() {
            if !self.safe_txn_ids.contains_key(s) {
                return Err(ReportError::MissingWatermark(*s));
            }
        }
        if let Some(d) = &self.decision {
            let mut expected = self.survivors.clone();
            expected.insert(self.reporting_site);
            let mut decided = d.clone();
            decided.insert(self.reporting_site);
            if decided != expected {
                return Err(ReportError::DecisionMismatch(self.reporting_site));
            }
        }
        Ok(())
    }

    /// Combines two versions of the same reporter's report into the least
    /// report that says everything either of them says.
    ///
    /// A decided version always wins over an undecided one, since a decision
    /// is terminal for its author.
    pub fn join(&self, other: &Report) -> Report {
        debug_assert_eq!(self.reporting_site, other.reporting_site);
        match (&self.decision, &other.decision) {
            (Some(_), None) => return self.clone(),
            (None, Some(_)) => return other.clone(),
            (Some(_), Some(_)) => return cmp::max(self, other).clone(),
            (None, None) => (),
        }

        let failed = (&FailedLE::new_from(self.failed.clone())
            + &FailedLE::new_from(other.failed.clone()))
            .value;
        let survivors = self
            .survivors
            .union(&other.survivors)
            .filter(|s| !failed.contains(*s))
            .cloned()
            .collect();

        let mut safe_txn_ids = self.safe_txn_ids.clone();
        for (site, txn) in other.safe_txn_ids.iter() {
            let joined = match safe_txn_ids.get(site) {
                Some(mine) => {
                    (&WatermarkLE::new_from(*mine) + &WatermarkLE::new_from(*txn)).value
                }
                None => *txn,
            };
            safe_txn_ids.insert(*site, joined);
        }

        Report {
            reporting_site: self.reporting_site,
            failed,
            survivors,
            safe_txn_ids,
            decision: None,
        }
    }

    /// True if `other` adds nothing to what this report already says.
    pub fn subsumes(&self, other: &Report) -> bool {
        &self.join(other) == self
    }
}

/// A report in transit, tagged with the site relaying it. The relay is only
/// used for routing; the payload is never altered by forwarding.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ForwardedReport {
    pub reporting_hsid: SiteId,
    pub report: Report,
}

impl ForwardedReport {
    pub fn new(relay: SiteId, report: Report) -> ForwardedReport {
        ForwardedReport {
            reporting_hsid: relay,
            report,
        }
    }

    /// True if the relay is the report's own author.
    pub fn is_direct(&self) -> bool {
        self.reporting_hsid == self.report.reporting_site
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sites(ids: &[i64]) -> BTreeSet<SiteId> {
        ids.iter().map(|i| SiteId(*i)).collect()
    }

    fn marks(pairs: &[(i64, i64)]) -> BTreeMap<SiteId, TxnId> {
        pairs.iter().map(|(s, t)| (SiteId(*s), TxnId(*t))).collect()
    }

    fn report(reporter: i64, failed: &[i64], wm: &[(i64, i64)]) -> Report {
        Report::new(SiteId(reporter), &sites(&[1, 2, 3, 4, 5]), sites(failed), marks(wm))
    }

    #[test]
    fn survivors_are_complement_of_failed() {
        let r = report(1, &[3], &[(3, 100)]);
        assert_eq!(r.survivors, sites(&[1, 2, 4, 5]));
        assert_eq!(r.membership(), sites(&[1, 2, 3, 4, 5]));
        assert!(r.validate().is_ok());
    }

    #[test]
    fn join_is_idempotent_and_commutative() {
        let a = report(1, &[3], &[(3, 100)]);
        let b = report(1, &[3, 4], &[(3, 90), (4, 7)]);
        assert_eq!(a.join(&a), a);
        assert_eq!(a.join(&b), b.join(&a));
        let j = a.join(&b);
        assert_eq!(j.failed, sites(&[3, 4]));
        assert_eq!(j.survivors, sites(&[1, 2, 5]));
        assert_eq!(j.watermark(SiteId(3)), Some(TxnId(100)));
        assert_eq!(j.watermark(SiteId(4)), Some(TxnId(7)));
        assert!(j.validate().is_ok());
    }

    #[test]
    fn watermarks_never_fall() {
        let hi = report(2, &[3], &[(3, 110)]);
        let lo = report(2, &[3], &[(3, 98)]);
        assert!(hi.subsumes(&lo));
        assert!(!lo.subsumes(&hi));
        assert_eq!(hi.join(&lo).watermark(SiteId(3)), Some(TxnId(110)));
    }

    #[test]
    fn decision_wins_over_undecided() {
        let mut decided = report(1, &[3], &[(3, 100)]);
        decided.decision = Some(decided.survivors.clone());
        let bigger = report(1, &[3, 4], &[(3, 200), (4, 1)]);
        assert_eq!(decided.join(&bigger), decided);
        assert_eq!(bigger.join(&decided), decided);
    }

    #[test]
    fn covers_checks_superset() {
        let r = report(1, &[3, 4], &[(3, 1), (4, 1)]);
        assert!(r.covers(&sites(&[3])));
        assert!(r.covers(&sites(&[])));
        assert!(!r.covers(&sites(&[2])));
    }

    #[test]
    fn validate_rejects_broken_reports() {
        let mut r = report(1, &[3], &[(3, 100)]);
        r.survivors.insert(SiteId(3));
        assert_eq!(r.validate(), Err(ReportError::Overlap(SiteId(3))));

        let r = report(1, &[1], &[(1, 100)]);
        assert_eq!(r.validate(), Err(ReportError::SelfFailed(SiteId(1))));

        let r = report(1, &[3], &[]);
        assert_eq!(r.validate(), Err(ReportError::MissingWatermark(SiteId(3))));

        let mut r = report(1, &[3], &[(3, 100)]);
        r.survivors.remove(&SiteId(1));
        assert_eq!(r.validate(), Err(ReportError::ReporterMissing(SiteId(1))));

        let r = report(1, &[3], &[(3, 1), (4, 1)]);
        assert_eq!(r.validate(), Err(ReportError::WatermarkForSurvivor(SiteId(4))));

        let mut r = report(1, &[3], &[(3, 100)]);
        r.decision = Some(sites(&[1, 2]));
        assert_eq!(r.validate(), Err(ReportError::DecisionMismatch(SiteId(1))));
    }

    #[test]
    fn forwarding_keeps_payload() {
        let r = report(1, &[3], &[(3, 100)]);
        let via2 = ForwardedReport::new(SiteId(2), r.clone());
        let via4 = ForwardedReport::new(SiteId(4), r.clone());
        assert_eq!(via2.report, via4.report);
        assert!(!via2.is_direct());
        assert!(ForwardedReport::new(SiteId(1), r).is_direct());
    }
}
