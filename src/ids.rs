// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a site: a cluster node or partition-owning process taking part
/// in agreement. Stable for the lifetime of a round; carried as an `i64` on
/// the wire.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SiteId(pub i64);

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl From<i64> for SiteId {
    fn from(id: i64) -> Self {
        SiteId(id)
    }
}

/// A transaction id. Only the ordering means anything: higher ids happened
/// later.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(pub i64);

impl TxnId {
    /// The lowest possible id. An oracle that cannot answer yet returns this.
    pub const MIN: TxnId = TxnId(i64::MIN);
}

// The bottom of the watermark lattice is the lowest id, not zero.
impl Default for TxnId {
    fn default() -> Self {
        TxnId::MIN
    }
}

impl pergola::MaxUnitDefault for TxnId {}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TxnId {
    fn from(id: i64) -> Self {
        TxnId(id)
    }
}

/// Local logical clock reading attached to suspicions and heartbeats.
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct LogicalTime(pub u64);

impl LogicalTime {
    pub fn next(self) -> LogicalTime {
        LogicalTime(self.0 + 1)
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Renders a set of sites as `{s1,s2,s3}` for log fields.
pub fn fmt_sites<'a, I>(sites: I) -> String
where
    I: IntoIterator<Item = &'a SiteId>,
{
    format!("{{{}}}", sites.into_iter().join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sites_render_compactly() {
        let s = vec![SiteId(1), SiteId(4)];
        assert_eq!(fmt_sites(s.iter()), "{s1,s4}");
        assert_eq!(fmt_sites(Vec::<SiteId>::new().iter()), "{}");
        assert!(TxnId::default() < TxnId(i64::MIN + 1));
    }

    #[test]
    fn watermarks_join_by_max() {
        use crate::WatermarkLE;
        let low = WatermarkLE::new_from(TxnId(-5));
        let high = WatermarkLE::new_from(TxnId(40));
        assert_eq!((&low + &high).value, TxnId(40));
        assert_eq!((&WatermarkLE::default() + &low).value, TxnId(-5));
        assert!(low <= high);
    }
}
