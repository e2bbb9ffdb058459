//! Vector clocks for causal ordering between replicas.
//!
//! Each site in the sync network owns one counter in the clock. Comparing
//! clocks yields happens-before, happens-after, equal, or concurrent. All
//! operations return new values; a clock is never mutated in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Causal relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClockOrdering {
    /// All counters equal.
    Equal,
    /// Self happened-before other.
    Before,
    /// Other happened-before self.
    After,
    /// Neither happened-before the other.
    Concurrent,
}

/// Immutable per-site counter map.
///
/// A missing site reads as 0. The map is ordered so the JSON encoding is
/// deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<String, u64>,
}

impl VectorClock {
    /// An empty clock (all counters 0).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a clock from explicit counters.
    pub fn from_counters(counters: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            counters: counters.into_iter().collect(),
        }
    }

    /// Counter for a site; 0 if the site has never been observed.
    pub fn get(&self, site_id: &str) -> u64 {
        self.counters.get(site_id).copied().unwrap_or(0)
    }

    /// True if no site has a non-zero counter recorded.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// New clock with `site_id`'s counter advanced by one.
    pub fn increment(&self, site_id: &str) -> Self {
        let mut counters = self.counters.clone();
        let entry = counters.entry(site_id.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
        Self { counters }
    }

    /// New clock taking the pointwise max over the union of sites.
    ///
    /// Commutative, associative, idempotent.
    pub fn merge(&self, other: &Self) -> Self {
        let mut counters = self.counters.clone();
        for (site, &count) in &other.counters {
            let entry = counters.entry(site.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        Self { counters }
    }

    /// Pairwise causal comparison across the union of sites.
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut le = true;
        let mut ge = true;

        for site in self.counters.keys().chain(other.counters.keys()) {
            let a = self.get(site);
            let b = other.get(site);
            if a > b {
                le = false;
            }
            if a < b {
                ge = false;
            }
        }

        match (le, ge) {
            (true, true) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Before,
            (false, true) => ClockOrdering::After,
            (false, false) => ClockOrdering::Concurrent,
        }
    }

    /// True if every counter in `other` is covered by this clock.
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            ClockOrdering::After | ClockOrdering::Equal
        )
    }

    /// True if neither clock happened-before the other.
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// Canonical JSON object `{site: counter, ...}`.
    pub fn to_json(&self) -> Result<String, SyncError> {
        serde_json::to_string(&self.counters).map_err(|e| SyncError::InvalidClock(e.to_string()))
    }

    /// Decode a clock from its canonical JSON encoding.
    ///
    /// Rejects non-objects, non-integer counters, and negative counters.
    pub fn from_json(json: &str) -> Result<Self, SyncError> {
        let counters: BTreeMap<String, u64> =
            serde_json::from_str(json).map_err(|e| SyncError::InvalidClock(e.to_string()))?;
        Ok(Self { counters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn clock(entries: &[(&str, u64)]) -> VectorClock {
        VectorClock::from_counters(entries.iter().map(|(s, n)| (s.to_string(), *n)))
    }

    #[test]
    fn empty_clock_reads_zero() {
        let c = VectorClock::new();
        assert!(c.is_empty());
        assert_eq!(c.get("site-a"), 0);
    }

    #[test]
    fn increment_returns_new_clock() {
        let c = clock(&[("site-a", 5)]);
        let next = c.increment("site-a");
        assert_eq!(next.get("site-a"), 6);
        assert_eq!(c.get("site-a"), 5);
    }

    #[test]
    fn increment_creates_missing_counter() {
        let next = VectorClock::new().increment("site-a");
        assert_eq!(next.get("site-a"), 1);
    }

    #[test]
    fn increments_are_independent_per_site() {
        let c = VectorClock::new()
            .increment("site-a")
            .increment("site-b")
            .increment("site-a");
        assert_eq!(c.get("site-a"), 2);
        assert_eq!(c.get("site-b"), 1);
    }

    #[test]
    fn merge_takes_pointwise_max_over_union() {
        let a = clock(&[("site-a", 3), ("site-b", 5)]);
        let b = clock(&[("site-a", 7), ("site-c", 2)]);
        let m = a.merge(&b);
        assert_eq!(m.get("site-a"), 7);
        assert_eq!(m.get("site-b"), 5);
        assert_eq!(m.get("site-c"), 2);
    }

    #[test]
    fn compare_equal() {
        let a = clock(&[("a", 3), ("b", 5)]);
        let b = clock(&[("a", 3), ("b", 5)]);
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
    }

    #[test]
    fn compare_before_and_after() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 2), ("b", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Before);
        assert_eq!(b.compare(&a), ClockOrdering::After);
    }

    #[test]
    fn concurrent_clocks_recognized() {
        let c1 = clock(&[("a", 3), ("b", 1)]);
        let c2 = clock(&[("a", 1), ("b", 3)]);
        assert_eq!(c1.compare(&c2), ClockOrdering::Concurrent);
        assert!(c1.is_concurrent(&c2));
        assert_eq!(c1.merge(&c2), clock(&[("a", 3), ("b", 3)]));
    }

    #[test]
    fn json_round_trip() {
        let c = clock(&[("site-a", 3), ("site-b", 7)]);
        let json = c.to_json().unwrap();
        assert_eq!(VectorClock::from_json(&json).unwrap(), c);
    }

    #[test]
    fn json_encoding_is_deterministic() {
        let c = clock(&[("b", 2), ("a", 1)]);
        assert_eq!(c.to_json().unwrap(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn from_json_rejects_malformed_input() {
        assert!(VectorClock::from_json("[1,2]").is_err());
        assert!(VectorClock::from_json(r#"{"a":-1}"#).is_err());
        assert!(VectorClock::from_json(r#"{"a":1.5}"#).is_err());
        assert!(VectorClock::from_json("not json").is_err());
    }

    #[test]
    fn empty_json_round_trip() {
        let c = VectorClock::from_json("{}").unwrap();
        assert!(c.is_empty());
        assert_eq!(c.to_json().unwrap(), "{}");
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        prop::collection::btree_map(
            prop::sample::select(vec!["a", "b", "c", "d"]).prop_map(String::from),
            1u64..20,
            0..4,
        )
        .prop_map(|m| VectorClock::from_counters(m))
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_clock(), b in arb_clock()) {
            prop_assert_eq!(a.merge(&b), b.merge(&a));
        }

        #[test]
        fn merge_is_associative(a in arb_clock(), b in arb_clock(), c in arb_clock()) {
            prop_assert_eq!(a.merge(&b).merge(&c), a.merge(&b.merge(&c)));
        }

        #[test]
        fn merge_is_idempotent(a in arb_clock()) {
            prop_assert_eq!(a.merge(&a), a);
        }

        #[test]
        fn compare_is_consistent_with_merge(a in arb_clock(), b in arb_clock()) {
            let before = a.compare(&b) == ClockOrdering::Before;
            let absorbed = a.merge(&b) == b && a != b;
            prop_assert_eq!(before, absorbed);
        }

        #[test]
        fn increment_is_strictly_after(a in arb_clock(), site in "[a-d]") {
            prop_assert_eq!(a.increment(&site).compare(&a), ClockOrdering::After);
        }

        #[test]
        fn clock_json_round_trips(a in arb_clock()) {
            let json = a.to_json().unwrap();
            prop_assert_eq!(VectorClock::from_json(&json).unwrap(), a);
        }
    }
}
