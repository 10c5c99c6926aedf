//! Weighted distribution tables
//!
//! Each repo carries three tables (pods, caps, scatters) mapping integer
//! node indices to integer weights. Object placement performs one
//! independent lookup per table, keyed on the object name. Selection uses
//! weighted rendezvous hashing so that re-weighting a node only moves keys
//! into or out of that node.
//!
//! A node with weight zero is never chosen by hashing, but remains
//! addressable by exact index (rebuild targeting needs this).

use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::error::{Error, Result};

/// One distribution table: node index -> weight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistTable {
    weights: Vec<u64>,
}

impl DistTable {
    /// Build a table of `cnt` nodes with default weight `dweight`, then
    /// apply overrides of the form `idx=weight;idx=weight;...`.
    ///
    /// Rejects out-of-range indices, malformed pairs, and tables whose
    /// total weight is zero (such a table could never place an object).
    pub fn new(cnt: usize, dweight: u64, overrides: &str) -> Result<Self> {
        if cnt == 0 {
            return Err(Error::config("distribution table has zero nodes"));
        }

        let mut weights = vec![dweight; cnt];
        for pair in overrides.split(';').filter(|p| !p.trim().is_empty()) {
            let (idx_str, weight_str) = pair.split_once('=').ok_or_else(|| {
                Error::config(format!("malformed distribution override: \"{}\"", pair))
            })?;
            let idx: usize = idx_str.trim().parse().map_err(|_| {
                Error::config(format!("bad distribution index: \"{}\"", idx_str))
            })?;
            let weight: u64 = weight_str.trim().parse().map_err(|_| {
                Error::config(format!("bad distribution weight: \"{}\"", weight_str))
            })?;
            if idx >= cnt {
                return Err(Error::config(format!(
                    "distribution index {} out of range (cnt = {})",
                    idx, cnt
                )));
            }
            weights[idx] = weight;
        }

        if weights.iter().all(|w| *w == 0) {
            return Err(Error::config("distribution table has no non-zero weights"));
        }

        Ok(DistTable { weights })
    }

    /// Uniform table, mostly for tests and single-node setups.
    pub fn uniform(cnt: usize) -> Self {
        DistTable { weights: vec![1; cnt] }
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.weights.len()
    }

    /// True when the table has no nodes (never for validated tables).
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    /// Weight of a node, if it exists.
    pub fn weight(&self, idx: usize) -> Option<u64> {
        self.weights.get(idx).copied()
    }

    /// Select a node for `key` via weighted rendezvous hashing.
    ///
    /// The `seed` decorrelates the three per-repo tables so pod, cap, and
    /// scatter selections are independent for the same object name.
    pub fn select(&self, key: &str, seed: u64) -> usize {
        let mut best = 0usize;
        let mut best_score = f64::NEG_INFINITY;
        for (idx, weight) in self.weights.iter().enumerate() {
            if *weight == 0 {
                continue; // reachable only by exact target
            }
            let raw = xxh3_64_with_seed(key.as_bytes(), seed ^ (idx as u64).wrapping_mul(0x9E3779B97F4A7C15));
            // map the hash into (0, 1]; rendezvous score favors the max
            let unit = ((raw >> 11) as f64 + 1.0) / ((1u64 << 53) as f64);
            let score = -(*weight as f64) / unit.ln();
            if score > best_score {
                best_score = score;
                best = idx;
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_applied() {
        let table = DistTable::new(4, 1, "0=3;2=0").unwrap();
        assert_eq!(table.weight(0), Some(3));
        assert_eq!(table.weight(1), Some(1));
        assert_eq!(table.weight(2), Some(0));
        assert_eq!(table.weight(3), Some(1));
    }

    #[test]
    fn test_rejects_out_of_range_override() {
        assert!(DistTable::new(2, 1, "5=1").is_err());
    }

    #[test]
    fn test_rejects_malformed_override() {
        assert!(DistTable::new(2, 1, "nonsense").is_err());
        assert!(DistTable::new(2, 1, "0:1").is_err());
    }

    #[test]
    fn test_rejects_all_zero_table() {
        assert!(DistTable::new(2, 0, "").is_err());
        assert!(DistTable::new(2, 1, "0=0;1=0").is_err());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let table = DistTable::new(8, 1, "").unwrap();
        for key in ["obj.a", "obj.b", "obj.c"] {
            assert_eq!(table.select(key, 0), table.select(key, 0));
        }
    }

    #[test]
    fn test_zero_weight_never_selected() {
        let table = DistTable::new(4, 1, "2=0").unwrap();
        for i in 0..512 {
            let key = format!("object-{}", i);
            assert_ne!(table.select(&key, 7), 2);
        }
    }

    #[test]
    fn test_seeds_decorrelate_lookups() {
        // with distinct seeds, at least one key must land differently
        let table = DistTable::new(16, 1, "").unwrap();
        let moved = (0..256)
            .map(|i| format!("object-{}", i))
            .any(|key| table.select(&key, 1) != table.select(&key, 2));
        assert!(moved);
    }

    #[test]
    fn test_weighting_shifts_load() {
        // a node with 8x weight should attract clearly more keys
        let table = DistTable::new(4, 1, "0=8").unwrap();
        let mut counts = [0usize; 4];
        for i in 0..2000 {
            counts[table.select(&format!("k{}", i), 0)] += 1;
        }
        assert!(counts[0] > counts[1] * 2);
        assert!(counts[0] > counts[2] * 2);
        assert!(counts[0] > counts[3] * 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_selection_stays_in_bounds(
                cnt in 1usize..64,
                dweight in 1u64..16,
                seed in any::<u64>(),
                key in "[a-z0-9.]{1,40}",
            ) {
                let table = DistTable::new(cnt, dweight, "").unwrap();
                let chosen = table.select(&key, seed);
                prop_assert!(chosen < cnt);
            }

            #[test]
            fn prop_reweighting_only_moves_keys_into_the_changed_node(
                cnt in 2usize..32,
                seed in any::<u64>(),
            ) {
                // rendezvous property: raising one node's weight never
                // moves a key between two *other* nodes
                let base = DistTable::new(cnt, 1, "").unwrap();
                let boosted = DistTable::new(cnt, 1, "0=9").unwrap();
                for i in 0..128 {
                    let key = format!("object-{}", i);
                    let before = base.select(&key, seed);
                    let after = boosted.select(&key, seed);
                    if before != after {
                        prop_assert_eq!(after, 0);
                    }
                }
            }
        }
    }
}
