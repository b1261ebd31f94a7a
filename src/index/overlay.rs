//! Transaction-scoped index overlay
//!
//! Each transaction buffers its index mutations per index name, in call
//! order. Reads through an active transaction see the base index with the
//! buffered delta applied on top; the base is never touched until commit.
//!
//! Rules: `clear` buffers a wipe marker hiding every base key until a later
//! `put` for a key restores it; `remove` after a buffered `put` cancels the
//! key's visibility; `put` after `remove`/`clear` restores it.

use std::collections::BTreeMap;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use super::core::IndexCore;
use super::key::CompositeKey;
use crate::record::Rid;
use crate::Result;

// ============================================================================
// Overlay Operations
// ============================================================================

/// A buffered index mutation, replayed in order at commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverlayOp {
    Put(CompositeKey, Rid),
    /// Remove every RID bound to the key
    Remove(CompositeKey),
    /// Remove one (key, rid) binding
    RemoveEntry(CompositeKey, Rid),
    Clear,
}

/// Net per-key visibility after the buffered operations so far
#[derive(Debug, Clone, Default)]
struct KeyDelta {
    /// Hide every base RID of this key (set by `remove`, or implied for all
    /// keys by a wipe marker)
    hide_base: bool,
    /// RIDs added by buffered puts
    added: Vec<Rid>,
    /// Individual base RIDs hidden by buffered `remove_entry`
    hidden: Vec<Rid>,
}

// ============================================================================
// Index Overlay
// ============================================================================

/// Per-transaction buffered delta for a single index.
///
/// Exclusively owned by its transaction; needs no synchronization.
#[derive(Debug, Default)]
pub struct IndexOverlay {
    /// Call-order buffer applied to the base index at commit
    ops: Vec<OverlayOp>,
    /// Wipe marker: a buffered `clear` hides all base keys
    cleared: bool,
    deltas: AHashMap<CompositeKey, KeyDelta>,
}

impl IndexOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Buffered operations in call order
    pub fn ops(&self) -> &[OverlayOp] {
        &self.ops
    }

    // ========================================================================
    // Buffering
    // ========================================================================

    pub fn put(&mut self, key: CompositeKey, rid: Rid) {
        let delta = self.deltas.entry(key.clone()).or_default();
        if !delta.added.contains(&rid) {
            delta.added.push(rid);
        }
        delta.hidden.retain(|&r| r != rid);
        self.ops.push(OverlayOp::Put(key, rid));
    }

    pub fn remove(&mut self, key: CompositeKey) {
        let delta = self.deltas.entry(key.clone()).or_default();
        delta.hide_base = true;
        delta.added.clear();
        self.ops.push(OverlayOp::Remove(key));
    }

    pub fn remove_entry(&mut self, key: CompositeKey, rid: Rid) {
        let delta = self.deltas.entry(key.clone()).or_default();
        delta.added.retain(|&r| r != rid);
        if !delta.hidden.contains(&rid) {
            delta.hidden.push(rid);
        }
        self.ops.push(OverlayOp::RemoveEntry(key, rid));
    }

    pub fn clear(&mut self) {
        self.cleared = true;
        self.deltas.clear();
        self.ops.push(OverlayOp::Clear);
    }

    // ========================================================================
    // Merged Reads
    // ========================================================================

    /// Point lookup through the overlay: base state with this delta on top
    pub fn get(&self, base: &IndexCore, key: &CompositeKey) -> Vec<Rid> {
        let delta = self.deltas.get(key);
        let mut rids = if self.cleared || delta.map_or(false, |d| d.hide_base) {
            Vec::new()
        } else {
            base.get(key)
        };
        if let Some(delta) = delta {
            rids.retain(|r| !delta.hidden.contains(r));
            for &rid in &delta.added {
                if !rids.contains(&rid) {
                    rids.push(rid);
                }
            }
        }
        rids
    }

    /// Range scan through the overlay, ordered by key
    pub fn range(
        &self,
        base: &IndexCore,
        lower: Option<&CompositeKey>,
        upper: Option<&CompositeKey>,
        inclusive: (bool, bool),
    ) -> Vec<(CompositeKey, Rid)> {
        let mut merged: BTreeMap<CompositeKey, Vec<Rid>> = BTreeMap::new();
        if !self.cleared {
            for (key, rid) in base.range(lower, upper, inclusive) {
                merged.entry(key).or_default().push(rid);
            }
        }
        for (key, delta) in &self.deltas {
            if !in_bounds(key, lower, upper, inclusive) {
                continue;
            }
            let rids = merged.entry(key.clone()).or_default();
            if delta.hide_base {
                rids.clear();
            }
            rids.retain(|r| !delta.hidden.contains(r));
            for &rid in &delta.added {
                if !rids.contains(&rid) {
                    rids.push(rid);
                }
            }
        }
        merged
            .into_iter()
            .flat_map(|(key, rids)| rids.into_iter().map(move |rid| (key.clone(), rid)))
            .collect()
    }

    /// Snapshot key stream through the overlay
    pub fn key_stream(&self, base: &IndexCore) -> impl Iterator<Item = CompositeKey> {
        let entries = self.range(base, None, None, (true, true));
        let mut keys: Vec<CompositeKey> = entries.into_iter().map(|(k, _)| k).collect();
        keys.dedup();
        keys.into_iter()
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Replay the buffered operations onto a base index in call order.
    ///
    /// Applied to a staged copy by the commit path so a failure (unique
    /// violation) leaves the real base untouched.
    pub fn apply_to(&self, base: &mut IndexCore) -> Result<()> {
        for op in &self.ops {
            match op {
                OverlayOp::Put(key, rid) => base.put(key.clone(), *rid)?,
                OverlayOp::Remove(key) => {
                    base.remove(key);
                }
                OverlayOp::RemoveEntry(key, rid) => {
                    base.remove_entry(key, *rid);
                }
                OverlayOp::Clear => base.clear(),
            }
        }
        Ok(())
    }
}

fn in_bounds(
    key: &CompositeKey,
    lower: Option<&CompositeKey>,
    upper: Option<&CompositeKey>,
    inclusive: (bool, bool),
) -> bool {
    if let Some(lo) = lower {
        if key < lo || (key == lo && !inclusive.0) {
            return false;
        }
    }
    if let Some(hi) = upper {
        if key > hi || (key == hi && !inclusive.1) {
            return false;
        }
    }
    true
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::key::{KeyValue, NullPolicy};

    fn k(v: i64) -> CompositeKey {
        CompositeKey::single(KeyValue::Int(v))
    }

    fn rid(p: u64) -> Rid {
        Rid::new(0, p)
    }

    fn base_with(entries: &[(i64, u64)]) -> IndexCore {
        let mut base = IndexCore::new("idx", false, NullPolicy::IgnoreNulls);
        for &(key, pos) in entries {
            base.put(k(key), rid(pos)).unwrap();
        }
        base
    }

    #[test]
    fn test_buffered_ops_mask_cross_signed_base_key() {
        let mut base = IndexCore::new("idx", false, NullPolicy::IgnoreNulls);
        base.put(CompositeKey::single(KeyValue::UInt(5)), rid(0)).unwrap();

        let mut ov = IndexOverlay::new();
        ov.remove_entry(k(5), rid(0));
        assert!(ov.get(&base, &k(5)).is_empty());
        assert!(ov
            .get(&base, &CompositeKey::single(KeyValue::UInt(5)))
            .is_empty());
    }

    #[test]
    fn test_put_then_remove_cancels_visibility() {
        let base = base_with(&[]);
        let mut ov = IndexOverlay::new();

        ov.put(k(1), rid(0));
        assert_eq!(ov.get(&base, &k(1)), vec![rid(0)]);

        ov.remove(k(1));
        assert!(ov.get(&base, &k(1)).is_empty());
    }

    #[test]
    fn test_put_after_remove_restores_visibility() {
        let base = base_with(&[(1, 0)]);
        let mut ov = IndexOverlay::new();

        ov.remove(k(1));
        assert!(ov.get(&base, &k(1)).is_empty());

        ov.put(k(1), rid(5));
        assert_eq!(ov.get(&base, &k(1)), vec![rid(5)]);
    }

    #[test]
    fn test_clear_hides_all_until_new_put() {
        let base = base_with(&[(1, 0), (2, 1)]);
        let mut ov = IndexOverlay::new();

        ov.clear();
        assert!(ov.get(&base, &k(1)).is_empty());
        assert!(ov.get(&base, &k(2)).is_empty());

        ov.put(k(2), rid(9));
        assert!(ov.get(&base, &k(1)).is_empty());
        assert_eq!(ov.get(&base, &k(2)), vec![rid(9)]);
    }

    #[test]
    fn test_remove_entry_hides_single_binding() {
        let base = base_with(&[(1, 0), (1, 1)]);
        let mut ov = IndexOverlay::new();

        ov.remove_entry(k(1), rid(0));
        assert_eq!(ov.get(&base, &k(1)), vec![rid(1)]);
    }

    #[test]
    fn test_range_merges_base_and_delta() {
        let base = base_with(&[(1, 0), (3, 1), (5, 2)]);
        let mut ov = IndexOverlay::new();
        ov.put(k(2), rid(10));
        ov.remove(k(3));

        let hits = ov.range(&base, Some(&k(1)), Some(&k(5)), (true, true));
        let keys: Vec<i64> = hits
            .iter()
            .map(|(key, _)| match key.0[0] {
                KeyValue::Int(v) => v,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![1, 2, 5]);
    }

    #[test]
    fn test_base_untouched_by_buffered_ops() {
        let base = base_with(&[(1, 0)]);
        let mut ov = IndexOverlay::new();
        ov.clear();
        ov.put(k(7), rid(3));
        ov.remove(k(1));

        assert_eq!(base.get(&k(1)), vec![rid(0)]);
        assert_eq!(base.len(), 1);
        assert!(!base.contains_key(&k(7)));
    }

    #[test]
    fn test_apply_replays_in_call_order() {
        let mut base = base_with(&[(1, 0), (2, 1)]);
        let mut ov = IndexOverlay::new();
        ov.clear();
        ov.put(k(3), rid(5));
        ov.remove(k(3));
        ov.put(k(4), rid(6));

        ov.apply_to(&mut base).unwrap();
        assert_eq!(base.len(), 1);
        assert_eq!(base.get(&k(4)), vec![rid(6)]);
        assert!(base.get(&k(1)).is_empty());
        assert!(base.get(&k(3)).is_empty());
    }
}
