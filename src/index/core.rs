//! Base secondary index - ordered key → RID structure
//!
//! Supports point lookups, inclusive/exclusive range scans, prefix scans
//! over composite keys, and a restartable snapshot key stream. Uniqueness
//! is enforced at `put` time: a violation performs no mutation.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use super::key::{CompositeKey, NullPolicy};
use crate::record::Rid;
use crate::{Result, StoreError};

// ============================================================================
// Index Core
// ============================================================================

/// An ordered index over composite keys.
///
/// Non-unique indexes keep a set of RIDs per key (insertion order);
/// unique indexes hold exactly one. Re-inserting an existing (key, rid)
/// pair is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexCore {
    name: String,
    unique: bool,
    null_policy: NullPolicy,
    tree: BTreeMap<CompositeKey, Vec<Rid>>,
    entry_count: u64,
}

impl IndexCore {
    pub fn new(name: &str, unique: bool, null_policy: NullPolicy) -> Self {
        Self {
            name: name.to_string(),
            unique,
            null_policy,
            tree: BTreeMap::new(),
            entry_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn null_policy(&self) -> NullPolicy {
        self.null_policy
    }

    /// Number of (key, rid) entries
    pub fn len(&self) -> u64 {
        self.entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Number of distinct keys
    pub fn distinct_keys(&self) -> usize {
        self.tree.len()
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Insert a (key, rid) pair.
    ///
    /// Keys inadmissible under the null policy are silently skipped (the
    /// record is simply not indexed). A unique-index violation fails with
    /// `DuplicateKey` and mutates nothing.
    pub fn put(&mut self, key: CompositeKey, rid: Rid) -> Result<()> {
        if !self.null_policy.admits(&key) {
            return Ok(());
        }
        let rids = self.tree.entry(key.clone()).or_default();
        if rids.contains(&rid) {
            return Ok(()); // idempotent
        }
        if self.unique && !rids.is_empty() {
            return Err(StoreError::DuplicateKey {
                index: self.name.clone(),
                key: key.to_string(),
            });
        }
        rids.push(rid);
        self.entry_count += 1;
        Ok(())
    }

    /// Remove every RID bound to a key. Returns the number removed.
    pub fn remove(&mut self, key: &CompositeKey) -> usize {
        match self.tree.remove(key) {
            Some(rids) => {
                self.entry_count -= rids.len() as u64;
                rids.len()
            }
            None => 0,
        }
    }

    /// Remove one (key, rid) binding. Returns whether it existed.
    pub fn remove_entry(&mut self, key: &CompositeKey, rid: Rid) -> bool {
        if let Some(rids) = self.tree.get_mut(key) {
            if let Some(pos) = rids.iter().position(|&r| r == rid) {
                rids.remove(pos);
                self.entry_count -= 1;
                if rids.is_empty() {
                    self.tree.remove(key);
                }
                return true;
            }
        }
        false
    }

    /// Drop all entries
    pub fn clear(&mut self) {
        self.tree.clear();
        self.entry_count = 0;
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Point lookup: all RIDs bound to an exact key (empty when absent)
    pub fn get(&self, key: &CompositeKey) -> Vec<Rid> {
        self.tree.get(key).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &CompositeKey) -> bool {
        self.tree.contains_key(key)
    }

    /// Range scan between optional bounds with per-bound inclusivity.
    ///
    /// The result is a snapshot taken at call time: the returned entries
    /// are complete and never torn, and the scan holds no lock afterwards.
    pub fn range(
        &self,
        lower: Option<&CompositeKey>,
        upper: Option<&CompositeKey>,
        inclusive: (bool, bool),
    ) -> Vec<(CompositeKey, Rid)> {
        let start: Bound<&CompositeKey> = match (lower, inclusive.0) {
            (Some(k), true) => Bound::Included(k),
            (Some(k), false) => Bound::Excluded(k),
            (None, _) => Bound::Unbounded,
        };
        let end: Bound<&CompositeKey> = match (upper, inclusive.1) {
            (Some(k), true) => Bound::Included(k),
            (Some(k), false) => Bound::Excluded(k),
            (None, _) => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for (key, rids) in self.tree.range((start, end)) {
            for &rid in rids {
                out.push((key.clone(), rid));
            }
        }
        out
    }

    /// Prefix scan: every entry whose leading components equal `prefix`,
    /// regardless of trailing component values.
    pub fn prefix(&self, prefix: &CompositeKey) -> Vec<(CompositeKey, Rid)> {
        let mut out = Vec::new();
        for (key, rids) in self.tree.range(prefix.clone()..) {
            if !key.starts_with(prefix) {
                break;
            }
            for &rid in rids {
                out.push((key.clone(), rid));
            }
        }
        out
    }

    /// Restartable, snapshot-consistent stream of all keys in order
    pub fn key_stream(&self) -> impl Iterator<Item = CompositeKey> {
        let keys: Vec<CompositeKey> = self.tree.keys().cloned().collect();
        keys.into_iter()
    }
}

// ============================================================================
// Tests
// ============================================================================
