//! Transaction working set
//!
//! Everything a running transaction has done lives here: the ordered record
//! write log, the per-record latest-state table used to answer the
//! transaction's own reads, the repeatable-read cache, and one
//! [`IndexOverlay`] per index the transaction touched. Nothing in this module
//! takes a lock or mutates shared state.

use std::collections::BTreeMap;

use ahash::AHashMap;

use crate::data::Content;
use crate::index::overlay::IndexOverlay;
use crate::record::{Record, Rid};
use crate::{Result, StoreError};

use super::IsolationLevel;

// ============================================================================
// Write Log
// ============================================================================

/// One buffered record operation, in the order the transaction issued it
#[derive(Debug, Clone)]
pub enum TxWrite {
    Create {
        rid: Rid,
        class: Option<String>,
        content: Content,
    },
    Update {
        rid: Rid,
        /// Stored version the update was based on
        base_version: u64,
        old: Content,
        new: Content,
    },
    Delete {
        rid: Rid,
        base_version: u64,
        old: Content,
    },
}

impl TxWrite {
    pub fn rid(&self) -> Rid {
        match self {
            TxWrite::Create { rid, .. } | TxWrite::Update { rid, .. } | TxWrite::Delete { rid, .. } => {
                *rid
            }
        }
    }
}

/// Net effect of a transaction on one record, resolved at commit time.
///
/// Folding the write log per record collapses create+update chains into a
/// single write and create+delete into [`FinalOp::Abandon`], so commit
/// performs at most one store operation per record.
#[derive(Debug, Clone)]
pub enum FinalOp {
    Create {
        rid: Rid,
        class: Option<String>,
        content: Content,
    },
    Update {
        rid: Rid,
        base_version: u64,
        /// Content as of the base version, kept for conflict merging
        old: Content,
        new: Content,
    },
    Delete {
        rid: Rid,
        base_version: u64,
    },
    /// Created and deleted inside the same transaction: the reserved slot is
    /// tombstoned so its position is never reissued
    Abandon { rid: Rid },
}

impl FinalOp {
    pub fn rid(&self) -> Rid {
        match self {
            FinalOp::Create { rid, .. }
            | FinalOp::Update { rid, .. }
            | FinalOp::Delete { rid, .. }
            | FinalOp::Abandon { rid } => *rid,
        }
    }
}

// ============================================================================
// Transaction Context
// ============================================================================

/// Visible state of a record inside the transaction, before commit
#[derive(Debug, Clone)]
pub(crate) enum PendingView {
    /// Record created by this transaction
    Created {
        class: Option<String>,
        content: Content,
    },
    /// Existing record rewritten by this transaction
    Updated {
        base_version: u64,
        class: Option<String>,
        content: Content,
    },
    /// Deleted (or created-then-deleted) by this transaction
    Deleted,
}

/// Buffered working set of one transaction
pub struct TxContext {
    pub(crate) isolation: IsolationLevel,
    /// Ordered write log, as issued
    writes: Vec<TxWrite>,
    /// Net pending state per touched record
    pending: AHashMap<Rid, PendingView>,
    /// First-read pins for repeatable-read sessions
    read_cache: AHashMap<Rid, Record>,
    /// Per-index deltas, keyed by index name (ordered for deterministic
    /// commit staging)
    overlays: BTreeMap<String, IndexOverlay>,
}

impl TxContext {
    pub fn new(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            writes: Vec::new(),
            pending: AHashMap::new(),
            read_cache: AHashMap::new(),
            overlays: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.overlays.values().all(|o| o.is_empty())
    }

    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    // ========================================================================
    // Record Writes
    // ========================================================================

    pub fn record_create(&mut self, rid: Rid, class: Option<String>, content: Content) {
        self.pending.insert(
            rid,
            PendingView::Created {
                class: class.clone(),
                content: content.clone(),
            },
        );
        self.writes.push(TxWrite::Create { rid, class, content });
    }

    pub fn record_update(
        &mut self,
        rid: Rid,
        base_version: u64,
        class: Option<String>,
        old: Content,
        new: Content,
    ) {
        let view = match self.pending.get(&rid) {
            Some(PendingView::Created { class, .. }) => PendingView::Created {
                class: class.clone(),
                content: new.clone(),
            },
            Some(PendingView::Updated {
                base_version, class, ..
            }) => PendingView::Updated {
                base_version: *base_version,
                class: class.clone(),
                content: new.clone(),
            },
            _ => PendingView::Updated {
                base_version,
                class,
                content: new.clone(),
            },
        };
        self.pending.insert(rid, view);
        self.writes.push(TxWrite::Update {
            rid,
            base_version,
            old,
            new,
        });
    }

    pub fn record_delete(&mut self, rid: Rid, base_version: u64, old: Content) {
        self.pending.insert(rid, PendingView::Deleted);
        self.writes.push(TxWrite::Delete {
            rid,
            base_version,
            old,
        });
    }

    /// Pending state of a record, if this transaction touched it
    pub(crate) fn pending_view(&self, rid: Rid) -> Option<&PendingView> {
        self.pending.get(&rid)
    }

    /// Slots this transaction reserved; rollback tombstones them
    pub fn created_rids(&self) -> impl Iterator<Item = Rid> + '_ {
        self.writes.iter().filter_map(|write| match write {
            TxWrite::Create { rid, .. } => Some(*rid),
            _ => None,
        })
    }

    // ========================================================================
    // Repeatable-Read Cache
    // ========================================================================

    pub fn cached_read(&self, rid: Rid) -> Option<&Record> {
        self.read_cache.get(&rid)
    }

    pub fn cache_read(&mut self, record: &Record) {
        self.read_cache
            .entry(record.rid)
            .or_insert_with(|| record.clone());
    }

    // ========================================================================
    // Index Overlays
    // ========================================================================

    pub fn overlay_mut(&mut self, index: &str) -> &mut IndexOverlay {
        self.overlays.entry(index.to_string()).or_default()
    }

    pub fn overlay(&self, index: &str) -> Option<&IndexOverlay> {
        self.overlays.get(index)
    }

    /// Non-empty overlays, ordered by index name
    pub fn overlays(&self) -> impl Iterator<Item = (&str, &IndexOverlay)> {
        self.overlays
            .iter()
            .filter(|(_, o)| !o.is_empty())
            .map(|(name, o)| (name.as_str(), o))
    }

    // ========================================================================
    // Commit Resolution
    // ========================================================================

    /// Fold the write log into one net operation per record, ordered by the
    /// first touch of each record.
    pub fn resolve_final_ops(&self) -> Result<Vec<FinalOp>> {
        let mut order: Vec<Rid> = Vec::new();
        let mut ops: AHashMap<Rid, FinalOp> = AHashMap::new();

        for write in &self.writes {
            let rid = write.rid();
            let prior = ops.remove(&rid);
            if prior.is_none() {
                order.push(rid);
            }
            let next = match (prior, write) {
                (None, TxWrite::Create { class, content, .. }) => FinalOp::Create {
                    rid,
                    class: class.clone(),
                    content: content.clone(),
                },
                (None, TxWrite::Update {
                    base_version,
                    old,
                    new,
                    ..
                }) => FinalOp::Update {
                    rid,
                    base_version: *base_version,
                    old: old.clone(),
                    new: new.clone(),
                },
                (None, TxWrite::Delete { base_version, .. }) => FinalOp::Delete {
                    rid,
                    base_version: *base_version,
                },
                (Some(FinalOp::Create { class, .. }), TxWrite::Update { new, .. }) => {
                    FinalOp::Create {
                        rid,
                        class,
                        content: new.clone(),
                    }
                }
                (Some(FinalOp::Create { .. }), TxWrite::Delete { .. }) => FinalOp::Abandon { rid },
                (
                    Some(FinalOp::Update {
                        base_version, old, ..
                    }),
                    TxWrite::Update { new, .. },
                ) => FinalOp::Update {
                    rid,
                    base_version,
                    old,
                    new: new.clone(),
                },
                (Some(FinalOp::Update { base_version, .. }), TxWrite::Delete { .. }) => {
                    FinalOp::Delete { rid, base_version }
                }
                (Some(prior), write) => {
                    return Err(StoreError::IllegalState(format!(
                        "invalid write sequence on {}: {:?} after {:?}",
                        rid, write, prior
                    )));
                }
            };
            ops.insert(rid, next);
        }

        Ok(order
            .into_iter()
            .filter_map(|rid| ops.remove(&rid))
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
