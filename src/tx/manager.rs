//! Session lifecycle and commit machinery
//!
//! A [`Session`] owns at most one running [`Transaction`] and enforces the
//! lifecycle: begin while active, or commit/rollback with nothing running,
//! is an illegal state, not a silent no-op.
//!
//! Commit is validate-then-apply under the involved cluster locks:
//!
//! 1. Fold the write log into one net operation per record.
//! 2. Lock the touched clusters (ascending id) and the touched indexes
//!    (ascending name).
//! 3. Validate every expected version; route mismatched updates through the
//!    configured conflict strategy.
//! 4. Replay the index overlays onto cloned cores, re-keying entries for
//!    any content the conflict strategy rewrote.
//! 5. Only then mutate: apply record writes, swap in the staged cores.
//!
//! Any failure before step 5 leaves both the record store and every index
//! exactly as they were.

use std::collections::BTreeMap;

use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock};

use crate::data::Content;
use crate::db::Database;
use crate::index::{CompositeKey, IndexCore};
use crate::record::{Record, Rid};
use crate::{Result, StoreError};

use super::conflict::{strategy_for, ConflictContext};
use super::context::{FinalOp, PendingView, TxContext};
use super::IsolationLevel;

// ============================================================================
// Session
// ============================================================================

/// Lifecycle state of a session, reflecting its most recent transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transaction has run yet
    None,
    Active,
    Committed,
    RolledBack,
}

/// A single-threaded unit of work against one database.
///
/// Sessions are reusable: after a commit or rollback, `begin` starts the
/// next transaction.
pub struct Session {
    db: Database,
    isolation: IsolationLevel,
    state: SessionState,
    tx: Option<Transaction>,
}

impl Session {
    pub(crate) fn new(db: Database) -> Self {
        Self {
            db,
            isolation: IsolationLevel::default(),
            state: SessionState::None,
            tx: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Set the isolation level for subsequent transactions. Rejected while
    /// a transaction is running.
    pub fn set_isolation(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.state == SessionState::Active {
            return Err(StoreError::IllegalState(
                "cannot change isolation inside an active transaction".into(),
            ));
        }
        self.isolation = isolation;
        Ok(())
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.state == SessionState::Active {
            return Err(StoreError::IllegalState(
                "transaction already active".into(),
            ));
        }
        self.tx = Some(Transaction {
            db: self.db.clone(),
            ctx: TxContext::new(self.isolation),
        });
        self.state = SessionState::Active;
        Ok(())
    }

    /// The running transaction
    pub fn tx(&mut self) -> Result<&mut Transaction> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::IllegalState("no active transaction".into()))
    }

    /// Atomically apply the running transaction.
    ///
    /// On failure the transaction is rolled back (its reserved slots are
    /// tombstoned) and the error is returned; the session may then begin a
    /// fresh attempt.
    pub fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| {
            StoreError::IllegalState("commit without an active transaction".into())
        })?;
        match tx.commit() {
            Ok(()) => {
                self.state = SessionState::Committed;
                Ok(())
            }
            Err(err) => {
                self.state = SessionState::RolledBack;
                Err(err)
            }
        }
    }

    /// Discard the running transaction; slots it reserved are tombstoned.
    pub fn rollback(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| {
            StoreError::IllegalState("rollback without an active transaction".into())
        })?;
        tx.rollback()?;
        self.state = SessionState::RolledBack;
        Ok(())
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// One optimistic transaction: buffered record writes plus index overlays.
///
/// Takes no locks while running. All reads see the transaction's own
/// pending writes first, then committed state per the isolation level.
pub struct Transaction {
    db: Database,
    ctx: TxContext,
}

impl Transaction {
    // ========================================================================
    // Record Operations
    // ========================================================================

    /// Create a record in a collection. The slot is reserved (and its
    /// identity fixed) immediately; content becomes visible at commit.
    pub fn create(&mut self, collection: &str, content: Content) -> Result<Rid> {
        let rid = self.db.allocate_in(collection, &content)?;
        for def in self.db.indexes().indexes_for(collection) {
            if let Some(key) = def.extract_key(&content) {
                self.ctx.overlay_mut(&def.name).put(key, rid);
            }
        }
        self.ctx
            .record_create(rid, Some(collection.to_string()), content);
        Ok(rid)
    }

    /// Read a record: own pending writes first, then committed state.
    pub fn read(&mut self, rid: Rid) -> Result<Record> {
        match self.ctx.pending_view(rid) {
            Some(PendingView::Created { class, content }) => {
                let mut record = Record::new(rid, 0, content.clone());
                record.class = class.clone();
                return Ok(record);
            }
            Some(PendingView::Updated {
                base_version,
                class,
                content,
            }) => {
                let mut record = Record::new(rid, *base_version, content.clone());
                record.class = class.clone();
                return Ok(record);
            }
            Some(PendingView::Deleted) => return Err(StoreError::NotFound(rid)),
            None => {}
        }

        if self.ctx.isolation == IsolationLevel::RepeatableRead {
            if let Some(cached) = self.ctx.cached_read(rid) {
                return Ok(cached.clone());
            }
        }
        let record = self.db.store().read(rid)?;
        if self.ctx.isolation == IsolationLevel::RepeatableRead {
            self.ctx.cache_read(&record);
        }
        Ok(record)
    }

    /// Rewrite a record's content. The stored version this update is based
    /// on is captured here and validated at commit.
    pub fn update(&mut self, rid: Rid, new: Content) -> Result<()> {
        let current = self.read(rid)?;
        self.maintain_indexes(rid, &current, Some(&new));
        self.ctx.record_update(
            rid,
            current.version,
            current.class.clone(),
            current.content,
            new,
        );
        Ok(())
    }

    /// Delete a record; the slot becomes a tombstone at commit.
    pub fn delete(&mut self, rid: Rid) -> Result<()> {
        let current = self.read(rid)?;
        self.maintain_indexes(rid, &current, None);
        self.ctx
            .record_delete(rid, current.version, current.content);
        Ok(())
    }

    /// Buffer the index entry changes implied by a content change
    fn maintain_indexes(&mut self, rid: Rid, current: &Record, new: Option<&Content>) {
        let collection = match current
            .class
            .clone()
            .or_else(|| self.db.collection_of_cluster(rid.cluster))
        {
            Some(c) => c,
            None => return,
        };
        for def in self.db.indexes().indexes_for(&collection) {
            let old_key = def.extract_key(&current.content);
            let new_key = new.and_then(|content| def.extract_key(content));
            if old_key == new_key {
                continue;
            }
            let overlay = self.ctx.overlay_mut(&def.name);
            if let Some(key) = old_key {
                overlay.remove_entry(key, rid);
            }
            if let Some(key) = new_key {
                overlay.put(key, rid);
            }
        }
    }

    // ========================================================================
    // Index Operations
    // ========================================================================

    /// Point lookup through the transaction's overlay
    pub fn index_get(&self, name: &str, key: &CompositeKey) -> Result<Vec<Rid>> {
        let core = self.db.indexes().core(name)?;
        let core = core.read();
        Ok(match self.ctx.overlay(name) {
            Some(overlay) => overlay.get(&core, key),
            None => core.get(key),
        })
    }

    /// Ordered range scan through the transaction's overlay
    pub fn index_range(
        &self,
        name: &str,
        lower: Option<&CompositeKey>,
        upper: Option<&CompositeKey>,
        inclusive: (bool, bool),
    ) -> Result<Vec<(CompositeKey, Rid)>> {
        let core = self.db.indexes().core(name)?;
        let core = core.read();
        Ok(match self.ctx.overlay(name) {
            Some(overlay) => overlay.range(&core, lower, upper, inclusive),
            None => core.range(lower, upper, inclusive),
        })
    }

    /// Prefix scan through the transaction's overlay
    pub fn index_prefix(
        &self,
        name: &str,
        prefix: &CompositeKey,
    ) -> Result<Vec<(CompositeKey, Rid)>> {
        let core = self.db.indexes().core(name)?;
        let core = core.read();
        Ok(match self.ctx.overlay(name) {
            Some(overlay) => overlay
                .range(&core, Some(prefix), None, (true, true))
                .into_iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .collect(),
            None => core.prefix(prefix),
        })
    }

    /// Snapshot of the distinct keys visible to this transaction, ordered
    pub fn index_keys(&self, name: &str) -> Result<Vec<CompositeKey>> {
        let core = self.db.indexes().core(name)?;
        let core = core.read();
        Ok(match self.ctx.overlay(name) {
            Some(overlay) => overlay.key_stream(&core).collect(),
            None => core.key_stream().collect(),
        })
    }

    /// Buffer a manual index entry insertion
    pub fn index_put(&mut self, name: &str, key: CompositeKey, rid: Rid) -> Result<()> {
        self.db.indexes().core(name)?; // existence check
        self.ctx.overlay_mut(name).put(key, rid);
        Ok(())
    }

    /// Buffer removal of every entry under a key
    pub fn index_remove(&mut self, name: &str, key: CompositeKey) -> Result<()> {
        self.db.indexes().core(name)?;
        self.ctx.overlay_mut(name).remove(key);
        Ok(())
    }

    /// Buffer removal of one `(key, rid)` binding
    pub fn index_remove_entry(&mut self, name: &str, key: CompositeKey, rid: Rid) -> Result<()> {
        self.db.indexes().core(name)?;
        self.ctx.overlay_mut(name).remove_entry(key, rid);
        Ok(())
    }

    /// Buffer a full index wipe
    pub fn index_clear(&mut self, name: &str) -> Result<()> {
        self.db.indexes().core(name)?;
        self.ctx.overlay_mut(name).clear();
        Ok(())
    }

    // ========================================================================
    // Commit / Rollback
    // ========================================================================

    fn commit(self) -> Result<()> {
        let Transaction { db, ctx } = self;
        let final_ops = match ctx.resolve_final_ops() {
            Ok(ops) => ops,
            Err(err) => {
                if let Err(rb) = rollback_allocations(&db, &ctx) {
                    tracing::warn!(error = %rb, "rollback after rejected commit failed");
                }
                return Err(err);
            }
        };
        if final_ops.is_empty() && ctx.overlays().next().is_none() {
            return Ok(());
        }

        match commit_inner(&db, &ctx, &final_ops) {
            Ok(applied) => {
                tracing::debug!(
                    records = applied,
                    indexes = ctx.overlays().count(),
                    "transaction committed"
                );
                Ok(())
            }
            Err(err) => {
                // the cause of the rejection outranks any rollback failure
                if let Err(rb) = rollback_allocations(&db, &ctx) {
                    tracing::warn!(error = %rb, "rollback after rejected commit failed");
                }
                tracing::debug!(error = %err, "transaction rejected");
                Err(err)
            }
        }
    }

    fn rollback(self) -> Result<()> {
        rollback_allocations(&self.db, &self.ctx)
    }
}

// ============================================================================
// Commit Internals
// ============================================================================

/// A record operation validated against the stored state, ready to apply
enum ResolvedOp {
    Write {
        rid: Rid,
        expected: u64,
        class: Option<String>,
        content: Content,
    },
    Delete {
        rid: Rid,
        expected: u64,
    },
    Bury {
        rid: Rid,
    },
}

/// Index entry correction for a record whose committed content was
/// rewritten by the conflict strategy
struct MergePatch {
    rid: Rid,
    /// Key the overlay installed from the pre-merge content, if any
    drop: Option<CompositeKey>,
    /// Key the merged content actually holds, if any
    add: Option<CompositeKey>,
}

fn commit_inner(db: &Database, ctx: &TxContext, final_ops: &[FinalOp]) -> Result<usize> {
    // Phase 1: lock every touched cluster, ascending id.
    let cluster_ids: Vec<u32> = final_ops.iter().map(|op| op.rid().cluster).collect();
    let mut lock = db.store().lock_for_commit(cluster_ids)?;

    // Phase 2: validate expected versions; a mismatched update goes through
    // the configured conflict strategy, everything else rejects. When the
    // strategy rewrites the content, the overlayed index keys (extracted
    // from the pre-merge content) are stale; collect corrections so the
    // staged cores end up describing what is actually committed.
    let (kind, preference) = db.conflict_config();
    let strategy = strategy_for(kind, preference);
    let mut resolved: Vec<ResolvedOp> = Vec::with_capacity(final_ops.len());
    let mut merge_patches: BTreeMap<String, Vec<MergePatch>> = BTreeMap::new();
    for op in final_ops {
        match op {
            FinalOp::Create {
                rid,
                class,
                content,
            } => {
                let actual = lock.stored_version(*rid)?;
                if lock.is_tombstoned(*rid)? || actual != 0 {
                    return Err(StoreError::VersionConflict {
                        rid: *rid,
                        expected: 0,
                        actual,
                    });
                }
                resolved.push(ResolvedOp::Write {
                    rid: *rid,
                    expected: 0,
                    class: class.clone(),
                    content: content.clone(),
                });
            }
            FinalOp::Update {
                rid,
                base_version,
                old,
                new,
            } => {
                if lock.is_tombstoned(*rid)? {
                    return Err(StoreError::NotFound(*rid));
                }
                let actual = lock.stored_version(*rid)?;
                let content = if actual == *base_version {
                    new.clone()
                } else {
                    let stored = lock
                        .stored_content(*rid)?
                        .ok_or(StoreError::NotFound(*rid))?;
                    let merged = strategy
                        .resolve(&ConflictContext {
                            rid: *rid,
                            expected: *base_version,
                            actual,
                            old,
                            incoming: new,
                            stored: &stored,
                        })?
                        .content;
                    if merged != *new {
                        if let Some(collection) = db.collection_of_cluster(rid.cluster) {
                            for def in db.indexes().indexes_for(&collection) {
                                let buffered = def.extract_key(new);
                                let actual_key = def.extract_key(&merged);
                                if buffered != actual_key {
                                    merge_patches.entry(def.name.clone()).or_default().push(
                                        MergePatch {
                                            rid: *rid,
                                            drop: buffered,
                                            add: actual_key,
                                        },
                                    );
                                }
                            }
                        }
                    }
                    merged
                };
                resolved.push(ResolvedOp::Write {
                    rid: *rid,
                    expected: actual,
                    class: None,
                    content,
                });
            }
            FinalOp::Delete { rid, base_version } => {
                if lock.is_tombstoned(*rid)? {
                    return Err(StoreError::NotFound(*rid));
                }
                let actual = lock.stored_version(*rid)?;
                if actual != *base_version {
                    return Err(StoreError::VersionConflict {
                        rid: *rid,
                        expected: *base_version,
                        actual,
                    });
                }
                resolved.push(ResolvedOp::Delete {
                    rid: *rid,
                    expected: actual,
                });
            }
            FinalOp::Abandon { rid } => resolved.push(ResolvedOp::Bury { rid: *rid }),
        }
    }

    // Phase 3: replay overlays onto cloned index cores while holding each
    // core's write lock (ascending name), so a concurrent commit on
    // disjoint clusters cannot interleave with the swap in phase 5.
    // Merge patches are applied after the replay so the staged core keys
    // the merged content, not the pre-merge buffer.
    let mut names: Vec<&str> = ctx.overlays().map(|(name, _)| name).collect();
    names.extend(merge_patches.keys().map(String::as_str));
    names.sort_unstable();
    names.dedup();
    let mut staged: Vec<(ArcRwLockWriteGuard<RawRwLock, IndexCore>, IndexCore)> = Vec::new();
    for name in names {
        let handle = db.indexes().core(name)?;
        let guard = RwLock::write_arc(&handle);
        let mut copy = IndexCore::clone(&guard);
        if let Some(overlay) = ctx.overlay(name) {
            overlay.apply_to(&mut copy)?;
        }
        if let Some(patches) = merge_patches.get(name) {
            for patch in patches {
                if let Some(key) = &patch.drop {
                    copy.remove_entry(key, patch.rid);
                }
                if let Some(key) = &patch.add {
                    copy.put(key.clone(), patch.rid)?;
                }
            }
        }
        staged.push((guard, copy));
    }

    // Phase 4: everything validated; apply record operations.
    let applied = resolved.len();
    for op in resolved {
        match op {
            ResolvedOp::Write {
                rid,
                expected,
                class,
                content,
            } => {
                lock.write(rid, content, class, expected)?;
            }
            ResolvedOp::Delete { rid, expected } => lock.delete(rid, expected)?,
            ResolvedOp::Bury { rid } => lock.bury(rid)?,
        }
    }

    // Phase 5: swap in the staged index cores.
    for (mut guard, copy) in staged {
        *guard = copy;
    }

    Ok(applied)
}

/// Tombstone every slot this transaction reserved so its positions are
/// never reissued. Used by rollback and by commit rejection.
fn rollback_allocations(db: &Database, ctx: &TxContext) -> Result<()> {
    let created: Vec<Rid> = ctx
        .created_rids()
        .filter(|rid| db.store().stored_version(*rid).map_or(false, |v| v == 0))
        .collect();
    if created.is_empty() {
        return Ok(());
    }
    let ids = created.iter().map(|rid| rid.cluster).collect();
    let mut lock = db.store().lock_for_commit(ids)?;
    for rid in created {
        lock.bury(rid)?;
    }
    Ok(())
}
