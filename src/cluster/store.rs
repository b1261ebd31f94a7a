//! Cluster store - versioned record slots with atomic compare-and-increment
//!
//! The sole low-level enforcement point for optimistic concurrency: every
//! `write`/`delete` compares the caller's expected version against the
//! stored one and increments it atomically under the cluster lock. The lock
//! is held only for the compare-and-increment, never across I/O.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

use crate::data::Content;
use crate::record::{Record, Rid};
use crate::{Result, StoreError};

/// Identifier of a physical cluster
pub type ClusterId = u32;

// ============================================================================
// Record Slot
// ============================================================================

/// A single record slot inside a cluster.
///
/// `content == None` means the slot was allocated but never written; such a
/// slot reads as `NotFound` but still owns its position. A tombstoned slot
/// keeps its version history so the position is never reissued.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Slot {
    version: u64,
    tombstone: bool,
    class: Option<String>,
    content: Option<Content>,
}

impl Slot {
    fn fresh() -> Self {
        Self {
            version: 0,
            tombstone: false,
            class: None,
            content: None,
        }
    }

    fn is_readable(&self) -> bool {
        !self.tombstone && self.content.is_some()
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// One physical cluster: an ordered sequence of slots keyed by position
#[derive(Debug, Serialize, Deserialize)]
struct Cluster {
    name: String,
    slots: Vec<Slot>,
    /// Live (written, non-tombstoned) record count
    live: u64,
}

impl Cluster {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            slots: Vec::new(),
            live: 0,
        }
    }

    fn slot(&self, rid: Rid) -> Result<&Slot> {
        self.slots
            .get(rid.position as usize)
            .ok_or(StoreError::NotFound(rid))
    }

    /// Compare-and-increment write. Fails without mutation on a version
    /// mismatch or a tombstoned slot.
    fn write(
        &mut self,
        rid: Rid,
        content: Content,
        class: Option<String>,
        expected_version: u64,
    ) -> Result<u64> {
        let slot = self
            .slots
            .get_mut(rid.position as usize)
            .ok_or(StoreError::NotFound(rid))?;
        if slot.tombstone {
            return Err(StoreError::NotFound(rid));
        }
        if slot.version != expected_version {
            return Err(StoreError::VersionConflict {
                rid,
                expected: expected_version,
                actual: slot.version,
            });
        }
        if slot.content.is_none() {
            self.live += 1;
        }
        slot.version += 1;
        slot.content = Some(content);
        if class.is_some() {
            slot.class = class;
        }
        Ok(slot.version)
    }

    /// Compare-and-increment delete: the slot becomes a tombstone.
    fn delete(&mut self, rid: Rid, expected_version: u64) -> Result<()> {
        let slot = self
            .slots
            .get_mut(rid.position as usize)
            .ok_or(StoreError::NotFound(rid))?;
        if slot.tombstone {
            return Err(StoreError::NotFound(rid));
        }
        if slot.version != expected_version {
            return Err(StoreError::VersionConflict {
                rid,
                expected: expected_version,
                actual: slot.version,
            });
        }
        if slot.content.is_some() {
            self.live -= 1;
        }
        slot.version += 1;
        slot.tombstone = true;
        slot.content = None;
        Ok(())
    }
}

// ============================================================================
// Cluster Store
// ============================================================================

/// Serializable image of the whole store, used by checkpointing
#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterStoreSnapshot {
    clusters: Vec<(ClusterId, Cluster)>,
    next_id: ClusterId,
}

/// All clusters of a database instance.
///
/// The outer map changes only when clusters are added; every record
/// operation locks a single cluster. Thread-safe.
pub struct ClusterStore {
    clusters: RwLock<AHashMap<ClusterId, Arc<RwLock<Cluster>>>>,
    next_id: RwLock<ClusterId>,
}

impl ClusterStore {
    pub fn new() -> Self {
        Self {
            clusters: RwLock::new(AHashMap::new()),
            next_id: RwLock::new(0),
        }
    }

    /// Register a new physical cluster and return its id
    pub fn add_cluster(&self, name: &str) -> ClusterId {
        let mut next = self.next_id.write();
        let id = *next;
        *next += 1;
        self.clusters
            .write()
            .insert(id, Arc::new(RwLock::new(Cluster::new(name))));
        id
    }

    fn cluster(&self, id: ClusterId) -> Result<Arc<RwLock<Cluster>>> {
        self.clusters
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::ClusterNotFound(id))
    }

    /// Whether a cluster id is registered
    pub fn has_cluster(&self, id: ClusterId) -> bool {
        self.clusters.read().contains_key(&id)
    }

    /// Cluster name, if registered
    pub fn cluster_name(&self, id: ClusterId) -> Option<String> {
        self.clusters
            .read()
            .get(&id)
            .map(|c| c.read().name.clone())
    }

    // ========================================================================
    // Record Operations
    // ========================================================================

    /// Reserve the next slot of a cluster. The returned identifier is
    /// permanent; the slot reads as `NotFound` until first written.
    pub fn allocate(&self, cluster_id: ClusterId) -> Result<Rid> {
        let cluster = self.cluster(cluster_id)?;
        let mut cluster = cluster.write();
        let position = cluster.slots.len() as u64;
        cluster.slots.push(Slot::fresh());
        Ok(Rid::new(cluster_id, position))
    }

    /// Application-level read. Tombstoned and never-written slots report
    /// `NotFound`.
    pub fn read(&self, rid: Rid) -> Result<Record> {
        let cluster = self.cluster(rid.cluster)?;
        let cluster = cluster.read();
        let slot = cluster.slot(rid)?;
        if !slot.is_readable() {
            return Err(StoreError::NotFound(rid));
        }
        let mut record = Record::new(
            rid,
            slot.version,
            slot.content.clone().unwrap_or_default(),
        );
        record.class = slot.class.clone();
        Ok(record)
    }

    /// Stored version of a slot, tombstoned or not. `NotFound` only for
    /// unknown positions.
    pub fn stored_version(&self, rid: Rid) -> Result<u64> {
        let cluster = self.cluster(rid.cluster)?;
        let cluster = cluster.read();
        Ok(cluster.slot(rid)?.version)
    }

    /// Atomic compare-and-increment write. Returns the new version.
    pub fn write(
        &self,
        rid: Rid,
        content: Content,
        class: Option<String>,
        expected_version: u64,
    ) -> Result<u64> {
        let cluster = self.cluster(rid.cluster)?;
        let mut cluster = cluster.write();
        cluster.write(rid, content, class, expected_version)
    }

    /// Atomic compare-and-increment delete (tombstones the slot)
    pub fn delete(&self, rid: Rid, expected_version: u64) -> Result<()> {
        let cluster = self.cluster(rid.cluster)?;
        let mut cluster = cluster.write();
        cluster.delete(rid, expected_version)
    }

    // ========================================================================
    // Enumeration / Administration
    // ========================================================================

    /// Live record count of a cluster
    pub fn count(&self, cluster_id: ClusterId) -> Result<u64> {
        Ok(self.cluster(cluster_id)?.read().live)
    }

    /// Snapshot scan of a cluster. Tombstones are only yielded when
    /// explicitly requested (repair and verification scans); their records
    /// carry empty content.
    pub fn scan(&self, cluster_id: ClusterId, include_tombstones: bool) -> Result<Vec<Record>> {
        let cluster = self.cluster(cluster_id)?;
        let cluster = cluster.read();
        let mut out = Vec::new();
        for (pos, slot) in cluster.slots.iter().enumerate() {
            let rid = Rid::new(cluster_id, pos as u64);
            if slot.is_readable() {
                let mut record =
                    Record::new(rid, slot.version, slot.content.clone().unwrap_or_default());
                record.class = slot.class.clone();
                out.push(record);
            } else if slot.tombstone && include_tombstones {
                out.push(Record::new(rid, slot.version, Content::new()));
            }
        }
        Ok(out)
    }

    /// All registered cluster ids, ascending
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<ClusterId> = self.clusters.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    // ========================================================================
    // Commit Locking
    // ========================================================================

    /// Acquire write locks on a set of clusters for the duration of a
    /// commit's validate-then-apply window. Ids are locked in ascending
    /// order so concurrent commits cannot deadlock.
    pub fn lock_for_commit(&self, mut ids: Vec<ClusterId>) -> Result<CommitLock> {
        ids.sort_unstable();
        ids.dedup();
        let mut guards = AHashMap::with_capacity(ids.len());
        for id in ids {
            let cluster = self.cluster(id)?;
            guards.insert(id, RwLock::write_arc(&cluster));
        }
        Ok(CommitLock { guards })
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    /// Serializable image of the entire store
    pub fn snapshot(&self) -> ClusterStoreSnapshot {
        let clusters = self.clusters.read();
        let mut out: Vec<(ClusterId, Cluster)> = clusters
            .iter()
            .map(|(id, c)| {
                let c = c.read();
                (
                    *id,
                    Cluster {
                        name: c.name.clone(),
                        slots: c.slots.clone(),
                        live: c.live,
                    },
                )
            })
            .collect();
        out.sort_by_key(|(id, _)| *id);
        ClusterStoreSnapshot {
            clusters: out,
            next_id: *self.next_id.read(),
        }
    }

    /// Rebuild a store from a checkpoint image
    pub fn from_snapshot(snapshot: ClusterStoreSnapshot) -> Self {
        let mut map = AHashMap::new();
        for (id, cluster) in snapshot.clusters {
            map.insert(id, Arc::new(RwLock::new(cluster)));
        }
        Self {
            clusters: RwLock::new(map),
            next_id: RwLock::new(snapshot.next_id),
        }
    }
}

impl Default for ClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Commit Lock
// ============================================================================

/// Write guards over every cluster a commit touches.
///
/// While held, no other writer can slip between commit validation and
/// apply, which is what makes a multi-record commit all-or-nothing.
pub struct CommitLock {
    guards: AHashMap<ClusterId, ArcRwLockWriteGuard<RawRwLock, Cluster>>,
}

impl CommitLock {
    fn guard(&mut self, rid: Rid) -> Result<&mut Cluster> {
        self.guards
            .get_mut(&rid.cluster)
            .map(|g| &mut **g)
            .ok_or(StoreError::ClusterNotFound(rid.cluster))
    }

    /// Stored version under the lock (validation phase)
    pub fn stored_version(&mut self, rid: Rid) -> Result<u64> {
        let cluster = self.guard(rid)?;
        Ok(cluster.slot(rid)?.version)
    }

    /// Whether the slot is tombstoned
    pub fn is_tombstoned(&mut self, rid: Rid) -> Result<bool> {
        let cluster = self.guard(rid)?;
        Ok(cluster.slot(rid)?.tombstone)
    }

    /// Stored content under the lock (conflict-merge input)
    pub fn stored_content(&mut self, rid: Rid) -> Result<Option<Content>> {
        let cluster = self.guard(rid)?;
        Ok(cluster.slot(rid)?.content.clone())
    }

    /// CAS write under the lock (apply phase)
    pub fn write(
        &mut self,
        rid: Rid,
        content: Content,
        class: Option<String>,
        expected_version: u64,
    ) -> Result<u64> {
        self.guard(rid)?.write(rid, content, class, expected_version)
    }

    /// CAS delete under the lock (apply phase)
    pub fn delete(&mut self, rid: Rid, expected_version: u64) -> Result<()> {
        self.guard(rid)?.delete(rid, expected_version)
    }

    /// Tombstone a slot regardless of version (rollback of an allocation
    /// whose creating transaction never committed)
    pub fn bury(&mut self, rid: Rid) -> Result<()> {
        let cluster = self.guard(rid)?;
        let slot = cluster
            .slots
            .get_mut(rid.position as usize)
            .ok_or(StoreError::NotFound(rid))?;
        if slot.content.is_some() {
            cluster.live -= 1;
        }
        slot.tombstone = true;
        slot.content = None;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
