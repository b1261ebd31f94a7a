//! Database facade - collections, sessions, and durability
//!
//! Ties the layers together: a [`Database`] owns the cluster store, the
//! index manager, and the collection catalog, hands out [`Session`]s, and
//! carries the database-wide conflict configuration. Clones share the same
//! underlying state and are cheap to pass between threads.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::cluster::{
    ClusterId, ClusterStore, ClusterStoreSnapshot, HashSharding, ShardKey, ShardingStrategy,
};
use crate::data::{Content, Value};
use crate::index::{IndexDefinition, IndexManager, IndexManagerSnapshot};
use crate::record::{Record, Rid};
use crate::tx::{ConflictStrategyKind, MergePreference, Session};
use crate::{Result, StoreError};

const CHECKPOINT_FILE: &str = "polystore.db";

// ============================================================================
// Collection Catalog
// ============================================================================

/// A named collection of records spread over N physical clusters.
///
/// The shard fields select which cluster a new record lands in; they are
/// fixed at collection creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDef {
    pub name: String,
    pub clusters: Vec<ClusterId>,
    pub shard_fields: Vec<String>,
}

// ============================================================================
// Database
// ============================================================================

struct DbInner {
    store: ClusterStore,
    indexes: IndexManager,
    collections: RwLock<AHashMap<String, CollectionDef>>,
    /// Reverse map: which collection owns each cluster
    cluster_owner: RwLock<AHashMap<ClusterId, String>>,
    conflict: RwLock<(ConflictStrategyKind, MergePreference)>,
    sharding: HashSharding,
}

/// Shared handle to one database instance
#[derive(Clone)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DbInner {
                store: ClusterStore::new(),
                indexes: IndexManager::new(),
                collections: RwLock::new(AHashMap::new()),
                cluster_owner: RwLock::new(AHashMap::new()),
                conflict: RwLock::new((
                    ConflictStrategyKind::default(),
                    MergePreference::default(),
                )),
                sharding: HashSharding,
            }),
        }
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    /// Register a collection backed by `cluster_count` fresh clusters.
    ///
    /// Records shard over the clusters by `shard_fields`; with no shard
    /// fields every record hashes the same and lands in the first cluster.
    pub fn add_collection(
        &self,
        name: &str,
        cluster_count: usize,
        shard_fields: Vec<String>,
    ) -> Result<CollectionDef> {
        let mut collections = self.inner.collections.write();
        if collections.contains_key(name) {
            return Err(StoreError::IllegalState(format!(
                "collection '{}' already exists",
                name
            )));
        }
        let count = cluster_count.max(1);
        let clusters: Vec<ClusterId> = (0..count)
            .map(|i| self.inner.store.add_cluster(&format!("{}_{}", name, i)))
            .collect();
        let def = CollectionDef {
            name: name.to_string(),
            clusters: clusters.clone(),
            shard_fields,
        };
        let mut owners = self.inner.cluster_owner.write();
        for id in clusters {
            owners.insert(id, name.to_string());
        }
        collections.insert(name.to_string(), def.clone());
        tracing::debug!(collection = name, clusters = count, "collection added");
        Ok(def)
    }

    pub fn collection(&self, name: &str) -> Result<CollectionDef> {
        self.inner
            .collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::CollectionNotFound(name.to_string()))
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) fn collection_of_cluster(&self, cluster: ClusterId) -> Option<String> {
        self.inner.cluster_owner.read().get(&cluster).cloned()
    }

    /// Reserve a slot for a new record, routed by the collection's shard
    /// fields. A missing shard field hashes as null.
    pub(crate) fn allocate_in(&self, collection: &str, content: &Content) -> Result<Rid> {
        let def = self.collection(collection)?;
        let key = ShardKey(
            def.shard_fields
                .iter()
                .map(|field| content.get(field).cloned().unwrap_or(Value::Null))
                .collect(),
        );
        let slot = self.inner.sharding.route(&key, def.clusters.len());
        self.inner.store.allocate(def.clusters[slot])
    }

    // ========================================================================
    // Access
    // ========================================================================

    pub fn store(&self) -> &ClusterStore {
        &self.inner.store
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.inner.indexes
    }

    /// New session against this database
    pub fn session(&self) -> Session {
        Session::new(self.clone())
    }

    /// Non-transactional read of the latest committed state
    pub fn read(&self, rid: Rid) -> Result<Record> {
        self.inner.store.read(rid)
    }

    /// Live record count across a collection's clusters
    pub fn record_count(&self, collection: &str) -> Result<u64> {
        let def = self.collection(collection)?;
        let mut total = 0;
        for cluster in def.clusters {
            total += self.inner.store.count(cluster)?;
        }
        Ok(total)
    }

    // ========================================================================
    // Conflict Configuration
    // ========================================================================

    pub fn set_conflict_strategy(&self, kind: ConflictStrategyKind) {
        self.inner.conflict.write().0 = kind;
    }

    pub fn set_merge_preference(&self, preference: MergePreference) {
        self.inner.conflict.write().1 = preference;
    }

    pub fn conflict_config(&self) -> (ConflictStrategyKind, MergePreference) {
        *self.inner.conflict.read()
    }

    // ========================================================================
    // Indexes
    // ========================================================================

    /// Create an index and populate it from the collection's existing
    /// records. A unique violation during population drops the half-built
    /// index and fails the creation.
    pub fn create_index(&self, def: IndexDefinition) -> Result<()> {
        let collection = self.collection(&def.collection)?;
        let mut entries = Vec::new();
        for cluster in &collection.clusters {
            for record in self.inner.store.scan(*cluster, false)? {
                if let Some(key) = def.extract_key(&record.content) {
                    entries.push((key, record.rid));
                }
            }
        }

        self.inner.indexes.create_index(def.clone())?;
        let core = self.inner.indexes.core(&def.name)?;
        let populated: Result<()> = {
            let mut guard = core.write();
            entries
                .into_iter()
                .try_for_each(|(key, rid)| guard.put(key, rid))
        };
        if let Err(err) = populated {
            let _ = self.inner.indexes.drop_index(&def.name);
            return Err(err);
        }
        tracing::debug!(index = %def.name, collection = %def.collection, "index created");
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.inner.indexes.drop_index(name)
    }

    // ========================================================================
    // Verification
    // ========================================================================

    /// Cross-check every index against the record store.
    ///
    /// Detects dangling entries (index rid with no readable record) and
    /// uniqueness breaches. Intended for tests and admin tooling; runs
    /// under read locks only.
    pub fn verify(&self) -> Result<()> {
        for name in self.inner.indexes.index_names() {
            let def = self.inner.indexes.definition(&name)?;
            let core = self.inner.indexes.core(&name)?;
            let core = core.read();
            for (key, rid) in core.range(None, None, (true, true)) {
                if self.inner.store.read(rid).is_err() {
                    return Err(StoreError::Corruption(format!(
                        "index '{}' entry {} references missing record {}",
                        name, key, rid
                    )));
                }
                if def.unique && core.get(&key).len() > 1 {
                    return Err(StoreError::Corruption(format!(
                        "unique index '{}' holds multiple records for key {}",
                        name, key
                    )));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Write a point-in-time image of the database to `dir`.
    ///
    /// The image is serialized to a temp file and renamed into place, so a
    /// crash mid-checkpoint never clobbers the previous one. Call from a
    /// quiesced database for a transactionally exact image.
    pub fn checkpoint(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let image = CheckpointImage {
            clusters: self.inner.store.snapshot(),
            indexes: self.inner.indexes.snapshot(),
            collections: {
                let mut defs: Vec<CollectionDef> =
                    self.inner.collections.read().values().cloned().collect();
                defs.sort_by(|a, b| a.name.cmp(&b.name));
                defs
            },
            conflict: self.conflict_config(),
        };
        let bytes =
            bincode::serialize(&image).map_err(|e| StoreError::Codec(e.to_string()))?;
        let tmp = dir.join(format!("{}.tmp", CHECKPOINT_FILE));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, dir.join(CHECKPOINT_FILE))?;
        tracing::debug!(bytes = bytes.len(), "checkpoint written");
        Ok(())
    }

    /// Rebuild a database from a checkpoint written by [`Database::checkpoint`]
    pub fn open(dir: &Path) -> Result<Self> {
        let bytes = fs::read(dir.join(CHECKPOINT_FILE))?;
        let image: CheckpointImage =
            bincode::deserialize(&bytes).map_err(|e| StoreError::Codec(e.to_string()))?;

        let mut collections = AHashMap::new();
        let mut owners = AHashMap::new();
        for def in image.collections {
            for id in &def.clusters {
                owners.insert(*id, def.name.clone());
            }
            collections.insert(def.name.clone(), def);
        }
        Ok(Self {
            inner: Arc::new(DbInner {
                store: ClusterStore::from_snapshot(image.clusters),
                indexes: IndexManager::from_snapshot(image.indexes),
                collections: RwLock::new(collections),
                cluster_owner: RwLock::new(owners),
                conflict: RwLock::new(image.conflict),
                sharding: HashSharding,
            }),
        })
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointImage {
    clusters: ClusterStoreSnapshot,
    indexes: IndexManagerSnapshot,
    collections: Vec<CollectionDef>,
    conflict: (ConflictStrategyKind, MergePreference),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::content_from;
    use crate::index::{CompositeKey, KeyValue};
    use crate::tx::{IsolationLevel, RetryPolicy, SessionState};
    use std::time::Duration;

    fn db_with(collection: &str, clusters: usize) -> Database {
        let db = Database::new();
        db.add_collection(collection, clusters, vec!["id".into()])
            .unwrap();
        db
    }

    fn commit_one(db: &Database, collection: &str, content: Content) -> Rid {
        let mut session = db.session();
        session.begin().unwrap();
        let rid = session.tx().unwrap().create(collection, content).unwrap();
        session.commit().unwrap();
        rid
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    #[test]
    fn test_session_lifecycle_illegal_states() {
        let db = db_with("docs", 1);
        let mut session = db.session();
        assert_eq!(session.state(), SessionState::None);
        assert!(session.commit().is_err());
        assert!(session.rollback().is_err());

        session.begin().unwrap();
        assert!(matches!(
            session.begin(),
            Err(StoreError::IllegalState(_))
        ));
        session.rollback().unwrap();
        assert_eq!(session.state(), SessionState::RolledBack);

        // session is reusable after a rollback
        session.begin().unwrap();
        session.commit().unwrap();
        assert_eq!(session.state(), SessionState::Committed);
    }

    #[test]
    fn test_create_read_update_delete_cycle() {
        let db = db_with("docs", 2);
        let rid = commit_one(&db, "docs", content_from([("id", 1i64), ("n", 10i64)]));

        let record = db.read(rid).unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.class.as_deref(), Some("docs"));

        let mut session = db.session();
        session.begin().unwrap();
        session
            .tx()
            .unwrap()
            .update(rid, content_from([("id", 1i64), ("n", 11i64)]))
            .unwrap();
        session.commit().unwrap();
        let record = db.read(rid).unwrap();
        assert_eq!(record.version, 2);
        assert_eq!(record.get("n"), Some(&Value::Int(11)));

        session.begin().unwrap();
        session.tx().unwrap().delete(rid).unwrap();
        session.commit().unwrap();
        assert!(matches!(db.read(rid), Err(StoreError::NotFound(_))));
        assert_eq!(db.record_count("docs").unwrap(), 0);
    }

    #[test]
    fn test_transaction_sees_own_writes() {
        let db = db_with("docs", 1);
        let mut session = db.session();
        session.begin().unwrap();
        let tx = session.tx().unwrap();
        let rid = tx.create("docs", content_from([("id", 7i64)])).unwrap();

        // visible inside, invisible outside until commit
        assert_eq!(tx.read(rid).unwrap().version, 0);
        assert!(db.read(rid).is_err());

        tx.update(rid, content_from([("id", 7i64), ("x", 1i64)])).unwrap();
        assert_eq!(tx.read(rid).unwrap().get("x"), Some(&Value::Int(1)));
        tx.delete(rid).unwrap();
        assert!(tx.read(rid).is_err());

        session.commit().unwrap();
        // created-then-deleted: position consumed, never readable
        assert!(db.read(rid).is_err());
        assert_eq!(db.record_count("docs").unwrap(), 0);
    }

    #[test]
    fn test_rollback_discards_and_buries() {
        let db = db_with("docs", 1);
        let mut session = db.session();
        session.begin().unwrap();
        let rid = session
            .tx()
            .unwrap()
            .create("docs", content_from([("id", 1i64)]))
            .unwrap();
        session.rollback().unwrap();

        assert!(db.read(rid).is_err());
        // the reserved position is not reissued to the next create
        let rid2 = commit_one(&db, "docs", content_from([("id", 1i64)]));
        assert_ne!(rid, rid2);
    }

    // ------------------------------------------------------------------
    // Isolation
    // ------------------------------------------------------------------

    #[test]
    fn test_repeatable_read_pins_first_read() {
        let db = db_with("docs", 1);
        let rid = commit_one(&db, "docs", content_from([("id", 1i64), ("n", 1i64)]));

        let mut reader = db.session();
        reader.set_isolation(IsolationLevel::RepeatableRead).unwrap();
        reader.begin().unwrap();
        assert_eq!(reader.tx().unwrap().read(rid).unwrap().version, 1);

        let mut writer = db.session();
        writer.begin().unwrap();
        writer
            .tx()
            .unwrap()
            .update(rid, content_from([("id", 1i64), ("n", 2i64)]))
            .unwrap();
        writer.commit().unwrap();

        // pinned view still serves version 1
        let pinned = reader.tx().unwrap().read(rid).unwrap();
        assert_eq!(pinned.version, 1);
        assert_eq!(pinned.get("n"), Some(&Value::Int(1)));
        reader.rollback().unwrap();

        // read-committed sees the latest
        let mut rc = db.session();
        rc.begin().unwrap();
        assert_eq!(rc.tx().unwrap().read(rid).unwrap().version, 2);
        rc.rollback().unwrap();
    }

    #[test]
    fn test_stale_update_is_rejected_and_retryable() {
        let db = db_with("docs", 1);
        let rid = commit_one(&db, "docs", content_from([("id", 1i64), ("n", 0i64)]));

        let mut s1 = db.session();
        let mut s2 = db.session();
        // pin s2's view so its update stays based on the pre-conflict version
        s2.set_isolation(IsolationLevel::RepeatableRead).unwrap();
        s1.begin().unwrap();
        s2.begin().unwrap();
        let base1 = s1.tx().unwrap().read(rid).unwrap();
        let base2 = s2.tx().unwrap().read(rid).unwrap();

        let mut c1 = base1.content.clone();
        c1.insert("n".into(), Value::Int(1));
        s1.tx().unwrap().update(rid, c1).unwrap();
        s1.commit().unwrap();

        let mut c2 = base2.content.clone();
        c2.insert("n".into(), Value::Int(2));
        s2.tx().unwrap().update(rid, c2).unwrap();
        let err = s2.commit().unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(s2.state(), SessionState::RolledBack);

        // first committer won
        assert_eq!(db.read(rid).unwrap().get("n"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_commit_is_all_or_nothing() {
        let db = db_with("docs", 1);
        let a = commit_one(&db, "docs", content_from([("id", 1i64), ("n", 0i64)]));
        let b = commit_one(&db, "docs", content_from([("id", 2i64), ("n", 0i64)]));

        let mut stale = db.session();
        stale.set_isolation(IsolationLevel::RepeatableRead).unwrap();
        stale.begin().unwrap();
        let base = stale.tx().unwrap().read(b).unwrap();
        // invalidate `b` behind the transaction's back
        let mut other = db.session();
        other.begin().unwrap();
        let mut c = base.content.clone();
        c.insert("n".into(), Value::Int(9));
        other.tx().unwrap().update(b, c).unwrap();
        other.commit().unwrap();

        // stale tx touches both records; neither write may land
        stale
            .tx()
            .unwrap()
            .update(a, content_from([("id", 1i64), ("n", 5i64)]))
            .unwrap();
        let mut c = base.content;
        c.insert("n".into(), Value::Int(5));
        stale.tx().unwrap().update(b, c).unwrap();
        assert!(stale.commit().is_err());

        assert_eq!(db.read(a).unwrap().get("n"), Some(&Value::Int(0)));
        assert_eq!(db.read(b).unwrap().get("n"), Some(&Value::Int(9)));
    }

    // ------------------------------------------------------------------
    // Conflict Strategies
    // ------------------------------------------------------------------

    #[test]
    fn test_automerge_disjoint_fields_commit() {
        let db = db_with("docs", 1);
        db.set_conflict_strategy(ConflictStrategyKind::AutoMerge);
        let rid = commit_one(
            &db,
            "docs",
            content_from([("id", 1i64), ("a", 1i64), ("b", 1i64)]),
        );

        let mut s1 = db.session();
        let mut s2 = db.session();
        s2.set_isolation(IsolationLevel::RepeatableRead).unwrap();
        s1.begin().unwrap();
        s2.begin().unwrap();
        let base1 = s1.tx().unwrap().read(rid).unwrap().content;
        let base2 = s2.tx().unwrap().read(rid).unwrap().content;

        let mut c1 = base1;
        c1.insert("a".into(), Value::Int(2));
        s1.tx().unwrap().update(rid, c1).unwrap();
        s1.commit().unwrap();

        let mut c2 = base2;
        c2.insert("b".into(), Value::Int(9));
        s2.tx().unwrap().update(rid, c2).unwrap();
        s2.commit().unwrap(); // merges instead of rejecting

        let merged = db.read(rid).unwrap();
        assert_eq!(merged.get("a"), Some(&Value::Int(2)));
        assert_eq!(merged.get("b"), Some(&Value::Int(9)));
        assert_eq!(merged.version, 3);
    }

    #[test]
    fn test_automerge_overlap_honors_preference() {
        let db = db_with("docs", 1);
        db.set_conflict_strategy(ConflictStrategyKind::AutoMerge);
        db.set_merge_preference(MergePreference::Incoming);
        let rid = commit_one(&db, "docs", content_from([("id", 1i64), ("a", 1i64)]));

        let mut s1 = db.session();
        let mut s2 = db.session();
        s2.set_isolation(IsolationLevel::RepeatableRead).unwrap();
        s1.begin().unwrap();
        s2.begin().unwrap();
        let base1 = s1.tx().unwrap().read(rid).unwrap().content;
        let base2 = s2.tx().unwrap().read(rid).unwrap().content;

        let mut c1 = base1;
        c1.insert("a".into(), Value::Int(2));
        s1.tx().unwrap().update(rid, c1).unwrap();
        s1.commit().unwrap();

        let mut c2 = base2;
        c2.insert("a".into(), Value::Int(3));
        s2.tx().unwrap().update(rid, c2).unwrap();
        s2.commit().unwrap();

        assert_eq!(db.read(rid).unwrap().get("a"), Some(&Value::Int(3)));
    }

    // ------------------------------------------------------------------
    // Concurrency
    // ------------------------------------------------------------------

    #[test]
    fn test_concurrent_increments_all_land() {
        let db = db_with("docs", 1);
        let a = commit_one(&db, "docs", content_from([("id", 1i64), ("n", 0i64)]));
        let b = commit_one(&db, "docs", content_from([("id", 2i64), ("n", 0i64)]));

        let threads = 4;
        let cycles = 50;
        let policy = RetryPolicy {
            max_attempts: 10_000,
            base_delay: Duration::from_micros(20),
            max_delay: Duration::from_millis(2),
        };

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let db = db.clone();
                let policy = policy.clone();
                std::thread::spawn(move || {
                    for _ in 0..cycles {
                        policy
                            .run(|| {
                                let mut session = db.session();
                                // pin the read so the increment is based on
                                // the exact version the commit validates
                                session.set_isolation(IsolationLevel::RepeatableRead)?;
                                session.begin()?;
                                for rid in [a, b] {
                                    let tx = session.tx()?;
                                    let current = tx.read(rid)?;
                                    let n = current.get("n").and_then(|v| v.as_i64()).unwrap_or(0);
                                    let mut next = current.content.clone();
                                    next.insert("n".into(), Value::Int(n + 1));
                                    tx.update(rid, next)?;
                                }
                                session.commit()
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let total = (threads * cycles) as i64;
        for rid in [a, b] {
            let record = db.read(rid).unwrap();
            assert_eq!(record.get("n"), Some(&Value::Int(total)));
            assert_eq!(record.version, 1 + total as u64);
        }
    }

    // ------------------------------------------------------------------
    // Sharding
    // ------------------------------------------------------------------

    #[test]
    fn test_records_spread_over_clusters() {
        let db = db_with("docs", 4);
        for i in 0..200i64 {
            commit_one(&db, "docs", content_from([("id", i)]));
        }
        let def = db.collection("docs").unwrap();
        for cluster in &def.clusters {
            assert!(db.store().count(*cluster).unwrap() > 0);
        }
        assert_eq!(db.record_count("docs").unwrap(), 200);
    }

    #[test]
    fn test_same_shard_key_routes_to_same_cluster() {
        let db = db_with("docs", 4);
        let r1 = commit_one(&db, "docs", content_from([("id", 42i64), ("v", 1i64)]));
        let r2 = commit_one(&db, "docs", content_from([("id", 42i64), ("v", 2i64)]));
        assert_eq!(r1.cluster, r2.cluster);
    }

    // ------------------------------------------------------------------
    // Indexes Through Transactions
    // ------------------------------------------------------------------

    #[test]
    fn test_index_maintained_across_crud() {
        let db = db_with("docs", 2);
        db.create_index(IndexDefinition::new("docs_tag", "docs", vec!["tag".into()]))
            .unwrap();

        let rid = commit_one(
            &db,
            "docs",
            content_from([("id", Value::Int(1)), ("tag", Value::from("red"))]),
        );
        assert_eq!(db.indexes().size("docs_tag").unwrap(), 1);

        let red = CompositeKey::single(KeyValue::Str("red".into()));
        let blue = CompositeKey::single(KeyValue::Str("blue".into()));

        let mut session = db.session();
        session.begin().unwrap();
        session
            .tx()
            .unwrap()
            .update(rid, content_from([("id", Value::Int(1)), ("tag", Value::from("blue"))]))
            .unwrap();
        // overlay visibility before commit
        assert!(session.tx().unwrap().index_get("docs_tag", &red).unwrap().is_empty());
        assert_eq!(
            session.tx().unwrap().index_get("docs_tag", &blue).unwrap(),
            vec![rid]
        );
        session.commit().unwrap();

        session.begin().unwrap();
        session.tx().unwrap().delete(rid).unwrap();
        session.commit().unwrap();
        assert_eq!(db.indexes().size("docs_tag").unwrap(), 0);
        db.verify().unwrap();
    }

    #[test]
    fn test_automerge_rekeys_index_entries() {
        let db = db_with("docs", 1);
        db.set_conflict_strategy(ConflictStrategyKind::AutoMerge);
        db.create_index(IndexDefinition::new("docs_f", "docs", vec!["f".into()]))
            .unwrap();
        let rid = commit_one(&db, "docs", content_from([("id", 1i64), ("f", 1i64)]));

        let mut stale = db.session();
        stale.set_isolation(IsolationLevel::RepeatableRead).unwrap();
        stale.begin().unwrap();
        let base = stale.tx().unwrap().read(rid).unwrap().content;

        // a winner moves f to 3, and its index entry with it
        let mut winner = db.session();
        winner.begin().unwrap();
        let mut w = winner.tx().unwrap().read(rid).unwrap().content;
        w.insert("f".into(), Value::Int(3));
        winner.tx().unwrap().update(rid, w).unwrap();
        winner.commit().unwrap();

        // the stale side merges f=2; stored wins, so the record keeps f=3
        let mut c = base;
        c.insert("f".into(), Value::Int(2));
        stale.tx().unwrap().update(rid, c).unwrap();
        stale.commit().unwrap();
        assert_eq!(db.read(rid).unwrap().get("f"), Some(&Value::Int(3)));

        // the index answers for the committed value, not the pre-merge one
        let handle = db.indexes().core("docs_f").unwrap();
        assert!(handle
            .read()
            .get(&CompositeKey::single(KeyValue::Int(2)))
            .is_empty());
        assert_eq!(
            handle.read().get(&CompositeKey::single(KeyValue::Int(3))),
            vec![rid]
        );
        assert_eq!(db.indexes().size("docs_f").unwrap(), 1);
        db.verify().unwrap();
    }

    #[test]
    fn test_composite_index_keys_omitted_trailing_fields_as_null() {
        let db = db_with("events", 1);
        db.create_index(
            IndexDefinition::new("events_kv", "events", vec!["kind".into(), "sub".into()])
                .ignore_null_values(false),
        )
        .unwrap();

        let mut rids = Vec::new();
        for i in 0..8i64 {
            let kind = if i < 4 { "a" } else { "b" };
            let mut content =
                content_from([("id", Value::Int(i)), ("kind", Value::from(kind))]);
            if i % 2 == 0 {
                content.insert("sub".into(), Value::Int(i));
            }
            rids.push(commit_one(&db, "events", content));
        }

        // every record is indexed; an omitted trailing field keys as null
        assert_eq!(db.indexes().size("events_kv").unwrap(), 8);

        let prefix_a = CompositeKey::single(KeyValue::Str("a".into()));
        let a_null = CompositeKey::new(vec![KeyValue::Str("a".into()), KeyValue::Null]);
        let mut session = db.session();
        session.begin().unwrap();
        assert_eq!(
            session.tx().unwrap().index_prefix("events_kv", &prefix_a).unwrap().len(),
            4
        );
        assert_eq!(
            session.tx().unwrap().index_get("events_kv", &a_null).unwrap().len(),
            2
        );
        session.rollback().unwrap();

        // filling in the field moves the entry off the null key
        session.begin().unwrap();
        session
            .tx()
            .unwrap()
            .update(
                rids[1],
                content_from([
                    ("id", Value::Int(1)),
                    ("kind", Value::from("a")),
                    ("sub", Value::Int(9)),
                ]),
            )
            .unwrap();
        session.commit().unwrap();

        assert_eq!(db.indexes().size("events_kv").unwrap(), 8);
        let handle = db.indexes().core("events_kv").unwrap();
        assert_eq!(handle.read().get(&a_null).len(), 1);
        db.verify().unwrap();
    }

    #[test]
    fn test_unique_violation_rejects_whole_commit() {
        let db = db_with("docs", 1);
        db.create_index(
            IndexDefinition::new("docs_id", "docs", vec!["id".into()]).unique(),
        )
        .unwrap();
        commit_one(&db, "docs", content_from([("id", 1i64)]));

        let mut session = db.session();
        session.begin().unwrap();
        session
            .tx()
            .unwrap()
            .create("docs", content_from([("id", 2i64)]))
            .unwrap();
        session
            .tx()
            .unwrap()
            .create("docs", content_from([("id", 1i64)]))
            .unwrap();
        let err = session.commit().unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));

        // nothing from the rejected transaction landed
        assert_eq!(db.record_count("docs").unwrap(), 1);
        assert_eq!(db.indexes().size("docs_id").unwrap(), 1);
        db.verify().unwrap();
    }

    #[test]
    fn test_index_population_on_create() {
        let db = db_with("docs", 2);
        for i in 0..10i64 {
            commit_one(&db, "docs", content_from([("id", i), ("m", i % 3)]));
        }
        db.create_index(IndexDefinition::new("docs_m", "docs", vec!["m".into()]))
            .unwrap();
        assert_eq!(db.indexes().size("docs_m").unwrap(), 10);

        let core = db.indexes().core("docs_m").unwrap();
        let zero = CompositeKey::single(KeyValue::Int(0));
        assert_eq!(core.read().get(&zero).len(), 4); // 0, 3, 6, 9
    }

    // ------------------------------------------------------------------
    // Durability
    // ------------------------------------------------------------------

    #[test]
    fn test_checkpoint_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_with("docs", 2);
        db.create_index(IndexDefinition::new("docs_tag", "docs", vec!["tag".into()]))
            .unwrap();
        db.set_conflict_strategy(ConflictStrategyKind::AutoMerge);
        let rid = commit_one(
            &db,
            "docs",
            content_from([("id", Value::Int(1)), ("tag", Value::from("red"))]),
        );
        db.checkpoint(dir.path()).unwrap();

        let reopened = Database::open(dir.path()).unwrap();
        assert_eq!(reopened.record_count("docs").unwrap(), 1);
        assert_eq!(reopened.read(rid).unwrap().get("tag"), Some(&Value::String("red".into())));
        assert_eq!(reopened.indexes().size("docs_tag").unwrap(), 1);
        assert_eq!(
            reopened.conflict_config().0,
            ConflictStrategyKind::AutoMerge
        );
        reopened.verify().unwrap();

        // versions survive: a stale update against the reopened store still
        // conflicts
        reopened.set_conflict_strategy(ConflictStrategyKind::Default);
        let mut session = reopened.session();
        session.begin().unwrap();
        session
            .tx()
            .unwrap()
            .update(rid, content_from([("id", Value::Int(1)), ("tag", Value::from("blue"))]))
            .unwrap();
        session.commit().unwrap();
        assert_eq!(reopened.read(rid).unwrap().version, 2);
    }
}
