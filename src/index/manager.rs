//! Index manager - definitions, registry, and incremental maintenance
//!
//! The schema layer registers an immutable [`IndexDefinition`] per index
//! (collection, field list, uniqueness, null policy). The manager owns the
//! base index instances and extracts composite keys from record content for
//! incremental maintenance; it never recomputes an index from scratch
//! except at creation time.

use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::core::IndexCore;
use super::key::{CompositeKey, KeyValue, NullPolicy};
use crate::data::Content;
use crate::{Result, StoreError};

// ============================================================================
// Index Definition
// ============================================================================

/// Immutable description of one index, fixed at creation time.
///
/// Changing the field list or null policy requires drop and recreate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name, unique within the database
    pub name: String,
    /// Collection (class) the index is defined over
    pub collection: String,
    /// Indexed fields, in key-component order
    pub fields: Vec<String>,
    pub unique: bool,
    pub null_policy: NullPolicy,
    /// Creation timestamp (epoch seconds)
    pub created_at: i64,
}

impl IndexDefinition {
    pub fn new(name: &str, collection: &str, fields: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            collection: collection.to_string(),
            fields,
            unique: false,
            null_policy: NullPolicy::default(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set the null policy from the schema layer's `ignore_null_values` flag
    pub fn ignore_null_values(mut self, ignore: bool) -> Self {
        self.null_policy = NullPolicy::from_ignore_null_values(ignore);
        self
    }

    /// Extract this index's composite key from record content.
    ///
    /// A missing field indexes as a null component. Returns `None` when the
    /// key is inadmissible under the null policy (record stays unindexed).
    pub fn extract_key(&self, content: &Content) -> Option<CompositeKey> {
        let components: Vec<KeyValue> = self
            .fields
            .iter()
            .map(|field| {
                content
                    .get(field)
                    .map(KeyValue::from_value)
                    .unwrap_or(KeyValue::Null)
            })
            .collect();
        let key = CompositeKey::new(components);
        self.null_policy.admits(&key).then_some(key)
    }
}

// ============================================================================
// Index Manager
// ============================================================================

struct IndexSlot {
    def: IndexDefinition,
    core: Arc<RwLock<IndexCore>>,
}

/// Serializable image of all indexes, used by checkpointing
#[derive(Debug, Serialize, Deserialize)]
pub struct IndexManagerSnapshot {
    indexes: Vec<(IndexDefinition, IndexCore)>,
}

/// Owns every base index of a database instance
pub struct IndexManager {
    indexes: RwLock<AHashMap<String, IndexSlot>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(AHashMap::new()),
        }
    }

    /// Register a new index. Fails if the name is taken.
    pub fn create_index(&self, def: IndexDefinition) -> Result<()> {
        let mut indexes = self.indexes.write();
        if indexes.contains_key(&def.name) {
            return Err(StoreError::IllegalState(format!(
                "index '{}' already exists",
                def.name
            )));
        }
        let core = IndexCore::new(&def.name, def.unique, def.null_policy);
        indexes.insert(
            def.name.clone(),
            IndexSlot {
                def,
                core: Arc::new(RwLock::new(core)),
            },
        );
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        self.indexes
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StoreError::IndexNotFound(name.to_string()))
    }

    pub fn definition(&self, name: &str) -> Result<IndexDefinition> {
        self.indexes
            .read()
            .get(name)
            .map(|slot| slot.def.clone())
            .ok_or_else(|| StoreError::IndexNotFound(name.to_string()))
    }

    /// Shared handle to a base index instance
    pub fn core(&self, name: &str) -> Result<Arc<RwLock<IndexCore>>> {
        self.indexes
            .read()
            .get(name)
            .map(|slot| Arc::clone(&slot.core))
            .ok_or_else(|| StoreError::IndexNotFound(name.to_string()))
    }

    /// Definitions of every index over a collection
    pub fn indexes_for(&self, collection: &str) -> Vec<IndexDefinition> {
        let mut defs: Vec<IndexDefinition> = self
            .indexes
            .read()
            .values()
            .filter(|slot| slot.def.collection == collection)
            .map(|slot| slot.def.clone())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// All index names, sorted
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.indexes.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Entry count of an index (admin/test accessor)
    pub fn size(&self, name: &str) -> Result<u64> {
        Ok(self.core(name)?.read().len())
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    pub fn snapshot(&self) -> IndexManagerSnapshot {
        let indexes = self.indexes.read();
        let mut out: Vec<(IndexDefinition, IndexCore)> = indexes
            .values()
            .map(|slot| (slot.def.clone(), slot.core.read().clone()))
            .collect();
        out.sort_by(|(a, _), (b, _)| a.name.cmp(&b.name));
        IndexManagerSnapshot { indexes: out }
    }

    pub fn from_snapshot(snapshot: IndexManagerSnapshot) -> Self {
        let mut map = AHashMap::new();
        for (def, core) in snapshot.indexes {
            map.insert(
                def.name.clone(),
                IndexSlot {
                    def,
                    core: Arc::new(RwLock::new(core)),
                },
            );
        }
        Self {
            indexes: RwLock::new(map),
        }
    }
}

impl Default for IndexManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{content_from, Value};

    #[test]
    fn test_create_and_duplicate_name() {
        let mgr = IndexManager::new();
        mgr.create_index(IndexDefinition::new("people_name", "people", vec!["name".into()]))
            .unwrap();
        let err = mgr
            .create_index(IndexDefinition::new("people_name", "people", vec!["name".into()]))
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalState(_)));
    }

    #[test]
    fn test_extract_key_missing_field_is_null() {
        let def = IndexDefinition::new("idx", "c", vec!["a".into(), "b".into()])
            .ignore_null_values(false);
        let content = content_from([("a", 1i64)]);

        let key = def.extract_key(&content).unwrap();
        assert_eq!(key.0, vec![KeyValue::Int(1), KeyValue::Null]);
    }

    #[test]
    fn test_extract_key_respects_ignore_nulls() {
        let def = IndexDefinition::new("idx", "c", vec!["a".into(), "b".into()]);
        // default policy ignores nulls: record with a missing component is
        // excluded from the index entirely
        let content = content_from([("a", 1i64)]);
        assert!(def.extract_key(&content).is_none());

        let full = content_from([("a", 1i64), ("b", 2i64)]);
        assert!(def.extract_key(&full).is_some());
    }

    #[test]
    fn test_indexes_for_collection() {
        let mgr = IndexManager::new();
        mgr.create_index(IndexDefinition::new("b_idx", "people", vec!["b".into()]))
            .unwrap();
        mgr.create_index(IndexDefinition::new("a_idx", "people", vec!["a".into()]))
            .unwrap();
        mgr.create_index(IndexDefinition::new("other", "cars", vec!["x".into()]))
            .unwrap();

        let defs = mgr.indexes_for("people");
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "a_idx"); // sorted
    }

    #[test]
    fn test_drop_index() {
        let mgr = IndexManager::new();
        mgr.create_index(IndexDefinition::new("idx", "c", vec!["f".into()]))
            .unwrap();
        mgr.drop_index("idx").unwrap();
        assert!(matches!(mgr.core("idx"), Err(StoreError::IndexNotFound(_))));
        assert!(matches!(mgr.drop_index("idx"), Err(StoreError::IndexNotFound(_))));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mgr = IndexManager::new();
        mgr.create_index(
            IndexDefinition::new("idx", "c", vec!["f".into()]).unique(),
        )
        .unwrap();
        mgr.core("idx")
            .unwrap()
            .write()
            .put(CompositeKey::single(KeyValue::Int(1)), crate::record::Rid::new(0, 0))
            .unwrap();

        let bytes = bincode::serialize(&mgr.snapshot()).unwrap();
        let restored: IndexManagerSnapshot = bincode::deserialize(&bytes).unwrap();
        let mgr2 = IndexManager::from_snapshot(restored);

        assert_eq!(mgr2.size("idx").unwrap(), 1);
        assert!(mgr2.definition("idx").unwrap().unique);
    }

    #[test]
    fn test_size_accessor() {
        let mgr = IndexManager::new();
        mgr.create_index(IndexDefinition::new("idx", "c", vec!["f".into()]))
            .unwrap();
        assert_eq!(mgr.size("idx").unwrap(), 0);

        let core = mgr.core("idx").unwrap();
        core.write()
            .put(
                CompositeKey::single(KeyValue::Int(5)),
                crate::record::Rid::new(1, 2),
            )
            .unwrap();
        assert_eq!(mgr.size("idx").unwrap(), 1);

        let content = content_from([("f", Value::Int(5))]);
        let key = mgr.definition("idx").unwrap().extract_key(&content).unwrap();
        assert_eq!(core.read().get(&key).len(), 1);
    }
}
