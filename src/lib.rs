//! Polystore Core Storage Engine
//!
//! An embedded multi-model storage core: versioned records distributed
//! across physical clusters, optimistic multi-version concurrency control,
//! transaction-scoped secondary indexing, and pluggable conflict resolution
//! for concurrent writers.
//!
//! Higher layers (query language, object/graph mapping, schema DDL,
//! security) consume this core through record CRUD, index put/get/remove,
//! and the transaction lifecycle only.

pub mod cluster;
pub mod data;
pub mod db;
pub mod index;
pub mod record;
pub mod tx;

// Re-export main types
pub use cluster::{ClusterId, ClusterStore, HashSharding, ShardKey};
pub use data::{DataType, Value};
pub use db::{CollectionDef, Database};
pub use index::{CompositeKey, IndexCore, IndexDefinition, KeyValue, NullPolicy};
pub use record::{Record, Rid};
pub use tx::{
    ConflictStrategyKind, IsolationLevel, MergePreference, RetryPolicy, Session, Transaction,
};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Record {0} not found")]
    NotFound(record::Rid),

    #[error("Version conflict on {rid}: expected {expected}, stored {actual}")]
    VersionConflict {
        rid: record::Rid,
        expected: u64,
        actual: u64,
    },

    #[error("Duplicate key {key} in unique index '{index}'")]
    DuplicateKey { index: String, key: String },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Cluster {0} not found")]
    ClusterNotFound(cluster::ClusterId),

    #[error("Index '{0}' not found")]
    IndexNotFound(String),

    #[error("Collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl StoreError {
    /// Whether a caller may sensibly retry the failed operation.
    ///
    /// Version conflicts are expected, frequent outcomes of optimistic
    /// concurrency; everything else is either a lookup miss or a fatal
    /// programming/consistency error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
