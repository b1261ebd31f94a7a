//! Optimistic transaction layer
//!
//! Architecture:
//!
//! ```text
//!   Session ──> Transaction ──> TxContext      (buffered writes + overlays)
//!                  │
//!                  ├──> ClusterStore           (reads; CAS apply at commit)
//!                  ├──> IndexManager           (base indexes; staged at commit)
//!                  └──> ConflictStrategy       (version mismatch resolution)
//! ```
//!
//! No locks are taken while a transaction runs. All its record writes and
//! index operations are buffered in the [`TxContext`]; commit acquires the
//! involved cluster locks once, validates every expected version, and applies
//! the whole batch or none of it. A version mismatch is routed through the
//! database's [`ConflictStrategy`] before the commit is rejected.

pub mod conflict;
pub mod context;
pub mod manager;
pub mod retry;

pub use conflict::{
    ConflictContext, ConflictStrategy, ConflictStrategyKind, MergePreference, Resolution,
};
pub use context::{FinalOp, TxContext, TxWrite};
pub use manager::{Session, SessionState, Transaction};
pub use retry::RetryPolicy;

use serde::{Deserialize, Serialize};

/// Read visibility of data committed by others while a transaction runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Every read observes the latest committed state
    #[default]
    ReadCommitted,
    /// The first read of a record pins the view for the rest of the
    /// transaction; commit validation still runs against latest versions
    RepeatableRead,
}
