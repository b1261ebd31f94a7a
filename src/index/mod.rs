//! Secondary indexing - ordered composite-key indexes with a
//! transaction-scoped overlay
//!
//! The base index is shared across all transactions; each transaction owns
//! a private buffered delta that is merged over the base on read and
//! flushed (or discarded) at commit (or rollback).

pub mod core;
pub mod key;
pub mod manager;
pub mod overlay;

pub use self::core::IndexCore;
pub use key::{CompositeKey, KeyValue, NullPolicy};
pub use manager::{IndexDefinition, IndexManager, IndexManagerSnapshot};
pub use overlay::{IndexOverlay, OverlayOp};
