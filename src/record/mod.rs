//! Record identity and versioned record state
//!
//! A record's identity is its [`Rid`]: the physical cluster it lives in and
//! its sequence position inside that cluster. The identity is permanent;
//! a deleted slot becomes a tombstone and its position is never reused for
//! a different logical record.

use serde::{Deserialize, Serialize};

use crate::data::Content;

// ============================================================================
// Record Identifier
// ============================================================================

/// Record identifier: `(cluster-id, sequence-position)`.
///
/// Immutable once assigned. Formats as `#cluster:position`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Rid {
    pub cluster: u32,
    pub position: u64,
}

impl Rid {
    pub const fn new(cluster: u32, position: u64) -> Self {
        Self { cluster, position }
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}:{}", self.cluster, self.position)
    }
}

// ============================================================================
// Record
// ============================================================================

/// A versioned, schemaless record.
///
/// `version` starts at 0 on creation and increases by exactly 1 on every
/// successful committed mutation. Content identity for conflict comparison
/// is `(rid, version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub rid: Rid,
    pub version: u64,
    /// Optional type tag assigned by the schema layer
    pub class: Option<String>,
    pub content: Content,
}

impl Record {
    pub fn new(rid: Rid, version: u64, content: Content) -> Self {
        Self {
            rid,
            version,
            class: None,
            content,
        }
    }

    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    /// Field accessor
    pub fn get(&self, field: &str) -> Option<&crate::data::Value> {
        self.content.get(field)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::content_from;

    #[test]
    fn test_rid_display_and_order() {
        let a = Rid::new(3, 10);
        let b = Rid::new(3, 11);
        assert_eq!(a.to_string(), "#3:10");
        assert!(a < b);
        assert!(Rid::new(2, 99) < a);
    }

    #[test]
    fn test_record_field_access() {
        let r = Record::new(Rid::new(0, 0), 0, content_from([("name", "alice")]))
            .with_class("Person");
        assert_eq!(r.get("name").and_then(|v| v.as_str()), Some("alice"));
        assert_eq!(r.class.as_deref(), Some("Person"));
    }
}
