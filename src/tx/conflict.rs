//! Conflict resolution strategies
//!
//! When commit validation finds a stored version newer than the one a
//! transaction based its write on, the configured strategy decides what
//! happens. The default rejects the commit with a retryable error. The
//! auto-merge strategy salvages updates whose changed fields are disjoint
//! from the concurrent writer's, falling back to a per-field preference when
//! both sides touched the same field.

use serde::{Deserialize, Serialize};

use crate::data::Content;
use crate::record::Rid;
use crate::{Result, StoreError};

// ============================================================================
// Strategy Selection
// ============================================================================

/// Which conflict strategy a database runs with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictStrategyKind {
    /// Reject the commit on any version mismatch
    #[default]
    Default,
    /// Field-level merge of concurrent updates where possible
    AutoMerge,
}

/// Tie-break for a field both writers changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MergePreference {
    /// The already-committed value wins
    #[default]
    Stored,
    /// The incoming transaction's value wins
    Incoming,
}

// ============================================================================
// Strategy Interface
// ============================================================================

/// Everything a strategy may inspect about one conflicting update
pub struct ConflictContext<'a> {
    pub rid: Rid,
    /// Version the transaction based its write on
    pub expected: u64,
    /// Version currently stored
    pub actual: u64,
    /// Content as of the expected version (the transaction's base image)
    pub old: &'a Content,
    /// Content the transaction wants to write
    pub incoming: &'a Content,
    /// Content currently stored
    pub stored: &'a Content,
}

/// Outcome of a successfully resolved conflict
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Content to write in place of the transaction's version
    pub content: Content,
}

/// Decides the fate of an update whose base version is stale.
///
/// Only updates are negotiable: a conflicting delete always rejects, and
/// creates target freshly reserved slots no other writer can see.
pub trait ConflictStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Result<Resolution>;
}

// ============================================================================
// Default: Reject
// ============================================================================

/// First committer wins; the loser gets a retryable version conflict.
pub struct VersionStrategy;

impl ConflictStrategy for VersionStrategy {
    fn name(&self) -> &'static str {
        "version"
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Result<Resolution> {
        Err(StoreError::VersionConflict {
            rid: ctx.rid,
            expected: ctx.expected,
            actual: ctx.actual,
        })
    }
}

// ============================================================================
// Auto-Merge
// ============================================================================

/// Merges concurrent updates field by field against their common base image.
///
/// A field counts as changed by a side when its value (or presence) differs
/// from the base. Disjoint change sets merge cleanly; a field changed by
/// both sides resolves per [`MergePreference`].
pub struct AutoMergeStrategy {
    pub preference: MergePreference,
}

impl AutoMergeStrategy {
    pub fn new(preference: MergePreference) -> Self {
        Self { preference }
    }
}

impl ConflictStrategy for AutoMergeStrategy {
    fn name(&self) -> &'static str {
        "automerge"
    }

    fn resolve(&self, ctx: &ConflictContext<'_>) -> Result<Resolution> {
        let mut merged = ctx.stored.clone();

        let mut fields: Vec<&String> = ctx
            .old
            .keys()
            .chain(ctx.incoming.keys())
            .chain(ctx.stored.keys())
            .collect();
        fields.sort();
        fields.dedup();

        for field in fields {
            let base = ctx.old.get(field);
            let incoming = ctx.incoming.get(field);
            let stored = ctx.stored.get(field);

            let incoming_changed = incoming != base;
            let stored_changed = stored != base;

            let winner = match (incoming_changed, stored_changed) {
                (false, _) => continue, // stored value already in place
                (true, false) => incoming,
                (true, true) => match self.preference {
                    MergePreference::Stored => continue,
                    MergePreference::Incoming => incoming,
                },
            };
            match winner {
                Some(value) => {
                    merged.insert(field.clone(), value.clone());
                }
                None => {
                    merged.remove(field);
                }
            }
        }

        Ok(Resolution { content: merged })
    }
}

/// Instantiate the strategy a database is configured with
pub fn strategy_for(
    kind: ConflictStrategyKind,
    preference: MergePreference,
) -> Box<dyn ConflictStrategy> {
    match kind {
        ConflictStrategyKind::Default => Box::new(VersionStrategy),
        ConflictStrategyKind::AutoMerge => Box::new(AutoMergeStrategy::new(preference)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{content_from, Value};

    fn ctx<'a>(old: &'a Content, incoming: &'a Content, stored: &'a Content) -> ConflictContext<'a> {
        ConflictContext {
            rid: Rid::new(0, 0),
            expected: 1,
            actual: 2,
            old,
            incoming,
            stored,
        }
    }

    #[test]
    fn test_version_strategy_always_rejects() {
        let old = content_from([("a", 1i64)]);
        let incoming = content_from([("a", 2i64)]);
        let stored = content_from([("a", 3i64)]);

        let err = VersionStrategy
            .resolve(&ctx(&old, &incoming, &stored))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_automerge_disjoint_fields() {
        // one writer bumped `a`, the other bumped `b`; both survive
        let old = content_from([("a", 1i64), ("b", 10i64)]);
        let incoming = content_from([("a", 2i64), ("b", 10i64)]);
        let stored = content_from([("a", 1i64), ("b", 11i64)]);

        let merged = AutoMergeStrategy::new(MergePreference::Stored)
            .resolve(&ctx(&old, &incoming, &stored))
            .unwrap()
            .content;
        assert_eq!(merged, content_from([("a", 2i64), ("b", 11i64)]));
    }

    #[test]
    fn test_automerge_overlap_stored_wins() {
        let old = content_from([("a", 1i64)]);
        let incoming = content_from([("a", 2i64)]);
        let stored = content_from([("a", 3i64)]);

        let merged = AutoMergeStrategy::new(MergePreference::Stored)
            .resolve(&ctx(&old, &incoming, &stored))
            .unwrap()
            .content;
        assert_eq!(merged.get("a"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_automerge_overlap_incoming_preference() {
        let old = content_from([("a", 1i64)]);
        let incoming = content_from([("a", 2i64)]);
        let stored = content_from([("a", 3i64)]);

        let merged = AutoMergeStrategy::new(MergePreference::Incoming)
            .resolve(&ctx(&old, &incoming, &stored))
            .unwrap()
            .content;
        assert_eq!(merged.get("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_automerge_incoming_field_removal() {
        // incoming dropped `b`, stored never touched it
        let old = content_from([("a", 1i64), ("b", 2i64)]);
        let incoming = content_from([("a", 1i64)]);
        let stored = content_from([("a", 1i64), ("b", 2i64), ("c", 3i64)]);

        let merged = AutoMergeStrategy::new(MergePreference::Stored)
            .resolve(&ctx(&old, &incoming, &stored))
            .unwrap()
            .content;
        assert!(!merged.contains_key("b"));
        assert_eq!(merged.get("c"), Some(&Value::Int(3)));
    }
}
