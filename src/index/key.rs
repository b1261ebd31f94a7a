//! Index keys - comparable scalar components and composite keys
//!
//! Composite keys compare lexicographically by position with a total order
//! over each scalar type. A null component sorts before every non-null
//! value of the same position; whether null components are indexed at all
//! is the index's [`NullPolicy`], fixed at creation time.

use serde::{Deserialize, Serialize};

use crate::data::Value;

// ============================================================================
// Key Value
// ============================================================================

/// A single comparable key component extracted from a record field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// Float stored as ordered bits for a correct Ord implementation
    Float(u64),
    Str(String),
    Bytes(Vec<u8>),
    /// Instant in epoch milliseconds
    Date(i64),
}

impl KeyValue {
    /// Convert a record field value into a key component
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => KeyValue::Null,
            Value::Bool(b) => KeyValue::Bool(*b),
            Value::Int(v) => KeyValue::Int(*v),
            Value::UInt(v) => KeyValue::UInt(*v),
            Value::Float(f) => KeyValue::Float(f.to_bits()),
            Value::String(s) => KeyValue::Str(s.clone()),
            Value::Bytes(b) => KeyValue::Bytes(b.clone()),
            Value::Date(d) => KeyValue::Date(*d),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, KeyValue::Null)
    }

    fn type_rank(&self) -> u8 {
        match self {
            KeyValue::Null => 0,
            KeyValue::Bool(_) => 1,
            KeyValue::Int(_) | KeyValue::UInt(_) => 2,
            KeyValue::Float(_) => 3,
            KeyValue::Str(_) => 4,
            KeyValue::Bytes(_) => 5,
            KeyValue::Date(_) => 6,
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (KeyValue::Null, KeyValue::Null) => Ordering::Equal,
            // Null sorts before all non-null values of the same position
            (KeyValue::Null, _) => Ordering::Less,
            (_, KeyValue::Null) => Ordering::Greater,
            (KeyValue::Bool(a), KeyValue::Bool(b)) => a.cmp(b),
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::UInt(a), KeyValue::UInt(b)) => a.cmp(b),
            // Integers compare by magnitude across signedness
            (KeyValue::Int(a), KeyValue::UInt(b)) => {
                if *a < 0 {
                    Ordering::Less
                } else {
                    (*a as u64).cmp(b)
                }
            }
            (KeyValue::UInt(a), KeyValue::Int(b)) => {
                if *b < 0 {
                    Ordering::Greater
                } else {
                    a.cmp(&(*b as u64))
                }
            }
            (KeyValue::Float(a), KeyValue::Float(b)) => {
                float_order(*a).cmp(&float_order(*b))
            }
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            (KeyValue::Bytes(a), KeyValue::Bytes(b)) => a.cmp(b),
            (KeyValue::Date(a), KeyValue::Date(b)) => a.cmp(b),
            // Cross-type: stable rank order
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Monotone bit transform giving floats a total order (IEEE totalOrder)
fn float_order(bits: u64) -> u64 {
    if bits >> 63 == 0 {
        bits ^ (1 << 63)
    } else {
        !bits
    }
}

// Eq and Hash must agree with `cmp`: `Int(5)` and `UInt(5)` are the same
// key, so both compare equal and hash identically.
impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl std::hash::Hash for KeyValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            KeyValue::Null => {}
            KeyValue::Bool(b) => b.hash(state),
            // Int and UInt share a rank; hashing through a common width
            // keeps equal cross-signed magnitudes on one hash
            KeyValue::Int(v) => (*v as i128).hash(state),
            KeyValue::UInt(v) => (*v as i128).hash(state),
            KeyValue::Float(v) => v.hash(state),
            KeyValue::Str(s) => s.hash(state),
            KeyValue::Bytes(b) => b.hash(state),
            KeyValue::Date(d) => d.hash(state),
        }
    }
}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyValue::Null => write!(f, "null"),
            KeyValue::Bool(b) => write!(f, "{b}"),
            KeyValue::Int(v) => write!(f, "{v}"),
            KeyValue::UInt(v) => write!(f, "{v}"),
            KeyValue::Float(v) => write!(f, "{}", f64::from_bits(*v)),
            KeyValue::Str(s) => write!(f, "'{s}'"),
            KeyValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            KeyValue::Date(d) => write!(f, "@{d}"),
        }
    }
}

// ============================================================================
// Composite Key
// ============================================================================

/// An ordered, fixed-arity tuple of key components.
///
/// Compares lexicographically by position; with a shared prefix, the
/// shorter key sorts first, which makes prefix range scans contiguous.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CompositeKey(pub Vec<KeyValue>);

impl CompositeKey {
    pub fn new(components: Vec<KeyValue>) -> Self {
        Self(components)
    }

    pub fn single(component: KeyValue) -> Self {
        Self(vec![component])
    }

    /// Build from field values in index-field order
    pub fn from_values(values: &[Value]) -> Self {
        Self(values.iter().map(KeyValue::from_value).collect())
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// Whether any component is null
    pub fn has_null(&self) -> bool {
        self.0.iter().any(KeyValue::is_null)
    }

    /// Whether this key's leading components equal `prefix`
    pub fn starts_with(&self, prefix: &CompositeKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }
}

impl From<KeyValue> for CompositeKey {
    fn from(component: KeyValue) -> Self {
        Self::single(component)
    }
}

impl From<&Value> for CompositeKey {
    fn from(value: &Value) -> Self {
        Self::single(KeyValue::from_value(value))
    }
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{c}")?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// Null Policy
// ============================================================================

/// How an index treats keys with null components. Recorded immutably at
/// index creation (`ignore_null_values`); changing it requires
/// drop-and-recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NullPolicy {
    /// Any null component excludes the record from the index (the default)
    IgnoreNulls,
    /// Null components are indexed and sort before non-null values
    IncludeNulls,
}

impl NullPolicy {
    pub fn from_ignore_null_values(ignore: bool) -> Self {
        if ignore {
            NullPolicy::IgnoreNulls
        } else {
            NullPolicy::IncludeNulls
        }
    }

    /// Whether a key is admissible under this policy
    pub fn admits(&self, key: &CompositeKey) -> bool {
        match self {
            NullPolicy::IgnoreNulls => !key.has_null(),
            NullPolicy::IncludeNulls => true,
        }
    }
}

impl Default for NullPolicy {
    fn default() -> Self {
        NullPolicy::IgnoreNulls
    }
}

// ============================================================================
// Tests
// ============================================================================
