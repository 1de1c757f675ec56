//! Identity tuples for mapped rows.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::value::Value;

static NEXT_PLACEHOLDER: AtomicU64 = AtomicU64::new(1);

/// Ordered, fixed-arity tuple of key values identifying one row.
///
/// Equality and hashing over real keys are element-wise. A placeholder key,
/// handed to objects that have no row yet, is only ever equal to itself
/// (and its clones).
#[derive(Clone)]
pub struct MappedObjectKeys(Repr);

#[derive(Clone)]
enum Repr {
    Placeholder(u64),
    Values(Arc<[Value]>),
}

impl MappedObjectKeys {
    /// A fresh placeholder distinct from every other key.
    pub fn placeholder() -> Self {
        Self(Repr::Placeholder(
            NEXT_PLACEHOLDER.fetch_add(1, Ordering::Relaxed),
        ))
    }

    pub fn new(values: impl Into<Vec<Value>>) -> Self {
        Self(Repr::Values(Arc::from(values.into())))
    }

    /// `true` for placeholder keys.
    pub fn is_placeholder(&self) -> bool {
        matches!(self.0, Repr::Placeholder(_))
    }

    /// `true` when any component is NULL, i.e. the row identity is unknown.
    pub fn has_null(&self) -> bool {
        self.values().iter().any(Value::is_null)
    }

    /// Key components; empty for a placeholder.
    pub fn values(&self) -> &[Value] {
        match &self.0 {
            Repr::Placeholder(_) => &[],
            Repr::Values(values) => values,
        }
    }

    pub fn arity(&self) -> usize {
        self.values().len()
    }
}

impl PartialEq for MappedObjectKeys {
    fn eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (Repr::Placeholder(a), Repr::Placeholder(b)) => a == b,
            (Repr::Values(a), Repr::Values(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for MappedObjectKeys {}

impl Hash for MappedObjectKeys {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Repr::Placeholder(id) => {
                state.write_u8(0);
                id.hash(state);
            }
            Repr::Values(values) => {
                state.write_u8(1);
                values.hash(state);
            }
        }
    }
}

impl fmt::Display for MappedObjectKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Repr::Placeholder(id) => write!(f, "<new #{}>", id),
            Repr::Values(values) => {
                write!(f, "(")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl fmt::Debug for MappedObjectKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappedObjectKeys{}", self)
    }
}

impl From<Value> for MappedObjectKeys {
    fn from(value: Value) -> Self {
        Self::new(vec![value])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn structural_equality() {
        let a = MappedObjectKeys::new(vec![Value::Int(1), Value::from("x")]);
        let b = MappedObjectKeys::new(vec![Value::BigInt(1), Value::from("x")]);
        assert_eq!(a, b);

        let mut map = HashMap::new();
        map.insert(a, "first");
        assert_eq!(map.get(&b), Some(&"first"));
    }

    #[test]
    fn placeholders_are_unique() {
        let a = MappedObjectKeys::placeholder();
        let b = MappedObjectKeys::placeholder();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.is_placeholder());
        assert_eq!(a.arity(), 0);
        assert_ne!(a, MappedObjectKeys::new(Vec::<Value>::new()));
    }

    #[test]
    fn null_components_are_detected() {
        assert!(MappedObjectKeys::from(Value::Null).has_null());
        assert!(!MappedObjectKeys::from(Value::Int(3)).has_null());
        assert_eq!(MappedObjectKeys::from(Value::Int(3)).to_string(), "(3)");
    }
}
