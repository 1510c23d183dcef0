//! Type-erased node values.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Trait for types that can be stored as the value of a node.
///
/// Equality is used for change pruning: a node recomputed to an equal value
/// keeps its old version, so its dependents are not rebuilt.
pub trait NodeValue: Any + Debug + Send + Sync {
    /// Get the value as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn value_eq(&self, other: &dyn Any) -> bool;
}

impl<T: PartialEq + Debug + Send + Sync + 'static> NodeValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// The value of a node. Clone is cheap as the inner value is wrapped by `Arc`.
#[derive(Clone)]
pub struct Value(Arc<dyn NodeValue>);

impl Value {
    /// Wrap a value.
    pub fn new<T: NodeValue>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Downcast the value to its original type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0.value_eq(other.0.as_any())
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

/// Value of the error-transience sentinel.
///
/// It never compares equal, not even to itself, so every injection gives the
/// sentinel a new version and re-evaluates the nodes whose errors were transient.
#[derive(Debug, Clone, Copy)]
pub struct ErrorTransienceValue;

impl PartialEq for ErrorTransienceValue {
    fn eq(&self, _: &Self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_equality() {
        assert_eq!(Value::new(1i32), Value::new(1i32));
        assert_ne!(Value::new(1i32), Value::new(2i32));
        assert_ne!(Value::new(1i32), Value::new(1i64));
        assert_eq!(Value::new("a".to_string()), Value::new("a".to_string()));
    }

    #[test]
    fn test_value_downcast() {
        let value = Value::new(vec![1u8, 2, 3]);
        assert_eq!(value.downcast_ref::<Vec<u8>>(), Some(&vec![1, 2, 3]));
        assert!(value.downcast_ref::<String>().is_none());
    }

    #[test]
    fn test_error_transience_never_equal() {
        let value = Value::new(ErrorTransienceValue);
        assert_ne!(value, value.clone());
        assert_ne!(value, Value::new(ErrorTransienceValue));
    }
}
