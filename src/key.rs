//! Keys addressing nodes of the evaluation graph.

use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Compare self with another value for equality.
    ///
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for types that can serve as the argument part of a [`Key`].
///
/// It is automatically implemented for all types that implement
/// `Hash + Eq + Debug + Send + Sync + 'static`.
pub trait KeyArgument: DynHash + DynEq + Debug + Send + Sync {
    /// Get the argument as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> KeyArgument for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

dyn_hash::hash_trait_object!(KeyArgument);

/// Name of a function family. Every key belongs to exactly one family, and the
/// family decides which registered [`NodeFunction`](crate::NodeFunction) computes it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionName(&'static str);

impl FunctionName {
    /// Family of the sentinel node that transient errors depend on.
    pub const ERROR_TRANSIENCE: FunctionName = FunctionName("ERROR_TRANSIENCE");

    /// Create a function name.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// The name as a string.
    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl Debug for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Immutable identifier of one memoized computation.
///
/// Stores the function family and a type-erased argument. Clone is cheap.
#[derive(Clone)]
pub struct Key {
    function: FunctionName,
    argument: Arc<dyn KeyArgument>,
}

impl Key {
    /// Create a key for `function` applied to `argument`.
    pub fn new<A: KeyArgument + 'static>(function: FunctionName, argument: A) -> Self {
        Self {
            function,
            argument: Arc::new(argument),
        }
    }

    /// Key of the error-transience sentinel.
    pub fn error_transience() -> Self {
        Self::new(FunctionName::ERROR_TRANSIENCE, ())
    }

    /// The function family of this key.
    pub fn function(&self) -> FunctionName {
        self.function
    }

    /// Downcast the argument to its original type.
    pub fn argument<A: 'static>(&self) -> Option<&A> {
        self.argument.as_any().downcast_ref()
    }

    /// Get the debug representation of this key.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.function, self.argument)
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.function.hash(state);
        self.argument.hash(state);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.function == other.function && self.argument.dyn_eq(other.argument.as_any())
    }
}

impl Eq for Key {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const FILE: FunctionName = FunctionName::new("FILE");
    const PACKAGE: FunctionName = FunctionName::new("PACKAGE");

    #[test]
    fn test_key_equality() {
        assert_eq!(Key::new(FILE, "a.txt"), Key::new(FILE, "a.txt"));
        assert_ne!(Key::new(FILE, "a.txt"), Key::new(FILE, "b.txt"));
        assert_ne!(Key::new(FILE, "a.txt"), Key::new(PACKAGE, "a.txt"));
        // Same function, different argument types.
        assert_ne!(Key::new(FILE, 1u32), Key::new(FILE, 1u64));
    }

    #[test]
    fn test_key_as_map_key() {
        let mut map = HashMap::new();
        map.insert(Key::new(FILE, "a.txt"), 1);
        map.insert(Key::new(FILE, "b.txt"), 2);
        assert_eq!(map.get(&Key::new(FILE, "a.txt")), Some(&1));
        assert_eq!(map.get(&Key::new(FILE, "b.txt")), Some(&2));
        assert_eq!(map.get(&Key::new(PACKAGE, "a.txt")), None);
    }

    #[test]
    fn test_key_argument_downcast() {
        let key = Key::new(PACKAGE, ("pkg".to_string(), 3u8));
        assert_eq!(
            key.argument::<(String, u8)>(),
            Some(&("pkg".to_string(), 3u8))
        );
        assert!(key.argument::<String>().is_none());
        assert_eq!(key.function(), PACKAGE);
    }

    #[test]
    fn test_key_debug_repr() {
        let key = Key::new(FILE, "a.txt");
        assert_eq!(key.debug_repr(), "FILE:\"a.txt\"");
        assert_eq!(Key::error_transience().debug_repr(), "ERROR_TRANSIENCE:()");
    }
}
