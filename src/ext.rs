//! A type-indexed map for attaching caller metadata to requests.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A heterogeneous map keyed by type identifier, holding at most one value
/// per type. Distinct libraries can annotate the same `Request` without
/// name collisions by keying on their own private types.
#[derive(Clone, Default)]
pub(crate) struct Tags {
    map: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Tags {
    pub(crate) fn new() -> Tags {
        Tags::default()
    }

    /// Inserts `value`, replacing any existing value of the same type.
    pub(crate) fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.map.insert(TypeId::of::<T>(), Arc::new(value));
    }

    /// The value of type `T`, if one was attached.
    pub(crate) fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| (&**value as &dyn Any).downcast_ref::<T>())
    }

}

impl fmt::Debug for Tags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tags").field("len", &self.map.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TraceId(u64);

    #[derive(Debug, PartialEq)]
    struct Attempt(u32);

    #[test]
    fn one_value_per_type() {
        let mut tags = Tags::new();
        tags.insert(TraceId(1));
        tags.insert(Attempt(7));
        tags.insert(TraceId(2));
        assert_eq!(tags.get::<TraceId>(), Some(&TraceId(2)));
        assert_eq!(tags.get::<Attempt>(), Some(&Attempt(7)));
    }

    #[test]
    fn absent_type_is_none() {
        let tags = Tags::new();
        assert!(tags.get::<TraceId>().is_none());
    }
}
