//! Cache keys and record locations.
//!
//! Frontends are typed over their key; internally keys are stored erased so
//! one cache can host frontends with different key types and cross-cache
//! dependency edges stay plain values.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A cache key.
///
/// Implemented automatically for every type that is hashable, comparable,
/// debuggable and sendable; there is nothing to implement by hand.
pub trait Key: Any + fmt::Debug + Send + Sync {
    #[doc(hidden)]
    fn eq_erased(&self, other: &dyn Key) -> bool;
    #[doc(hidden)]
    fn hash_erased(&self, state: &mut dyn Hasher);
    #[doc(hidden)]
    fn as_any(&self) -> &dyn Any;
}

impl<K> Key for K
where
    K: Any + fmt::Debug + Eq + Hash + Send + Sync,
{
    fn eq_erased(&self, other: &dyn Key) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| other == self)
    }

    fn hash_erased(&self, mut state: &mut dyn Hasher) {
        // Different key types hash apart even on identical byte patterns.
        TypeId::of::<K>().hash(&mut state);
        self.hash(&mut state);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Shared, type-erased key as stored in buckets, the LRU list and
/// dependency edges.
#[derive(Clone)]
pub(crate) struct KeyHandle(Arc<dyn Key>);

impl KeyHandle {
    pub(crate) fn new<K: Key>(key: K) -> Self {
        Self(Arc::new(key))
    }

    pub(crate) fn downcast_ref<K: Key>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref()
    }
}

impl PartialEq for KeyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_erased(other.0.as_ref())
    }
}

impl Eq for KeyHandle {}

impl Hash for KeyHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_erased(state);
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Record location inside one cache.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct Location {
    pub frontend: usize,
    pub key: KeyHandle,
}

/// Record location across all caches.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub(crate) struct GlobalLocation {
    pub cache: usize,
    pub frontend: usize,
    pub key: KeyHandle,
}

impl GlobalLocation {
    pub(crate) fn local(&self) -> Location {
        Location {
            frontend: self.frontend,
            key: self.key.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn equal_keys_compare_equal() {
        assert_eq!(KeyHandle::new("post-7"), KeyHandle::new("post-7"));
        assert_ne!(KeyHandle::new("post-7"), KeyHandle::new("post-8"));
    }

    #[test]
    fn different_types_never_compare_equal() {
        assert_ne!(KeyHandle::new(1u32), KeyHandle::new(1u64));
        assert_ne!(KeyHandle::new("1"), KeyHandle::new(1u32));
    }

    #[test]
    fn usable_as_map_key() {
        let mut map = HashMap::new();
        map.insert(KeyHandle::new(("feed", 3u8)), "value");
        assert_eq!(map.get(&KeyHandle::new(("feed", 3u8))), Some(&"value"));
        assert_eq!(map.get(&KeyHandle::new(("feed", 4u8))), None);
    }

    #[test]
    fn downcast_recovers_the_typed_key() {
        let handle = KeyHandle::new(42u32);
        assert_eq!(handle.downcast_ref::<u32>(), Some(&42));
        assert_eq!(handle.downcast_ref::<i32>(), None);
    }
}
