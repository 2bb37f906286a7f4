//! The identity model of cached entities.

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

/// A key uniquely identifying an [`Entity`] of a given type.
///
/// This is implemented for all types that can be used as a hash map key, so both
/// arbitrary comparable keys (strings, composite ids) and dense integer ids work.
pub trait EntityKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> EntityKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// A domain object that is persisted in the backing store and cached in memory.
///
/// Entities are not synchronized internally. The cache hands them out wrapped in an
/// [`EntityRef`], which owns all access coordination.
pub trait Entity: Clone + Serialize + Send + Sync + 'static {
    /// The key type identifying entities of this type.
    type Key: EntityKey;

    /// The name of this entity type, used in logs, metrics and errors.
    const NAME: &'static str;

    /// Returns the key of this entity.
    fn id(&self) -> Self::Key;

    /// Whether the stored record is marked as deleted.
    fn is_deleted(&self) -> bool {
        false
    }
}

/// A shared handle to the single cached instance of an entity.
///
/// Cloning the handle does not clone the entity. All clones, and the cache itself, observe
/// the mutations made through [`write`](Self::write), which is how in-place mutations end up
/// being persisted.
pub struct EntityRef<E>(Arc<RwLock<E>>);

impl<E> EntityRef<E> {
    pub fn new(entity: E) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Locks the entity for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the entity for mutation.
    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether both handles point to the very same entity instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<E: Entity> EntityRef<E> {
    pub fn id(&self) -> E::Key {
        self.read().id()
    }

    /// Clones the current state of the entity.
    pub fn snapshot(&self) -> E {
        self.read().clone()
    }
}

impl<E> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E: fmt::Debug> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityRef").field(&*self.read()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Serialize)]
    struct Counter {
        id: u32,
        value: u32,
    }

    impl Entity for Counter {
        type Key = u32;
        const NAME: &'static str = "Counter";

        fn id(&self) -> u32 {
            self.id
        }
    }

    #[test]
    fn test_mutations_are_shared() {
        let entity = EntityRef::new(Counter { id: 1, value: 0 });
        let other = entity.clone();

        other.write().value += 5;

        assert_eq!(entity.read().value, 5);
        assert!(entity.ptr_eq(&other));
        assert_eq!(entity.id(), 1);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let entity = EntityRef::new(Counter { id: 1, value: 1 });
        let snapshot = entity.snapshot();

        entity.write().value = 2;

        assert_eq!(snapshot.value, 1);
        assert!(!entity.ptr_eq(&EntityRef::new(snapshot)));
    }
}
