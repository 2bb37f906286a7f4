use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::clock::Timestamp;
use crate::entity::EntityRef;

/// The value stored per key.
pub(crate) enum CacheEntry<E> {
    /// The entity is known to be absent from the store, or was deleted.
    Empty { created_at: Timestamp },
    /// The entity is cached.
    NonEmpty(Arc<Resident<E>>),
}

impl<E> CacheEntry<E> {
    pub fn empty(now: Timestamp) -> Self {
        Self::Empty { created_at: now }
    }

    pub fn resident(resident: Resident<E>) -> Self {
        Self::NonEmpty(Arc::new(resident))
    }

    /// The time of the last access, which for empty entries is their creation.
    pub fn last_access(&self) -> Timestamp {
        match self {
            Self::Empty { created_at } => *created_at,
            Self::NonEmpty(resident) => resident.last_access(),
        }
    }

    pub fn as_resident(&self) -> Option<&Arc<Resident<E>>> {
        match self {
            Self::Empty { .. } => None,
            Self::NonEmpty(resident) => Some(resident),
        }
    }
}

impl<E> Clone for CacheEntry<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Empty { created_at } => Self::Empty {
                created_at: *created_at,
            },
            Self::NonEmpty(resident) => Self::NonEmpty(Arc::clone(resident)),
        }
    }
}

impl<E> fmt::Debug for CacheEntry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty { created_at } => f
                .debug_struct("Empty")
                .field("created_at", created_at)
                .finish(),
            Self::NonEmpty(resident) => f.debug_tuple("NonEmpty").field(resident).finish(),
        }
    }
}

/// A cached entity together with its bookkeeping.
///
/// Readers always [`touch`](Self::touch) before checking [`is_expired`](Self::is_expired), and
/// the expiration sweep always marks the entry expired before re-reading the access time.
/// Either the reader sees the flag, or the sweep sees the access, so an entity handed out to a
/// reader is never dropped from the map.
pub(crate) struct Resident<E> {
    entity: EntityRef<E>,
    last_access: AtomicU64,
    /// `0` if the entity was never written since entering the cache.
    last_persist: AtomicU64,
    expired: AtomicBool,
}

impl<E> Resident<E> {
    /// Wraps an entity that has not been written to the store yet.
    pub fn new(entity: EntityRef<E>, now: Timestamp) -> Self {
        Self::with_timestamps(entity, now, 0)
    }

    fn with_timestamps(entity: EntityRef<E>, last_access: Timestamp, last_persist: Timestamp) -> Self {
        Self {
            entity,
            last_access: AtomicU64::new(last_access),
            last_persist: AtomicU64::new(last_persist),
            expired: AtomicBool::new(false),
        }
    }

    /// Wraps an entity whose stored state is known to be identical to the cached one.
    pub fn persisted(entity: EntityRef<E>, accessed: Timestamp, persisted: Timestamp) -> Self {
        Self::with_timestamps(entity, accessed, persisted)
    }

    /// A fresh, unexpired entry for the same entity instance.
    pub fn revive(&self) -> Self {
        Self::with_timestamps(
            self.entity.clone(),
            self.last_access(),
            self.last_persist(),
        )
    }

    /// The entity, without counting as an access.
    pub fn entity(&self) -> &EntityRef<E> {
        &self.entity
    }

    /// Records an access and returns the entity.
    pub fn touch(&self, now: Timestamp) -> &EntityRef<E> {
        self.last_access.fetch_max(now, Ordering::SeqCst);
        &self.entity
    }

    pub fn last_access(&self) -> Timestamp {
        self.last_access.load(Ordering::SeqCst)
    }

    pub fn last_persist(&self) -> Timestamp {
        self.last_persist.load(Ordering::SeqCst)
    }

    pub fn is_persisted(&self) -> bool {
        self.last_persist() != 0
    }

    /// Whether the entity was accessed, and thus possibly modified, since it was last written.
    pub fn is_dirty(&self) -> bool {
        self.last_access() > self.last_persist()
    }

    /// Records a successful write that started at `at`.
    pub fn persisted_at(&self, at: Timestamp) {
        self.last_persist.fetch_max(at, Ordering::SeqCst);
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    /// Flags the entry as removed from the map.
    ///
    /// # Panics
    ///
    /// Panics if the entry was already flagged. That means an entry was evicted twice, which
    /// breaks the guarantee that every key maps to at most one live entry.
    pub fn mark_expired(&self) {
        if self
            .expired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            panic!("cache entry expired twice");
        }
    }
}

impl<E> fmt::Debug for Resident<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resident")
            .field("last_access", &self.last_access())
            .field("last_persist", &self.last_persist())
            .field("expired", &self.is_expired())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_tracking() {
        let resident = Resident::new(EntityRef::new(1u32), 10);
        assert!(resident.is_dirty());
        assert!(!resident.is_persisted());

        resident.persisted_at(11);
        assert!(!resident.is_dirty());
        assert!(resident.is_persisted());

        resident.touch(12);
        assert!(resident.is_dirty());

        // an older write never moves the persist time backwards
        resident.persisted_at(5);
        assert_eq!(resident.last_persist(), 11);
    }

    #[test]
    fn test_revive_keeps_instance() {
        let resident = Resident::persisted(EntityRef::new(1u32), 10, 20);
        resident.mark_expired();

        let revived = resident.revive();
        assert!(!revived.is_expired());
        assert!(revived.entity().ptr_eq(resident.entity()));
        assert_eq!(revived.last_access(), 10);
        assert_eq!(revived.last_persist(), 20);
    }

    #[test]
    #[should_panic(expected = "expired twice")]
    fn test_expire_twice() {
        let resident = Resident::new(EntityRef::new(1u32), 10);
        resident.mark_expired();
        resident.mark_expired();
    }
}
