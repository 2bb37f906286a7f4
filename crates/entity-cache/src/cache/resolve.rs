use std::sync::Arc;
use std::time::Instant;

use moka::ops::compute::{CompResult, Op};

use super::{CacheEntry, CacheInner, Resident};
use crate::entity::{Entity, EntityRef};
use crate::error::EntityCacheError;

/// What to do when resolving an id that has no live entity in the cache.
pub(super) enum Miss<F> {
    /// Only look at the cache.
    Cached,
    /// Load the entity from the store if there is no entry.
    Load,
    /// Load the entity, and create it if it does not exist in the store. Entries remembering
    /// an absent entity are replaced by a created one directly.
    Create(F),
}

/// The factory type of misses that never create entities.
pub(super) type NoFactory<E> = fn(&<E as Entity>::Key) -> E;

impl<F> Miss<F> {
    fn creates(&self) -> bool {
        matches!(self, Self::Create(_))
    }

    fn take(&mut self) -> Self {
        std::mem::replace(self, Self::Cached)
    }
}

impl<E: Entity> CacheInner<E> {
    /// Resolves an id to its cached entity, going to the store according to `miss`.
    pub(super) async fn resolve<F>(
        &self,
        id: &E::Key,
        mut miss: Miss<F>,
    ) -> Result<Option<EntityRef<E>>, EntityCacheError>
    where
        F: FnOnce(&E::Key) -> E + Send,
    {
        metric!(counter("access") += 1, "entity" => E::NAME);

        let mut stale = match self.entries.get(id).await {
            Some(CacheEntry::NonEmpty(resident)) => {
                let entity = resident.touch(self.clock.now());
                if !resident.is_expired() {
                    metric!(counter("memory.hit") += 1, "entity" => E::NAME);
                    return Ok(Some(entity.clone()));
                }
                // evicted in this very moment, but the entity is still good to use
                Some(resident)
            }
            Some(CacheEntry::Empty { .. }) if !miss.creates() => return Ok(None),
            None if matches!(miss, Miss::Cached) => return Ok(None),
            _ => None,
        };

        loop {
            let seen_expired = stale.take();
            let miss = &mut miss;
            let result = self
                .entries
                .entry(id.clone())
                .and_try_compute_with(move |slot| {
                    self.resolve_slot(id, slot.map(|e| e.into_value()), seen_expired, miss)
                })
                .await?;

            let entry = match result {
                CompResult::Inserted(entry)
                | CompResult::ReplacedWith(entry)
                | CompResult::Unchanged(entry) => entry.into_value(),
                CompResult::StillNone(_) | CompResult::Removed(_) => return Ok(None),
            };
            let CacheEntry::NonEmpty(resident) = entry else {
                return Ok(None);
            };

            let entity = resident.touch(self.clock.now()).clone();
            if !resident.is_expired() {
                return Ok(Some(entity));
            }
            stale = Some(resident);
        }
    }

    /// Decides the new state of a slot, while holding the lock on its key.
    pub(super) async fn resolve_slot<F>(
        &self,
        id: &E::Key,
        slot: Option<CacheEntry<E>>,
        stale: Option<Arc<Resident<E>>>,
        miss: &mut Miss<F>,
    ) -> Result<Op<CacheEntry<E>>, EntityCacheError>
    where
        F: FnOnce(&E::Key) -> E + Send,
    {
        let op = match slot {
            Some(CacheEntry::NonEmpty(resident)) if resident.is_expired() => {
                Op::Put(CacheEntry::resident(resident.revive()))
            }
            Some(CacheEntry::NonEmpty(_)) => Op::Nop,
            Some(CacheEntry::Empty { .. }) => match miss.take() {
                Miss::Create(factory) => Op::Put(CacheEntry::NonEmpty(self.create(id, factory))),
                Miss::Cached | Miss::Load => Op::Nop,
            },
            None => match (stale, miss.take()) {
                // the sweep removed the entry we saw expiring, put the same entity back
                (Some(stale), _) => Op::Put(CacheEntry::resident(stale.revive())),
                (None, Miss::Cached) => Op::Nop,
                (None, Miss::Load) => match self.load(id).await? {
                    Some(resident) => Op::Put(CacheEntry::resident(resident)),
                    None => Op::Put(CacheEntry::empty(self.clock.now())),
                },
                (None, Miss::Create(factory)) => match self.load(id).await? {
                    Some(resident) => Op::Put(CacheEntry::resident(resident)),
                    None => Op::Put(CacheEntry::NonEmpty(self.create(id, factory))),
                },
            },
        };
        Ok(op)
    }

    /// Loads a single entity from the store.
    ///
    /// Entities marked as deleted in the store are treated as absent, and their records are
    /// purged in the background.
    async fn load(&self, id: &E::Key) -> Result<Option<Resident<E>>, EntityCacheError> {
        // everything there is was loaded on init
        if self.options.is_resident() {
            return Ok(None);
        }

        let timeout = self.settings.load_timeout;
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, self.loader.load_by_id(id)).await;
        metric!(timer("load.duration") = start.elapsed(), "entity" => E::NAME);

        let loaded = match result {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(source)) => {
                metric!(counter("load") += 1, "entity" => E::NAME, "status" => "failure");
                tracing::error!(
                    entity = E::NAME,
                    id = ?id,
                    error = &source as &dyn std::error::Error,
                    "Failed to load entity",
                );
                return Err(EntityCacheError::LoadFailure {
                    entity: E::NAME,
                    id: format!("{id:?}"),
                    source,
                });
            }
            Err(_) => {
                metric!(counter("load") += 1, "entity" => E::NAME, "status" => "timeout");
                tracing::error!(entity = E::NAME, id = ?id, ?timeout, "Loading entity timed out");
                return Err(EntityCacheError::LoadTimeout {
                    entity: E::NAME,
                    id: format!("{id:?}"),
                    timeout,
                });
            }
        };

        let status = match &loaded {
            Some(entity) if entity.is_deleted() => "deleted",
            Some(_) => "found",
            None => "missing",
        };
        metric!(counter("load") += 1, "entity" => E::NAME, "status" => status);

        match loaded {
            Some(entity) if entity.is_deleted() => {
                self.purge(id.clone());
                Ok(None)
            }
            Some(entity) => Ok(Some(self.admit(entity))),
            None => Ok(None),
        }
    }

    /// Creates a new entity and inserts it into the store in the background.
    fn create<F>(&self, id: &E::Key, factory: F) -> Arc<Resident<E>>
    where
        F: FnOnce(&E::Key) -> E,
    {
        let mut entity = factory(id);
        self.options.initialize(&mut entity);
        let snapshot = entity.clone();
        let resident = Arc::new(Resident::new(EntityRef::new(entity), self.clock.now()));
        metric!(counter("create") += 1, "entity" => E::NAME);

        let writer = Arc::clone(&self.writer);
        let inserted = Arc::clone(&resident);
        let started = self.clock.now();
        self.scheduler.spawn(async move {
            match writer.insert(&snapshot).await {
                Ok(()) => inserted.persisted_at(started),
                Err(e) => {
                    // stays dirty, so the persistence sweep writes it later
                    tracing::error!(
                        entity = E::NAME,
                        id = ?snapshot.id(),
                        error = &e as &dyn std::error::Error,
                        "Failed to insert created entity",
                    );
                }
            }
        });

        resident
    }

    /// Deletes the record of an entity that is marked as deleted, without retrying.
    fn purge(&self, id: E::Key) {
        tracing::debug!(entity = E::NAME, id = ?id, "Purging entity marked as deleted");
        let writer = Arc::clone(&self.writer);
        self.scheduler.spawn(async move {
            if let Err(e) = writer.delete_by_id(&id).await {
                tracing::warn!(
                    entity = E::NAME,
                    id = ?id,
                    error = &e as &dyn std::error::Error,
                    "Failed to purge entity marked as deleted",
                );
            }
        });
    }
}
