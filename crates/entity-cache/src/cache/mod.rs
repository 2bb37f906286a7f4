//! The entity cache.
//!
//! Every entity type gets its own [`EntityCache`]. Entries live in a [`moka`] map without a
//! capacity bound or moka-driven expiry. Instead, two sweeps scheduled per cache take care of
//! evicting idle entries and of writing modified entities back to the store.
//!
//! All changes to a single key go through moka's atomic per-key compute operations. This is
//! what serializes concurrent loads of the same key, so a burst of requests for an entity that
//! is not cached results in exactly one load.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::clock::Clock;
use crate::config::CacheSettings;
use crate::entity::{Entity, EntityRef};
use crate::error::EntityCacheError;
use crate::options::EntityCacheOptions;
use crate::scheduler::{ScheduledTask, Scheduler};
use crate::store::{EntityLoader, EntityWriter};

use entry::{CacheEntry, Resident};
use resolve::{Miss, NoFactory};

mod bulk;
mod deletion;
mod entry;
mod expiration;
mod persistence;
mod resolve;


/// An in-memory cache of all entities of type `E` that are currently in use.
///
/// Entities are handed out as [`EntityRef`]s to the single cached instance. Mutations made
/// through them are picked up by the periodic persistence sweep, callers never write to the
/// store themselves.
///
/// Cloning the cache is cheap and shares all state. Background sweeps stop once the last
/// clone is dropped.
pub struct EntityCache<E: Entity> {
    inner: Arc<CacheInner<E>>,
    _sweeps: Arc<[ScheduledTask]>,
}

pub(crate) struct CacheInner<E: Entity> {
    entries: Cache<E::Key, CacheEntry<E>>,
    options: EntityCacheOptions<E>,
    settings: CacheSettings,
    /// Idle time after which entries of this type are evicted.
    idle: Duration,
    loader: Arc<dyn EntityLoader<E>>,
    writer: Arc<dyn EntityWriter<E>>,
    scheduler: Scheduler,
    clock: Clock,
}

impl<E: Entity> EntityCache<E> {
    /// Creates the cache for an entity type.
    ///
    /// If the type is configured to [load all entities on init](EntityCacheOptions::load_all_on_init),
    /// they are loaded before this returns, and before any sweep can run. Failing to do so fails
    /// the construction.
    pub async fn new(
        settings: CacheSettings,
        options: EntityCacheOptions<E>,
        loader: Arc<dyn EntityLoader<E>>,
        writer: Arc<dyn EntityWriter<E>>,
        scheduler: Scheduler,
    ) -> Result<Self, EntityCacheError> {
        let idle = options
            .expire_after_access
            .unwrap_or(settings.expire_after_access);
        let initial_size = options.initial_size.unwrap_or(settings.initial_size);

        let entries = Cache::builder()
            .name(E::NAME)
            .initial_capacity(initial_size)
            .build();

        let inner = Arc::new(CacheInner {
            entries,
            options,
            settings,
            idle,
            loader,
            writer,
            scheduler,
            clock: Clock::new(),
        });

        if inner.options.load_all_on_init {
            inner.load_all().await?;
        }
        let sweeps = inner.start_sweeps();

        Ok(Self {
            inner,
            _sweeps: sweeps.into(),
        })
    }

    /// Creates the cache on top of a store that both loads and writes entities.
    pub async fn with_store<S>(
        settings: CacheSettings,
        options: EntityCacheOptions<E>,
        store: Arc<S>,
        scheduler: Scheduler,
    ) -> Result<Self, EntityCacheError>
    where
        S: EntityLoader<E> + EntityWriter<E> + 'static,
    {
        Self::new(settings, options, store.clone(), store, scheduler).await
    }

    /// The name of the cached entity type.
    pub fn name(&self) -> &'static str {
        E::NAME
    }

    /// Returns the entity, loading it from the store if it is not cached.
    ///
    /// Returns `None` if the entity does not exist. Known absent entities are remembered, so
    /// they are not loaded again until that information expires.
    pub async fn get(&self, id: &E::Key) -> Result<Option<EntityRef<E>>, EntityCacheError> {
        self.inner.resolve(id, Miss::<NoFactory<E>>::Load).await
    }

    /// Same as [`get`](Self::get).
    pub async fn get_or_none(&self, id: &E::Key) -> Result<Option<EntityRef<E>>, EntityCacheError> {
        self.get(id).await
    }

    /// Returns the entity, failing with [`EntityCacheError::NotFound`] if it does not exist.
    pub async fn get_or_throw(&self, id: &E::Key) -> Result<EntityRef<E>, EntityCacheError> {
        self.get(id)
            .await?
            .ok_or_else(|| EntityCacheError::not_found(E::NAME, id))
    }

    /// Returns the entity, creating it with `factory` if it exists neither in the cache nor
    /// in the store.
    ///
    /// Concurrent calls for the same id create at most one entity, and all of them return
    /// that same instance. A created entity is inserted into the store in the background.
    pub async fn get_or_create<F>(
        &self,
        id: &E::Key,
        factory: F,
    ) -> Result<EntityRef<E>, EntityCacheError>
    where
        F: FnOnce(&E::Key) -> E + Send,
    {
        self.inner
            .resolve(id, Miss::Create(factory))
            .await?
            .ok_or_else(|| EntityCacheError::not_found(E::NAME, id))
    }

    /// Adds a new entity.
    ///
    /// Fails with [`EntityCacheError::AlreadyExists`] if an entity with the same id is already
    /// cached or stored, which includes losing a race against a concurrent creation.
    pub async fn create(&self, entity: E) -> Result<EntityRef<E>, EntityCacheError> {
        let id = entity.id();
        let mut created = false;
        let cached = self
            .get_or_create(&id, |_| {
                created = true;
                entity
            })
            .await?;

        match created {
            true => Ok(cached),
            false => Err(EntityCacheError::already_exists(E::NAME, &id)),
        }
    }

    /// Returns the entity if it is cached, never touching the store.
    pub async fn get_cached(&self, id: &E::Key) -> Option<EntityRef<E>> {
        // resolving from the cache alone can not fail
        self.inner.resolve(id, Miss::<NoFactory<E>>::Cached).await.ok().flatten()
    }

    /// Returns all cached entities, in no particular order.
    ///
    /// This does not count as an access of the entities.
    pub fn get_all_cached(&self) -> Vec<EntityRef<E>> {
        self.inner
            .entries
            .iter()
            .filter_map(|(_, entry)| entry.as_resident().map(|r| r.entity().clone()))
            .collect()
    }

    /// Returns all entities with the given ids that exist, in no particular order.
    ///
    /// Ids that are not cached are loaded from the store with a single bulk load.
    pub async fn get_all<I>(&self, ids: I) -> Result<Vec<EntityRef<E>>, EntityCacheError>
    where
        I: IntoIterator<Item = E::Key>,
    {
        self.inner.get_all(ids).await
    }

    /// Deletes the entity.
    ///
    /// The entity is gone from the cache immediately, while the store is updated in the
    /// background. Failed deletes are retried until they succeed, or until an entity with the
    /// same id is created again.
    pub async fn delete(&self, id: &E::Key) {
        self.inner.delete(id).await
    }

    pub async fn delete_entity(&self, entity: &E) {
        self.delete(&entity.id()).await
    }

    /// The number of entries, including the ones remembering absent entities.
    pub fn size(&self) -> usize {
        self.inner.size()
    }

    /// Whether there is an entry for the id, which may also be one remembering its absence.
    pub fn is_cached(&self, id: &E::Key) -> bool {
        self.inner.entries.contains_key(id)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.iter().next().is_none()
    }

    /// Writes all cached entities to the store.
    ///
    /// Used on shutdown, immutable entities that were already written are skipped.
    pub async fn persist(&self) -> Result<(), EntityCacheError> {
        self.inner.persist_all().await
    }

    /// Serializes all cached entities as pretty printed JSON.
    pub fn dump(&self) -> Result<String, EntityCacheError> {
        let entities: Vec<E> = self
            .get_all_cached()
            .iter()
            .map(EntityRef::snapshot)
            .collect();
        Ok(serde_json::to_string_pretty(&entities)?)
    }

    /// Remembers the entity as absent without asking the store.
    ///
    /// This has no effect if there is an entry for the id already.
    pub async fn init_with_empty_value(&self, id: &E::Key) {
        let now = self.inner.clock.now();
        let entry = self
            .inner
            .entries
            .entry(id.clone())
            .or_insert(CacheEntry::empty(now))
            .await;
        if !entry.is_fresh() {
            tracing::debug!(
                entity = E::NAME,
                id = ?id,
                existing = ?entry.value(),
                "Not initializing with empty value, entry exists",
            );
        }
    }
}

impl<E: Entity> CacheInner<E> {
    fn start_sweeps(self: &Arc<Self>) -> Vec<ScheduledTask> {
        let mut sweeps = Vec::with_capacity(2);

        if !self.options.expire.is_never() {
            let cache = Arc::downgrade(self);
            sweeps.push(self.scheduler.schedule_with_fixed_delay(
                "expire",
                self.idle,
                self.idle / 2,
                move || {
                    let cache = cache.clone();
                    async move {
                        if let Some(cache) = cache.upgrade() {
                            cache.expire_idle().await;
                        }
                    }
                },
            ));
        }

        // immutable entities are written once when they are created
        if !self.options.immutable {
            let cache = Arc::downgrade(self);
            let interval = self.settings.persist_interval;
            sweeps.push(self.scheduler.schedule_with_fixed_delay(
                "persist",
                interval,
                interval / 2,
                move || {
                    let cache = cache.clone();
                    async move {
                        if let Some(cache) = cache.upgrade() {
                            cache.persist_dirty().await;
                        }
                    }
                },
            ));
        }

        sweeps
    }

    fn size(&self) -> usize {
        self.entries.iter().count()
    }

    fn report_size(&self) {
        metric!(gauge("size") = self.size() as u64, "entity" => E::NAME);
    }

    /// Wraps an entity that just entered the cache from the store.
    fn admit(&self, mut entity: E) -> Resident<E> {
        self.options.initialize(&mut entity);
        let accessed = self.clock.now();
        let entity = EntityRef::new(entity);
        match self.options.immutable {
            // the stored state can not differ from the cached one
            true => Resident::persisted(entity, accessed, self.clock.now()),
            false => Resident::new(entity, accessed),
        }
    }

    /// Whether the store holds everything the cached entity contains.
    fn is_saved(&self, resident: &Resident<E>) -> bool {
        match self.options.immutable {
            true => resident.is_persisted(),
            false => resident.last_persist() > resident.last_access(),
        }
    }
}

impl<E: Entity> Clone for EntityCache<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _sweeps: Arc::clone(&self._sweeps),
        }
    }
}

impl<E: Entity> fmt::Debug for EntityCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCache")
            .field("entity", &E::NAME)
            .field("entries", &self.inner.size())
            .field("idle", &self.inner.idle)
            .field("options", &self.inner.options)
            .finish()
    }
}
