//! Per entity type cache configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::entity::Entity;
use crate::expire::{ExpireEvaluator, ExpirePolicy};

/// A hook run on every freshly loaded or created entity before it becomes visible.
pub type Initializer<E> = Arc<dyn Fn(&mut E) + Send + Sync>;

/// Configuration of the cache for a single entity type.
///
/// This is supplied once when constructing an [`EntityCache`](crate::EntityCache) and never
/// inspected per operation afterwards.
pub struct EntityCacheOptions<E: Entity> {
    /// Initial capacity of the map, overriding [`CacheSettings::initial_size`](crate::config::CacheSettings::initial_size).
    pub initial_size: Option<usize>,
    /// Idle time after which entries are evicted, overriding
    /// [`CacheSettings::expire_after_access`](crate::config::CacheSettings::expire_after_access).
    pub expire_after_access: Option<Duration>,
    /// Entities never change after creation, so they are persisted at most once.
    pub immutable: bool,
    /// Load every entity of the type when the cache is created.
    pub load_all_on_init: bool,
    /// Decides which idle entities may be evicted.
    pub expire: ExpirePolicy<E>,
    /// Run on every entity entering the cache from the store or a factory.
    pub initializer: Option<Initializer<E>>,
}

impl<E: Entity> EntityCacheOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for small reference data sets that are loaded once and never expire.
    pub fn resident() -> Self {
        Self {
            load_all_on_init: true,
            expire: ExpirePolicy::Never,
            ..Self::default()
        }
    }

    pub fn with_initial_size(mut self, size: usize) -> Self {
        self.initial_size = Some(size);
        self
    }

    pub fn with_expire_after_access(mut self, duration: Duration) -> Self {
        self.expire_after_access = Some(duration);
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn load_all_on_init(mut self) -> Self {
        self.load_all_on_init = true;
        self
    }

    pub fn never_expire(mut self) -> Self {
        self.expire = ExpirePolicy::Never;
        self
    }

    pub fn with_expire_evaluator<F>(mut self, evaluator: F) -> Self
    where
        F: ExpireEvaluator<E> + 'static,
    {
        self.expire = ExpirePolicy::evaluate(evaluator);
        self
    }

    pub fn with_initializer<F>(mut self, initializer: F) -> Self
    where
        F: Fn(&mut E) + Send + Sync + 'static,
    {
        self.initializer = Some(Arc::new(initializer));
        self
    }

    /// Resident types are fully loaded on init and never evicted, so a miss means the
    /// entity does not exist.
    pub fn is_resident(&self) -> bool {
        self.load_all_on_init && self.expire.is_never()
    }

    pub(crate) fn initialize(&self, entity: &mut E) {
        if let Some(initializer) = &self.initializer {
            initializer(entity);
        }
    }
}

impl<E: Entity> Default for EntityCacheOptions<E> {
    fn default() -> Self {
        Self {
            initial_size: None,
            expire_after_access: None,
            immutable: false,
            load_all_on_init: false,
            expire: ExpirePolicy::Idle,
            initializer: None,
        }
    }
}

impl<E: Entity> fmt::Debug for EntityCacheOptions<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityCacheOptions")
            .field("entity", &E::NAME)
            .field("initial_size", &self.initial_size)
            .field("expire_after_access", &self.expire_after_access)
            .field("immutable", &self.immutable)
            .field("load_all_on_init", &self.load_all_on_init)
            .field("expire", &self.expire)
            .field("initializer", &self.initializer.is_some())
            .finish()
    }
}
