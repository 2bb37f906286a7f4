//! The interface to the durable document store backing the cache.
//!
//! The cache never talks to a database driver directly. It loads entities through an
//! [`EntityLoader`] and writes them back through an [`EntityWriter`]. Both are asynchronous;
//! the only place where the cache waits for the store on behalf of a caller is a load
//! triggered by a cache miss, which is bounded by
//! [`CacheSettings::load_timeout`](crate::config::CacheSettings::load_timeout).

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::entity::Entity;
use crate::error::StoreError;

mod memory;

pub use memory::{MemoryStore, StoreCounters};

/// Loads entities from the backing store.
#[async_trait]
pub trait EntityLoader<E: Entity>: Send + Sync {
    /// Loads a single entity, returning `None` if it does not exist.
    async fn load_by_id(&self, id: &E::Key) -> Result<Option<E>, StoreError>;

    /// Streams every entity of the type. Used for the load-on-init path.
    fn load_all(&self) -> BoxStream<'_, Result<E, StoreError>>;

    /// Loads all entities with the given ids that exist.
    async fn load_many(&self, ids: &[E::Key]) -> Result<Vec<E>, StoreError>;
}

/// Writes entities to the backing store.
#[async_trait]
pub trait EntityWriter<E: Entity>: Send + Sync {
    async fn insert(&self, entity: &E) -> Result<(), StoreError>;

    async fn insert_or_update(&self, entity: &E) -> Result<(), StoreError>;

    /// Upserts a batch of entities.
    ///
    /// An error means that the batch as a whole can not be assumed to be durable, even though
    /// some of the entities might have been written.
    async fn batch_insert_or_update(&self, entities: &[E]) -> Result<(), StoreError>;

    /// Deletes an entity. Deleting an entity that does not exist is not an error.
    async fn delete_by_id(&self, id: &E::Key) -> Result<(), StoreError>;
}
