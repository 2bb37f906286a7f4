//! An in-process cache for game server entities with write-back persistence.
//!
//! Every entity type gets an [`EntityCache`] that keeps the single live instance of each
//! entity in memory. Requests for entities that are not cached are loaded from a document
//! store, and concurrent requests for the same entity trigger only one load. Modified entities
//! are written back by a periodic sweep, and idle entities without unsaved changes are evicted
//! by another one.

#[macro_use]
pub mod metrics;

pub mod cache;
pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod expire;
pub mod logging;
pub mod options;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod test;

pub use cache::EntityCache;
pub use config::{CacheSettings, Config};
pub use entity::{Entity, EntityKey, EntityRef};
pub use error::{EntityCacheError, StoreError};
pub use expire::{ExpireEvaluator, ExpirePolicy};
pub use options::{EntityCacheOptions, Initializer};
pub use scheduler::{Resolution, RetryHandle, RetryState, ScheduledTask, Scheduler};
pub use store::{EntityLoader, EntityWriter, MemoryStore, StoreCounters};
