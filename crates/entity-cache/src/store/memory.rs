use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{EntityLoader, EntityWriter};
use crate::entity::Entity;
use crate::error::StoreError;

/// Number of calls per store operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounters {
    pub load_by_id: usize,
    pub load_all: usize,
    pub load_many: usize,
    pub insert: usize,
    pub insert_or_update: usize,
    pub batch_insert_or_update: usize,
    pub delete_by_id: usize,
}

#[derive(Default)]
struct Counters {
    load_by_id: AtomicUsize,
    load_all: AtomicUsize,
    load_many: AtomicUsize,
    insert: AtomicUsize,
    insert_or_update: AtomicUsize,
    batch_insert_or_update: AtomicUsize,
    delete_by_id: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// An in-memory document store.
///
/// Documents are kept as JSON values, so entities round-trip through serialization exactly
/// like they would with a real document database. Every operation is counted, and failures
/// can be injected to exercise the error paths of the cache.
pub struct MemoryStore<E: Entity> {
    documents: Mutex<HashMap<E::Key, serde_json::Value>>,
    counters: Counters,
    load_delay: Mutex<Option<Duration>>,
    batch_delay: Mutex<Option<Duration>>,
    fail_loads: AtomicBool,
    fail_batches: AtomicBool,
    failing_upserts: Mutex<HashSet<E::Key>>,
    failing_deletes: AtomicUsize,
}

impl<E> MemoryStore<E>
where
    E: Entity + DeserializeOwned,
{
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            load_delay: Mutex::new(None),
            batch_delay: Mutex::new(None),
            fail_loads: AtomicBool::new(false),
            fail_batches: AtomicBool::new(false),
            failing_upserts: Mutex::new(HashSet::new()),
            failing_deletes: AtomicUsize::new(0),
        }
    }

    /// Creates a store already containing the given entities.
    pub fn with_entities(entities: impl IntoIterator<Item = E>) -> Self {
        let store = Self::new();
        for entity in entities {
            store.seed(&entity);
        }
        store
    }

    /// Writes an entity without counting it as an operation.
    ///
    /// # Panics
    ///
    /// Panics if the entity does not serialize to JSON.
    pub fn seed(&self, entity: &E) {
        let document = serde_json::to_value(entity).expect("entities must serialize to JSON");
        self.documents().insert(entity.id(), document);
    }

    /// Reads back the stored state of an entity.
    ///
    /// # Panics
    ///
    /// Panics if the stored document does not deserialize.
    pub fn get(&self, id: &E::Key) -> Option<E> {
        let document = self.documents().get(id).cloned()?;
        Some(serde_json::from_value(document).expect("stored documents must deserialize"))
    }

    pub fn contains(&self, id: &E::Key) -> bool {
        self.documents().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counters(&self) -> StoreCounters {
        let c = &self.counters;
        StoreCounters {
            load_by_id: c.load_by_id.load(Ordering::SeqCst),
            load_all: c.load_all.load(Ordering::SeqCst),
            load_many: c.load_many.load(Ordering::SeqCst),
            insert: c.insert.load(Ordering::SeqCst),
            insert_or_update: c.insert_or_update.load(Ordering::SeqCst),
            batch_insert_or_update: c.batch_insert_or_update.load(Ordering::SeqCst),
            delete_by_id: c.delete_by_id.load(Ordering::SeqCst),
        }
    }

    /// Delays every single entity load by `delay`.
    pub fn set_load_delay(&self, delay: Option<Duration>) {
        *self.load_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Delays every batch upsert by `delay`. The documents are written once it elapsed.
    pub fn set_batch_delay(&self, delay: Option<Duration>) {
        *self.batch_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Makes all loads fail.
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Makes all batch upserts fail.
    pub fn fail_batches(&self, fail: bool) {
        self.fail_batches.store(fail, Ordering::SeqCst);
    }

    /// Makes every upsert of the entity with the given id fail.
    pub fn fail_upserts_of(&self, id: E::Key) {
        self.failing_upserts().insert(id);
    }

    pub fn clear_upsert_failures(&self) {
        self.failing_upserts().clear();
    }

    /// Makes the next `count` deletes fail.
    pub fn fail_next_deletes(&self, count: usize) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    fn documents(&self) -> std::sync::MutexGuard<'_, HashMap<E::Key, serde_json::Value>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn failing_upserts(&self) -> std::sync::MutexGuard<'_, HashSet<E::Key>> {
        self.failing_upserts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_loads(&self) -> Result<(), StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("loads are failing".into()));
        }
        Ok(())
    }

    fn decode(document: serde_json::Value) -> Result<E, StoreError> {
        serde_json::from_value(document).map_err(|e| StoreError::Rejected(e.to_string()))
    }

    fn upsert(&self, entity: &E) -> Result<(), StoreError> {
        let id = entity.id();
        if self.failing_upserts().contains(&id) {
            return Err(StoreError::Unavailable(format!("upsert of {id:?} is failing")));
        }
        let document =
            serde_json::to_value(entity).map_err(|e| StoreError::Rejected(e.to_string()))?;
        self.documents().insert(id, document);
        Ok(())
    }
}

impl<E> Default for MemoryStore<E>
where
    E: Entity + DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> fmt::Debug for MemoryStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let documents = self
            .documents
            .try_lock()
            .map(|d| d.len())
            .unwrap_or_default();
        f.debug_struct("MemoryStore")
            .field("entity", &E::NAME)
            .field("documents", &documents)
            .finish()
    }
}

#[async_trait]
impl<E> EntityLoader<E> for MemoryStore<E>
where
    E: Entity + DeserializeOwned,
{
    async fn load_by_id(&self, id: &E::Key) -> Result<Option<E>, StoreError> {
        bump(&self.counters.load_by_id);
        let delay = *self.load_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_loads()?;

        let document = self.documents().get(id).cloned();
        document.map(Self::decode).transpose()
    }

    fn load_all(&self) -> BoxStream<'_, Result<E, StoreError>> {
        bump(&self.counters.load_all);
        if let Err(err) = self.check_loads() {
            return futures::stream::once(async move { Err(err) }).boxed();
        }

        let documents: Vec<_> = self.documents().values().cloned().collect();
        futures::stream::iter(documents).map(Self::decode).boxed()
    }

    async fn load_many(&self, ids: &[E::Key]) -> Result<Vec<E>, StoreError> {
        bump(&self.counters.load_many);
        self.check_loads()?;

        let documents: Vec<_> = {
            let stored = self.documents();
            ids.iter().filter_map(|id| stored.get(id).cloned()).collect()
        };
        documents.into_iter().map(Self::decode).collect()
    }
}

#[async_trait]
impl<E> EntityWriter<E> for MemoryStore<E>
where
    E: Entity + DeserializeOwned,
{
    async fn insert(&self, entity: &E) -> Result<(), StoreError> {
        bump(&self.counters.insert);
        let id = entity.id();
        if self.contains(&id) {
            return Err(StoreError::Rejected(format!("duplicate key {id:?}")));
        }
        self.upsert(entity)
    }

    async fn insert_or_update(&self, entity: &E) -> Result<(), StoreError> {
        bump(&self.counters.insert_or_update);
        self.upsert(entity)
    }

    async fn batch_insert_or_update(&self, entities: &[E]) -> Result<(), StoreError> {
        bump(&self.counters.batch_insert_or_update);
        let delay = *self.batch_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_batches.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("batch writes are failing".into()));
        }
        // unordered bulk write: everything that can be written is, the first error is reported
        let mut result = Ok(());
        for entity in entities {
            if let Err(err) = self.upsert(entity) {
                result = result.and(Err(err));
            }
        }
        result
    }

    async fn delete_by_id(&self, id: &E::Key) -> Result<(), StoreError> {
        bump(&self.counters.delete_by_id);
        let failing = self
            .failing_deletes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable(format!("delete of {id:?} is failing")));
        }
        self.documents().remove(id);
        Ok(())
    }
}
