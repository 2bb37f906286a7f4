use std::collections::HashSet;

use futures::StreamExt;
use moka::ops::compute::{CompResult, Op};

use super::resolve::{Miss, NoFactory};
use super::{CacheEntry, CacheInner};
use crate::entity::{Entity, EntityRef};
use crate::error::{EntityCacheError, StoreError};

impl<E: Entity> CacheInner<E> {
    /// Loads every entity of the type from the store into the cache.
    pub(super) async fn load_all(&self) -> Result<(), EntityCacheError> {
        let bulk_failure = |source| EntityCacheError::BulkLoadFailure {
            entity: E::NAME,
            source,
        };

        let mut stream = self.loader.load_all();
        let mut loaded = 0usize;
        while let Some(entity) = stream.next().await {
            let entity = entity.map_err(bulk_failure)?;
            if entity.is_deleted() {
                continue;
            }
            let id = entity.id();
            let resident = self.admit(entity);
            self.entries.insert(id, CacheEntry::resident(resident)).await;
            loaded += 1;
        }

        tracing::debug!(entity = E::NAME, loaded, "Loaded all entities");
        self.report_size();
        Ok(())
    }

    /// Resolves a set of ids, loading all uncached ones with a single bulk load.
    ///
    /// Ids remembered as absent are skipped without asking the store.
    pub(super) async fn get_all<I>(&self, ids: I) -> Result<Vec<EntityRef<E>>, EntityCacheError>
    where
        I: IntoIterator<Item = E::Key>,
    {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for id in ids {
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.resolve(&id, Miss::<NoFactory<E>>::Cached).await? {
                Some(entity) => found.push(entity),
                None if !self.entries.contains_key(&id) => missing.push(id),
                None => {}
            }
        }

        if missing.is_empty() || self.options.is_resident() {
            return Ok(found);
        }

        let timeout = self.settings.bulk_load_timeout;
        let loaded = tokio::time::timeout(timeout, self.loader.load_many(&missing))
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
            .map_err(|source| {
                tracing::error!(
                    entity = E::NAME,
                    count = missing.len(),
                    error = &source as &dyn std::error::Error,
                    "Failed to bulk load entities",
                );
                EntityCacheError::BulkLoadFailure {
                    entity: E::NAME,
                    source,
                }
            })?;
        tracing::trace!(
            entity = E::NAME,
            requested = missing.len(),
            loaded = loaded.len(),
            "Bulk loaded entities",
        );

        for entity in loaded {
            if entity.is_deleted() {
                continue;
            }
            let id = entity.id();
            let mut loaded = Some(entity);
            let result = self
                .entries
                .entry(id)
                .and_compute_with(|slot| {
                    let op = match slot.map(|e| e.into_value()) {
                        None => match loaded.take() {
                            Some(entity) => Op::Put(CacheEntry::resident(self.admit(entity))),
                            None => Op::Nop,
                        },
                        Some(CacheEntry::NonEmpty(resident)) if resident.is_expired() => {
                            Op::Put(CacheEntry::resident(resident.revive()))
                        }
                        // cached or deleted in the meantime
                        Some(_) => Op::Nop,
                    };
                    std::future::ready(op)
                })
                .await;

            let entry = match result {
                CompResult::Inserted(entry)
                | CompResult::ReplacedWith(entry)
                | CompResult::Unchanged(entry) => entry.into_value(),
                CompResult::StillNone(_) | CompResult::Removed(_) => continue,
            };
            if let CacheEntry::NonEmpty(resident) = entry {
                found.push(resident.touch(self.clock.now()).clone());
            }
        }

        self.report_size();
        Ok(found)
    }
}
