use std::sync::Arc;

use moka::ops::compute::Op;

use super::{CacheEntry, CacheInner};
use crate::entity::{Entity, EntityRef};
use crate::error::{EntityCacheError, StoreError};
use crate::scheduler::Resolution;

impl<E: Entity> CacheInner<E> {
    /// Replaces the entry with an empty one, and deletes the entity from the store.
    pub(super) async fn delete(self: &Arc<Self>, id: &E::Key) {
        let now = self.clock.now();
        self.entries
            .entry(id.clone())
            .and_compute_with(|_| std::future::ready(Op::Put(CacheEntry::empty(now))))
            .await;

        let cache = Arc::downgrade(self);
        let writer = Arc::clone(&self.writer);
        let id = id.clone();
        self.scheduler.spawn(async move {
            match writer.delete_by_id(&id).await {
                Ok(()) => {
                    metric!(counter("delete") += 1, "entity" => E::NAME, "status" => "ok");
                }
                Err(e) => {
                    metric!(counter("delete") += 1, "entity" => E::NAME, "status" => "failure");
                    tracing::error!(
                        entity = E::NAME,
                        id = ?id,
                        error = &e as &dyn std::error::Error,
                        "Failed to delete entity",
                    );
                    if let Some(cache) = cache.upgrade() {
                        cache.retry_delete(id);
                    }
                }
            }
        });
    }

    /// Deletes the record again if the entity was deleted while it was being written.
    ///
    /// If an entity with the same id was created in the meantime, the write may have replaced
    /// its record with the old state. It is marked as accessed, so the next persistence sweep
    /// writes it again.
    pub(super) async fn recheck_written(self: &Arc<Self>, id: &E::Key, written: &EntityRef<E>) {
        let mut failed = None;
        let failure = &mut failed;
        self.entries
            .entry(id.clone())
            .and_compute_with(move |slot| {
                self.undo_stale_write(id, slot.map(|e| e.into_value()), written, failure)
            })
            .await;

        if let Some(e) = failed {
            metric!(counter("delete") += 1, "entity" => E::NAME, "status" => "failure");
            tracing::error!(
                entity = E::NAME,
                id = ?id,
                error = &e as &dyn std::error::Error,
                "Failed to delete entity written after its deletion",
            );
            self.retry_delete(id.clone());
        }
    }

    /// Runs while holding the lock on the key, so no creation can interleave with the delete.
    async fn undo_stale_write(
        &self,
        id: &E::Key,
        slot: Option<CacheEntry<E>>,
        written: &EntityRef<E>,
        failed: &mut Option<StoreError>,
    ) -> Op<CacheEntry<E>> {
        match slot {
            Some(CacheEntry::NonEmpty(current)) => {
                if !current.entity().ptr_eq(written) {
                    metric!(counter("persist.overwritten") += 1, "entity" => E::NAME);
                    current.touch(self.clock.now());
                }
            }
            Some(CacheEntry::Empty { .. }) => {
                metric!(counter("delete.rewritten") += 1, "entity" => E::NAME);
                tracing::warn!(
                    entity = E::NAME,
                    id = ?id,
                    "Entity was written back after its deletion, deleting it again",
                );
                match self.writer.delete_by_id(id).await {
                    Ok(()) => {
                        metric!(counter("delete") += 1, "entity" => E::NAME, "status" => "ok");
                    }
                    Err(e) => *failed = Some(e),
                }
            }
            // evicted after being written, the record is current
            None => {}
        }
        Op::Nop
    }

    /// Keeps deleting the entity until it succeeds, or the entity is created again.
    ///
    /// The retry interval is half the idle time, so the empty entry standing in for the
    /// deleted entity is refreshed before it could expire. Otherwise a `get` could load the
    /// record that is still waiting to be deleted.
    fn retry_delete(self: &Arc<Self>, id: E::Key) {
        let cache = Arc::downgrade(self);
        let label = format!("delete {}({id:?})", E::NAME);
        self.scheduler.retry_forever(label, self.idle / 2, move || {
            let cache = cache.clone();
            let id = id.clone();
            async move {
                match cache.upgrade() {
                    Some(cache) => cache.retry_delete_attempt(&id).await,
                    None => Ok(Resolution::Aborted),
                }
            }
        });
    }

    async fn retry_delete_attempt(&self, id: &E::Key) -> Result<Resolution, EntityCacheError> {
        if self.is_resurrected(id).await {
            return Ok(Resolution::Aborted);
        }

        match self.writer.delete_by_id(id).await {
            Ok(()) => {
                metric!(counter("delete") += 1, "entity" => E::NAME, "status" => "ok");
                tracing::info!(entity = E::NAME, id = ?id, "Deleted entity after retrying");
                Ok(Resolution::Resolved)
            }
            Err(source) => {
                metric!(counter("delete") += 1, "entity" => E::NAME, "status" => "failure");
                if self.is_resurrected(id).await {
                    return Ok(Resolution::Aborted);
                }
                self.refresh_empty(id).await;
                Err(EntityCacheError::DeleteFailure {
                    entity: E::NAME,
                    id: format!("{id:?}"),
                    source,
                })
            }
        }
    }

    /// Whether an entity with the id was created while its deletion is pending.
    async fn is_resurrected(&self, id: &E::Key) -> bool {
        let resurrected = matches!(self.entries.get(id).await, Some(CacheEntry::NonEmpty(_)));
        if resurrected {
            metric!(counter("delete.resurrected") += 1, "entity" => E::NAME);
            tracing::warn!(
                entity = E::NAME,
                id = ?id,
                "Deleted entity has been created again, no longer deleting it",
            );
        }
        resurrected
    }

    /// Renews the empty entry of a deleted entity, unless the entity was created again.
    async fn refresh_empty(&self, id: &E::Key) {
        let now = self.clock.now();
        self.entries
            .entry(id.clone())
            .and_compute_with(|slot| {
                let op = match slot.map(|e| e.into_value()) {
                    Some(CacheEntry::NonEmpty(_)) => Op::Nop,
                    Some(CacheEntry::Empty { .. }) | None => Op::Put(CacheEntry::empty(now)),
                };
                std::future::ready(op)
            })
            .await;
    }
}
