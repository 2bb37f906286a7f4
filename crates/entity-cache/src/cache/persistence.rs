use std::sync::Arc;

use futures::future;

use super::{CacheInner, Resident};
use crate::clock::Timestamp;
use crate::entity::Entity;
use crate::error::{EntityCacheError, StoreError};

impl<E: Entity> CacheInner<E> {
    /// Writes all entities that were accessed since they were last written.
    ///
    /// This first tries a single batch write. If that fails, every entity is written on its
    /// own, and the ones that fail again stay dirty for the next sweep.
    pub(super) async fn persist_dirty(self: &Arc<Self>) {
        let started = self.clock.now();
        let dirty: Vec<Arc<Resident<E>>> = self
            .entries
            .iter()
            .filter_map(|(_, entry)| entry.as_resident().filter(|r| r.is_dirty()).cloned())
            .collect();
        if dirty.is_empty() {
            return;
        }

        let snapshots: Vec<E> = dirty.iter().map(|r| r.entity().snapshot()).collect();
        metric!(histogram("persist.entities") = snapshots.len() as u64, "entity" => E::NAME);

        match self.write_batch(&dirty, &snapshots, started).await {
            Ok(()) => {
                tracing::trace!(entity = E::NAME, count = snapshots.len(), "Persisted entities");
            }
            Err(e) => {
                tracing::error!(
                    entity = E::NAME,
                    count = snapshots.len(),
                    error = &e as &dyn std::error::Error,
                    "Batch upsert failed, falling back to one by one",
                );
                let writes = dirty
                    .iter()
                    .zip(&snapshots)
                    .map(|(resident, snapshot)| self.write_single(resident, snapshot, started));
                let failed = future::join_all(writes)
                    .await
                    .into_iter()
                    .filter(|written| !written)
                    .count();
                if failed > 0 {
                    tracing::warn!(entity = E::NAME, failed, "Entities left unsaved until the next sweep");
                }
            }
        }
        self.report_size();
    }

    /// Writes every cached entity, except for immutable ones that were already written.
    pub(super) async fn persist_all(self: &Arc<Self>) -> Result<(), EntityCacheError> {
        let started = self.clock.now();
        let immutable = self.options.immutable;
        let residents: Vec<Arc<Resident<E>>> = self
            .entries
            .iter()
            .filter_map(|(_, entry)| entry.as_resident().cloned())
            .filter(|r| !(immutable && r.is_persisted()))
            .collect();
        if residents.is_empty() {
            return Ok(());
        }

        let snapshots: Vec<E> = residents.iter().map(|r| r.entity().snapshot()).collect();
        self.write_batch(&residents, &snapshots, started)
            .await
            .map_err(|source| EntityCacheError::PersistFailure {
                entity: E::NAME,
                count: snapshots.len(),
                source,
            })
    }

    async fn write_batch(
        self: &Arc<Self>,
        residents: &[Arc<Resident<E>>],
        snapshots: &[E],
        started: Timestamp,
    ) -> Result<(), StoreError> {
        let result = self.writer.batch_insert_or_update(snapshots).await;
        let status = if result.is_ok() { "ok" } else { "failure" };
        metric!(counter("persist.batch") += 1, "entity" => E::NAME, "status" => status);

        if result.is_ok() {
            for resident in residents {
                resident.persisted_at(started);
            }
        }
        // a failed batch may still have written some of the entities
        for (resident, snapshot) in residents.iter().zip(snapshots) {
            self.recheck_written(&snapshot.id(), resident.entity()).await;
        }
        result
    }

    async fn write_single(
        self: &Arc<Self>,
        resident: &Resident<E>,
        snapshot: &E,
        started: Timestamp,
    ) -> bool {
        match self.writer.insert_or_update(snapshot).await {
            Ok(()) => {
                metric!(counter("persist.single") += 1, "entity" => E::NAME, "status" => "ok");
                resident.persisted_at(started);
                self.recheck_written(&snapshot.id(), resident.entity()).await;
                true
            }
            Err(e) => {
                metric!(counter("persist.single") += 1, "entity" => E::NAME, "status" => "failure");
                let state = serde_json::to_string(snapshot)
                    .unwrap_or_else(|err| format!("<not serializable: {err}>"));
                tracing::error!(
                    entity = E::NAME,
                    id = ?snapshot.id(),
                    error = &e as &dyn std::error::Error,
                    state = %state,
                    "Failed to upsert entity",
                );
                false
            }
        }
    }
}
