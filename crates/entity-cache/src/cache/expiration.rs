use moka::ops::compute::{CompResult, Op};

use super::{CacheEntry, CacheInner, Resident};
use crate::clock::Timestamp;
use crate::entity::Entity;

impl<E: Entity> CacheInner<E> {
    /// Evicts all entries that were not accessed within the idle time.
    ///
    /// Entities with changes that are not persisted yet, and entities the expire policy wants
    /// to keep, stay in the cache. Entries remembering absent entities are evicted once idle.
    pub(super) async fn expire_idle(&self) {
        let idle = u64::try_from(self.idle.as_micros()).unwrap_or(u64::MAX);
        let threshold = self.clock.micros_ago(idle);

        let candidates: Vec<E::Key> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_access() <= threshold)
            .map(|(id, _)| E::Key::clone(&id))
            .collect();

        let mut evicted = 0u64;
        for id in candidates {
            let result = self
                .entries
                .entry(id)
                .and_compute_with(|slot| {
                    std::future::ready(self.expire_slot(slot.map(|e| e.into_value()), threshold))
                })
                .await;
            if let CompResult::Removed(_) = result {
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::debug!(entity = E::NAME, evicted, "Evicted idle entries");
        }
        metric!(counter("expire.evicted") += evicted as i64, "entity" => E::NAME);
        self.report_size();
    }

    /// Decides whether the entry in a slot is evicted, while holding the lock on its key.
    fn expire_slot(&self, slot: Option<CacheEntry<E>>, threshold: Timestamp) -> Op<CacheEntry<E>> {
        let Some(entry) = slot else {
            return Op::Nop;
        };
        // accessed since the candidates were collected
        if entry.last_access() > threshold {
            return Op::Nop;
        }

        let resident = match entry {
            CacheEntry::Empty { .. } => return Op::Remove,
            CacheEntry::NonEmpty(resident) => resident,
        };
        if !self.is_saved(&resident) || !self.options.expire.can_expire(&resident.entity().read()) {
            return Op::Nop;
        }

        resident.mark_expired();
        self.evict_expired(&resident, threshold)
    }

    /// Removes an entry that was just flagged as expired, unless a reader touched it before
    /// it could see the flag. That reader holds the entity, so it is put back.
    pub(super) fn evict_expired(
        &self,
        resident: &Resident<E>,
        threshold: Timestamp,
    ) -> Op<CacheEntry<E>> {
        if resident.last_access() > threshold {
            metric!(counter("expire.revived") += 1, "entity" => E::NAME);
            Op::Put(CacheEntry::resident(resident.revive()))
        } else {
            Op::Remove
        }
    }
}
