//! Helpers for testing the cache.
//!
//! Call [`setup`] at the beginning of every test that wants to see log output.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::fmt;

use crate::config::CacheSettings;
use crate::entity::Entity;
use crate::store::MemoryStore;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `entity_cache` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("entity_cache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A small game entity used throughout the tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    pub id: u64,
    pub name: String,
    pub level: u32,
    #[serde(default)]
    pub deleted: bool,
}

impl Player {
    pub fn new(id: u64, name: &str) -> Self {
        Self {
            id,
            name: name.into(),
            level: 1,
            deleted: false,
        }
    }

    pub fn deleted(id: u64) -> Self {
        Self {
            deleted: true,
            ..Self::new(id, "deleted")
        }
    }
}

impl Entity for Player {
    type Key = u64;
    const NAME: &'static str = "Player";

    fn id(&self) -> u64 {
        self.id
    }

    fn is_deleted(&self) -> bool {
        self.deleted
    }
}

/// Settings with short, easy to reason about intervals.
///
/// Entries expire after 60s idle, persistence starts after 20s and then runs every 10s.
pub fn settings() -> CacheSettings {
    CacheSettings {
        expire_after_access: Duration::from_secs(60),
        persist_interval: Duration::from_secs(20),
        load_timeout: Duration::from_secs(5),
        bulk_load_timeout: Duration::from_secs(10),
        initial_size: 16,
    }
}

pub fn store(players: impl IntoIterator<Item = Player>) -> Arc<MemoryStore<Player>> {
    Arc::new(MemoryStore::with_entities(players))
}
