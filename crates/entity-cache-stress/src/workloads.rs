use std::ops::Range;

use rand::Rng;
use serde::{Deserialize, Serialize};

use entity_cache::{Entity, EntityCache, EntityCacheError};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (i, workload) in self.workloads.iter().enumerate() {
            if workload.concurrency == 0 || workload.keys == 0 {
                anyhow::bail!("workload {i} needs a concurrency and keys");
            }
            if workload.mix.total() == 0 {
                anyhow::bail!("workload {i} has an empty operation mix");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Number of distinct players the workload operates on.
    pub keys: u64,
    #[serde(default)]
    pub mix: OperationMix,
}

/// Relative weights of the operations a workload performs.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct OperationMix {
    pub get: u32,
    pub get_or_create: u32,
    pub mutate: u32,
    pub delete: u32,
    pub get_all: u32,
}

impl Default for OperationMix {
    fn default() -> Self {
        Self {
            get: 60,
            get_or_create: 20,
            mutate: 15,
            delete: 2,
            get_all: 3,
        }
    }
}

impl OperationMix {
    fn total(&self) -> u32 {
        self.get + self.get_or_create + self.mutate + self.delete + self.get_all
    }

    /// Picks a random operation on one of `keys` players.
    pub fn pick(&self, keys: u64) -> Operation {
        let mut rng = rand::rng();
        let id = rng.random_range(0..keys);

        let mut roll = rng.random_range(0..self.total());
        let weighted = [
            (self.get, Operation::Get(id)),
            (self.get_or_create, Operation::GetOrCreate(id)),
            (self.mutate, Operation::Mutate(id)),
            (self.delete, Operation::Delete(id)),
        ];
        for (weight, operation) in weighted {
            if roll < weight {
                return operation;
            }
            roll -= weight;
        }

        let len = rng.random_range(1..=16).min(keys - id);
        Operation::GetAll(id..id + len)
    }
}

#[derive(Clone, Debug)]
pub enum Operation {
    Get(u64),
    GetOrCreate(u64),
    Mutate(u64),
    Delete(u64),
    GetAll(Range<u64>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Player {
    pub id: u64,
    pub name: String,
    pub level: u32,
    pub gold: u64,
}

impl Player {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            name: format!("player-{id}"),
            level: 1,
            gold: 0,
        }
    }
}

impl Entity for Player {
    type Key = u64;
    const NAME: &'static str = "Player";

    fn id(&self) -> u64 {
        self.id
    }
}

pub async fn process_operation(
    cache: &EntityCache<Player>,
    operation: Operation,
) -> Result<(), EntityCacheError> {
    match operation {
        Operation::Get(id) => {
            cache.get(&id).await?;
        }
        Operation::GetOrCreate(id) => {
            cache.get_or_create(&id, |id| Player::new(*id)).await?;
        }
        Operation::Mutate(id) => {
            if let Some(player) = cache.get(&id).await? {
                let mut player = player.write();
                player.level += 1;
                player.gold += 10;
            }
        }
        Operation::Delete(id) => cache.delete(&id).await,
        Operation::GetAll(ids) => {
            cache.get_all(ids).await?;
        }
    }
    Ok(())
}
