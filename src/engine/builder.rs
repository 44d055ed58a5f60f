use super::{max_parallelism, Shard, StorageEngine};

use hashbrown::raw::RawTable;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use priority_queue::PriorityQueue;

use std::hash::{BuildHasher, Hash};
use std::time::Duration;

use tokio::time::Instant;

pub struct EngineBuilder {
    pub(crate) time_to_live: Duration,
    pub(crate) shards: Option<usize>,
    pub(crate) estimated_size: Option<usize>,
    pub(crate) max_entries: Option<usize>,
}

impl EngineBuilder {
    pub fn new(time_to_live: Duration) -> Self {
        EngineBuilder {
            time_to_live,
            shards: None,
            estimated_size: None,
            max_entries: None,
        }
    }

    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    pub fn estimated_size(mut self, estimated_size: usize) -> Self {
        self.estimated_size = Some(estimated_size);
        self
    }

    /// Bound the number of resident entries, this also sizes the shards.
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self.estimated_size.get_or_insert(max_entries);
        self
    }

    /// # Panics
    /// If the time to live is zero, entries must expire strictly after they are created,
    /// or so large that an expiry can't be represented
    pub fn build<K, V, E, S>(self, build_hasher: S) -> StorageEngine<K, V, E, S>
    where
        K: Eq + Hash,
        S: BuildHasher,
    {
        assert!(!self.time_to_live.is_zero(), "time to live must be greater than zero");
        assert!(
            Instant::now().checked_add(self.time_to_live).is_some(),
            "time to live is too large"
        );

        let shards = self
            .shards
            .unwrap_or_else(|| max_parallelism() * 4)
            .max(1)
            .next_power_of_two();

        let per_shard = match self.estimated_size {
            Some(estimated_size) if estimated_size > shards => (estimated_size / shards) * 2,
            _ => 0,
        };

        let shards = (0..shards)
            .map(|_| Shard {
                flights: Mutex::new(HashMap::new()),
                table: RwLock::new(RawTable::with_capacity(per_shard)),
                expiry: Mutex::new(PriorityQueue::new()),
            })
            .collect();

        StorageEngine {
            build_hasher,
            shards,
            time_to_live: self.time_to_live,
            max_entries: self.max_entries,
        }
    }
}
