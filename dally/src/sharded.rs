//  Copyright 2025 Dally Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use std::{collections::HashMap, sync::Arc, time::Duration};

use dally_common::hashing::HashSharder;
use dally_memory::{Cache, Error, Key, Result, Stats, Value};
use itertools::Itertools;

/// Keeps the reduced digest non-negative regardless of the high bit.
const SHARD_MASK: u64 = 0x7FFF_FFFF_FFFF_FFFF;

/// A sharded [`Cache`] that routes every key to one of several independent
/// cores to reduce lock contention.
///
/// Each shard is bounded by `max_items_per_shard`, not by a global count, so
/// total capacity depends on how evenly the sharder spreads the keys. This
/// may also cost some memory locality; your mileage may vary.
pub struct ShardedCache<K, V>
where
    K: Key,
    V: Value,
{
    shards: Vec<Cache<K, V>>,
    sharder: HashSharder<K>,
    ttl: Duration,
}

impl<K, V> ShardedCache<K, V>
where
    K: Key,
    V: Value,
{
    /// Creates a cache of `num_shards` independent cores.
    ///
    /// The sharder must be consistent and should distribute as uniformly as
    /// possible over the expected keys. For string and byte-string keys the
    /// canned [`HashSharder::strings`] and [`HashSharder::bytes`] are
    /// appropriate; custom key types can supply their own writer through
    /// [`HashSharder::new`].
    pub fn new(
        max_items_per_shard: usize,
        ttl: Duration,
        num_shards: usize,
        sharder: HashSharder<K>,
    ) -> Self {
        let shards = (0..num_shards.max(1))
            .map(|_| Cache::new(max_items_per_shard, ttl))
            .collect();
        Self { shards, sharder, ttl }
    }

    /// The shard a key routes to.
    pub fn shard_index(&self, key: &K) -> usize {
        ((self.sharder.shard(key) & SHARD_MASK) % self.shards.len() as u64) as usize
    }

    /// Retrieves a value from the owning shard.
    pub fn get(&self, key: &K) -> Option<V> {
        self.shards[self.shard_index(key)].get(key)
    }

    /// Retrieves values for the given keys. Missing and expired keys are
    /// absent from the result.
    pub fn mget(&self, keys: &[K]) -> HashMap<K, V> {
        match keys {
            [] => HashMap::new(),
            [key] => {
                // One key never needs the grouping machinery.
                let mut found = HashMap::with_capacity(1);
                if let Some(value) = self.get(key) {
                    found.insert(key.clone(), value);
                }
                found
            }
            _ => {
                let mut grouped: Vec<(usize, K)> = keys
                    .iter()
                    .map(|key| (self.shard_index(key), key.clone()))
                    .collect();
                grouped.sort_by_key(|(shard, _)| *shard);

                let mut found = HashMap::with_capacity(keys.len());
                for (shard, group) in &grouped.into_iter().chunk_by(|(shard, _)| *shard) {
                    let group_keys: Vec<K> = group.map(|(_, key)| key).collect();
                    found.extend(self.shards[shard].mget(&group_keys));
                }
                found
            }
        }
    }

    /// Writes to the owning shard with the default time-to-live.
    pub fn set(&self, key: K, value: V) {
        self.shards[self.shard_index(&key)].set(key, value);
    }

    /// Writes to the owning shard, expiring after the given time-to-live.
    pub fn set_ttl(&self, key: K, value: V, ttl: Duration) {
        self.shards[self.shard_index(&key)].set_ttl(key, value, ttl);
    }

    /// Writes multiple keys and values with the default time-to-live, one
    /// bulk write per targeted shard.
    pub fn mset(&self, keys: Vec<K>, values: Vec<V>) -> Result<()> {
        self.mset_ttl(keys, values, self.ttl)
    }

    /// Writes multiple keys and values, expiring after the given
    /// time-to-live, one bulk write per targeted shard.
    pub fn mset_ttl(&self, mut keys: Vec<K>, mut values: Vec<V>, ttl: Duration) -> Result<()> {
        if keys.len() != values.len() {
            return Err(Error::MismatchedLengths);
        }
        if keys.is_empty() {
            return Ok(());
        }
        if keys.len() == 1 {
            // One pair never needs the grouping machinery.
            if let (Some(key), Some(value)) = (keys.pop(), values.pop()) {
                self.set_ttl(key, value, ttl);
            }
            return Ok(());
        }

        let mut grouped: Vec<(usize, K, V)> = keys
            .into_iter()
            .zip(values)
            .map(|(key, value)| (self.shard_index(&key), key, value))
            .collect();
        // Stable, so each shard sees its keys in the caller's order.
        grouped.sort_by_key(|(shard, _, _)| *shard);

        for (shard, group) in &grouped.into_iter().chunk_by(|(shard, _, _)| *shard) {
            let (group_keys, group_values): (Vec<K>, Vec<V>) =
                group.map(|(_, key, value)| (key, value)).unzip();
            self.shards[shard].mset_ttl(group_keys, group_values, ttl)?;
        }
        Ok(())
    }

    /// Removes a key from its owning shard.
    pub fn delete(&self, key: &K) {
        self.shards[self.shard_index(key)].delete(key);
    }

    /// Registers an eviction callback on every shard.
    pub fn on_evict(&self, callback: impl Fn(&K, &V) + Send + Sync + 'static) {
        let callback = Arc::new(callback);
        for shard in &self.shards {
            let callback = callback.clone();
            shard.on_evict(move |key, value| callback(key, value));
        }
    }

    /// Runs one reaper pass on every shard.
    pub fn reap(&self) {
        for shard in &self.shards {
            shard.reap();
        }
    }

    /// Total number of items across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the background reaper is active on at least one shard.
    pub fn is_running(&self) -> bool {
        self.shards.iter().any(|shard| shard.is_running())
    }

    /// Closes every shard. Safe to call multiple times.
    pub fn close(&self) {
        for shard in &self.shards {
            shard.close();
        }
    }

    /// A copy of the counters, summed across all shards.
    pub fn stats(&self) -> Stats {
        self.shards
            .iter()
            .map(|shard| shard.stats())
            .fold(Stats::default(), |acc, stats| acc.merge(&stats))
    }
}
