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

//! dally - an in-process approximate-LRU cache with per-entry TTL.
//!
//! The cache trades perfectly strict LRU ordering for lower lock contention:
//! most reads finish under the shared lock alone, and only entries near the
//! least-fresh end of the queue are refreshed on read. A background reaper
//! proactively removes expired entries. For workloads with hot keys spread
//! over many threads, [`ShardedCache`] partitions the whole construction
//! behind a stable hash.
//!
//! ```
//! use std::time::Duration;
//!
//! use dally::{Cache, HashSharder, ShardedCache};
//!
//! let cache: Cache<String, String> = Cache::new(1024, Duration::from_secs(300));
//! cache.set("doorbell".to_string(), "ding".to_string());
//! assert_eq!(cache.get(&"doorbell".to_string()), Some("ding".to_string()));
//! cache.close();
//!
//! let sharded: ShardedCache<String, u64> =
//!     ShardedCache::new(256, Duration::from_secs(300), 8, HashSharder::strings());
//! sharded.set("visits".to_string(), 1);
//! assert_eq!(sharded.get(&"visits".to_string()), Some(1));
//! sharded.close();
//! ```

pub mod prelude;
pub mod sharded;

pub use dally_common::{
    code::{Key, Value},
    hashing::{HashSharder, Hasher},
};
pub use dally_memory::{Cache, Error, Result, Stats};
pub use sharded::ShardedCache;
