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

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Live operation counters, updated with relaxed atomics on the hot paths.
#[derive(Debug, Default)]
pub(crate) struct Metrics {
    pub keys_written: AtomicU32,
    pub keys_read_ok: AtomicU32,
    pub keys_read_not_found: AtomicU32,
    pub keys_read_expired: AtomicU32,
    pub shuffles: AtomicU32,
    pub evictions: AtomicU32,
    pub keys_reaped: AtomicU32,
    pub reaper_cycles: AtomicU32,
}

impl Metrics {
    pub fn snapshot(&self) -> Stats {
        Stats {
            keys_written: self.keys_written.load(Ordering::Relaxed),
            keys_read_ok: self.keys_read_ok.load(Ordering::Relaxed),
            keys_read_not_found: self.keys_read_not_found.load(Ordering::Relaxed),
            keys_read_expired: self.keys_read_expired.load(Ordering::Relaxed),
            shuffles: self.shuffles.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            keys_reaped: self.keys_reaped.load(Ordering::Relaxed),
            reaper_cycles: self.reaper_cycles.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the cache counters.
///
/// Counters are maintained independently, so a snapshot is not a coordinated
/// view across fields. Each counter is monotonically non-decreasing and wraps
/// on overflow.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub keys_written: u32,
    pub keys_read_ok: u32,
    pub keys_read_not_found: u32,
    pub keys_read_expired: u32,
    pub shuffles: u32,
    pub evictions: u32,
    pub keys_reaped: u32,
    pub reaper_cycles: u32,
}

impl Stats {
    /// Element-wise wrapping sum, used to combine per-shard counters.
    pub fn merge(&self, other: &Stats) -> Stats {
        Stats {
            keys_written: self.keys_written.wrapping_add(other.keys_written),
            keys_read_ok: self.keys_read_ok.wrapping_add(other.keys_read_ok),
            keys_read_not_found: self.keys_read_not_found.wrapping_add(other.keys_read_not_found),
            keys_read_expired: self.keys_read_expired.wrapping_add(other.keys_read_expired),
            shuffles: self.shuffles.wrapping_add(other.shuffles),
            evictions: self.evictions.wrapping_add(other.evictions),
            keys_reaped: self.keys_reaped.wrapping_add(other.keys_reaped),
            reaper_cycles: self.reaper_cycles.wrapping_add(other.reaper_cycles),
        }
    }
}
