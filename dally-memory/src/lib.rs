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

//! The cache core for dally: an approximate LRU bounded by item count, with
//! per-entry TTL and a background reaper.
//!
//! Recency is tracked with a min-heap over monotonic insertion numbers, and
//! reads only refresh entries already at risk of eviction, so the common read
//! needs nothing beyond the shared lock. See [`Cache`] for the details and
//! caveats of the approximation.

mod cache;
mod error;
mod metrics;
mod queue;

pub use cache::Cache;
pub use dally_common::code::{Key, Value};
pub use error::{Error, Result};
pub use metrics::Stats;
