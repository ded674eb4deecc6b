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

use std::hash::Hash;

/// Key type for the cache.
///
/// `Clone` is required because the key is held both by the index and by the
/// entry itself, and because bulk reads return a map keyed by the caller's
/// keys.
pub trait Key: Send + Sync + 'static + Hash + Eq + Clone {}
impl<T: Send + Sync + 'static + Hash + Eq + Clone> Key for T {}

/// Value type for the cache.
///
/// `Clone` is required because reads return a copy of the value taken under
/// the shared lock; no reference into the cache ever escapes it.
pub trait Value: Send + Sync + 'static + Clone {}
impl<T: Send + Sync + 'static + Clone> Value for T {}
