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

/// Error type for the cache.
///
/// Absence of a key is not an error; it is reported through `Option` returns
/// and the read counters.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A bulk write received key and value sequences of different lengths.
    #[error("mismatch between number of keys and number of values")]
    MismatchedLengths,
}

/// Result type for the cache.
pub type Result<T> = std::result::Result<T, Error>;
