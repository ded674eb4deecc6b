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

use crossbeam::queue::ArrayQueue;
use xxhash_rust::xxh3::Xxh3;

/// Streaming 64-bit hasher fed by a sharder writer.
///
/// Writer contract: two keys that compare equal must produce identical write
/// sequences, and keys whose logical content differs must produce different
/// ones. Variable-length fields need explicit separators, otherwise
/// `("ab", "c")` and `("a", "bc")` hash alike.
pub trait Hasher {
    fn write(&mut self, bytes: &[u8]);

    fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }

    fn write_u8(&mut self, v: u8) {
        self.write(&[v]);
    }

    fn write_u16(&mut self, v: u16) {
        self.write(&v.to_le_bytes());
    }

    fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    fn write_f32(&mut self, v: f32) {
        self.write_u32(v.to_bits());
    }

    fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    fn write_bool(&mut self, v: bool) {
        self.write_u8(v as u8);
    }
}

impl Hasher for Xxh3 {
    fn write(&mut self, bytes: &[u8]) {
        self.update(bytes);
    }
}

/// The pool bounds how many idle hashers are retained, not concurrency.
const HASHER_POOL_CAPACITY: usize = 64;

/// Maps keys to 64-bit shard digests with a user-supplied writer function.
///
/// Hasher instances are pooled so steady-state sharding does not allocate.
pub struct HashSharder<K> {
    write: Box<dyn Fn(&K, &mut dyn Hasher) + Send + Sync>,
    pool: ArrayQueue<Xxh3>,
}

impl<K> HashSharder<K> {
    /// Builds a sharder from a writer that feeds the key's structure into the
    /// hasher. See the [`Hasher`] writer contract.
    pub fn new(write: impl Fn(&K, &mut dyn Hasher) + Send + Sync + 'static) -> Self {
        Self {
            write: Box::new(write),
            pool: ArrayQueue::new(HASHER_POOL_CAPACITY),
        }
    }

    pub fn shard(&self, key: &K) -> u64 {
        let mut hasher = self.pool.pop().unwrap_or_else(Xxh3::new);
        hasher.reset();
        (self.write)(key, &mut hasher);
        let digest = hasher.digest();
        let _ = self.pool.push(hasher);
        digest
    }
}

impl HashSharder<String> {
    /// Sharder for string keys.
    pub fn strings() -> Self {
        Self::new(|key: &String, hasher| hasher.write_str(key))
    }
}

impl HashSharder<Vec<u8>> {
    /// Sharder for byte-string keys.
    pub fn bytes() -> Self {
        Self::new(|key: &Vec<u8>, hasher| hasher.write(key))
    }
}

impl<K> std::fmt::Debug for HashSharder<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashSharder").finish_non_exhaustive()
    }
}
