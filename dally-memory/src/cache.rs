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

use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam::{
    channel::{self, Receiver, Sender},
    select,
};
use dally_common::code::{Key, Value};
use hashbrown::HashMap as HashTable;
use parking_lot::RwLock;
use rand::Rng;

use crate::{
    metrics::{Metrics, Stats},
    queue::{Entry, EntryQueue},
    Error, Result,
};

/// Upper bound on entries examined per reaper cycle, bounding how long the
/// shared lock is held while scanning.
const REAP_SCAN_WINDOW: usize = 100;

/// The reaper ticks at `ttl / 10`, clamped to this range.
const MIN_REAP_TICK: Duration = Duration::from_millis(1);
const MAX_REAP_TICK: Duration = Duration::from_secs(1);

/// Stand-in horizon when `now + ttl` would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(1000 * 365 * 24 * 60 * 60);

fn expire_at(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl).unwrap_or_else(|| now + FAR_FUTURE)
}

struct State<K, V>
where
    K: Key,
    V: Value,
{
    index: HashTable<K, NonNull<Entry<K, V>>>,
    queue: EntryQueue<K, V>,
    callbacks: Vec<Arc<dyn Fn(&K, &V) + Send + Sync>>,
    /// Close signal for the reaper. Dropping the sender wakes it.
    done: Option<Sender<()>>,
    is_running: bool,
    is_closing: bool,
}

impl<K, V> State<K, V>
where
    K: Key,
    V: Value,
{
    /// Pops tombstoned entries off the queue head, collecting them for
    /// callback fan-out after the lock is released.
    ///
    /// Tombstoned entries have already been removed from the index, so this
    /// restores the index/queue key-set equivalence.
    fn compact_head(&mut self, dead: &mut Vec<(K, V)>) {
        while self
            .queue
            .peek()
            .map_or(false, |head| unsafe { head.as_ref().insert_number == 0 })
        {
            if let Some(ptr) = unsafe { self.queue.pop() } {
                let entry = *unsafe { Box::from_raw(ptr.as_ptr()) };
                dead.push((entry.key, entry.value));
            }
        }
    }
}

impl<K, V> Drop for State<K, V>
where
    K: Key,
    V: Value,
{
    fn drop(&mut self) {
        debug_assert_eq!(self.index.len(), self.queue.len());
        for (_, ptr) in self.index.drain() {
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }
}

struct Shared<K, V>
where
    K: Key,
    V: Value,
{
    state: RwLock<State<K, V>>,
    /// Source of insertion numbers. Starts at 1; 0 is reserved for
    /// tombstones.
    insert_seq: AtomicU64,
    metrics: Metrics,
    /// Cheaper for the hot paths to check than locking and counting the
    /// callback vector.
    num_callbacks: AtomicUsize,
    max_items: usize,
    ttl: Duration,
}

// Entry pointers are only dereferenced while `state`'s lock is held, and
// entries never outlive their removal from both index and queue.
unsafe impl<K, V> Send for Shared<K, V>
where
    K: Key,
    V: Value,
{
}
unsafe impl<K, V> Sync for Shared<K, V>
where
    K: Key,
    V: Value,
{
}

impl<K, V> Shared<K, V>
where
    K: Key,
    V: Value,
{
    fn next_insert_number(&self) -> u64 {
        self.insert_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether a read of the entry at `index` should refresh it. True only
    /// when the entry sits in the least-fresh quarter of the capacity window,
    /// adjusted for unused capacity, which keeps most reads free of the
    /// exclusive lock.
    fn should_bubble(&self, index: isize, queue_len: usize) -> bool {
        let cap = self.max_items as isize;
        index + (cap - queue_len as isize) < cap / 4
    }

    fn set_ttl(&self, key: K, value: V, ttl: Duration) {
        let expiration = expire_at(ttl);
        let mut dead = Vec::new();
        {
            let mut state = self.state.write();
            self.set_under_lock(&mut state, key, value, expiration, &mut dead);
        }
        self.fire_callbacks(&dead);
    }

    /// Writes one entry. Callers hold the exclusive lock; evicted entries are
    /// pushed onto `dead` for callback fan-out after release.
    fn set_under_lock(
        &self,
        state: &mut State<K, V>,
        key: K,
        value: V,
        expiration: Instant,
        dead: &mut Vec<(K, V)>,
    ) {
        self.metrics.keys_written.fetch_add(1, Ordering::Relaxed);
        if self.max_items == 0 {
            return;
        }

        if let Some(&ptr) = state.index.get(&key) {
            {
                let entry = unsafe { &mut *ptr.as_ptr() };
                entry.value = value;
                entry.expiration = expiration;
            }
            unsafe { state.queue.update(ptr, self.next_insert_number()) };
            return;
        }

        // Make room before pushing, evicting from the least-fresh end.
        while state.queue.len() >= self.max_items {
            let Some(victim) = (unsafe { state.queue.pop() }) else {
                break;
            };
            let entry = *unsafe { Box::from_raw(victim.as_ptr()) };
            state.index.remove(&entry.key);
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            dead.push((entry.key, entry.value));
        }

        let entry = Box::new(Entry {
            key: key.clone(),
            value,
            insert_number: self.next_insert_number(),
            expiration,
            index: -1,
        });
        let ptr = unsafe { NonNull::new_unchecked(Box::into_raw(entry)) };
        unsafe { state.queue.push(ptr) };
        state.index.insert(key, ptr);
    }

    /// Re-checks an expiry observed under the shared lock and removes the
    /// entry if it still holds. Returns whether the key was removed.
    ///
    /// The clock is queried again under the exclusive lock: a concurrent
    /// write may have extended the entry's life, and only the current time
    /// decides whether that extension has itself already lapsed.
    fn remove_if_expired(&self, key: &K) -> bool {
        let mut dead = Vec::new();
        let removed = {
            let mut state = self.state.write();
            match state.index.get(key) {
                Some(&ptr) => {
                    let (expiration, index) = {
                        let entry = unsafe { ptr.as_ref() };
                        (entry.expiration, entry.index)
                    };
                    if expiration < Instant::now() && index >= 0 {
                        unsafe { state.queue.update(ptr, 0) };
                        state.index.remove(key);
                        state.compact_head(&mut dead);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        self.fire_callbacks(&dead);
        removed
    }

    /// Runs reap cycles until one turns up nothing expired. `start` fixes the
    /// scan origin; `None` picks a random origin on the first cycle of the
    /// pass. The origin is chosen once per pass: the queue is ordered by
    /// freshness, not expiration, so uniform sampling is as good as anything.
    fn reap_from(&self, start: Option<usize>) {
        let timestamp = Instant::now();
        if self.state.read().queue.is_empty() {
            return;
        }

        let mut cycles = 0u32;
        let mut dead = Vec::new();
        let mut origin = start;
        loop {
            cycles += 1;

            let mut candidates = Vec::new();
            {
                let state = self.state.read();
                if !state.is_running || state.queue.is_empty() {
                    break;
                }
                let len = state.queue.len();
                let begin = *origin.get_or_insert_with(|| rand::thread_rng().gen_range(0..len));
                let end = (begin + REAP_SCAN_WINDOW).min(len);
                for position in begin..end {
                    if let Some(ptr) = state.queue.get(position) {
                        let entry = unsafe { ptr.as_ref() };
                        if entry.expiration < timestamp {
                            candidates.push(entry.key.clone());
                        }
                    }
                }
            }

            if candidates.is_empty() {
                break;
            }

            {
                let mut state = self.state.write();
                for key in &candidates {
                    // It may have been touched between the locks.
                    let Some(&ptr) = state.index.get(key) else {
                        continue;
                    };
                    let (expiration, insert_number) = {
                        let entry = unsafe { ptr.as_ref() };
                        (entry.expiration, entry.insert_number)
                    };
                    if insert_number > 0 && expiration < timestamp {
                        unsafe { state.queue.update(ptr, 0) };
                        state.index.remove(key);
                        self.metrics.keys_reaped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                state.compact_head(&mut dead);
            }
        }

        self.metrics.reaper_cycles.fetch_add(cycles, Ordering::Relaxed);
        self.fire_callbacks(&dead);
    }

    /// Invokes eviction callbacks, outside all locks.
    fn fire_callbacks(&self, dead: &[(K, V)]) {
        if dead.is_empty() || self.num_callbacks.load(Ordering::Relaxed) == 0 {
            return;
        }
        let callbacks = self.state.read().callbacks.clone();
        for (key, value) in dead {
            for callback in &callbacks {
                callback(key, value);
            }
        }
    }
}

fn spawn_reaper<K, V>(shared: &Arc<Shared<K, V>>, done: Receiver<()>)
where
    K: Key,
    V: Value,
{
    let period = (shared.ttl / 10).clamp(MIN_REAP_TICK, MAX_REAP_TICK);
    let weak = Arc::downgrade(shared);
    thread::spawn(move || {
        tracing::trace!(?period, "cache reaper started");
        let ticker = channel::tick(period);
        loop {
            select! {
                recv(done) -> _ => break,
                recv(ticker) -> _ => {
                    let Some(shared) = weak.upgrade() else { return };
                    shared.reap_from(None);
                }
            }
        }
        if let Some(shared) = weak.upgrade() {
            shared.state.write().is_running = false;
        }
        tracing::trace!("cache reaper exited");
    });
}

/// An LRU cache with per-entry TTL that only reshuffles values when it is
/// somewhat full.
///
/// Lookups go through a hash index; recency is approximated with a priority
/// queue keyed by a monotonic insertion number. Approximate, because usage is
/// not recorded on every read: only entries close to the least-fresh end of
/// the queue, the ones actually at risk of eviction, are refreshed. That
/// assumption does not hold everywhere. An undersized cache that churns a lot
/// will behave worse than an LRU that reshuffles on every read.
///
/// The handle is cheap to clone; clones share one cache. If the cache is
/// built with a non-zero TTL, a background reaper thread proactively removes
/// expired entries until [`Cache::close`] is called.
pub struct Cache<K, V>
where
    K: Key,
    V: Value,
{
    shared: Arc<Shared<K, V>>,
}

impl<K, V> Clone for Cache<K, V>
where
    K: Key,
    V: Value,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Key,
    V: Value,
{
    /// Creates a cache with the given capacity and default time-to-live.
    ///
    /// With `max_items == 0` the cache holds nothing, though writes still
    /// count. With `ttl == 0` every entry is stored already expired and no
    /// reaper is started; with a non-zero TTL the background reaper runs
    /// until [`Cache::close`].
    pub fn new(max_items: usize, ttl: Duration) -> Self {
        let run_reaper = !ttl.is_zero();
        let (done_tx, done_rx) = channel::bounded(0);
        let state = State {
            index: HashTable::new(),
            queue: EntryQueue::new(),
            callbacks: Vec::new(),
            done: run_reaper.then_some(done_tx),
            is_running: run_reaper,
            is_closing: !run_reaper,
        };
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            insert_seq: AtomicU64::new(1),
            metrics: Metrics::default(),
            num_callbacks: AtomicUsize::new(0),
            max_items,
            ttl,
        });
        if run_reaper {
            spawn_reaper(&shared, done_rx);
        }
        Self { shared }
    }

    /// Retrieves a value from the cache.
    ///
    /// An entry observed past its expiration is removed and reported as
    /// absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let shared = &self.shared;

        // The snapshot is copied to the stack before the shared lock is
        // released; the entry itself may be freed by another thread between
        // the locks below.
        let (value, expiration, index, mut bubble) = {
            let state = shared.state.read();
            let Some(&ptr) = state.index.get(key) else {
                drop(state);
                shared.metrics.keys_read_not_found.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            let entry = unsafe { ptr.as_ref() };
            (
                entry.value.clone(),
                entry.expiration,
                entry.index,
                shared.should_bubble(entry.index, state.queue.len()),
            )
        };

        if expiration < Instant::now() && index >= 0 {
            if shared.remove_if_expired(key) {
                shared.metrics.keys_read_expired.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            // The entry was refreshed between the locks, so the snapshot's
            // shuffle decision is stale. Take the exclusive path below and
            // re-derive it there.
            bubble = true;
        }

        if bubble {
            let mut state = shared.state.write();
            // Double check: someone else may have shuffled or removed it
            // between the locks.
            if let Some(&ptr) = state.index.get(key) {
                let index = unsafe { ptr.as_ref().index };
                if shared.should_bubble(index, state.queue.len()) {
                    unsafe { state.queue.update(ptr, shared.next_insert_number()) };
                    shared.metrics.shuffles.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        shared.metrics.keys_read_ok.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Retrieves values for the given keys. Missing and expired keys are
    /// absent from the result.
    pub fn mget(&self, keys: &[K]) -> HashMap<K, V> {
        let shared = &self.shared;

        let mut found: HashMap<K, V> = HashMap::with_capacity(keys.len());
        let mut maybe_expired = Vec::new();
        let mut needs_shuffle = Vec::new();
        let mut not_found = 0u32;

        {
            let state = shared.state.read();
            for key in keys {
                let Some(&ptr) = state.index.get(key) else {
                    not_found += 1;
                    continue;
                };
                let entry = unsafe { ptr.as_ref() };
                found.insert(key.clone(), entry.value.clone());
                if entry.expiration < Instant::now() && entry.index >= 0 {
                    maybe_expired.push(key.clone());
                } else if shared.should_bubble(entry.index, state.queue.len()) {
                    needs_shuffle.push(key.clone());
                }
            }
        }
        if not_found > 0 {
            shared.metrics.keys_read_not_found.fetch_add(not_found, Ordering::Relaxed);
        }

        // Nothing to mutate, so never take the exclusive lock.
        if found.is_empty() || (maybe_expired.is_empty() && needs_shuffle.is_empty()) {
            shared.metrics.keys_read_ok.fetch_add(found.len() as u32, Ordering::Relaxed);
            return found;
        }

        let mut dead = Vec::new();
        {
            let mut state = shared.state.write();
            for key in &maybe_expired {
                // Re-check under the exclusive lock against the current
                // time; it may have been refreshed or removed between the
                // locks.
                let Some(&ptr) = state.index.get(key) else {
                    continue;
                };
                let (expiration, index) = {
                    let entry = unsafe { ptr.as_ref() };
                    (entry.expiration, entry.index)
                };
                if expiration < Instant::now() && index >= 0 {
                    unsafe { state.queue.update(ptr, 0) };
                    state.index.remove(key);
                    found.remove(key);
                    shared.metrics.keys_read_expired.fetch_add(1, Ordering::Relaxed);
                }
            }
            state.compact_head(&mut dead);

            for key in &needs_shuffle {
                let Some(&ptr) = state.index.get(key) else {
                    continue;
                };
                let index = unsafe { ptr.as_ref().index };
                if shared.should_bubble(index, state.queue.len()) {
                    unsafe { state.queue.update(ptr, shared.next_insert_number()) };
                    shared.metrics.shuffles.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        shared.fire_callbacks(&dead);

        shared.metrics.keys_read_ok.fetch_add(found.len() as u32, Ordering::Relaxed);
        found
    }

    /// Writes to the cache with the default time-to-live.
    pub fn set(&self, key: K, value: V) {
        self.shared.set_ttl(key, value, self.shared.ttl);
    }

    /// Writes to the cache, expiring after the given time-to-live.
    pub fn set_ttl(&self, key: K, value: V, ttl: Duration) {
        self.shared.set_ttl(key, value, ttl);
    }

    /// Writes multiple keys and values with the default time-to-live under a
    /// single lock acquisition.
    pub fn mset(&self, keys: Vec<K>, values: Vec<V>) -> Result<()> {
        self.mset_ttl(keys, values, self.shared.ttl)
    }

    /// Writes multiple keys and values, expiring after the given
    /// time-to-live, under a single lock acquisition.
    pub fn mset_ttl(&self, keys: Vec<K>, values: Vec<V>, ttl: Duration) -> Result<()> {
        if keys.len() != values.len() {
            return Err(Error::MismatchedLengths);
        }
        let expiration = expire_at(ttl);
        let mut dead = Vec::new();
        {
            let mut state = self.shared.state.write();
            for (key, value) in keys.into_iter().zip(values) {
                self.shared.set_under_lock(&mut state, key, value, expiration, &mut dead);
            }
        }
        self.shared.fire_callbacks(&dead);
        Ok(())
    }

    /// Removes a key. Removing a key that is not present is a no-op.
    pub fn delete(&self, key: &K) {
        let shared = &self.shared;

        // If the key isn't here, don't bother taking the exclusive lock.
        {
            let state = shared.state.read();
            if !state.index.contains_key(key) {
                return;
            }
        }

        let mut dead = Vec::new();
        {
            let mut state = shared.state.write();
            if let Some(&ptr) = state.index.get(key) {
                state.index.remove(key);
                // Tombstoning floats the entry to the head, where compaction
                // pops it.
                unsafe { state.queue.update(ptr, 0) };
                state.compact_head(&mut dead);
            }
        }
        shared.fire_callbacks(&dead);
    }

    /// Registers a callback invoked with every entry subsequently removed by
    /// capacity eviction, expiry, or [`Cache::delete`].
    ///
    /// Callbacks run outside all locks: synchronously on the writing thread
    /// for eviction and delete, on the reaper thread for proactive expiry.
    /// A slow callback therefore delays its caller, not the cache.
    pub fn on_evict(&self, callback: impl Fn(&K, &V) + Send + Sync + 'static) {
        let mut state = self.shared.state.write();
        state.callbacks.push(Arc::new(callback));
        self.shared.num_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs one reaper pass over the whole cache, scanning from the front.
    pub fn reap(&self) {
        self.shared.reap_from(Some(0));
    }

    /// The number of items currently held.
    pub fn len(&self) -> usize {
        self.shared.state.read().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the background reaper is active.
    pub fn is_running(&self) -> bool {
        self.shared.state.read().is_running
    }

    /// Signals the reaper to stop. Safe to call multiple times. The cache
    /// remains readable and writable afterwards, just without proactive
    /// expiry.
    pub fn close(&self) {
        let mut state = self.shared.state.write();
        if !state.is_closing {
            state.is_closing = true;
            state.done.take();
            tracing::debug!("cache closing");
        }
    }

    /// A copy of the cache counters. The copy does not update as the cache
    /// continues to run.
    pub fn stats(&self) -> Stats {
        self.shared.metrics.snapshot()
    }
}
