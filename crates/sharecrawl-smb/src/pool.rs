//! Keyed object pool for expensive, stateful connections.
//!
//! Objects are partitioned by key. Each key has its own idle queue, its own
//! set of checked-out object ids and, with `fairness` on, its own FIFO of
//! waiting borrowers. All bookkeeping sits behind one mutex; factory calls
//! (create, activate, validate, destroy) always run with the lock released.
//!
//! # Lifecycle
//!
//! ```text
//! create ──▶ active ──return──▶ idle ──borrow──▶ active
//!              │                  │
//!              └──invalidate──▶ destroy ◀──evict/clear/close
//! ```
//!
//! An object handed back that the pool does not consider active (returned
//! twice, after `clear`, after `close`) is destroyed, never re-pooled.

use crate::error::{Error, Result};
use crate::interrupt::Interrupt;
use crate::protocol::ProtocolError;
use parking_lot::{Condvar, Mutex, MutexGuard};
use sharecrawl_core::PoolConfig;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Longest a blocked borrower sleeps before rechecking its interrupt.
pub const WAIT_SLICE: Duration = Duration::from_millis(50);

/// Lifecycle hooks for pooled objects.
pub trait PooledObjectFactory<K, T>: Send + Sync {
    fn create(&self, key: &K) -> Result<T>;

    fn destroy(&self, key: &K, object: T);

    /// Health check used by the `test_on_*` and `test_while_idle` settings.
    fn validate(&self, _key: &K, _object: &T) -> bool {
        true
    }

    /// Called on every borrow before the object is handed out.
    fn activate(&self, _key: &K, _object: &T) -> Result<()> {
        Ok(())
    }
}

/// An object checked out of a [`KeyedPool`].
///
/// Give it back with [`KeyedPool::return_object`] or
/// [`KeyedPool::invalidate`]. Dropping it instead leaks its slot until the
/// pool is cleared.
#[derive(Debug)]
pub struct PooledObject<T> {
    id: u64,
    value: T,
    created_at: Instant,
    idle_since: Instant,
}

impl<T> PooledObject<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn idle_since(&self) -> Instant {
        self.idle_since
    }
}

impl<T> Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// Pool-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub waiters: usize,
    pub created: u64,
    pub destroyed: u64,
    pub borrowed: u64,
    pub returned: u64,
}

/// Counters for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyStats {
    pub active: usize,
    pub idle: usize,
    pub waiters: usize,
}

struct KeyState<T> {
    /// Oldest at the front.
    idle: VecDeque<PooledObject<T>>,
    active: HashSet<u64>,
    creating: usize,
    waiters: VecDeque<u64>,
}

impl<T> KeyState<T> {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            active: HashSet::new(),
            creating: 0,
            waiters: VecDeque::new(),
        }
    }

    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.creating
    }

    fn is_unused(&self) -> bool {
        self.total() == 0 && self.waiters.is_empty()
    }
}

struct PoolState<K, T> {
    keys: HashMap<K, KeyState<T>>,
    closed: bool,
    next_id: u64,
    next_ticket: u64,
    created: u64,
    destroyed: u64,
    borrowed: u64,
    returned: u64,
}

impl<K: Clone + Eq + Hash, T> PoolState<K, T> {
    fn total(&self) -> usize {
        self.keys.values().map(KeyState::total).sum()
    }

    fn key_mut(&mut self, key: &K) -> &mut KeyState<T> {
        self.keys.entry(key.clone()).or_insert_with(KeyState::new)
    }

    fn pop_idle(&mut self, key: &K, lifo: bool) -> Option<PooledObject<T>> {
        let entry = self.keys.get_mut(key)?;
        let object = if lifo {
            entry.idle.pop_back()
        } else {
            entry.idle.pop_front()
        }?;
        entry.active.insert(object.id);
        Some(object)
    }

    fn forget_active(&mut self, key: &K, id: u64) -> bool {
        self.keys
            .get_mut(key)
            .is_some_and(|entry| entry.active.remove(&id))
    }

    fn is_active(&self, key: &K, id: u64) -> bool {
        self.keys
            .get(key)
            .is_some_and(|entry| entry.active.contains(&id))
    }

    /// Drop bookkeeping for a key nobody uses, unless idle objects must be
    /// maintained for it.
    fn prune(&mut self, key: &K, keep_keys: bool) {
        if !keep_keys && self.keys.get(key).is_some_and(KeyState::is_unused) {
            self.keys.remove(key);
        }
    }

    fn per_key_room(&self, key: &K, config: &PoolConfig) -> bool {
        let used = self.keys.get(key).map_or(0, KeyState::total);
        config.max_total_per_key_limit().is_none_or(|max| used < max)
    }

    fn global_room(&self, config: &PoolConfig) -> bool {
        config
            .max_total_limit()
            .is_none_or(|max| self.total() < max)
    }

    /// Remove the idle object that has been idle the longest, across keys.
    fn take_oldest_idle(&mut self) -> Option<(K, PooledObject<T>)> {
        let victim = self
            .keys
            .iter()
            .filter_map(|(key, entry)| entry.idle.front().map(|o| (key, o.idle_since)))
            .min_by_key(|(_, since)| *since)
            .map(|(key, _)| key.clone())?;
        let object = self.keys.get_mut(&victim)?.idle.pop_front()?;
        Some((victim, object))
    }

    fn dequeue(&mut self, key: &K, ticket: &mut Option<u64>) {
        if let Some(t) = ticket.take() {
            if let Some(entry) = self.keys.get_mut(key) {
                entry.waiters.retain(|w| *w != t);
            }
        }
    }
}

#[derive(Default)]
struct EvictorState {
    shutdown: bool,
    running: bool,
}

#[derive(Default)]
struct EvictorControl {
    state: Mutex<EvictorState>,
    signal: Condvar,
}

struct Inner<K, T> {
    factory: Arc<dyn PooledObjectFactory<K, T>>,
    config: PoolConfig,
    state: Mutex<PoolState<K, T>>,
    available: Condvar,
    evictor: Arc<EvictorControl>,
}

impl<K, T> Drop for Inner<K, T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.closed = true;
        for (key, entry) in state.keys.iter_mut() {
            for object in entry.idle.drain(..) {
                self.factory.destroy(key, object.value);
            }
        }

        let mut evictor = self.evictor.state.lock();
        evictor.shutdown = true;
        self.evictor.signal.notify_all();
    }
}

/// Thread-safe keyed pool. Clones share the same pool.
pub struct KeyedPool<K, T> {
    inner: Arc<Inner<K, T>>,
}

impl<K, T> Clone for KeyedPool<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, T> KeyedPool<K, T>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    T: Send + 'static,
{
    /// Create a pool. Starts the background evictor when
    /// `time_between_eviction_runs` is positive.
    pub fn new(factory: Arc<dyn PooledObjectFactory<K, T>>, config: PoolConfig) -> Self {
        let interval = config.eviction_interval();
        let pool = Self {
            inner: Arc::new(Inner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    keys: HashMap::new(),
                    closed: false,
                    next_id: 1,
                    next_ticket: 1,
                    created: 0,
                    destroyed: 0,
                    borrowed: 0,
                    returned: 0,
                }),
                available: Condvar::new(),
                evictor: Arc::new(EvictorControl::default()),
            }),
        };
        if let Some(interval) = interval {
            pool.spawn_evictor(interval);
        }
        pool
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Check out an object for `key`, reusing an idle one or creating one.
    ///
    /// When the key or the whole pool is at capacity this blocks up to
    /// `max_wait` if `block_when_exhausted` is set and fails with
    /// [`Error::PoolExhausted`] otherwise.
    pub fn borrow(&self, key: &K) -> Result<PooledObject<T>> {
        self.borrow_with(key, &Interrupt::none())
    }

    /// Like [`borrow`](Self::borrow), but a wait for capacity also ends with
    /// [`Error::Interrupted`] once `interrupt` trips. Cancellation is noticed
    /// within [`WAIT_SLICE`].
    pub fn borrow_with(&self, key: &K, interrupt: &Interrupt) -> Result<PooledObject<T>> {
        let config = &self.inner.config;
        let deadline = config
            .max_wait_duration()
            .and_then(|wait| Instant::now().checked_add(wait));
        let mut ticket: Option<u64> = None;
        let mut state = self.inner.state.lock();

        loop {
            if state.closed {
                state.dequeue(key, &mut ticket);
                return Err(Error::PoolClosed);
            }

            let first_in_line = !config.fairness
                || state
                    .key_mut(key)
                    .waiters
                    .front()
                    .is_none_or(|front| Some(*front) == ticket);

            if first_in_line {
                if let Some(object) = state.pop_idle(key, config.lifo) {
                    let ready =
                        MutexGuard::unlocked(&mut state, || self.make_ready(key, &object, false));
                    if ready {
                        state.borrowed += 1;
                        state.dequeue(key, &mut ticket);
                        self.inner.available.notify_all();
                        trace!(key = %key, object_id = object.id, "Borrowed idle object");
                        return Ok(object);
                    }
                    state.forget_active(key, object.id);
                    state.destroyed += 1;
                    MutexGuard::unlocked(&mut state, || {
                        self.inner.factory.destroy(key, object.value);
                    });
                    self.inner.available.notify_all();
                    continue;
                }

                let per_key_room = state.per_key_room(key, config);
                let global_room = state.global_room(config);

                if per_key_room && !global_room {
                    if let Some((victim_key, victim)) = state.take_oldest_idle() {
                        state.destroyed += 1;
                        state.prune(&victim_key, config.min_idle_per_key_count() > 0);
                        MutexGuard::unlocked(&mut state, || {
                            debug!(key = %victim_key, object_id = victim.id, "Destroying oldest idle object to make room");
                            self.inner.factory.destroy(&victim_key, victim.value);
                        });
                        continue;
                    }
                }

                if per_key_room && global_room {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.key_mut(key).creating += 1;
                    let created =
                        MutexGuard::unlocked(&mut state, || self.inner.factory.create(key));
                    state.key_mut(key).creating -= 1;

                    let value = match created {
                        Ok(value) => value,
                        Err(e) => {
                            state.dequeue(key, &mut ticket);
                            state.prune(key, config.min_idle_per_key_count() > 0);
                            self.inner.available.notify_all();
                            return Err(e);
                        }
                    };

                    state.created += 1;
                    let now = Instant::now();
                    let object = PooledObject {
                        id,
                        value,
                        created_at: now,
                        idle_since: now,
                    };
                    state.key_mut(key).active.insert(id);
                    let ready =
                        MutexGuard::unlocked(&mut state, || self.make_ready(key, &object, true));
                    state.dequeue(key, &mut ticket);
                    if ready {
                        state.borrowed += 1;
                        self.inner.available.notify_all();
                        debug!(key = %key, object_id = id, "Created pooled object");
                        return Ok(object);
                    }
                    state.forget_active(key, id);
                    state.destroyed += 1;
                    state.prune(key, config.min_idle_per_key_count() > 0);
                    MutexGuard::unlocked(&mut state, || {
                        self.inner.factory.destroy(key, object.value);
                    });
                    self.inner.available.notify_all();
                    // Validation only fails for objects whose connection is gone.
                    return Err(Error::Protocol(ProtocolError::Closed));
                }
            }

            if !config.block_when_exhausted {
                state.dequeue(key, &mut ticket);
                return Err(Error::PoolExhausted {
                    key: key.to_string(),
                });
            }

            if config.fairness && ticket.is_none() {
                let t = state.next_ticket;
                state.next_ticket += 1;
                state.key_mut(key).waiters.push_back(t);
                ticket = Some(t);
            }

            if let Err(e) = interrupt.check("pool wait") {
                state.dequeue(key, &mut ticket);
                state.prune(key, config.min_idle_per_key_count() > 0);
                self.inner.available.notify_all();
                debug!(key = %key, error = %e, "Gave up waiting for a pooled object");
                return Err(e);
            }
            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                state.dequeue(key, &mut ticket);
                state.prune(key, config.min_idle_per_key_count() > 0);
                self.inner.available.notify_all();
                debug!(key = %key, "Timed out waiting for a pooled object");
                return Err(Error::PoolExhausted {
                    key: key.to_string(),
                });
            }
            let wake = [deadline, interrupt.deadline(), now.checked_add(WAIT_SLICE)]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(now);
            self.inner.available.wait_until(&mut state, wake);
        }
    }

    fn make_ready(&self, key: &K, object: &PooledObject<T>, fresh: bool) -> bool {
        let config = &self.inner.config;
        if let Err(e) = self.inner.factory.activate(key, &object.value) {
            debug!(key = %key, object_id = object.id, error = %e, "Activation failed");
            return false;
        }
        let test = config.test_on_borrow || (fresh && config.test_on_create);
        if test && !self.inner.factory.validate(key, &object.value) {
            debug!(key = %key, object_id = object.id, "Validation failed on borrow");
            return false;
        }
        true
    }

    /// Hand a healthy object back for reuse.
    pub fn return_object(&self, key: &K, object: PooledObject<T>) {
        let config = &self.inner.config;
        if !self.inner.state.lock().is_active(key, object.id) {
            warn!(key = %key, object_id = object.id, "Returned object is not active in this pool, destroying it");
            self.destroy_untracked(key, object);
            return;
        }

        let valid = !config.test_on_return || self.inner.factory.validate(key, &object.value);

        let mut state = self.inner.state.lock();
        state.forget_active(key, object.id);
        state.returned += 1;
        let idle_len = state.keys.get(key).map_or(0, |entry| entry.idle.len());
        let over_idle = config
            .max_idle_per_key_limit()
            .is_some_and(|max| idle_len >= max);

        if !valid || state.closed || over_idle {
            state.destroyed += 1;
            state.prune(key, config.min_idle_per_key_count() > 0);
            drop(state);
            self.inner.available.notify_all();
            trace!(key = %key, object_id = object.id, valid, over_idle, "Destroying returned object");
            self.inner.factory.destroy(key, object.value);
            return;
        }

        let mut object = object;
        object.idle_since = Instant::now();
        trace!(key = %key, object_id = object.id, "Returned object to pool");
        state.key_mut(key).idle.push_back(object);
        drop(state);
        self.inner.available.notify_all();
    }

    /// Destroy a checked-out object instead of returning it.
    pub fn invalidate(&self, key: &K, object: PooledObject<T>) {
        {
            let mut state = self.inner.state.lock();
            if !state.forget_active(key, object.id) {
                debug!(key = %key, object_id = object.id, "Invalidated object was not active");
            }
            state.destroyed += 1;
            state.prune(key, self.inner.config.min_idle_per_key_count() > 0);
        }
        self.inner.available.notify_all();
        debug!(key = %key, object_id = object.id, "Invalidating pooled object");
        self.inner.factory.destroy(key, object.value);
    }

    fn destroy_untracked(&self, key: &K, object: PooledObject<T>) {
        self.inner.state.lock().destroyed += 1;
        self.inner.factory.destroy(key, object.value);
    }

    /// Create one idle object for `key` if capacity allows.
    ///
    /// Returns `Ok(false)` when the key or the pool is full.
    pub fn add_object(&self, key: &K) -> Result<bool> {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(Error::PoolClosed);
        }
        if !state.per_key_room(key, config) || !state.global_room(config) {
            return Ok(false);
        }

        let id = state.next_id;
        state.next_id += 1;
        state.key_mut(key).creating += 1;
        let created = MutexGuard::unlocked(&mut state, || self.inner.factory.create(key));
        state.key_mut(key).creating -= 1;

        let value = match created {
            Ok(value) => value,
            Err(e) => {
                state.prune(key, config.min_idle_per_key_count() > 0);
                return Err(e);
            }
        };
        state.created += 1;
        if state.closed {
            state.destroyed += 1;
            drop(state);
            self.inner.factory.destroy(key, value);
            return Ok(false);
        }
        let now = Instant::now();
        state.key_mut(key).idle.push_back(PooledObject {
            id,
            value,
            created_at: now,
            idle_since: now,
        });
        drop(state);
        self.inner.available.notify_all();
        Ok(true)
    }

    /// Register `key` and top it up to `min_idle_per_key`.
    pub fn prepare(&self, key: &K) -> Result<()> {
        self.inner.state.lock().key_mut(key);
        self.fill_idle(key)
    }

    fn fill_idle(&self, key: &K) -> Result<()> {
        let min_idle = self.inner.config.min_idle_per_key_count();
        while self.num_idle(key) < min_idle {
            if !self.add_object(key)? {
                break;
            }
        }
        Ok(())
    }

    /// Top every known key up to `min_idle_per_key`.
    pub fn ensure_min_idle(&self) {
        if self.inner.config.min_idle_per_key_count() == 0 {
            return;
        }
        let keys: Vec<K> = self.inner.state.lock().keys.keys().cloned().collect();
        for key in keys {
            if let Err(e) = self.fill_idle(&key) {
                warn!(key = %key, error = %e, "Failed to maintain minimum idle objects");
            }
        }
    }

    /// Run one eviction pass over the oldest idle objects.
    ///
    /// Returns the number of objects destroyed.
    pub fn evict(&self) -> usize {
        let config = &self.inner.config;
        let now = Instant::now();
        let min_idle = config.min_idle_per_key_count();
        let hard_limit = config.min_evictable_idle();
        let soft_limit = config.soft_min_evictable_idle();

        let mut expired = Vec::new();
        let mut to_test = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return 0;
            }
            let total_idle: usize = state.keys.values().map(|entry| entry.idle.len()).sum();
            let mut budget = config.tests_per_eviction_run(total_idle);
            let keys: Vec<K> = state.keys.keys().cloned().collect();

            for key in keys {
                if budget == 0 {
                    break;
                }
                let Some(entry) = state.keys.get_mut(&key) else {
                    continue;
                };
                let mut kept = VecDeque::with_capacity(entry.idle.len());
                while let Some(object) = entry.idle.pop_front() {
                    if budget == 0 {
                        kept.push_back(object);
                        continue;
                    }
                    budget -= 1;

                    let idle_for = now.saturating_duration_since(object.idle_since);
                    let hard = hard_limit.is_some_and(|limit| idle_for > limit);
                    let soft = soft_limit.is_some_and(|limit| idle_for > limit)
                        && entry.idle.len() + kept.len() >= min_idle;

                    if hard || soft {
                        expired.push((key.clone(), object));
                    } else if config.test_while_idle {
                        entry.active.insert(object.id);
                        to_test.push((key.clone(), object));
                    } else {
                        kept.push_back(object);
                    }
                }
                entry.idle = kept;
            }
            state.destroyed += expired.len() as u64;
        }

        let mut evicted = expired.len();
        for (key, object) in expired {
            debug!(key = %key, object_id = object.id, "Evicting idle object");
            self.inner.factory.destroy(&key, object.value);
        }

        for (key, object) in to_test {
            let valid = self.inner.factory.validate(&key, &object.value);
            let mut state = self.inner.state.lock();
            state.forget_active(&key, object.id);
            if valid && !state.closed {
                state.key_mut(&key).idle.push_front(object);
                continue;
            }
            state.destroyed += 1;
            drop(state);
            evicted += 1;
            debug!(key = %key, object_id = object.id, "Idle object failed validation");
            self.inner.factory.destroy(&key, object.value);
        }

        if evicted > 0 {
            self.inner.available.notify_all();
        }
        evicted
    }

    /// Destroy the idle objects of one key.
    pub fn clear(&self, key: &K) {
        let idle: Vec<PooledObject<T>> = {
            let mut state = self.inner.state.lock();
            let drained: Vec<_> = state
                .keys
                .get_mut(key)
                .map(|entry| entry.idle.drain(..).collect())
                .unwrap_or_default();
            state.destroyed += drained.len() as u64;
            state.prune(key, self.inner.config.min_idle_per_key_count() > 0);
            drained
        };
        for object in idle {
            self.inner.factory.destroy(key, object.value);
        }
        self.inner.available.notify_all();
    }

    /// Destroy every idle object.
    pub fn clear_all(&self) {
        let keys: Vec<K> = self.inner.state.lock().keys.keys().cloned().collect();
        for key in keys {
            self.clear(&key);
        }
    }

    /// Stop the evictor, destroy idle objects and fail subsequent borrows.
    ///
    /// Objects still checked out are destroyed when they come back.
    pub fn close(&self) {
        let idle: Vec<(K, PooledObject<T>)> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let mut drained = Vec::new();
            for (key, entry) in state.keys.iter_mut() {
                drained.extend(entry.idle.drain(..).map(|o| (key.clone(), o)));
            }
            state.destroyed += drained.len() as u64;
            drained
        };
        self.inner.available.notify_all();
        debug!(idle = idle.len(), "Closing pool");
        for (key, object) in idle {
            self.inner.factory.destroy(&key, object.value);
        }

        let control = &self.inner.evictor;
        let mut evictor = control.state.lock();
        evictor.shutdown = true;
        control.signal.notify_all();
        let deadline = Instant::now() + self.inner.config.evictor_shutdown_wait();
        while evictor.running {
            if control.signal.wait_until(&mut evictor, deadline).timed_out() {
                warn!("Evictor did not stop within the shutdown timeout");
                break;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn num_active(&self, key: &K) -> usize {
        self.key_stats(key).active
    }

    pub fn num_idle(&self, key: &K) -> usize {
        self.key_stats(key).idle
    }

    pub fn key_stats(&self, key: &K) -> KeyStats {
        let state = self.inner.state.lock();
        state
            .keys
            .get(key)
            .map(|entry| KeyStats {
                active: entry.active.len(),
                idle: entry.idle.len(),
                waiters: entry.waiters.len(),
            })
            .unwrap_or_default()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        let mut stats = PoolStats {
            created: state.created,
            destroyed: state.destroyed,
            borrowed: state.borrowed,
            returned: state.returned,
            ..PoolStats::default()
        };
        for entry in state.keys.values() {
            stats.active += entry.active.len();
            stats.idle += entry.idle.len();
            stats.waiters += entry.waiters.len();
        }
        stats
    }

    fn spawn_evictor(&self, interval: Duration) {
        let weak: Weak<Inner<K, T>> = Arc::downgrade(&self.inner);
        let control = Arc::clone(&self.inner.evictor);
        control.state.lock().running = true;

        let thread_control = Arc::clone(&control);
        let spawned = thread::Builder::new()
            .name("sharecrawl-evictor".to_string())
            .spawn(move || {
                debug!(interval_ms = interval.as_millis() as u64, "Evictor started");
                loop {
                    {
                        let mut evictor = thread_control.state.lock();
                        if !evictor.shutdown {
                            thread_control.signal.wait_for(&mut evictor, interval);
                        }
                        if evictor.shutdown {
                            break;
                        }
                    }
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    let pool = KeyedPool { inner };
                    let evicted = pool.evict();
                    if evicted > 0 {
                        debug!(evicted, "Eviction run finished");
                    }
                    pool.ensure_min_idle();
                }
                let mut evictor = thread_control.state.lock();
                evictor.running = false;
                thread_control.signal.notify_all();
                debug!("Evictor stopped");
            });

        if let Err(e) = spawned {
            warn!(error = %e, "Failed to start evictor thread");
            control.state.lock().running = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        created: AtomicU64,
        destroyed: AtomicU64,
        fail_next_create: AtomicBool,
        reject: AtomicBool,
    }

    impl PooledObjectFactory<String, u64> for CountingFactory {
        fn create(&self, key: &String) -> Result<u64> {
            if self.fail_next_create.swap(false, Ordering::SeqCst) {
                return Err(Error::Connect {
                    key: sharecrawl_core::SessionKey::new(key.clone(), None),
                    source: ProtocolError::Closed,
                });
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn destroy(&self, _key: &String, _object: u64) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        fn validate(&self, _key: &String, _object: &u64) -> bool {
            !self.reject.load(Ordering::SeqCst)
        }
    }

    fn pool_with(config: PoolConfig) -> (KeyedPool<String, u64>, Arc<CountingFactory>) {
        let factory = Arc::new(CountingFactory::default());
        let pool = KeyedPool::new(factory.clone(), config);
        (pool, factory)
    }

    fn key(name: &str) -> String {
        name.to_string()
    }

    #[test]
    fn test_borrow_reuses_returned_object() {
        let (pool, factory) = pool_with(PoolConfig::default());
        let first = pool.borrow(&key("a")).unwrap();
        let id = first.id();
        pool.return_object(&key("a"), first);

        let second = pool.borrow(&key("a")).unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_active(&key("a")), 1);
        assert_eq!(pool.num_idle(&key("a")), 0);
    }

    #[test]
    fn test_keys_are_partitioned() {
        let (pool, _) = pool_with(PoolConfig::default());
        let a = pool.borrow(&key("a")).unwrap();
        pool.return_object(&key("a"), a);
        let b = pool.borrow(&key("b")).unwrap();
        assert_eq!(pool.num_idle(&key("a")), 1);
        assert_eq!(pool.num_active(&key("b")), 1);
        pool.return_object(&key("b"), b);
    }

    #[test]
    fn test_per_key_limit_fails_fast_when_not_blocking() {
        let config = PoolConfig {
            max_total_per_key: 2,
            block_when_exhausted: false,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let _a = pool.borrow(&key("a")).unwrap();
        let _b = pool.borrow(&key("a")).unwrap();
        let err = pool.borrow(&key("a")).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert_eq!(pool.num_active(&key("a")), 2);

        // Other keys are unaffected.
        assert!(pool.borrow(&key("b")).is_ok());
    }

    #[test]
    fn test_per_key_limit_blocks_until_max_wait() {
        let config = PoolConfig {
            max_total_per_key: 1,
            max_wait: 50,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let _held = pool.borrow(&key("a")).unwrap();

        let started = Instant::now();
        let err = pool.borrow(&key("a")).unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_interrupt_deadline_ends_unbounded_wait() {
        let config = PoolConfig {
            max_total_per_key: 1,
            fairness: true,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let _held = pool.borrow(&key("a")).unwrap();

        let started = Instant::now();
        let interrupt = Interrupt::with_timeout(Duration::from_millis(100));
        let err = pool.borrow_with(&key("a"), &interrupt).unwrap_err();
        assert!(matches!(err, Error::Interrupted(_)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pool.key_stats(&key("a")).waiters, 0);
        assert_eq!(pool.num_active(&key("a")), 1);
    }

    #[test]
    fn test_cancel_wakes_blocked_borrower() {
        let config = PoolConfig {
            max_total_per_key: 1,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let held = pool.borrow(&key("a")).unwrap();

        let interrupt = Interrupt::none();
        let other = pool.clone();
        let waiter_interrupt = interrupt.clone();
        let waiter = thread::spawn(move || {
            other
                .borrow_with(&key("a"), &waiter_interrupt)
                .map(|o| o.id())
        });
        thread::sleep(Duration::from_millis(50));
        interrupt.cancel();

        let started = Instant::now();
        let result = waiter.join().expect("waiter panicked");
        assert!(matches!(result, Err(Error::Interrupted(_))));
        assert!(started.elapsed() < Duration::from_secs(2));

        // The slot is still usable once the holder gives it back.
        pool.return_object(&key("a"), held);
        assert!(pool.borrow(&key("a")).is_ok());
    }

    #[test]
    fn test_blocked_borrower_wakes_on_return() {
        let config = PoolConfig {
            max_total_per_key: 1,
            max_wait: 5_000,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool_with(config);
        let held = pool.borrow(&key("a")).unwrap();
        let held_id = held.id();

        let other = pool.clone();
        let waiter = thread::spawn(move || other.borrow(&key("a")).map(|o| o.id()));
        thread::sleep(Duration::from_millis(50));
        pool.return_object(&key("a"), held);

        let id = waiter.join().expect("waiter panicked").unwrap();
        assert_eq!(id, held_id);
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalidated_object_is_never_reborrowed() {
        let (pool, factory) = pool_with(PoolConfig::default());
        let object = pool.borrow(&key("a")).unwrap();
        let id = object.id();
        pool.invalidate(&key("a"), object);

        let next = pool.borrow(&key("a")).unwrap();
        assert_ne!(next.id(), id);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().destroyed, 1);
    }

    #[test]
    fn test_invalidate_frees_capacity_for_blocked_borrower() {
        let config = PoolConfig {
            max_total_per_key: 1,
            max_wait: 5_000,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let held = pool.borrow(&key("a")).unwrap();
        let held_id = held.id();

        let other = pool.clone();
        let waiter = thread::spawn(move || other.borrow(&key("a")).map(|o| o.id()));
        thread::sleep(Duration::from_millis(50));
        pool.invalidate(&key("a"), held);

        let id = waiter.join().expect("waiter panicked").unwrap();
        assert_ne!(id, held_id);
    }

    #[test]
    fn test_global_limit_destroys_oldest_idle_of_other_key() {
        let config = PoolConfig {
            max_total: 1,
            block_when_exhausted: false,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool_with(config);
        let a = pool.borrow(&key("a")).unwrap();
        pool.return_object(&key("a"), a);

        let b = pool.borrow(&key("b")).unwrap();
        assert_eq!(pool.num_idle(&key("a")), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);

        // Nothing idle to sacrifice now.
        assert!(matches!(
            pool.borrow(&key("c")),
            Err(Error::PoolExhausted { .. })
        ));
        pool.return_object(&key("b"), b);
    }

    #[test]
    fn test_max_idle_per_key_destroys_surplus() {
        let config = PoolConfig {
            max_idle_per_key: 1,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool_with(config);
        let a = pool.borrow(&key("a")).unwrap();
        let b = pool.borrow(&key("a")).unwrap();
        pool.return_object(&key("a"), a);
        pool.return_object(&key("a"), b);
        assert_eq!(pool.num_idle(&key("a")), 1);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fifo_order() {
        let config = PoolConfig {
            lifo: false,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let a = pool.borrow(&key("k")).unwrap();
        let b = pool.borrow(&key("k")).unwrap();
        let (a_id, b_id) = (a.id(), b.id());
        pool.return_object(&key("k"), a);
        pool.return_object(&key("k"), b);
        assert_eq!(pool.borrow(&key("k")).unwrap().id(), a_id);
        assert_eq!(pool.borrow(&key("k")).unwrap().id(), b_id);
    }

    #[test]
    fn test_failed_create_releases_capacity() {
        let config = PoolConfig {
            max_total_per_key: 1,
            block_when_exhausted: false,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool_with(config);
        factory.fail_next_create.store(true, Ordering::SeqCst);
        assert!(matches!(pool.borrow(&key("a")), Err(Error::Connect { .. })));
        assert_eq!(pool.key_stats(&key("a")), KeyStats::default());
        assert!(pool.borrow(&key("a")).is_ok());
    }

    #[test]
    fn test_validation_on_borrow_replaces_stale_object() {
        let config = PoolConfig {
            test_on_borrow: true,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool_with(config);
        let object = pool.borrow(&key("a")).unwrap();
        let stale = object.id();
        pool.return_object(&key("a"), object);

        factory.reject.store(true, Ordering::SeqCst);
        // The idle object fails validation, so does the replacement.
        assert!(pool.borrow(&key("a")).is_err());

        factory.reject.store(false, Ordering::SeqCst);
        let fresh = pool.borrow(&key("a")).unwrap();
        assert_ne!(fresh.id(), stale);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_validation_on_return() {
        let config = PoolConfig {
            test_on_return: true,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool_with(config);
        let object = pool.borrow(&key("a")).unwrap();
        factory.reject.store(true, Ordering::SeqCst);
        pool.return_object(&key("a"), object);
        assert_eq!(pool.num_idle(&key("a")), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_evict_idle_objects() {
        let config = PoolConfig {
            min_evictable_idle_duration: 1,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool_with(config);
        let object = pool.borrow(&key("a")).unwrap();
        pool.return_object(&key("a"), object);
        thread::sleep(Duration::from_millis(20));

        assert_eq!(pool.evict(), 1);
        assert_eq!(pool.num_idle(&key("a")), 0);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_soft_eviction_keeps_min_idle() {
        let config = PoolConfig {
            min_evictable_idle_duration: -1,
            soft_min_evictable_idle_duration: 1,
            min_idle_per_key: 1,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let a = pool.borrow(&key("a")).unwrap();
        let b = pool.borrow(&key("a")).unwrap();
        pool.return_object(&key("a"), a);
        pool.return_object(&key("a"), b);
        thread::sleep(Duration::from_millis(20));

        assert_eq!(pool.evict(), 1);
        assert_eq!(pool.num_idle(&key("a")), 1);
    }

    #[test]
    fn test_prepare_fills_min_idle() {
        let config = PoolConfig {
            min_idle_per_key: 2,
            ..PoolConfig::default()
        };
        let (pool, factory) = pool_with(config);
        pool.prepare(&key("a")).unwrap();
        assert_eq!(pool.num_idle(&key("a")), 2);
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_background_evictor_runs() {
        let config = PoolConfig {
            min_evictable_idle_duration: 1,
            time_between_eviction_runs: 10,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let object = pool.borrow(&key("a")).unwrap();
        pool.return_object(&key("a"), object);

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.num_idle(&key("a")) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.num_idle(&key("a")), 0);
        pool.close();
    }

    #[test]
    fn test_close_destroys_idle_and_rejects_borrows() {
        let (pool, factory) = pool_with(PoolConfig::default());
        let idle = pool.borrow(&key("a")).unwrap();
        let out = pool.borrow(&key("a")).unwrap();
        pool.return_object(&key("a"), idle);

        pool.close();
        assert!(pool.is_closed());
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 1);
        assert!(matches!(pool.borrow(&key("a")), Err(Error::PoolClosed)));

        // Late returns are destroyed, not pooled.
        pool.return_object(&key("a"), out);
        assert_eq!(factory.destroyed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.num_idle(&key("a")), 0);
    }

    #[test]
    fn test_concurrent_borrowers_respect_per_key_limit() {
        let config = PoolConfig {
            max_total_per_key: 3,
            max_wait: 10_000,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let in_use = Arc::clone(&in_use);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let object = pool.borrow(&key("shared")).expect("borrow");
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::yield_now();
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        pool.return_object(&key("shared"), object);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().expect("worker panicked");
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert_eq!(stats.active, 0);
        assert!(stats.created <= 3);
        assert_eq!(stats.borrowed, 200);
    }

    #[test]
    fn test_fair_pool_serves_waiters() {
        let config = PoolConfig {
            max_total_per_key: 1,
            fairness: true,
            max_wait: 10_000,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(config);
        let held = pool.borrow(&key("a")).unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    let object = pool.borrow(&key("a")).expect("borrow");
                    pool.return_object(&key("a"), object);
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(50));
        pool.return_object(&key("a"), held);

        for waiter in waiters {
            waiter.join().expect("waiter panicked");
        }
        assert_eq!(pool.key_stats(&key("a")).waiters, 0);
    }
}
