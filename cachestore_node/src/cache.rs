//! The node's cache: object and binding entries spread over a fixed set of locked
//! buckets, an ordered index of binding keys, and the reservations that bound its size.
//!
//! Entries are looked up again by key after every wait rather than held on to. An entry
//! carries a serial number so that a caller can tell whether the entry it saw before
//! waiting is still the one in the cache.
//!
//! Locks are taken in the order: reservation, bucket, binding index. A thread holds at
//! most one bucket at a time. Waits for an entry end only when it changes as awaited or
//! the waiter's deadline passes, however often the bucket is signalled meanwhile.

use crate::{
    entry::{BindingData, DisplayBinding, Entry, ObjectValue, State, Step},
    reserve::{Reservation, Reservations},
};
use cachestore_api::{DataKey, Error, Result};
use cachestore_id::{BindingKey, ContextId, ObjectId};
use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use std::{
    collections::BTreeMap,
    fmt::Display,
    hash::{BuildHasher, Hash},
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Instant,
};
use tracing::warn;

/// How many times an operation goes around its retry loop before giving up.
pub(crate) const MAX_RETRIES: usize = 1000;

#[derive(Debug)]
pub(crate) struct Cache {
    buckets: Box<[BucketSlot]>,
    hasher: DefaultHashBuilder,
    /// Binding keys in order, with the serial of the entry for each.
    index: RwLock<BTreeMap<BindingKey, u64>>,
    next_serial: AtomicU64,
    objects: AtomicUsize,
    bindings: AtomicUsize,
    reservations: Arc<Reservations>,
}

#[derive(Debug, Default)]
struct BucketSlot {
    bucket: Mutex<Bucket>,
    /// Signalled whenever an entry in the bucket changes.
    changed: Condvar,
}

#[derive(Debug, Default)]
struct Bucket {
    objects: HashMap<ObjectId, Entry<ObjectValue>>,
    bindings: HashMap<BindingKey, Entry<BindingData>>,
}

/// The result of waiting for an entry to become writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AwaitWritable {
    Writable,
    /// Cached for read only; the caller must upgrade it.
    Readable,
    /// Gone from the cache.
    Decached,
}

/// A snapshot of an entry of either kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Summary {
    pub(crate) serial: u64,
    pub(crate) state: State,
    pub(crate) context_id: ContextId,
    pub(crate) pending_previous: bool,
}

impl Summary {
    /// Whether a transaction may still depend on the entry: one that used it is running
    /// or its commit is unacknowledged, or an operation is using it as a next entry.
    pub(crate) fn in_use(&self, lowest_pending: ContextId) -> bool {
        self.context_id >= lowest_pending || self.pending_previous
    }
}

/// How long a caller may wait, and the flag that interrupts it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Waiter<'a> {
    pub(crate) deadline: Instant,
    interrupted: Option<&'a AtomicBool>,
}

impl<'a> Waiter<'a> {
    pub(crate) fn new(deadline: Instant, interrupted: Option<&'a AtomicBool>) -> Self {
        Self {
            deadline,
            interrupted,
        }
    }

    fn check_interrupted(&self, what: &dyn Display) -> Result<()> {
        if self
            .interrupted
            .is_some_and(|interrupted| interrupted.load(Ordering::Acquire))
        {
            return Err(Error::Interrupted(format!("while waiting for {what}")));
        }
        Ok(())
    }

    fn check(&self, what: &dyn Display) -> Result<()> {
        self.check_interrupted(what)?;
        if Instant::now() >= self.deadline {
            return Err(Error::Timeout(format!("waiting for {what}")));
        }
        Ok(())
    }
}

impl Cache {
    pub(crate) fn new(num_buckets: usize, reservations: Arc<Reservations>) -> Self {
        Self {
            buckets: (0..num_buckets.max(1)).map(|_| BucketSlot::default()).collect(),
            hasher: DefaultHashBuilder::default(),
            index: RwLock::new(BTreeMap::new()),
            next_serial: AtomicU64::new(1),
            objects: AtomicUsize::new(0),
            bindings: AtomicUsize::new(0),
            reservations,
        }
    }

    pub(crate) fn reservations(&self) -> &Arc<Reservations> {
        &self.reservations
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.load(Ordering::Relaxed)
    }

    pub(crate) fn binding_count(&self) -> usize {
        self.bindings.load(Ordering::Relaxed)
    }

    fn slot<K: Hash + ?Sized>(&self, key: &K) -> &BucketSlot {
        let hash = self.hasher.hash_one(key);
        &self.buckets[(hash % self.buckets.len() as u64) as usize]
    }

    fn lock_slot<'a>(&'a self, slot: &'a BucketSlot) -> BucketGuard<'a> {
        BucketGuard {
            cache: self,
            guard: slot.bucket.lock(),
            changed: &slot.changed,
            dirty: false,
        }
    }

    pub(crate) fn lock_object(&self, oid: ObjectId) -> BucketGuard<'_> {
        self.lock_slot(self.slot(&oid))
    }

    pub(crate) fn lock_binding(&self, key: &BindingKey) -> BucketGuard<'_> {
        self.lock_slot(self.slot(key))
    }

    pub(crate) fn lock_key(&self, key: &DataKey) -> BucketGuard<'_> {
        match key {
            DataKey::Object(oid) => self.lock_object(*oid),
            DataKey::Binding(key) => self.lock_binding(key),
        }
    }

    /// The cached binding with the lowest key at or above `key`, and its serial.
    pub(crate) fn ceiling_binding(&self, key: &BindingKey) -> Option<(BindingKey, u64)> {
        self.index
            .read()
            .range(key..)
            .next()
            .map(|(key, serial)| (key.clone(), *serial))
    }

    /// The cached binding with the lowest key above `key`, and its serial.
    pub(crate) fn higher_binding(&self, key: &BindingKey) -> Option<(BindingKey, u64)> {
        self.index
            .read()
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(key, serial)| (key.clone(), *serial))
    }

    /// Wakes every waiter so that it notices an interrupt.
    pub(crate) fn wake_all(&self) {
        for slot in self.buckets.iter() {
            let _bucket = slot.bucket.lock();
            slot.changed.notify_all();
        }
    }

    /// Collects the keys of every entry in as many buckets as it takes to reach `max`,
    /// starting at the bucket `cursor` points to and advancing it. Buckets hold objects
    /// and bindings in proportion to how many of each are cached, so the batch does too.
    /// The result may be stale by the time it is used.
    pub(crate) fn scan_keys(&self, cursor: &mut usize, max: usize) -> Vec<(DataKey, u64)> {
        let mut keys = Vec::with_capacity(max);
        for _ in 0..self.buckets.len() {
            if keys.len() >= max {
                break;
            }
            *cursor %= self.buckets.len();
            let bucket = self.buckets[*cursor].bucket.lock();
            *cursor += 1;
            let objects = bucket
                .objects
                .iter()
                .map(|(oid, entry)| (DataKey::Object(*oid), entry.serial()));
            let bindings = bucket
                .bindings
                .iter()
                .map(|(key, entry)| (DataKey::Binding(key.clone()), entry.serial()));
            keys.extend(objects.chain(bindings));
        }
        keys
    }

    /// Checks that cached bindings are ordered and that their previous-key ranges do not
    /// overlap, logging a warning for each problem. Returns the number of problems.
    pub(crate) fn check_bindings(&self) -> usize {
        let keys: Vec<(BindingKey, u64)> = self
            .index
            .read()
            .iter()
            .map(|(key, serial)| (key.clone(), *serial))
            .collect();
        let mut problems = 0;
        let mut previous_entry_key: Option<BindingKey> = None;
        for (key, serial) in keys {
            let bucket = self.lock_binding(&key);
            let Some(entry) = bucket.binding(&key, serial) else {
                continue;
            };
            if let Some(previous_entry_key) = &previous_entry_key {
                if *previous_entry_key >= key {
                    warn!(%previous_entry_key, entry = %DisplayBinding(&key, entry), "entry is out of order");
                    problems += 1;
                }
                if let Some(previous_key) = entry.previous_key() {
                    if previous_entry_key > previous_key {
                        warn!(%previous_entry_key, entry = %DisplayBinding(&key, entry), "previous key is too low");
                        problems += 1;
                    } else if previous_entry_key == previous_key && entry.previous_key_unbound() {
                        warn!(%previous_entry_key, entry = %DisplayBinding(&key, entry), "previous key is bound");
                        problems += 1;
                    }
                }
            }
            previous_entry_key = Some(key);
        }
        problems
    }
}

/// A locked bucket. Waiters on the bucket are woken when a guard that handed out
/// mutable access is dropped or starts waiting itself.
#[derive(Debug)]
pub(crate) struct BucketGuard<'a> {
    cache: &'a Cache,
    guard: MutexGuard<'a, Bucket>,
    changed: &'a Condvar,
    dirty: bool,
}

impl BucketGuard<'_> {
    /// The entry for `oid`, if it is the one with `serial`.
    pub(crate) fn object(&self, oid: ObjectId, serial: u64) -> Option<&Entry<ObjectValue>> {
        self.guard
            .objects
            .get(&oid)
            .filter(|entry| entry.serial() == serial)
    }

    pub(crate) fn current_object(&self, oid: ObjectId) -> Option<&Entry<ObjectValue>> {
        self.guard.objects.get(&oid)
    }

    pub(crate) fn object_mut(&mut self, oid: ObjectId, serial: u64) -> Result<&mut Entry<ObjectValue>> {
        self.dirty = true;
        self.guard
            .objects
            .get_mut(&oid)
            .filter(|entry| entry.serial() == serial)
            .ok_or_else(|| Error::IllegalState(format!("object {oid} is no longer cached")))
    }

    pub(crate) fn binding(&self, key: &BindingKey, serial: u64) -> Option<&Entry<BindingData>> {
        self.guard
            .bindings
            .get(key)
            .filter(|entry| entry.serial() == serial)
    }

    pub(crate) fn current_binding(&self, key: &BindingKey) -> Option<&Entry<BindingData>> {
        self.guard.bindings.get(key)
    }

    pub(crate) fn binding_mut(
        &mut self,
        key: &BindingKey,
        serial: u64,
    ) -> Result<&mut Entry<BindingData>> {
        self.dirty = true;
        self.guard
            .bindings
            .get_mut(key)
            .filter(|entry| entry.serial() == serial)
            .ok_or_else(|| Error::IllegalState(format!("binding {key} is no longer cached")))
    }

    fn next_serial(&self) -> u64 {
        self.cache.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Adds an entry for `oid`, using space from `reservation`. Returns its serial.
    pub(crate) fn add_object(
        &mut self,
        oid: ObjectId,
        state: State,
        context_id: ContextId,
        value: ObjectValue,
        reservation: &mut Reservation,
    ) -> Result<u64> {
        if self.guard.objects.contains_key(&oid) {
            return Err(Error::IllegalState(format!("object {oid} is already cached")));
        }
        reservation.take_one()?;
        let serial = self.next_serial();
        self.guard
            .objects
            .insert(oid, Entry::new(serial, state, context_id, value));
        self.cache.objects.fetch_add(1, Ordering::Relaxed);
        self.dirty = true;
        Ok(serial)
    }

    pub(crate) fn add_binding(
        &mut self,
        key: BindingKey,
        state: State,
        context_id: ContextId,
        value: BindingData,
        reservation: &mut Reservation,
    ) -> Result<u64> {
        if self.guard.bindings.contains_key(&key) {
            return Err(Error::IllegalState(format!("binding {key} is already cached")));
        }
        reservation.take_one()?;
        let serial = self.next_serial();
        self.cache.index.write().insert(key.clone(), serial);
        self.guard
            .bindings
            .insert(key, Entry::new(serial, state, context_id, value));
        self.cache.bindings.fetch_add(1, Ordering::Relaxed);
        self.dirty = true;
        Ok(serial)
    }

    /// Removes a decached entry, giving back its space.
    pub(crate) fn remove_object(&mut self, oid: ObjectId, serial: u64) -> Result<()> {
        match self.guard.objects.get(&oid) {
            Some(entry) if entry.serial() == serial && entry.state().decached() => {}
            _ => {
                return Err(Error::IllegalState(format!(
                    "removing object {oid} that is cached or absent"
                )));
            }
        }
        self.guard.objects.remove(&oid);
        self.cache.objects.fetch_sub(1, Ordering::Relaxed);
        self.cache.reservations.release(1);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn remove_binding(&mut self, key: &BindingKey, serial: u64) -> Result<()> {
        match self.guard.bindings.get(key) {
            Some(entry) if entry.serial() == serial && entry.state().decached() => {}
            _ => {
                return Err(Error::IllegalState(format!(
                    "removing binding {key} that is cached or absent"
                )));
            }
        }
        self.guard.bindings.remove(key);
        self.cache.index.write().remove(key);
        self.cache.bindings.fetch_sub(1, Ordering::Relaxed);
        self.cache.reservations.release(1);
        self.dirty = true;
        Ok(())
    }

    fn state_of(&self, key: &DataKey, serial: u64) -> Option<State> {
        match key {
            DataKey::Object(oid) => self.object(*oid, serial).map(Entry::state),
            DataKey::Binding(key) => self.binding(key, serial).map(Entry::state),
        }
    }

    /// The entry currently cached for `key`.
    pub(crate) fn summary(&self, key: &DataKey) -> Option<Summary> {
        match key {
            DataKey::Object(oid) => self.current_object(*oid).map(|entry| Summary {
                serial: entry.serial(),
                state: entry.state(),
                context_id: entry.context_id(),
                pending_previous: false,
            }),
            DataKey::Binding(key) => self.current_binding(key).map(|entry| Summary {
                serial: entry.serial(),
                state: entry.state(),
                context_id: entry.context_id(),
                pending_previous: entry.pending_previous(),
            }),
        }
    }

    /// Moves the entry for `key` through `step`, returning the context id of the last
    /// transaction to use it.
    pub(crate) fn step(&mut self, key: &DataKey, serial: u64, step: Step) -> Result<ContextId> {
        match key {
            DataKey::Object(oid) => {
                let entry = self.object_mut(*oid, serial)?;
                entry.step(step)?;
                Ok(entry.context_id())
            }
            DataKey::Binding(key) => {
                let entry = self.binding_mut(key, serial)?;
                entry.step(step)?;
                Ok(entry.context_id())
            }
        }
    }

    pub(crate) fn remove(&mut self, key: &DataKey, serial: u64) -> Result<()> {
        match key {
            DataKey::Object(oid) => self.remove_object(*oid, serial),
            DataKey::Binding(key) => self.remove_binding(key, serial),
        }
    }

    /// Waits once for a change to the bucket, failing if the waiter is out of time or
    /// interrupted. Callers check the entry again afterwards.
    pub(crate) fn wait(&mut self, waiter: &Waiter<'_>, what: &dyn Display) -> Result<()> {
        waiter.check(what)?;
        if std::mem::take(&mut self.dirty) {
            self.changed.notify_all();
        }
        self.changed.wait_until(&mut self.guard, waiter.deadline);
        waiter.check_interrupted(what)
    }

    /// Waits for the entry to become readable. Returns `false` if it leaves the cache
    /// instead.
    pub(crate) fn await_readable(
        &mut self,
        key: &DataKey,
        serial: u64,
        waiter: &Waiter<'_>,
    ) -> Result<bool> {
        loop {
            match self.state_of(key, serial) {
                Some(state) if state.readable() => return Ok(true),
                Some(state) if state.reading() || state.decaching() => self.wait(waiter, key)?,
                _ => return Ok(false),
            }
        }
    }

    pub(crate) fn await_writable(
        &mut self,
        key: &DataKey,
        serial: u64,
        waiter: &Waiter<'_>,
    ) -> Result<AwaitWritable> {
        loop {
            match self.state_of(key, serial) {
                None => return Ok(AwaitWritable::Decached),
                Some(state) if state.writable() => return Ok(AwaitWritable::Writable),
                Some(State::CachedRead) => return Ok(AwaitWritable::Readable),
                Some(state)
                    if state.upgrading()
                        || state.downgrading()
                        || state.reading()
                        || state.decaching() =>
                {
                    self.wait(waiter, key)?
                }
                Some(_) => return Ok(AwaitWritable::Decached),
            }
        }
    }

    /// Waits until no operation is using the binding entry as the next entry of an
    /// earlier name. Returns `false` if the entry leaves the cache.
    pub(crate) fn await_not_pending_previous(
        &mut self,
        key: &BindingKey,
        serial: u64,
        waiter: &Waiter<'_>,
    ) -> Result<bool> {
        let what = DataKey::Binding(key.clone());
        loop {
            match self.binding(key, serial) {
                None => return Ok(false),
                Some(entry) if !entry.pending_previous() => return Ok(true),
                Some(_) => self.wait(waiter, &what)?,
            }
        }
    }

    /// Waits until the entry is not being fetched, upgraded or downgraded. Returns its
    /// state then, or `None` if it left the cache.
    pub(crate) fn await_settled(
        &mut self,
        key: &DataKey,
        serial: u64,
        waiter: &Waiter<'_>,
    ) -> Result<Option<State>> {
        loop {
            match self.state_of(key, serial) {
                Some(state) if state.reading() || state.upgrading() || state.downgrading() => {
                    self.wait(waiter, key)?
                }
                state => return Ok(state.filter(|state| !state.decached())),
            }
        }
    }

    /// Like [`Self::await_settled`], but also waits for an entry being evicted to leave
    /// the cache.
    pub(crate) fn await_stable(
        &mut self,
        key: &DataKey,
        serial: u64,
        waiter: &Waiter<'_>,
    ) -> Result<Option<State>> {
        loop {
            match self.state_of(key, serial) {
                Some(state)
                    if state.reading()
                        || state.upgrading()
                        || state.downgrading()
                        || state.decaching() =>
                {
                    self.wait(waiter, key)?
                }
                state => return Ok(state.filter(|state| !state.decached())),
            }
        }
    }
}

impl Drop for BucketGuard<'_> {
    fn drop(&mut self) {
        if self.dirty {
            self.changed.notify_all();
        }
    }
}
