//! Name binding operations, built on next-key information.
//!
//! A name that has a cache entry is answered from it. Otherwise the answer comes from
//! the next cached entry, the one with the lowest key above the name, whose previous
//! key may show that the name is unbound. When it does not, the operation marks that
//! entry pending previous, which keeps other operations from using it as an anchor,
//! asks the server on a fetch thread, and looks again once the answer is cached. A
//! LAST entry stands in for the next entry when no higher name is cached.
//!
//! Binding a name changes what its next entry knows, so the next entry must be
//! writable and its access lock held for write first. Removing a name needs both the
//! name and the name after it writable.

use crate::{
    CheckBindings,
    cache::{AwaitWritable, BucketGuard, Cache, MAX_RETRIES, Waiter},
    entry::{BindingData, BindingState, Entry, State},
    reserve::Reservation,
    store::StoreInner,
    txn::{SavedBinding, Transaction, TxnShared},
};
use cachestore_api::{DataKey, Error, Result};
use cachestore_id::{BindingKey, ContextId, ObjectId};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What a binding operation found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingValue {
    /// Whether the name was bound.
    pub found: bool,
    /// The object the name was bound to.
    pub oid: Option<ObjectId>,
    /// The first bound name after the requested one, `None` if there is none. Only
    /// given when the name was not bound, or was removed.
    pub next_name: Option<String>,
}

impl BindingValue {
    fn bound(oid: Option<ObjectId>) -> Self {
        Self {
            found: true,
            oid,
            next_name: None,
        }
    }

    fn unbound(next: &BindingKey) -> Self {
        Self {
            found: false,
            oid: None,
            next_name: next.name().map(str::to_string),
        }
    }
}

/// The server call that answers a question the cache could not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    Get,
    /// Also obtains write access to the name, or to the next name if it is unbound.
    ForUpdate,
    /// Also obtains write access to the name and the next name, if the name is bound.
    ForRemove,
    NextBound,
}

/// Where the search for a name ended.
enum Located<'a> {
    /// The name's own entry.
    Name(BucketGuard<'a>, u64, Reservation),
    /// The next entry, which knows the name is unbound.
    Unbound(BucketGuard<'a>, BindingKey, u64, Reservation),
    /// Things changed, or the server is being asked: look again.
    Retry,
}

/// Whether an entry is writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Writable {
    Yes,
    /// The entry changed or left the cache.
    Retry,
    /// The entry is readable and now pending previous, for the caller to upgrade.
    Upgrade,
}

impl Transaction {
    pub fn get_binding(&mut self, name: &str) -> Result<BindingValue> {
        self.operation("get_binding", |txn| {
            let name = BindingKey::new(name);
            txn.lock_access(DataKey::Binding(name.clone()), false)?;
            let value = txn.get_binding_locked(&name)?;
            txn.store.maybe_check_bindings(CheckBindings::Operation)?;
            Ok(value)
        })
    }

    /// Binds `name` to `oid`. The result tells whether the name was bound before, and
    /// to what.
    pub fn set_binding(&mut self, name: &str, oid: ObjectId) -> Result<BindingValue> {
        self.operation("set_binding", |txn| {
            let name = BindingKey::new(name);
            txn.lock_access(DataKey::Binding(name.clone()), true)?;
            let value = txn.set_binding_locked(&name, oid)?;
            txn.store.maybe_check_bindings(CheckBindings::Operation)?;
            Ok(value)
        })
    }

    pub fn remove_binding(&mut self, name: &str) -> Result<BindingValue> {
        self.operation("remove_binding", |txn| {
            let name = BindingKey::new(name);
            txn.lock_access(DataKey::Binding(name.clone()), true)?;
            let value = txn.remove_binding_locked(&name)?;
            txn.store.maybe_check_bindings(CheckBindings::Operation)?;
            Ok(value)
        })
    }

    /// Returns the first bound name after `name`, or the first of all if `name` is
    /// `None`.
    pub fn next_bound_name(&mut self, name: Option<&str>) -> Result<Option<String>> {
        self.operation("next_bound_name", |txn| {
            let name = name.map_or(BindingKey::FIRST, BindingKey::new);
            let next = txn.next_bound_name_locked(&name)?;
            txn.store.maybe_check_bindings(CheckBindings::Operation)?;
            Ok(next)
        })
    }

    fn get_binding_locked(&mut self, name: &BindingKey) -> Result<BindingValue> {
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        let context_id = self.context_id;
        for _ in 0..MAX_RETRIES {
            shared.check()?;
            let waiter = self.waiter(&shared);
            match self.locate(&store, name, Lookup::Get, 2, &waiter)? {
                Located::Retry => {}
                Located::Name(mut bucket, serial, _) => {
                    let key = DataKey::Binding(name.clone());
                    if bucket.await_readable(&key, serial, &waiter)? {
                        let entry = bucket.binding_mut(name, serial)?;
                        entry.note_access(context_id);
                        return Ok(BindingValue::bound(entry.value.oid));
                    }
                }
                Located::Unbound(mut bucket, next, serial, _) => {
                    bucket.binding_mut(&next, serial)?.note_access(context_id);
                    return Ok(BindingValue::unbound(&next));
                }
            }
        }
        Err(too_many_retries(name))
    }

    fn set_binding_locked(&mut self, name: &BindingKey, oid: ObjectId) -> Result<BindingValue> {
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        for _ in 0..MAX_RETRIES {
            shared.check()?;
            let waiter = self.waiter(&shared);
            match self.locate(&store, name, Lookup::ForUpdate, 2, &waiter)? {
                Located::Retry => {}
                Located::Name(mut bucket, serial, _) => {
                    match make_writable(&mut bucket, name, serial, None, &waiter)? {
                        Writable::Retry => {}
                        Writable::Upgrade => {
                            drop(bucket);
                            self.submit_upgrade(name, serial)?;
                        }
                        Writable::Yes => {
                            let entry = bucket.binding_mut(name, serial)?;
                            let saved = saved_binding(entry);
                            let previous = entry.value.oid.replace(oid);
                            if !entry.state().modified() {
                                entry.set_cached_dirty()?;
                            }
                            entry.note_access(self.context_id);
                            drop(bucket);
                            self.save_binding(name, || saved);
                            trace!(context_id = %self.context_id, %name, %oid, "rebound name");
                            return Ok(BindingValue::bound(previous));
                        }
                    }
                }
                Located::Unbound(mut bucket, next, serial, reservation) => {
                    match make_writable(&mut bucket, &next, serial, Some(name), &waiter)? {
                        Writable::Retry => {}
                        Writable::Upgrade => {
                            drop(bucket);
                            self.submit_lookup(Lookup::ForUpdate, name, next, serial, reservation)?;
                        }
                        Writable::Yes => {
                            drop(bucket);
                            drop(reservation);
                            if let Some(value) = self.bind_unbound(&store, name, &next, oid, &waiter)? {
                                return Ok(value);
                            }
                        }
                    }
                }
            }
        }
        Err(too_many_retries(name))
    }

    /// Binds a name known to be unbound, whose next entry was writable.
    fn bind_unbound(
        &mut self,
        store: &StoreInner,
        name: &BindingKey,
        next: &BindingKey,
        oid: ObjectId,
        waiter: &Waiter<'_>,
    ) -> Result<Option<BindingValue>> {
        self.lock_access(DataKey::Binding(next.clone()), true)?;
        let mut reservation = store.cache.reservations().reserve(1, Some(self.deadline()))?;
        let mut bucket = store.cache.lock_binding(next);
        let Some(serial) = bucket.current_binding(next).map(|entry| entry.serial()) else {
            return Ok(None);
        };
        if !assure_next_entry(&store.cache, &mut bucket, next, serial, name, true, waiter)? {
            return Ok(None);
        }
        let entry = bucket.binding_mut(next, serial)?;
        if !entry.state().writable() || !entry.known_unbound(next, name) {
            return Ok(None);
        }
        entry.set_pending_previous()?;
        let previous_key = entry.previous_key().filter(|previous_key| *previous_key < name).cloned();
        let previous_key_unbound = previous_key.is_some() && entry.previous_key_unbound();
        drop(bucket);

        let added = (|| {
            let mut bucket = store.cache.lock_binding(name);
            if bucket.current_binding(name).is_some() {
                return Err(Error::IllegalState(format!(
                    "binding {name} is cached although known to be unbound"
                )));
            }
            bucket.add_binding(
                name.clone(),
                State::CachedDirty,
                self.context_id,
                BindingData::with_previous_key(Some(oid), previous_key, previous_key_unbound),
                &mut reservation,
            )
        })();

        let mut bucket = store.cache.lock_binding(next);
        let entry = bucket.binding_mut(next, serial)?;
        entry.set_not_pending_previous()?;
        added?;
        let saved = saved_binding(entry);
        if !entry.state().modified() {
            entry.set_cached_dirty()?;
        }
        entry.update_previous_key(next, name, BindingState::Bound);
        entry.note_access(self.context_id);
        drop(bucket);

        self.save_binding(name, || SavedBinding {
            oid: None,
            previous_key: None,
            previous_key_unbound: false,
            created: true,
        });
        self.save_binding(next, || saved);
        trace!(context_id = %self.context_id, %name, %oid, %next, "bound name");
        Ok(Some(BindingValue::unbound(next)))
    }

    fn remove_binding_locked(&mut self, name: &BindingKey) -> Result<BindingValue> {
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        let context_id = self.context_id;
        for _ in 0..MAX_RETRIES {
            shared.check()?;
            let waiter = self.waiter(&shared);
            match self.locate(&store, name, Lookup::ForRemove, 3, &waiter)? {
                Located::Retry => {}
                Located::Unbound(mut bucket, next, serial, _) => {
                    bucket.binding_mut(&next, serial)?.note_access(context_id);
                    return Ok(BindingValue::unbound(&next));
                }
                Located::Name(mut bucket, serial, reservation) => {
                    let key = DataKey::Binding(name.clone());
                    let name_writable = match bucket.await_writable(&key, serial, &waiter)? {
                        AwaitWritable::Decached => continue,
                        AwaitWritable::Writable => true,
                        AwaitWritable::Readable => {
                            if !bucket.await_not_pending_previous(name, serial, &waiter)? {
                                continue;
                            }
                            match bucket.binding(name, serial).map(|entry| entry.state()) {
                                Some(state) if state.readable() => state.writable(),
                                _ => continue,
                            }
                        }
                    };
                    bucket.binding_mut(name, serial)?.note_access(context_id);
                    drop(bucket);
                    if let Some(value) =
                        self.remove_bound_name(&store, name, name_writable, reservation, &waiter)?
                    {
                        return Ok(value);
                    }
                }
            }
        }
        Err(too_many_retries(name))
    }

    /// Removes a name whose entry is cached, once the entry after it is writable too.
    fn remove_bound_name(
        &mut self,
        store: &StoreInner,
        name: &BindingKey,
        name_writable: bool,
        reservation: Reservation,
        waiter: &Waiter<'_>,
    ) -> Result<Option<BindingValue>> {
        let next = store
            .cache
            .higher_binding(name)
            .map_or(BindingKey::LAST, |(key, _)| key);
        self.lock_access(DataKey::Binding(next.clone()), false)?;
        let mut bucket = store.cache.lock_binding(&next);
        let current = bucket.current_binding(&next).map(|entry| entry.serial());
        let Some(serial) = current else {
            if next.is_last() {
                self.start_lookup(bucket, Lookup::ForRemove, name, next, None, reservation)?;
            }
            return Ok(None);
        };
        let ready = name_writable
            && bucket
                .binding(&next, serial)
                .is_some_and(|entry| entry.is_next_entry(&next, name) && entry.state().writable());
        if !ready {
            if assure_next_entry(&store.cache, &mut bucket, &next, serial, name, false, waiter)? {
                self.start_lookup(bucket, Lookup::ForRemove, name, next, Some(serial), reservation)?;
            }
            return Ok(None);
        }
        drop(bucket);
        drop(reservation);

        self.lock_access(DataKey::Binding(next.clone()), true)?;
        let mut bucket = store.cache.lock_binding(&next);
        if bucket.current_binding(&next).map(|entry| entry.serial()) != Some(serial)
            || !assure_next_entry(&store.cache, &mut bucket, &next, serial, name, false, waiter)?
        {
            return Ok(None);
        }
        let entry = bucket.binding_mut(&next, serial)?;
        if !entry.state().writable() || !entry.is_next_entry(&next, name) {
            return Ok(None);
        }
        entry.set_pending_previous()?;
        drop(bucket);

        let removed = (|| -> Result<Option<SavedBinding>> {
            let mut bucket = store.cache.lock_binding(name);
            let Some(name_serial) = bucket.current_binding(name).map(|entry| entry.serial()) else {
                return Ok(None);
            };
            if !bucket.await_not_pending_previous(name, name_serial, waiter)? {
                return Ok(None);
            }
            let entry = bucket.binding_mut(name, name_serial)?;
            if !entry.state().writable() {
                return Ok(None);
            }
            let saved = saved_binding(entry);
            if entry.state().modified() {
                entry.set_not_modified()?;
            }
            entry.set_evicted_immediate()?;
            bucket.remove_binding(name, name_serial)?;
            Ok(Some(saved))
        })();

        let mut bucket = store.cache.lock_binding(&next);
        let entry = bucket.binding_mut(&next, serial)?;
        entry.set_not_pending_previous()?;
        let Some(removed) = removed? else {
            return Ok(None);
        };
        let saved = saved_binding(entry);
        if !entry.state().modified() {
            entry.set_cached_dirty()?;
        }
        // The removed name's range joins the next entry's
        match &removed.previous_key {
            None => entry.update_previous_key(&next, name, BindingState::Unbound),
            Some(previous_key) => {
                let state = if removed.previous_key_unbound {
                    BindingState::Unbound
                } else {
                    BindingState::Unknown
                };
                entry.update_previous_key(&next, previous_key, state)
            }
        };
        entry.note_access(self.context_id);
        drop(bucket);

        let oid = removed.oid;
        self.save_binding(name, || removed);
        self.save_binding(&next, || saved);
        trace!(context_id = %self.context_id, %name, %next, "removed name");
        Ok(Some(BindingValue {
            found: true,
            oid,
            next_name: next.name().map(str::to_string),
        }))
    }

    fn next_bound_name_locked(&mut self, name: &BindingKey) -> Result<Option<String>> {
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        for _ in 0..MAX_RETRIES {
            shared.check()?;
            let waiter = self.waiter(&shared);
            let next = store
                .cache
                .higher_binding(name)
                .map_or(BindingKey::LAST, |(key, _)| key);
            self.lock_access(DataKey::Binding(next.clone()), false)?;
            let reservation = store.cache.reservations().reserve(2, Some(self.deadline()))?;
            let mut bucket = store.cache.lock_binding(&next);
            let current = bucket.current_binding(&next).map(|entry| entry.serial());
            let Some(serial) = current else {
                if next.is_last() {
                    self.start_lookup(bucket, Lookup::NextBound, name, next, None, reservation)?;
                }
                continue;
            };
            if !assure_next_entry(&store.cache, &mut bucket, &next, serial, name, false, &waiter)? {
                continue;
            }
            let entry = bucket.binding_mut(&next, serial)?;
            if entry.is_next_entry(&next, name) {
                entry.note_access(self.context_id);
                return Ok(next.name().map(str::to_string));
            }
            self.start_lookup(bucket, Lookup::NextBound, name, next, Some(serial), reservation)?;
        }
        Err(too_many_retries(name))
    }

    /// Finds the entry for `name`, or the next entry if it knows that `name` is unbound.
    /// Otherwise starts `lookup` and asks the caller to retry. The access lock is taken
    /// on the entry found before it is looked at.
    fn locate<'a>(
        &mut self,
        store: &'a StoreInner,
        name: &BindingKey,
        lookup: Lookup,
        reserve: usize,
        waiter: &Waiter<'_>,
    ) -> Result<Located<'a>> {
        let key = store
            .cache
            .ceiling_binding(name)
            .map_or(BindingKey::LAST, |(key, _)| key);
        self.lock_access(DataKey::Binding(key.clone()), false)?;
        let reservation = store.cache.reservations().reserve(reserve, Some(self.deadline()))?;
        let mut bucket = store.cache.lock_binding(&key);
        let current = bucket.current_binding(&key).map(|entry| entry.serial());
        let Some(serial) = current else {
            if key.is_last() {
                self.start_lookup(bucket, lookup, name, key, None, reservation)?;
            }
            return Ok(Located::Retry);
        };
        if key == *name {
            return Ok(Located::Name(bucket, serial, reservation));
        }
        if !assure_next_entry(&store.cache, &mut bucket, &key, serial, name, true, waiter)? {
            return Ok(Located::Retry);
        }
        if bucket
            .binding(&key, serial)
            .is_some_and(|entry| entry.known_unbound(&key, name))
        {
            return Ok(Located::Unbound(bucket, key, serial, reservation));
        }
        self.start_lookup(bucket, lookup, name, key, Some(serial), reservation)?;
        Ok(Located::Retry)
    }

    /// Marks the next entry pending previous, or adds a LAST entry for that if `serial`
    /// is `None`, and asks the server.
    fn start_lookup(
        &self,
        mut bucket: BucketGuard<'_>,
        lookup: Lookup,
        name: &BindingKey,
        next: BindingKey,
        serial: Option<u64>,
        mut reservation: Reservation,
    ) -> Result<()> {
        let serial = match serial {
            Some(serial) => {
                bucket.binding_mut(&next, serial)?.set_pending_previous()?;
                serial
            }
            None => {
                let serial = bucket.add_binding(
                    BindingKey::LAST,
                    State::FetchingRead,
                    self.context_id,
                    BindingData::new(None),
                    &mut reservation,
                )?;
                bucket.binding_mut(&next, serial)?.set_pending_previous()?;
                serial
            }
        };
        drop(bucket);
        self.submit_lookup(lookup, name, next, serial, reservation)
    }

    fn submit_lookup(
        &self,
        lookup: Lookup,
        name: &BindingKey,
        next: BindingKey,
        serial: u64,
        reservation: Reservation,
    ) -> Result<()> {
        trace!(context_id = %self.context_id, ?lookup, %name, %next, "asking server");
        let job = LookupJob {
            store: Arc::clone(&self.store),
            shared: Arc::clone(&self.shared),
            context_id: self.context_id,
            lookup,
            name: name.clone(),
            next: next.clone(),
            serial,
            reservation,
        };
        if let Err(e) = self.store.fetch_pool.execute(move || job.run()) {
            abandon_lookup(&self.store, &next, serial);
            return Err(e);
        }
        Ok(())
    }

    /// Asks the server for write access to a name whose entry is readable and pending
    /// previous.
    fn submit_upgrade(&self, name: &BindingKey, serial: u64) -> Result<()> {
        let store = Arc::clone(&self.store);
        let shared = Arc::clone(&self.shared);
        let context_id = self.context_id;
        let name = name.clone();
        let job_name = name.clone();
        let submitted = self.store.fetch_pool.execute(move || {
            if let Err(e) = upgrade_name(&store, context_id, &job_name, serial) {
                debug!(%job_name, %e, "binding upgrade failed");
                store.report_if_fatal(&e);
                shared.fail(e);
                abandon_lookup(&store, &job_name, serial);
            }
        });
        if let Err(e) = submitted {
            abandon_lookup(&self.store, &name, serial);
            return Err(e);
        }
        Ok(())
    }
}

/// Checks that the entry is the first cached after `name`, or at `name` if
/// `include_equal`, once no other operation is using it, and waits for it to be
/// readable and settled. Returns `false` if the caller must look again.
fn assure_next_entry(
    cache: &Cache,
    bucket: &mut BucketGuard<'_>,
    key: &BindingKey,
    serial: u64,
    name: &BindingKey,
    include_equal: bool,
    waiter: &Waiter<'_>,
) -> Result<bool> {
    let data_key = DataKey::Binding(key.clone());
    for _ in 0..MAX_RETRIES {
        if !bucket.await_not_pending_previous(key, serial, waiter)? {
            return Ok(false);
        }
        let check = if include_equal {
            cache.ceiling_binding(name)
        } else {
            cache.higher_binding(name)
        };
        if check.as_ref().is_none_or(|(check_key, check_serial)| {
            check_key != key || *check_serial != serial
        }) {
            return Ok(false);
        }
        match bucket.await_settled(&data_key, serial, waiter)? {
            None => return Ok(false),
            Some(state) if !state.readable() => {
                // Being evicted
                if !bucket.await_readable(&data_key, serial, waiter)? {
                    return Ok(false);
                }
            }
            Some(_) => {}
        }
        if bucket
            .binding(key, serial)
            .is_some_and(|entry| !entry.pending_previous())
        {
            return Ok(true);
        }
    }
    Err(too_many_retries(name))
}

/// Waits for a binding entry to be writable. With `unbound`, the entry is the next
/// entry for that name and must still know it is unbound.
fn make_writable(
    bucket: &mut BucketGuard<'_>,
    key: &BindingKey,
    serial: u64,
    unbound: Option<&BindingKey>,
    waiter: &Waiter<'_>,
) -> Result<Writable> {
    let data_key = DataKey::Binding(key.clone());
    match bucket.await_writable(&data_key, serial, waiter)? {
        AwaitWritable::Writable => return Ok(Writable::Yes),
        AwaitWritable::Decached => return Ok(Writable::Retry),
        AwaitWritable::Readable => {}
    }
    if !bucket.await_not_pending_previous(key, serial, waiter)? {
        return Ok(Writable::Retry);
    }
    let Some(entry) = bucket.binding(key, serial) else {
        return Ok(Writable::Retry);
    };
    if unbound.is_some_and(|name| !entry.known_unbound(key, name)) {
        return Ok(Writable::Retry);
    }
    match entry.state() {
        state if state.writable() => Ok(Writable::Yes),
        State::CachedRead => {
            bucket.binding_mut(key, serial)?.set_pending_previous()?;
            Ok(Writable::Upgrade)
        }
        _ => Ok(Writable::Retry),
    }
}

fn saved_binding(entry: &Entry<BindingData>) -> SavedBinding {
    SavedBinding {
        oid: entry.value.oid,
        previous_key: entry.previous_key().cloned(),
        previous_key_unbound: entry.previous_key_unbound(),
        created: false,
    }
}

fn too_many_retries(name: &BindingKey) -> Error {
    Error::ResourceExhausted(format!("too many retries for binding {name}"))
}

/// Undoes what an operation did before asking the server, after the request failed.
fn abandon_lookup(store: &StoreInner, key: &BindingKey, serial: u64) {
    let abandon = || -> Result<()> {
        let mut bucket = store.cache.lock_binding(key);
        let Some(entry) = bucket.binding(key, serial) else {
            return Ok(());
        };
        let (pending, reading) = (entry.pending_previous(), entry.state().reading());
        let entry = bucket.binding_mut(key, serial)?;
        if pending {
            entry.set_not_pending_previous()?;
        }
        if reading {
            entry.set_evicted_abandon_fetching()?;
            bucket.remove_binding(key, serial)?;
        }
        Ok(())
    };
    if let Err(e) = abandon() {
        warn!(%key, %e, "cannot abandon binding lookup");
        store.report_if_fatal(&e);
    }
}

/// Upgrades a readable name entry that is pending previous.
fn upgrade_name(store: &Arc<StoreInner>, context_id: ContextId, name: &BindingKey, serial: u64) -> Result<()> {
    let Some(name_str) = name.name() else {
        return Err(Error::IllegalState(format!("cannot upgrade binding {name}")));
    };
    let node_id = store.node_id;
    let results = store.config.retry.run("get_binding_for_update", || {
        store.server.get_binding_for_update(node_id, name_str)
    })?;
    if !results.found {
        return Err(Error::CacheConsistency(format!(
            "cached binding {name} is not bound on the server"
        )));
    }
    {
        let mut bucket = store.cache.lock_binding(name);
        let entry = bucket.binding_mut(name, serial)?;
        if entry.state() == State::CachedRead {
            entry.set_upgraded_immediate()?;
        }
        entry.note_access(context_id);
        entry.set_not_pending_previous()?;
    }
    store.follow_up(
        DataKey::Binding(name.clone()),
        results.callback_evict,
        results.callback_downgrade,
    );
    Ok(())
}

/// The server's answer to a lookup, in the terms the cache records.
#[derive(Debug)]
struct Answer {
    name_state: BindingState,
    name_oid: Option<ObjectId>,
    name_for_write: bool,
    /// The first bound name after the requested one and its object, if the server said.
    server_next: Option<(BindingKey, Option<ObjectId>)>,
    next_for_write: bool,
    /// Evictions and downgrades the server asked for.
    follow_ups: Vec<(BindingKey, bool, bool)>,
}

/// A lookup running on a fetch thread. The next entry is pending previous until it
/// finishes, and LAST is also fetching if it was added for the lookup.
#[derive(Debug)]
struct LookupJob {
    store: Arc<StoreInner>,
    shared: Arc<TxnShared>,
    context_id: ContextId,
    lookup: Lookup,
    name: BindingKey,
    next: BindingKey,
    serial: u64,
    /// Space for the entries the answer may add.
    reservation: Reservation,
}

impl LookupJob {
    fn run(mut self) {
        let result = self.ask().and_then(|answer| self.record(answer));
        if let Err(e) = result {
            debug!(name = %self.name, lookup = ?self.lookup, %e, "binding lookup failed");
            self.store.report_if_fatal(&e);
            self.shared.fail(e);
            abandon_lookup(&self.store, &self.next, self.serial);
        }
    }

    fn ask(&self) -> Result<Answer> {
        let store = &self.store;
        let server = &store.server;
        let node_id = store.node_id;
        let retry = store.config.retry;
        let name = self.name.name();
        let real_name = || {
            name.ok_or_else(|| Error::IllegalState(format!("cannot look up binding {}", self.name)))
        };
        let state = |found| {
            if found {
                BindingState::Bound
            } else {
                BindingState::Unbound
            }
        };
        let answer = match self.lookup {
            Lookup::Get => {
                let name = real_name()?;
                let results = retry.run("get_binding", || server.get_binding(node_id, name))?;
                let server_next = results.next_key.filter(|_| !results.found);
                let evict_key = server_next.clone().unwrap_or_else(|| self.name.clone());
                Answer {
                    name_state: state(results.found),
                    name_oid: results.oid.filter(|_| results.found),
                    name_for_write: false,
                    server_next: server_next.map(|key| (key, results.oid)),
                    next_for_write: false,
                    follow_ups: vec![(evict_key, results.callback_evict, false)],
                }
            }
            Lookup::ForUpdate => {
                let name = real_name()?;
                let results = retry.run("get_binding_for_update", || {
                    server.get_binding_for_update(node_id, name)
                })?;
                let server_next = results.next_key.filter(|_| !results.found);
                let evict_key = server_next.clone().unwrap_or_else(|| self.name.clone());
                Answer {
                    name_state: state(results.found),
                    name_oid: results.oid.filter(|_| results.found),
                    name_for_write: true,
                    server_next: server_next.map(|key| (key, results.oid)),
                    next_for_write: true,
                    follow_ups: vec![(
                        evict_key,
                        results.callback_evict,
                        results.callback_downgrade,
                    )],
                }
            }
            Lookup::ForRemove => {
                let name = real_name()?;
                let results = retry.run("get_binding_for_remove", || {
                    server.get_binding_for_remove(node_id, name)
                })?;
                Answer {
                    name_state: state(results.found),
                    name_oid: results.oid,
                    name_for_write: true,
                    server_next: Some((results.next_key.clone(), results.next_oid)),
                    next_for_write: results.found,
                    follow_ups: vec![
                        (
                            self.name.clone(),
                            results.callback_evict,
                            results.callback_downgrade,
                        ),
                        (
                            results.next_key,
                            results.next_callback_evict,
                            results.next_callback_downgrade,
                        ),
                    ],
                }
            }
            Lookup::NextBound => {
                let results =
                    retry.run("next_bound_name", || server.next_bound_name(node_id, name))?;
                Answer {
                    name_state: BindingState::Unknown,
                    name_oid: None,
                    name_for_write: false,
                    server_next: Some((results.next_key.clone(), results.oid)),
                    next_for_write: false,
                    follow_ups: vec![(results.next_key, results.callback_evict, false)],
                }
            }
        };
        trace!(name = %self.name, lookup = ?self.lookup, ?answer, "server answered");
        Ok(answer)
    }

    fn record(&mut self, answer: Answer) -> Result<()> {
        self.record_name(&answer)?;
        self.record_server_next(&answer)?;
        self.record_cached_next(&answer)?;
        for (key, evict, downgrade) in answer.follow_ups {
            self.store.follow_up(DataKey::Binding(key), evict, downgrade);
        }
        Ok(())
    }

    /// Caches a name the server found bound.
    fn record_name(&mut self, answer: &Answer) -> Result<()> {
        if answer.name_state != BindingState::Bound {
            return Ok(());
        }
        let mut bucket = self.store.cache.lock_binding(&self.name);
        match bucket.current_binding(&self.name).map(|entry| entry.serial()) {
            None => {
                let state = if answer.name_for_write {
                    State::CachedWrite
                } else {
                    State::CachedRead
                };
                bucket.add_binding(
                    self.name.clone(),
                    state,
                    self.context_id,
                    BindingData::new(answer.name_oid),
                    &mut self.reservation,
                )?;
            }
            Some(serial) => {
                let entry = bucket.binding_mut(&self.name, serial)?;
                entry.note_access(self.context_id);
                if answer.name_for_write && entry.state() == State::CachedRead {
                    entry.set_upgraded_immediate()?;
                }
            }
        }
        Ok(())
    }

    /// Caches the server's next name if it comes before the cached next entry, unless
    /// this node already knows it is unbound because a local transaction removed it.
    fn record_server_next(&mut self, answer: &Answer) -> Result<()> {
        let Some((server_next, oid)) = &answer.server_next else {
            return Ok(());
        };
        if *server_next >= self.next {
            return Ok(());
        }
        {
            let bucket = self.store.cache.lock_binding(&self.next);
            if bucket
                .binding(&self.next, self.serial)
                .is_some_and(|entry| entry.known_unbound(&self.next, server_next))
            {
                return Ok(());
            }
        }
        let mut bucket = self.store.cache.lock_binding(server_next);
        match bucket.current_binding(server_next).map(|entry| entry.serial()) {
            None => {
                let state = if answer.next_for_write {
                    State::CachedWrite
                } else {
                    State::CachedRead
                };
                let serial = bucket.add_binding(
                    server_next.clone(),
                    state,
                    self.context_id,
                    BindingData::new(*oid),
                    &mut self.reservation,
                )?;
                bucket
                    .binding_mut(server_next, serial)?
                    .update_previous_key(server_next, &self.name, answer.name_state);
            }
            Some(serial) => {
                let entry = bucket.binding_mut(server_next, serial)?;
                entry.note_access(self.context_id);
                if answer.next_for_write && entry.state() == State::CachedRead {
                    entry.set_upgraded_immediate()?;
                }
            }
        }
        Ok(())
    }

    /// Records what the answer says about the names before the cached next entry, and
    /// lets other operations use it again.
    fn record_cached_next(&mut self, answer: &Answer) -> Result<()> {
        let mut bucket = self.store.cache.lock_binding(&self.next);
        let next = &self.next;
        let entry = bucket.binding_mut(next, self.serial)?;
        let reached = answer
            .server_next
            .as_ref()
            .is_some_and(|(server_next, _)| server_next >= next);
        let covers = reached
            || answer
                .server_next
                .as_ref()
                .is_some_and(|(server_next, _)| entry.known_unbound(next, server_next));
        if covers {
            entry.update_previous_key(next, &self.name, answer.name_state);
        }
        entry.set_not_pending_previous()?;
        if reached {
            entry.note_access(self.context_id);
            if entry.state().reading() {
                entry.set_cached_read()?;
            }
            if answer.next_for_write && entry.state() == State::CachedRead {
                entry.set_upgraded_immediate()?;
            }
        } else if entry.state().reading() {
            // A LAST entry added for the lookup, now that a lower name is cached
            entry.set_evicted_abandon_fetching()?;
            bucket.remove_binding(next, self.serial)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn binding_values() {
        let oid = ObjectId::new(3).unwrap();
        assert_eq!(
            BindingValue::bound(Some(oid)),
            BindingValue {
                found: true,
                oid: Some(oid),
                next_name: None,
            }
        );
        assert_eq!(
            BindingValue::unbound(&BindingKey::new("bob")),
            BindingValue {
                found: false,
                oid: None,
                next_name: Some("bob".to_string()),
            }
        );
        assert_eq!(BindingValue::unbound(&BindingKey::LAST).next_name, None);
    }

    #[test]
    fn saved_bindings_keep_previous_keys() {
        let oid = ObjectId::new(5).unwrap();
        let entry = Entry::new(
            1,
            State::CachedWrite,
            ContextId::NONE,
            BindingData::with_previous_key(Some(oid), Some(BindingKey::new("a")), true),
        );
        let saved = saved_binding(&entry);
        assert_eq!(saved.oid, Some(oid));
        assert_eq!(saved.previous_key, Some(BindingKey::new("a")));
        assert!(saved.previous_key_unbound);
        assert!(!saved.created);
    }
}
