//! Transactions: the context an operation runs in, commit, and rollback.
//!
//! A transaction takes local access locks on everything it touches and keeps them until
//! it finishes. Entries it modifies stay `CachedDirty` until then, which keeps them in
//! the cache, and the values they had before are saved so that abort can put them back.

use crate::{
    CheckBindings,
    cache::Waiter,
    entry::{BindingData, ObjectValue, State},
    store::StoreInner,
};
use bytes::Bytes;
use cachestore_api::{CommitRequest, DataKey, Error, ErrorCategory, Result};
use cachestore_id::{BindingKey, ClassId, ContextId, ObjectId};
use cachestore_lock::Locker;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};
use tracing::{debug, trace, warn};

pub(crate) type TxnLocker = Locker<DataKey, ContextId>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Prepared,
    Finished,
}

/// What a transaction shares with the jobs it starts and with its interrupter.
#[derive(Debug, Default)]
pub(crate) struct TxnShared {
    pub(crate) interrupted: AtomicBool,
    failure: Mutex<Option<Error>>,
}

impl TxnShared {
    /// Records the failure of a job started for the transaction.
    pub(crate) fn fail(&self, e: Error) {
        self.failure.lock().get_or_insert(e);
    }

    pub(crate) fn check(&self) -> Result<()> {
        match self.failure.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// How to undo a change to an object.
#[derive(Debug)]
pub(crate) struct SavedObject {
    pub(crate) oid: ObjectId,
    pub(crate) restore: ObjectValue,
    /// Created by the transaction, so abort drops it.
    pub(crate) created: bool,
}

/// How to undo changes to a binding entry, its previous-key information included.
#[derive(Debug, Clone)]
pub(crate) struct SavedBinding {
    pub(crate) oid: Option<ObjectId>,
    pub(crate) previous_key: Option<BindingKey>,
    pub(crate) previous_key_unbound: bool,
    pub(crate) created: bool,
}

/// A transaction on a [`CachingStore`](crate::CachingStore).
///
/// Operations fail with errors whose [`ErrorCategory`] tells the caller what to do:
/// after anything but a `Request` error the transaction can only be aborted. Dropping
/// an unfinished transaction aborts it.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) store: Arc<StoreInner>,
    pub(crate) context_id: ContextId,
    started: Instant,
    pub(crate) locker: Arc<TxnLocker>,
    pub(crate) shared: Arc<TxnShared>,
    locked: HashSet<DataKey>,
    pub(crate) modified_objects: Vec<SavedObject>,
    pub(crate) modified_bindings: BTreeMap<BindingKey, SavedBinding>,
    state: TxnState,
    failure: Option<Error>,
}

/// Interrupts a transaction from another thread, ending its current and future waits.
#[derive(Debug, Clone)]
pub struct TxnInterrupter {
    shared: Arc<TxnShared>,
    locker: Arc<TxnLocker>,
    store: Weak<StoreInner>,
}

impl TxnInterrupter {
    pub fn interrupt(&self) {
        self.shared.interrupted.store(true, Ordering::Release);
        self.locker.interrupt();
        if let Some(store) = self.store.upgrade() {
            store.cache.wake_all();
        }
    }
}

impl Transaction {
    pub(crate) fn begin(store: Arc<StoreInner>) -> Result<Self> {
        store.lifecycle.txn_started()?;
        let context_id = store.update_queue.begin_txn();
        let started = Instant::now();
        let locker = store
            .access
            .new_locker(context_id, Some(started + store.config.txn_timeout));
        trace!(%context_id, "begin transaction");
        Ok(Self {
            store,
            context_id,
            started,
            locker,
            shared: Arc::new(TxnShared::default()),
            locked: HashSet::new(),
            modified_objects: vec![],
            modified_bindings: BTreeMap::new(),
            state: TxnState::Active,
            failure: None,
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn interrupter(&self) -> TxnInterrupter {
        TxnInterrupter {
            shared: Arc::clone(&self.shared),
            locker: Arc::clone(&self.locker),
            store: Arc::downgrade(&self.store),
        }
    }

    /// When the current wait must end: after the lock timeout, but never after the
    /// transaction times out.
    pub(crate) fn deadline(&self) -> Instant {
        let config = &self.store.config;
        (Instant::now() + config.lock_timeout).min(self.started + config.txn_timeout)
    }

    pub(crate) fn waiter<'a>(&self, shared: &'a TxnShared) -> Waiter<'a> {
        Waiter::new(self.deadline(), Some(&shared.interrupted))
    }

    fn check_active(&self, what: &str) -> Result<()> {
        if self.state != TxnState::Active {
            return Err(Error::IllegalState(format!(
                "{what} called on a transaction that is {:?}",
                self.state
            )));
        }
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        if self.shared.interrupted.load(Ordering::Acquire) {
            return Err(Error::Interrupted(format!(
                "transaction {} interrupted",
                self.context_id
            )));
        }
        if Instant::now() >= self.started + self.store.config.txn_timeout {
            return Err(Error::Timeout(format!(
                "transaction {} timed out before {what}",
                self.context_id
            )));
        }
        Ok(())
    }

    /// Runs an operation, remembering a failure that leaves the transaction unusable.
    pub(crate) fn operation<T>(
        &mut self,
        what: &'static str,
        op: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.check_active(what)?;
        let result = op(self);
        if let Err(e) = &result {
            if e.category() != ErrorCategory::Request {
                debug!(context_id = %self.context_id, what, %e, "transaction failed");
                self.store.report_if_fatal(e);
                self.failure = Some(e.clone());
            }
        }
        result
    }

    /// Takes the local access lock on `key`, which is held until the transaction ends.
    pub(crate) fn lock_access(&mut self, key: DataKey, for_write: bool) -> Result<()> {
        if let Some(conflict) = self.store.access.lock(&self.locker, key.clone(), for_write)? {
            return Err(Error::from_lock_conflict(&conflict, &key));
        }
        self.locked.insert(key);
        Ok(())
    }

    fn is_modified(&self) -> bool {
        !self.modified_objects.is_empty() || !self.modified_bindings.is_empty()
    }

    /// Remembers how to restore a binding entry the first time the transaction changes
    /// it.
    pub(crate) fn save_binding(&mut self, key: &BindingKey, saved: impl FnOnce() -> SavedBinding) {
        if !self.modified_bindings.contains_key(key) {
            self.modified_bindings.insert(key.clone(), saved());
        }
    }

    pub fn get_class_id(&mut self, class_info: &[u8]) -> Result<ClassId> {
        self.operation("get_class_id", |txn| {
            let store = &txn.store;
            store
                .config
                .retry
                .run("get_class_id", || store.server.get_class_id(class_info))
        })
    }

    pub fn get_class_info(&mut self, class_id: ClassId) -> Result<Bytes> {
        self.operation("get_class_info", |txn| {
            let store = &txn.store;
            store
                .config
                .retry
                .run("get_class_info", || store.server.get_class_info(class_id))?
                .ok_or(Error::ClassInfoNotFound(class_id))
        })
    }

    /// Reserves room for the transaction's changes in the update queue. Returns `true`
    /// if there were no changes, in which case the transaction is already finished.
    pub fn prepare(&mut self) -> Result<bool> {
        self.check_active("prepare")?;
        if !self.is_modified() {
            let result = self.store.update_queue.abort(self.context_id, false);
            self.finish();
            result?;
            self.store.maybe_check_bindings(CheckBindings::Txn)?;
            return Ok(true);
        }
        let deadline = self.started + self.store.config.txn_timeout;
        if let Err(e) = self.store.update_queue.prepare(deadline) {
            self.failure = Some(e.clone());
            return Err(e);
        }
        self.state = TxnState::Prepared;
        Ok(false)
    }

    /// Commits a prepared transaction.
    pub fn commit(mut self) -> Result<()> {
        match self.state {
            TxnState::Finished => return Ok(()),
            TxnState::Active => {
                return Err(Error::IllegalState(
                    "commit called on a transaction that is not prepared".to_string(),
                ));
            }
            TxnState::Prepared => {}
        }
        if let Err(e) = self.commit_prepared() {
            warn!(context_id = %self.context_id, %e, "commit failed");
            self.store.report_if_fatal(&e);
            return Err(e);
        }
        self.finish();
        self.store.maybe_check_bindings(CheckBindings::Txn)
    }

    pub fn prepare_and_commit(mut self) -> Result<()> {
        if self.prepare()? {
            return Ok(());
        }
        self.commit()
    }

    /// Rolls back every change and ends the transaction.
    pub fn abort(mut self) -> Result<()> {
        self.rollback()
    }

    fn commit_prepared(&mut self) -> Result<()> {
        let store = Arc::clone(&self.store);
        let mut request = CommitRequest::default();

        // The server takes new object ids from the front of the list
        let (created, existing): (Vec<&SavedObject>, Vec<&SavedObject>) =
            self.modified_objects.iter().partition(|saved| saved.created);
        request.new_oids = created.len();
        for saved in created.into_iter().chain(existing) {
            let oid = saved.oid;
            let mut bucket = store.cache.lock_object(oid);
            let serial = bucket
                .current_object(oid)
                .map(|entry| entry.serial())
                .ok_or_else(|| Error::IllegalState(format!("modified object {oid} is not cached")))?;
            let entry = bucket.object_mut(oid, serial)?;
            if entry.state().modified() {
                entry.set_not_modified()?;
            }
            request.oids.push(oid);
            request.oid_values.push(entry.value.to_commit());
        }

        let created = self.modified_bindings.iter().filter(|(_, saved)| saved.created);
        let existing = self.modified_bindings.iter().filter(|(_, saved)| !saved.created);
        for (key, _) in created.chain(existing) {
            let mut bucket = store.cache.lock_binding(key);
            let oid = match bucket.current_binding(key).map(|entry| entry.serial()) {
                Some(serial) => {
                    let entry = bucket.binding_mut(key, serial)?;
                    if entry.state().modified() {
                        entry.set_not_modified()?;
                    }
                    entry.value.oid
                }
                // Removed
                None => None,
            };
            if let Some(name) = key.name() {
                request.names.push(name.to_string());
                request.name_values.push(oid);
            }
        }
        debug!(context_id = %self.context_id, oids = request.oids.len(), names = request.names.len(), "committing");
        store.update_queue.commit(self.context_id, request)
    }

    fn rollback(&mut self) -> Result<()> {
        if self.state == TxnState::Finished {
            return Ok(());
        }
        debug!(context_id = %self.context_id, objects = self.modified_objects.len(), bindings = self.modified_bindings.len(), "rolling back");
        let prepared = self.state == TxnState::Prepared;
        let mut result = Ok(());
        for saved in std::mem::take(&mut self.modified_objects) {
            if let Err(e) = self.rollback_object(saved) {
                result = result.and(Err(e));
            }
        }
        for (key, saved) in std::mem::take(&mut self.modified_bindings) {
            if let Err(e) = self.rollback_binding(&key, saved) {
                result = result.and(Err(e));
            }
        }
        let aborted = self.store.update_queue.abort(self.context_id, prepared);
        self.finish();
        if let Err(e) = &result {
            warn!(context_id = %self.context_id, %e, "rollback failed");
            self.store.report_if_fatal(e);
        }
        result.and(aborted)
    }

    fn rollback_object(&self, saved: SavedObject) -> Result<()> {
        let oid = saved.oid;
        let mut bucket = self.store.cache.lock_object(oid);
        let Some(serial) = bucket.current_object(oid).map(|entry| entry.serial()) else {
            return Err(Error::IllegalState(format!("modified object {oid} is not cached")));
        };
        let entry = bucket.object_mut(oid, serial)?;
        if entry.state().modified() {
            entry.set_not_modified()?;
        }
        entry.value = saved.restore;
        if saved.created {
            entry.set_evicted_immediate()?;
            bucket.remove_object(oid, serial)?;
        }
        Ok(())
    }

    fn rollback_binding(&self, key: &BindingKey, saved: SavedBinding) -> Result<()> {
        let cache = &self.store.cache;
        // Space for an entry the transaction removed, reserved before taking the bucket
        let mut reservation = if saved.created {
            None
        } else {
            let cached = cache.lock_binding(key).current_binding(key).is_some();
            if cached { None } else { Some(cache.reservations().reserve(1, None)?) }
        };
        let mut bucket = cache.lock_binding(key);
        match bucket.current_binding(key).map(|entry| entry.serial()) {
            Some(serial) => {
                let entry = bucket.binding_mut(key, serial)?;
                if entry.state().modified() {
                    entry.set_not_modified()?;
                }
                entry.value.oid = saved.oid;
                entry.set_previous_key(saved.previous_key, saved.previous_key_unbound);
                if saved.created {
                    entry.set_evicted_immediate()?;
                    bucket.remove_binding(key, serial)?;
                }
            }
            None if saved.created => {}
            None => {
                let Some(reservation) = reservation.as_mut() else {
                    return Err(Error::IllegalState(format!(
                        "binding {key} left the cache during rollback"
                    )));
                };
                bucket.add_binding(
                    key.clone(),
                    State::CachedWrite,
                    self.context_id,
                    BindingData::with_previous_key(
                        saved.oid,
                        saved.previous_key,
                        saved.previous_key_unbound,
                    ),
                    reservation,
                )?;
            }
        }
        Ok(())
    }

    fn finish(&mut self) {
        for key in self.locked.drain() {
            if let Err(e) = self.store.access.release_lock(&self.locker, &key) {
                warn!(context_id = %self.context_id, %key, %e, "cannot release access lock");
            }
        }
        self.state = TxnState::Finished;
        self.store.lifecycle.txn_finished();
        trace!(context_id = %self.context_id, "transaction finished");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TxnState::Finished {
            if let Err(e) = self.rollback() {
                warn!(context_id = %self.context_id, %e, "abort of dropped transaction failed");
            }
        }
    }
}
