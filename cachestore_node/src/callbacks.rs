//! Requests from the server to give up cached data, and the tasks that give it up once
//! no local transaction needs it.
//!
//! An entry nobody is using is evicted or downgraded on the spot and the server is told
//! so in the reply. Otherwise a task waits for the entry's local access lock, moves the
//! entry to an evicting state, and sends the release through the update queue tagged
//! with the last transaction that used the entry, so that it reaches the server after
//! that transaction's commit.

use crate::{
    cache::{BucketGuard, MAX_RETRIES, Waiter},
    entry::{State, Step},
    lifecycle,
    store::StoreInner,
};
use cachestore_api::{CallbackServer, DataKey, Error, ErrorCategory, Result};
use cachestore_id::{BindingKey, ContextId, NodeId, ObjectId};
use cachestore_queue::Completion;
use std::{
    sync::{Arc, OnceLock, Weak},
    time::Instant,
};
use tracing::{debug, trace, warn};

/// The node's [`CallbackServer`], registered before the store it serves exists.
#[derive(Debug, Default)]
pub(crate) struct NodeCallbacks {
    store: OnceLock<Weak<StoreInner>>,
}

impl NodeCallbacks {
    pub(crate) fn bind(&self, store: &Arc<StoreInner>) {
        if self.store.set(Arc::downgrade(store)).is_err() {
            warn!("node callbacks bound twice");
        }
    }

    fn request(&self, key: DataKey, requester: NodeId, evict: bool) -> Result<bool> {
        match self.store.get() {
            // Nothing can be cached before the store exists
            None => Ok(true),
            Some(store) => match store.upgrade() {
                Some(store) => store.handle_callback(key, requester, evict),
                None => Err(Error::ShuttingDown),
            },
        }
    }
}

impl CallbackServer for NodeCallbacks {
    fn request_downgrade_object(&self, oid: ObjectId, requester: NodeId) -> Result<bool> {
        self.request(DataKey::Object(oid), requester, false)
    }

    fn request_evict_object(&self, oid: ObjectId, requester: NodeId) -> Result<bool> {
        self.request(DataKey::Object(oid), requester, true)
    }

    fn request_downgrade_binding(&self, key: &BindingKey, requester: NodeId) -> Result<bool> {
        self.request(DataKey::Binding(key.clone()), requester, false)
    }

    fn request_evict_binding(&self, key: &BindingKey, requester: NodeId) -> Result<bool> {
        self.request(DataKey::Binding(key.clone()), requester, true)
    }
}

/// What a task found it has to do once it holds the entry.
#[derive(Debug)]
enum Release {
    Nothing,
    Send { serial: u64, context_id: ContextId },
}

impl StoreInner {
    fn handle_callback(self: &Arc<Self>, key: DataKey, requester: NodeId, evict: bool) -> Result<bool> {
        if self.lifecycle.state() >= lifecycle::State::ShutdownTxnsCompleted {
            return Err(Error::ShuttingDown);
        }
        self.note_conflict(&key, requester, evict);
        // Read before taking the bucket: completions of queued requests take buckets
        let lowest_pending = self.update_queue.lowest_pending_context_id();
        let mut bucket = self.cache.lock_key(&key);
        let Some(entry) = bucket.summary(&key) else {
            drop(bucket);
            return match &key {
                DataKey::Object(_) => {
                    trace!(%key, %requester, evict, "callback for uncached entry");
                    Ok(true)
                }
                DataKey::Binding(name) => {
                    self.handle_uncached_name_callback(name, requester, evict, lowest_pending)
                }
            };
        };
        let idle = !entry.in_use(lowest_pending);
        let done = match entry.state {
            state if state.decaching() => Some(false),
            State::CachedRead | State::CachedWrite if evict && idle => {
                bucket.step(&key, entry.serial, Step::EvictedImmediate)?;
                bucket.remove(&key, entry.serial)?;
                Some(true)
            }
            State::CachedRead if !evict => Some(true),
            State::EvictingDowngrade if !evict => Some(false),
            State::CachedWrite if !evict && idle => {
                bucket.step(&key, entry.serial, Step::EvictedDowngradeImmediate)?;
                Some(true)
            }
            _ => None,
        };
        drop(bucket);
        match done {
            Some(done) => {
                debug!(%key, %requester, evict, done, "callback answered");
                Ok(done)
            }
            None => {
                debug!(%key, %requester, evict, state = ?entry.state, "callback delayed");
                self.schedule_task(key, evict)?;
                Ok(false)
            }
        }
    }

    /// Answers a callback for a name with no entry of its own. The node may still hold
    /// the name's lock while a local removal of it is uncommitted, and an abort caches
    /// the name again. The entry covering the name as its next entry tells whether that
    /// can be the case.
    fn handle_uncached_name_callback(
        self: &Arc<Self>,
        name: &BindingKey,
        requester: NodeId,
        evict: bool,
        lowest_pending: ContextId,
    ) -> Result<bool> {
        let key = DataKey::Binding(name.clone());
        for _ in 0..MAX_RETRIES {
            let Some((ceiling, serial)) = self.cache.ceiling_binding(name) else {
                trace!(%key, %requester, evict, "callback for uncovered name");
                return Ok(true);
            };
            let mut bucket = self.cache.lock_binding(&ceiling);
            if self.cache.ceiling_binding(name) != Some((ceiling.clone(), serial)) {
                continue;
            }
            let Some(entry) = bucket.binding(&ceiling, serial) else {
                continue;
            };
            if ceiling == *name {
                // Cached since the first look
                drop(bucket);
                self.schedule_task(key, evict)?;
                return Ok(false);
            }
            if !entry.is_next_entry(&ceiling, name) {
                trace!(%key, %requester, evict, "callback for uncovered name");
                return Ok(true);
            }
            let busy = entry.context_id() >= lowest_pending
                || entry.pending_previous()
                || !matches!(entry.state(), State::CachedRead | State::CachedWrite);
            if busy {
                drop(bucket);
                debug!(%key, %requester, evict, next = %ceiling, "callback for uncached name delayed");
                self.schedule_task(key, evict)?;
                return Ok(false);
            }
            if evict {
                // The entry no longer vouches for the names up to the given up one
                bucket
                    .binding_mut(&ceiling, serial)?
                    .set_previous_key(Some(name.clone()), false);
            }
            debug!(%key, %requester, evict, next = %ceiling, "callback for uncached name answered");
            return Ok(true);
        }
        Err(Error::ResourceExhausted(format!(
            "too many retries answering callback for {key}"
        )))
    }

    /// Starts an eviction or downgrade the server asked for in a reply.
    pub(crate) fn follow_up(self: &Arc<Self>, key: DataKey, evict: bool, downgrade: bool) {
        if !evict && !downgrade {
            return;
        }
        if let Err(e) = self.schedule_task(key.clone(), evict) {
            debug!(%key, %e, "follow-up not scheduled");
        }
    }

    pub(crate) fn schedule_task(self: &Arc<Self>, key: DataKey, evict: bool) -> Result<()> {
        let store = Arc::clone(self);
        self.task_pool.execute(move || store.run_task(key, evict))
    }

    fn run_task(self: &Arc<Self>, key: DataKey, evict: bool) {
        let Err(e) = self.release(&key, evict) else {
            return;
        };
        match e.category() {
            _ if e == Error::ShuttingDown => debug!(%key, evict, "task abandoned at shutdown"),
            ErrorCategory::Fatal => {
                warn!(%key, evict, %e, "task failed");
                self.report_if_fatal(&e);
            }
            ErrorCategory::Request => warn!(%key, evict, %e, "task failed"),
            ErrorCategory::RetryableByCaller | ErrorCategory::AbortTransaction => {
                debug!(%key, evict, %e, "task will be retried");
                std::thread::sleep(self.config.retry.retry_wait);
                if let Err(e) = self.schedule_task(key.clone(), evict) {
                    debug!(%key, evict, %e, "task not retried");
                }
            }
        }
    }

    /// Gives up the entry for `key` while holding its access lock, so that no local
    /// transaction is using it.
    fn release(self: &Arc<Self>, key: &DataKey, evict: bool) -> Result<()> {
        let deadline = Instant::now() + self.config.lock_timeout;
        let locker = self.access.new_locker(ContextId::NONE, Some(deadline));
        if let Some(conflict) = self.access.lock(&locker, key.clone(), evict)? {
            return Err(Error::from_lock_conflict(&conflict, key));
        }
        let result = self.release_locked(key, evict, &Waiter::new(deadline, None));
        self.access.release_lock(&locker, key)?;
        result
    }

    fn release_locked(self: &Arc<Self>, key: &DataKey, evict: bool, waiter: &Waiter<'_>) -> Result<()> {
        let release = match key {
            DataKey::Object(_) => settle(&mut self.cache.lock_key(key), key, evict, waiter)?,
            DataKey::Binding(name) => self.settle_name(name, evict, waiter)?,
        };
        match release {
            Release::Nothing => Ok(()),
            Release::Send { serial, context_id } => self.send_release(key, serial, context_id, evict),
        }
    }

    /// Settles the entry for `name`, or if it has none, the entry covering it. A lookup
    /// anchored on the covering entry may cache the name, so it is waited for.
    fn settle_name(&self, name: &BindingKey, evict: bool, waiter: &Waiter<'_>) -> Result<Release> {
        let key = DataKey::Binding(name.clone());
        for _ in 0..MAX_RETRIES {
            let Some((ceiling, serial)) = self.cache.ceiling_binding(name) else {
                return Ok(Release::Nothing);
            };
            let mut bucket = self.cache.lock_binding(&ceiling);
            if ceiling == *name {
                return settle(&mut bucket, &key, evict, waiter);
            }
            if self.cache.ceiling_binding(name) != Some((ceiling.clone(), serial)) {
                continue;
            }
            let Some(entry) = bucket.binding(&ceiling, serial) else {
                continue;
            };
            if !entry.is_next_entry(&ceiling, name) {
                return Ok(Release::Nothing);
            }
            if !entry.pending_previous() {
                // Given up already, or held only until a removal's commit releases it
                trace!(%key, evict, next = %ceiling, "uncached name has nothing to release");
                return Ok(Release::Nothing);
            }
            bucket.await_not_pending_previous(&ceiling, serial, waiter)?;
        }
        Err(Error::ResourceExhausted(format!(
            "too many retries releasing {key}"
        )))
    }

    /// Tells the server that the entry, already moved to an evicting state, is given up.
    /// The entry finishes its transition when the server acknowledges.
    pub(crate) fn send_release(
        self: &Arc<Self>,
        key: &DataKey,
        serial: u64,
        context_id: ContextId,
        evict: bool,
    ) -> Result<()> {
        trace!(%key, serial, %context_id, evict, "sending release");
        let step = if evict { Step::Evicted } else { Step::EvictedDowngrade };
        let completion = self.completion(key.clone(), serial, step);
        let queue = &self.update_queue;
        match (key, evict) {
            (DataKey::Object(oid), true) => queue.evict_object(context_id, *oid, completion),
            (DataKey::Object(oid), false) => queue.downgrade_object(context_id, *oid, completion),
            (DataKey::Binding(name), true) => queue.evict_binding(context_id, name.clone(), completion),
            (DataKey::Binding(name), false) => {
                queue.downgrade_binding(context_id, name.clone(), completion)
            }
        }
    }

    fn completion(self: &Arc<Self>, key: DataKey, serial: u64, step: Step) -> Completion {
        let store = Arc::downgrade(self);
        Box::new(move || {
            let Some(store) = store.upgrade() else {
                return;
            };
            let mut bucket = store.cache.lock_key(&key);
            let result = bucket.step(&key, serial, step).and_then(|_| {
                if step == Step::Evicted {
                    bucket.remove(&key, serial)
                } else {
                    Ok(())
                }
            });
            drop(bucket);
            match result {
                Ok(()) => trace!(%key, ?step, "release acknowledged"),
                Err(e) => {
                    warn!(%key, ?step, %e, "cannot complete release");
                    store.report_if_fatal(&e);
                }
            }
        })
    }
}

/// Waits for the entry to settle and, if there is something to give up, moves it to
/// the evicting state.
fn settle(
    bucket: &mut BucketGuard<'_>,
    key: &DataKey,
    evict: bool,
    waiter: &Waiter<'_>,
) -> Result<Release> {
    loop {
        let Some(entry) = bucket.summary(key) else {
            return Ok(Release::Nothing);
        };
        if entry.state.decached() {
            return Ok(Release::Nothing);
        }
        let Some(state) = bucket.await_settled(key, entry.serial, waiter)? else {
            continue;
        };
        // A binding anchoring a lookup must stay until the lookup is answered
        if let DataKey::Binding(name) = key {
            if bucket
                .binding(name, entry.serial)
                .is_some_and(|entry| entry.pending_previous())
            {
                bucket.wait(waiter, key)?;
                continue;
            }
        }
        let step = match (evict, state) {
            (true, State::CachedRead | State::CachedWrite) => Step::Evicting,
            (false, State::CachedWrite) => Step::EvictingDowngrade,
            _ => {
                trace!(%key, evict, ?state, "nothing to release");
                return Ok(Release::Nothing);
            }
        };
        let context_id = bucket.step(key, entry.serial, step)?;
        return Ok(Release::Send {
            serial: entry.serial,
            context_id,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbound_callbacks_give_up_at_once() {
        let callbacks = NodeCallbacks::default();
        let oid = ObjectId::new(4).unwrap();
        assert!(callbacks.request_evict_object(oid, NodeId::new(2)).unwrap());
        assert!(callbacks
            .request_downgrade_binding(&BindingKey::new("a"), NodeId::new(2))
            .unwrap());
    }
}
