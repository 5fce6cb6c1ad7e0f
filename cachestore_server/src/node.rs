use cachestore_api::{CallbackServer, DataKey};
use cachestore_id::NodeId;
use cachestore_lock::Locker;
use cachestore_queue::RequestQueueServer;
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

pub(crate) type NodeLocker = Locker<DataKey, NodeId>;

/// What the server knows about a registered node.
#[derive(Debug)]
pub(crate) struct NodeInfo {
    pub(crate) node_id: NodeId,
    pub(crate) callback: Arc<dyn CallbackServer>,
    pub(crate) locker: Arc<NodeLocker>,
    pub(crate) queue_server: Arc<RequestQueueServer>,
    /// Held while obtaining a lock: a locker waits for one lock at a time.
    pub(crate) lock_sync: Mutex<()>,
    locked: Mutex<HashSet<DataKey>>,
    calls: Mutex<Calls>,
    calls_done: Condvar,
}

#[derive(Debug, Default)]
struct Calls {
    active: usize,
    shutdown: bool,
}

impl NodeInfo {
    pub(crate) fn new(
        node_id: NodeId,
        callback: Arc<dyn CallbackServer>,
        locker: Arc<NodeLocker>,
        queue_server: Arc<RequestQueueServer>,
    ) -> Self {
        Self {
            node_id,
            callback,
            locker,
            queue_server,
            lock_sync: Mutex::new(()),
            locked: Mutex::new(HashSet::new()),
            calls: Mutex::new(Calls::default()),
            calls_done: Condvar::new(),
        }
    }

    /// Notes the start of a call made on behalf of this node. Returns `false` if the
    /// node has been shut down.
    pub(crate) fn call_started(&self) -> bool {
        let mut calls = self.calls.lock();
        if calls.shutdown {
            return false;
        }
        calls.active += 1;
        true
    }

    pub(crate) fn call_finished(&self) {
        let mut calls = self.calls.lock();
        calls.active = calls.active.saturating_sub(1);
        if calls.active == 0 {
            self.calls_done.notify_all();
        }
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.calls.lock().shutdown
    }

    /// Marks the node shut down. Returns `true` only for the first call.
    pub(crate) fn shutdown(&self) -> bool {
        let mut calls = self.calls.lock();
        !std::mem::replace(&mut calls.shutdown, true)
    }

    /// Waits for calls that started before the node was shut down.
    pub(crate) fn await_calls_finished(&self) {
        let mut calls = self.calls.lock();
        while calls.active > 0 {
            self.calls_done.wait(&mut calls);
        }
    }

    pub(crate) fn note_locked(&self, key: DataKey) {
        self.locked.lock().insert(key);
    }

    pub(crate) fn note_unlocked(&self, key: &DataKey) {
        self.locked.lock().remove(key);
    }

    /// Forgets every key the node was noted to hold, returning them.
    pub(crate) fn take_locked(&self) -> Vec<DataKey> {
        self.locked.lock().drain().collect()
    }

    #[cfg(test)]
    pub(crate) fn locked_count(&self) -> usize {
        self.locked.lock().len()
    }
}
