//! The store a node's transactions run against, and the state they share with the
//! node's background threads.

use crate::{
    CheckBindings, NodeConfig,
    cache::Cache,
    callbacks::NodeCallbacks,
    conflicts::{DataConflict, DataConflictListener, Listeners, deliver_conflicts},
    evictor::run_evictor,
    lifecycle::Lifecycle,
    object_ids::{NewObjectIds, OBJECT_ID_BATCH},
    reserve::Reservations,
    txn::Transaction,
    workers::WorkerPool,
};
use cachestore_api::{
    CallbackServer, DataKey, DataServer, Error, ErrorCategory, FailureReporter, Result,
    UpdateQueueEndpoint,
};
use cachestore_id::{ContextId, NodeId};
use cachestore_lock::LockManager;
use cachestore_queue::{
    LoopbackRequestQueue, NodeQueues, RequestQueue, RequestQueueClient, RequestQueueConfig,
    UpdateQueue,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// A node's cache of the server's data, and the way its transactions reach it.
///
/// Dropping the store shuts it down, which waits for running transactions to finish.
#[derive(Debug)]
pub struct CachingStore {
    inner: Arc<StoreInner>,
}

/// Snapshot of how full the cache is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub objects: usize,
    pub bindings: usize,
    /// Space that is neither used by entries nor reserved.
    pub available: usize,
}

#[derive(Debug)]
pub(crate) struct StoreInner {
    pub(crate) config: NodeConfig,
    pub(crate) node_id: NodeId,
    pub(crate) server: Arc<dyn DataServer>,
    pub(crate) update_queue: UpdateQueue,
    /// Isolates the node's own transactions from each other.
    pub(crate) access: LockManager<DataKey, ContextId>,
    pub(crate) cache: Cache,
    pub(crate) object_ids: NewObjectIds,
    pub(crate) lifecycle: Arc<Lifecycle>,
    /// Runs server calls made for transactions.
    pub(crate) fetch_pool: WorkerPool,
    /// Runs evictions and downgrades.
    pub(crate) task_pool: WorkerPool,
    conflicts: Sender<DataConflict>,
    listeners: Listeners,
    stop: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CachingStore {
    /// Registers a new node with `server`. A server in the same process hands its
    /// update queues over through `local_queues`; other servers are reached over TCP.
    pub fn new(
        config: NodeConfig,
        server: Arc<dyn DataServer>,
        local_queues: Option<Arc<dyn NodeQueues>>,
    ) -> Result<Self> {
        config.validate()?;
        let callbacks = Arc::new(NodeCallbacks::default());
        let registration = config.retry.run("register_node", || {
            server.register_node(Arc::clone(&callbacks) as Arc<dyn CallbackServer>)
        })?;
        let node_id = registration.node_id;
        info!(%node_id, update_queue = ?registration.update_queue, cache_size = config.cache_size, "registered node");

        let lifecycle = Arc::new(Lifecycle::new());
        let queue_config = RequestQueueConfig {
            max_retry: config.retry.max_retry,
            retry_wait: config.retry.retry_wait,
            ..Default::default()
        };
        let reporter = Arc::clone(&lifecycle) as Arc<dyn FailureReporter>;
        let request_queue: Arc<dyn RequestQueue> = match registration.update_queue {
            UpdateQueueEndpoint::InProcess => {
                let local_queues = local_queues.ok_or_else(|| {
                    Error::InvalidArgument(
                        "the server runs in this process but no local queues were given"
                            .to_string(),
                    )
                })?;
                let queue_server = local_queues.request_queue_server(node_id)?;
                Arc::new(LoopbackRequestQueue::new(queue_server, queue_config, reporter)?)
            }
            UpdateQueueEndpoint::Tcp(addr) => Arc::new(RequestQueueClient::new(
                node_id,
                addr,
                queue_config,
                reporter,
            )?),
        };

        let (cache_full_sender, cache_full) = crossbeam_channel::bounded(1);
        let (conflicts, conflicts_receiver) = crossbeam_channel::unbounded();
        let (stop, stop_receiver) = crossbeam_channel::bounded::<()>(0);
        let reservations = Arc::new(Reservations::new(config.cache_size, cache_full_sender));
        let inner = Arc::new(StoreInner {
            config,
            node_id,
            object_ids: NewObjectIds::new(Arc::clone(&server), config.retry, OBJECT_ID_BATCH),
            server,
            update_queue: UpdateQueue::new(request_queue, config.update_queue_size)?,
            access: LockManager::new(config.lock_timeout, config.num_locks, true)?,
            cache: Cache::new(config.num_locks, reservations),
            lifecycle,
            fetch_pool: WorkerPool::new("cachestore-fetch", config.fetch_threads)?,
            task_pool: WorkerPool::new("cachestore-task", config.task_threads)?,
            conflicts,
            listeners: Listeners::default(),
            stop: Mutex::new(Some(stop)),
            threads: Mutex::new(vec![]),
        });
        callbacks.bind(&inner);

        // From here on, dropping the store stops whatever was started
        let store = Self { inner };
        store.start_threads(cache_full, conflicts_receiver, stop_receiver)?;
        Ok(store)
    }

    fn start_threads(
        &self,
        cache_full: Receiver<()>,
        conflicts: Receiver<DataConflict>,
        stop: Receiver<()>,
    ) -> Result<()> {
        let spawn = |name: &str, f: Box<dyn FnOnce() + Send>| {
            std::thread::Builder::new()
                .name(format!("{name}-{}", self.inner.node_id))
                .spawn(f)
                .map_err(|e| Error::IllegalState(format!("cannot start {name} thread: {e}")))
        };
        let evictor = {
            let inner = Arc::clone(&self.inner);
            let stop = stop.clone();
            spawn(
                "cachestore-evictor",
                Box::new(move || run_evictor(&inner, &cache_full, &stop)),
            )?
        };
        self.inner.threads.lock().push(evictor);
        let listeners = Arc::clone(&self.inner.listeners);
        let notifier = spawn(
            "cachestore-conflicts",
            Box::new(move || deliver_conflicts(conflicts, stop, listeners)),
        )?;
        self.inner.threads.lock().push(notifier);
        Ok(())
    }

    /// Lets transactions start.
    pub fn ready(&self) -> Result<()> {
        self.inner.lifecycle.ready()
    }

    pub fn local_node_id(&self) -> NodeId {
        self.inner.node_id
    }

    /// Starts a transaction, which lasts until it commits, aborts, or is dropped.
    pub fn begin(&self) -> Result<Transaction> {
        Transaction::begin(Arc::clone(&self.inner))
    }

    pub fn add_data_conflict_listener(&self, listener: Arc<dyn DataConflictListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Adds a reporter told when the node fails.
    pub fn add_failure_reporter(&self, reporter: Arc<dyn FailureReporter>) {
        self.inner.lifecycle.add_reporter(reporter);
    }

    /// Checks cached bindings for consistency, returning the number of problems found.
    pub fn check_bindings(&self) -> usize {
        self.inner.cache.check_bindings()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = &self.inner.cache;
        CacheStats {
            objects: cache.object_count(),
            bindings: cache.binding_count(),
            available: cache.reservations().available(),
        }
    }

    /// Waits until the server has applied every commit made on this node so far.
    /// Returns `false` if `timeout` passes first.
    pub fn await_commits(&self, timeout: Duration) -> bool {
        self.inner
            .update_queue
            .await_commits(Instant::now() + timeout)
    }

    /// Waits for running transactions, then stops the node's threads and update queue.
    /// Calling it again waits for the first call to finish.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Drop for CachingStore {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

impl StoreInner {
    fn shutdown(&self) {
        if !self.lifecycle.begin_shutdown() {
            return;
        }
        info!(node_id = %self.node_id, "shutting down node");
        drop(self.stop.lock().take());
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            if handle.join().is_err() {
                warn!(node_id = %self.node_id, "background thread panicked");
            }
        }
        self.task_pool.shutdown();
        self.fetch_pool.shutdown();
        self.update_queue.shutdown();
        self.cache.reservations().shutdown();
        self.cache.wake_all();
        self.lifecycle.shutdown_completed();
    }

    /// Marks the node failed if `e` leaves it unable to go on.
    pub(crate) fn report_if_fatal(&self, e: &Error) {
        if e.category() == ErrorCategory::Fatal {
            self.lifecycle.report_failure(e);
        }
    }

    pub(crate) fn note_conflict(&self, key: &DataKey, node_id: NodeId, for_update: bool) {
        let conflict = DataConflict {
            access_id: key.clone(),
            node_id,
            for_update,
        };
        if self.conflicts.send(conflict).is_err() {
            debug!(%key, %node_id, "conflict dropped after shutdown");
        }
    }

    /// Checks cached bindings if the configuration asks for it at `level`.
    pub(crate) fn maybe_check_bindings(&self, level: CheckBindings) -> Result<()> {
        if self.config.check_bindings < level {
            return Ok(());
        }
        match self.cache.check_bindings() {
            0 => Ok(()),
            problems => Err(Error::IllegalState(format!(
                "found {problems} problems with cached bindings"
            ))),
        }
    }
}
