use crate::{ServerConfig, node::NodeInfo, storage::Storage};
use bytes::Bytes;
use cachestore_api::{
    CallbackServer, CommitRequest, DataKey, DataServer, Error, GetBindingForRemoveResults,
    GetBindingForUpdateResults, GetBindingResults, GetObjectForUpdateResults, GetObjectResults,
    NextBoundNameResults, NextObjectResults, RegisterNodeResult, Result, UpdateQueueEndpoint,
    UpdateQueueServer, UpgradeObjectResults,
};
use cachestore_id::{BindingKey, ClassId, NodeId, ObjectId};
use cachestore_lock::{LockConflictKind, LockManager};
use cachestore_queue::{NodeQueues, RequestQueueServer};
use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::{
    ops::Deref,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};
use tracing::{debug, info, trace, warn};

/// The caching server. Nodes reach it through [`DataServer`], and their update queues
/// through the [`RequestQueueServer`]s it hands out as [`NodeQueues`].
#[derive(Debug)]
pub struct CachingServer {
    inner: Arc<ServerInner>,
    callback_threads: Mutex<Vec<JoinHandle<()>>>,
    stop_callbacks: Mutex<Option<Sender<()>>>,
}

#[derive(Debug)]
struct ServerInner {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    lock_manager: LockManager<DataKey, NodeId>,
    nodes: DashMap<NodeId, Arc<NodeInfo>>,
    node_ids: Mutex<NodeIdBlock>,
    callback_requests: Sender<CallbackRequest>,
    update_queue: Mutex<UpdateQueueEndpoint>,
    shutting_down: AtomicBool,
}

#[derive(Debug)]
struct NodeIdBlock {
    next: u64,
    last: u64,
}

/// A node asked for `key` and had to wait: its owners need calling back.
#[derive(Debug)]
struct CallbackRequest {
    requester: Arc<NodeInfo>,
    key: DataKey,
    for_write: bool,
}

/// Who else is waiting for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Waiting {
    Nobody,
    Readers,
    Writers,
}

/// Where a name falls among the bound names.
#[derive(Debug)]
struct NameLookup {
    found: bool,
    /// The name if `found`, otherwise the next bound name or LAST.
    key: BindingKey,
    /// The object bound to `key`, if it is not LAST.
    oid: Option<ObjectId>,
}

/// A call made on behalf of a registered node. The node is not shut down until every
/// call has been dropped.
#[derive(Debug)]
struct NodeCall(Arc<NodeInfo>);

impl Deref for NodeCall {
    type Target = Arc<NodeInfo>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Drop for NodeCall {
    fn drop(&mut self) {
        self.0.call_finished();
    }
}

/// Serves a node's update queue requests. Holds the server weakly: the server owns the
/// queue servers that own this.
#[derive(Debug)]
struct UpdateHandler(Weak<ServerInner>);

impl UpdateHandler {
    fn server(&self) -> Result<Arc<ServerInner>> {
        self.0.upgrade().ok_or(Error::ShuttingDown)
    }
}

impl UpdateQueueServer for UpdateHandler {
    fn commit(&self, node_id: NodeId, commit: &CommitRequest) -> Result<()> {
        self.server()?.commit(node_id, commit)
    }

    fn evict_object(&self, node_id: NodeId, oid: ObjectId) -> Result<()> {
        self.server()?.evict(node_id, DataKey::Object(oid))
    }

    fn downgrade_object(&self, node_id: NodeId, oid: ObjectId) -> Result<()> {
        self.server()?.downgrade(node_id, DataKey::Object(oid))
    }

    fn evict_binding(&self, node_id: NodeId, key: &BindingKey) -> Result<()> {
        self.server()?.evict(node_id, DataKey::Binding(key.clone()))
    }

    fn downgrade_binding(&self, node_id: NodeId, key: &BindingKey) -> Result<()> {
        self.server()?.downgrade(node_id, DataKey::Binding(key.clone()))
    }
}

impl CachingServer {
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        config.validate()?;
        let lock_manager = LockManager::new(config.lock_timeout, config.num_key_maps, true)?;
        let (callback_requests, requests) = crossbeam_channel::unbounded();
        let (stop_callbacks, stop) = crossbeam_channel::bounded(0);
        let server = Self {
            inner: Arc::new(ServerInner {
                config,
                storage,
                lock_manager,
                nodes: DashMap::new(),
                node_ids: Mutex::new(NodeIdBlock { next: 1, last: 0 }),
                callback_requests,
                update_queue: Mutex::new(UpdateQueueEndpoint::InProcess),
                shutting_down: AtomicBool::new(false),
            }),
            callback_threads: Mutex::new(vec![]),
            stop_callbacks: Mutex::new(Some(stop_callbacks)),
        };

        for i in 0..config.callback_threads {
            let inner = Arc::clone(&server.inner);
            let requests = requests.clone();
            let stop = stop.clone();
            let handle = std::thread::Builder::new()
                .name(format!("cachestore-callback-{i}"))
                .spawn(move || inner.run_callbacks(&requests, &stop))
                .map_err(|e| Error::IllegalState(format!("cannot start callback thread: {e}")))?;
            server.callback_threads.lock().push(handle);
        }
        info!(
            lock_timeout = ?config.lock_timeout,
            callback_threads = config.callback_threads,
            "caching server started"
        );
        Ok(server)
    }

    /// Sets the update queue endpoint handed to nodes that register from now on.
    pub fn set_update_queue_endpoint(&self, endpoint: UpdateQueueEndpoint) {
        *self.inner.update_queue.lock() = endpoint;
    }

    /// Forgets a failed node: releases all of its locks and ends its update queue.
    pub fn shutdown_node(&self, node_id: NodeId) {
        self.inner.shutdown_node(node_id);
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Refuses further calls, interrupts lock waits and stops the callback threads.
    pub fn shutdown(&self) {
        if !self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            info!("caching server shutting down");
        }
        drop(self.stop_callbacks.lock().take());
        for node in self.inner.nodes.iter() {
            node.locker.interrupt();
            node.queue_server.disconnect();
        }
        let handles = std::mem::take(&mut *self.callback_threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("callback thread panicked");
            }
        }
    }
}

impl Drop for CachingServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DataServer for CachingServer {
    fn register_node(&self, callback: Arc<dyn CallbackServer>) -> Result<RegisterNodeResult> {
        self.inner.check_running()?;
        let node_id = self.inner.next_node_id()?;
        let handler = Arc::new(UpdateHandler(Arc::downgrade(&self.inner)));
        let node = Arc::new(NodeInfo::new(
            node_id,
            callback,
            self.inner.lock_manager.new_locker(node_id, None),
            Arc::new(RequestQueueServer::new(node_id, handler)),
        ));
        self.inner.nodes.insert(node_id, node);
        let update_queue = *self.inner.update_queue.lock();
        info!(%node_id, ?update_queue, "node registered");
        Ok(RegisterNodeResult {
            node_id,
            update_queue,
        })
    }

    fn new_object_ids(&self, count: u32) -> Result<ObjectId> {
        self.inner.check_running()?;
        if count < 1 {
            return Err(Error::InvalidArgument(
                "the number of object ids must not be less than 1".to_string(),
            ));
        }
        self.inner.storage.allocate_object_ids(count)
    }

    fn get_object(&self, node_id: NodeId, oid: ObjectId) -> Result<Option<GetObjectResults>> {
        let inner = &self.inner;
        let node = inner.node_call_started(node_id)?;
        let key = DataKey::Object(oid);
        inner.lock(&node, key.clone(), false, "get_object")?;
        Ok(inner.storage.get_object(oid)?.map(|data| GetObjectResults {
            data,
            callback_evict: inner.get_waiting(&key) == Waiting::Writers,
        }))
    }

    fn get_object_for_update(
        &self,
        node_id: NodeId,
        oid: ObjectId,
    ) -> Result<Option<GetObjectForUpdateResults>> {
        let inner = &self.inner;
        let node = inner.node_call_started(node_id)?;
        let key = DataKey::Object(oid);
        inner.lock(&node, key.clone(), true, "get_object_for_update")?;
        let waiting = inner.get_waiting(&key);
        Ok(inner
            .storage
            .get_object(oid)?
            .map(|data| GetObjectForUpdateResults {
                data,
                callback_evict: waiting == Waiting::Writers,
                callback_downgrade: waiting == Waiting::Readers,
            }))
    }

    fn upgrade_object(&self, node_id: NodeId, oid: ObjectId) -> Result<UpgradeObjectResults> {
        let inner = &self.inner;
        let node = inner.node_call_started(node_id)?;
        let key = DataKey::Object(oid);
        let owned = inner
            .lock_manager
            .get_owners(&key)
            .into_iter()
            .find(|owner| *owner.locker().payload() == node_id);
        match owned {
            Some(owner) if owner.for_write() => {}
            Some(_) => inner.lock(&node, key.clone(), true, "upgrade_object")?,
            None => {
                return Err(consistency_failure(format!(
                    "node {node_id} attempted to upgrade {key} without holding it for read"
                )));
            }
        }
        let waiting = inner.get_waiting(&key);
        Ok(UpgradeObjectResults {
            callback_evict: waiting == Waiting::Writers,
            callback_downgrade: waiting == Waiting::Readers,
        })
    }

    fn next_object_id(
        &self,
        node_id: NodeId,
        oid: Option<ObjectId>,
    ) -> Result<Option<NextObjectResults>> {
        let inner = &self.inner;
        let node = inner.node_call_started(node_id)?;
        let mut after = oid;
        loop {
            let Some((next, _)) = inner.storage.next_object(after)? else {
                return Ok(None);
            };
            let key = DataKey::Object(next);
            inner.lock(&node, key.clone(), false, "next_object_id")?;
            // Read again under the lock: the object may have changed or gone meanwhile
            if let Some(data) = inner.storage.get_object(next)? {
                return Ok(Some(NextObjectResults {
                    oid: next,
                    data,
                    callback_evict: inner.get_waiting(&key) == Waiting::Writers,
                }));
            }
            after = Some(next);
        }
    }

    fn get_binding(&self, node_id: NodeId, name: &str) -> Result<GetBindingResults> {
        let inner = &self.inner;
        let node = inner.node_call_started(node_id)?;
        let mut results: Option<GetBindingResults> = None;
        for _ in 0..=inner.config.max_range_lock_retries {
            let lookup = inner.lookup_name(name)?;
            let next_key = (!lookup.found).then(|| lookup.key.clone());
            if let Some(previous) = results {
                if previous.found == lookup.found && previous.next_key == next_key {
                    return Ok(previous);
                }
            }
            let key = DataKey::Binding(lookup.key);
            inner.lock(&node, key.clone(), false, "get_binding")?;
            results = Some(GetBindingResults {
                found: lookup.found,
                next_key,
                oid: lookup.oid,
                callback_evict: inner.get_waiting(&key) == Waiting::Writers,
            });
        }
        Err(too_many_retries(name))
    }

    fn get_binding_for_update(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> Result<GetBindingForUpdateResults> {
        let inner = &self.inner;
        let node = inner.node_call_started(node_id)?;
        let mut results: Option<GetBindingForUpdateResults> = None;
        for _ in 0..=inner.config.max_range_lock_retries {
            let lookup = inner.lookup_name(name)?;
            let next_key = (!lookup.found).then(|| lookup.key.clone());
            if let Some(previous) = results {
                if previous.found == lookup.found && previous.next_key == next_key {
                    return Ok(previous);
                }
            }
            let key = DataKey::Binding(lookup.key);
            inner.lock(&node, key.clone(), true, "get_binding_for_update")?;
            let waiting = inner.get_waiting(&key);
            results = Some(GetBindingForUpdateResults {
                found: lookup.found,
                next_key,
                oid: lookup.oid,
                callback_evict: waiting == Waiting::Writers,
                callback_downgrade: waiting == Waiting::Readers,
            });
        }
        Err(too_many_retries(name))
    }

    fn get_binding_for_remove(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> Result<GetBindingForRemoveResults> {
        let inner = &self.inner;
        let node = inner.node_call_started(node_id)?;
        let name_key = DataKey::Binding(BindingKey::new(name));
        let mut results: Option<GetBindingForRemoveResults> = None;
        for _ in 0..=inner.config.max_range_lock_retries {
            let (oid, next) = match inner.storage.ceiling_name(name)? {
                Some((bound, oid)) if bound == name => {
                    (Some(oid), inner.storage.higher_name(Some(name))?)
                }
                next => (None, next),
            };
            let found = oid.is_some();
            let next_key = BindingKey::from_name_or_last(next.as_ref().map(|(n, _)| n.as_str()));
            if let Some(previous) = results {
                if previous.found == found && previous.next_key == next_key {
                    return Ok(previous);
                }
            }
            // The name sorts before the next name, so it is locked first
            if found {
                inner.lock(&node, name_key.clone(), true, "get_binding_for_remove")?;
            }
            let next_data_key = DataKey::Binding(next_key.clone());
            inner.lock(&node, next_data_key.clone(), found, "get_binding_for_remove")?;
            let waiting_name = inner.get_waiting(&name_key);
            let waiting_next = inner.get_waiting(&next_data_key);
            results = Some(GetBindingForRemoveResults {
                found,
                next_key,
                oid,
                callback_evict: found && waiting_name == Waiting::Writers,
                callback_downgrade: found && waiting_name == Waiting::Readers,
                next_oid: next.map(|(_, oid)| oid),
                next_callback_evict: waiting_next == Waiting::Writers,
                next_callback_downgrade: waiting_next == Waiting::Readers,
            });
        }
        Err(too_many_retries(name))
    }

    fn next_bound_name(&self, node_id: NodeId, name: Option<&str>) -> Result<NextBoundNameResults> {
        let inner = &self.inner;
        let node = inner.node_call_started(node_id)?;
        let mut results: Option<NextBoundNameResults> = None;
        for _ in 0..=inner.config.max_range_lock_retries {
            let next = inner.storage.higher_name(name)?;
            let next_key = BindingKey::from_name_or_last(next.as_ref().map(|(n, _)| n.as_str()));
            if let Some(previous) = results {
                if previous.next_key == next_key {
                    return Ok(previous);
                }
            }
            let key = DataKey::Binding(next_key.clone());
            inner.lock(&node, key.clone(), false, "next_bound_name")?;
            results = Some(NextBoundNameResults {
                next_key,
                oid: next.map(|(_, oid)| oid),
                callback_evict: inner.get_waiting(&key) == Waiting::Writers,
            });
        }
        Err(too_many_retries(name.unwrap_or_default()))
    }

    fn get_class_id(&self, class_info: &[u8]) -> Result<ClassId> {
        self.inner.check_running()?;
        self.inner.storage.class_id(class_info)
    }

    fn get_class_info(&self, class_id: ClassId) -> Result<Option<Bytes>> {
        self.inner.check_running()?;
        self.inner.storage.class_info(class_id)
    }
}

impl NodeQueues for CachingServer {
    fn request_queue_server(&self, node_id: NodeId) -> Result<Arc<RequestQueueServer>> {
        self.inner
            .nodes
            .get(&node_id)
            .map(|node| Arc::clone(&node.queue_server))
            .ok_or_else(|| Error::IllegalState(format!("node {node_id} is not registered")))
    }
}

impl ServerInner {
    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::Acquire) {
            Err(Error::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn next_node_id(&self) -> Result<NodeId> {
        let mut block = self.node_ids.lock();
        if block.next > block.last {
            let first = self.storage.allocate_node_ids(self.config.node_id_block)?;
            block.next = first;
            block.last = first + self.config.node_id_block - 1;
        }
        let node_id = NodeId::new(block.next);
        block.next += 1;
        Ok(node_id)
    }

    fn node_call_started(&self, node_id: NodeId) -> Result<NodeCall> {
        self.check_running()?;
        let node = self
            .nodes
            .get(&node_id)
            .map(|node| Arc::clone(node.value()))
            .ok_or_else(|| Error::IllegalState(format!("node {node_id} is not registered")))?;
        if !node.call_started() {
            return Err(Error::IllegalState(format!("node {node_id} is shut down")));
        }
        Ok(NodeCall(node))
    }

    /// Like [`Self::node_call_started`], for update queue requests, where an unknown
    /// node means the node and server disagree about its state.
    fn update_call_started(&self, node_id: NodeId) -> Result<NodeCall> {
        self.node_call_started(node_id).map_err(|e| match e {
            Error::IllegalState(message) => consistency_failure(message),
            e => e,
        })
    }

    /// Locks `key` for the node, asking the current owners to give it up if needed.
    fn lock(
        &self,
        node: &Arc<NodeInfo>,
        key: DataKey,
        for_write: bool,
        operation: &'static str,
    ) -> Result<()> {
        let _sync = node.lock_sync.lock();
        let locker = &node.locker;
        let outcome = match self.lock_manager.lock_no_wait(locker, key.clone(), for_write)? {
            None => None,
            Some(conflict) => {
                if conflict.kind == LockConflictKind::Blocked {
                    debug!(
                        node_id = %node.node_id,
                        %key,
                        for_write,
                        operation,
                        blocked_by = %conflict.conflicting,
                        "lock blocked"
                    );
                    self.request_callbacks(node, key.clone(), for_write);
                }
                self.lock_manager.wait_for_lock(locker)?
            }
        };
        if let Some(conflict) = outcome {
            if conflict.kind == LockConflictKind::Deadlock {
                // The node's transaction aborts; the node keeps its other locks
                locker.clear_conflict();
            }
            debug!(
                node_id = %node.node_id,
                %key,
                for_write,
                operation,
                ?conflict,
                "lock failed"
            );
            return Err(Error::from_lock_conflict(&conflict, &key));
        }
        trace!(node_id = %node.node_id, %key, for_write, operation, "locked");
        node.note_locked(key);
        Ok(())
    }

    fn release_lock(&self, node: &NodeInfo, key: &DataKey) -> Result<()> {
        trace!(node_id = %node.node_id, %key, "releasing lock");
        self.lock_manager.release_lock(&node.locker, key)?;
        node.note_unlocked(key);
        Ok(())
    }

    fn check_locked(&self, node: &NodeInfo, key: &DataKey, for_write: bool) -> Result<()> {
        let owned = self
            .lock_manager
            .get_owners(key)
            .iter()
            .any(|owner| {
                *owner.locker().payload() == node.node_id && (!for_write || owner.for_write())
            });
        if owned {
            Ok(())
        } else {
            Err(consistency_failure(format!(
                "node {} does not hold {key} for {}",
                node.node_id,
                if for_write { "write" } else { "read" }
            )))
        }
    }

    fn get_waiting(&self, key: &DataKey) -> Waiting {
        let waiters = self.lock_manager.get_waiters(key);
        if waiters.is_empty() {
            Waiting::Nobody
        } else if waiters.iter().any(|waiter| waiter.for_write()) {
            Waiting::Writers
        } else {
            Waiting::Readers
        }
    }

    fn lookup_name(&self, name: &str) -> Result<NameLookup> {
        let ceiling = self.storage.ceiling_name(name)?;
        Ok(NameLookup {
            found: ceiling.as_ref().is_some_and(|(bound, _)| bound == name),
            key: BindingKey::from_name_or_last(ceiling.as_ref().map(|(n, _)| n.as_str())),
            oid: ceiling.map(|(_, oid)| oid),
        })
    }

    fn commit(&self, node_id: NodeId, commit: &CommitRequest) -> Result<()> {
        let node = self.update_call_started(node_id)?;
        commit.validate()?;
        debug!(
            %node_id,
            oids = commit.oids.len(),
            new_oids = commit.new_oids,
            names = commit.names.len(),
            "commit"
        );
        let mut attempt = 1;
        loop {
            match self.commit_attempt(&node, commit) {
                Err(e) if e.should_retry() && attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!(%node_id, attempt, %e, "retrying commit");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Locks what the commit creates, then applies it. The storage write guard is never
    /// held while waiting for a lock.
    fn commit_attempt(&self, node: &Arc<NodeInfo>, commit: &CommitRequest) -> Result<()> {
        for oid in &commit.oids[..commit.new_oids] {
            self.lock(node, DataKey::Object(*oid), true, "commit")?;
        }
        // The node holds each name's next key for write, so whether a name is bound
        // cannot change under it
        for (name, value) in commit.names.iter().zip(&commit.name_values) {
            if value.is_some()
                && self
                    .storage
                    .ceiling_name(name)?
                    .is_none_or(|(next, _)| next != *name)
            {
                let key = DataKey::Binding(BindingKey::new(name.as_str()));
                self.lock(node, key, true, "commit")?;
            }
        }

        let mut write = self.storage.write()?;
        for (i, (oid, value)) in commit.oids.iter().zip(&commit.oid_values).enumerate() {
            if i >= commit.new_oids {
                self.check_locked(node, &DataKey::Object(*oid), true)?;
            }
            match value {
                Some(data) => write.put_object(*oid, data.clone()),
                None => write.delete_object(*oid),
            }
        }

        let mut removed = vec![];
        for (name, value) in commit.names.iter().zip(&commit.name_values) {
            let next_name = write.ceiling_name(name).map(|(next, _)| next);
            let bound = next_name.as_deref() == Some(name.as_str());
            let next_key = DataKey::Binding(BindingKey::from_name_or_last(next_name.as_deref()));
            match value {
                Some(oid) => {
                    // Setting a name changes the range covered by the next name
                    self.check_locked(node, &next_key, true)?;
                    if !bound {
                        let key = DataKey::Binding(BindingKey::new(name.as_str()));
                        self.check_locked(node, &key, true)?;
                    }
                    write.put_name(name, *oid);
                }
                None if !bound => self.check_locked(node, &next_key, false)?,
                None => {
                    self.check_locked(node, &next_key, true)?;
                    let after = write.higher_name(name).map(|(next, _)| next);
                    let after = DataKey::Binding(BindingKey::from_name_or_last(after.as_deref()));
                    self.check_locked(node, &after, true)?;
                    write.delete_name(name);
                    removed.push(next_key);
                }
            }
        }
        write.commit()?;

        for key in removed {
            self.release_lock(node, &key)?;
        }
        Ok(())
    }

    fn evict(&self, node_id: NodeId, key: DataKey) -> Result<()> {
        let node = self.update_call_started(node_id)?;
        self.check_locked(&node, &key, false)?;
        debug!(%node_id, %key, "evicted");
        self.release_lock(&node, &key)
    }

    fn downgrade(&self, node_id: NodeId, key: DataKey) -> Result<()> {
        let node = self.update_call_started(node_id)?;
        self.check_locked(&node, &key, true)?;
        debug!(%node_id, %key, "downgraded");
        self.lock_manager.downgrade_lock(&node.locker, &key)?;
        Ok(())
    }

    fn request_callbacks(&self, requester: &Arc<NodeInfo>, key: DataKey, for_write: bool) {
        let request = CallbackRequest {
            requester: Arc::clone(requester),
            key,
            for_write,
        };
        if self.callback_requests.send(request).is_err() {
            debug!("callback threads stopped, dropping callback request");
        }
    }

    fn run_callbacks(&self, requests: &Receiver<CallbackRequest>, stop: &Receiver<()>) {
        loop {
            crossbeam_channel::select! {
                recv(requests) -> request => match request {
                    Ok(request) => self.callback_owners(&request),
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            }
        }
        debug!("callback thread stopped");
    }

    /// Asks each node holding the key, other than the requester, to give it up, once
    /// per grant.
    fn callback_owners(&self, request: &CallbackRequest) {
        let requester = &request.requester;
        for owner in self.lock_manager.get_owners(&request.key) {
            let owner_id = *owner.locker().payload();
            if owner_id == requester.node_id || !owner.note_callback() {
                continue;
            }
            if requester.is_shut_down() {
                debug!(requester = %requester.node_id, key = %request.key, "abandoning callbacks");
                return;
            }
            let Some(owner_node) = self.nodes.get(&owner_id).map(|node| Arc::clone(node.value()))
            else {
                continue;
            };
            let downgrade = owner.for_write() && !request.for_write;
            self.callback(&owner_node, &request.key, downgrade, requester);
        }
    }

    fn callback(
        &self,
        owner: &Arc<NodeInfo>,
        key: &DataKey,
        downgrade: bool,
        requester: &NodeInfo,
    ) {
        let requester_id = requester.node_id;
        debug!(owner = %owner.node_id, requester = %requester_id, %key, downgrade, "callback");
        let result = self.config.retry.run("callback", || {
            if requester.is_shut_down() {
                return Err(Error::ShuttingDown);
            }
            let callback = owner.callback.as_ref();
            match (key, downgrade) {
                (DataKey::Object(oid), true) => {
                    callback.request_downgrade_object(*oid, requester_id)
                }
                (DataKey::Object(oid), false) => callback.request_evict_object(*oid, requester_id),
                (DataKey::Binding(name), true) => {
                    callback.request_downgrade_binding(name, requester_id)
                }
                (DataKey::Binding(name), false) => {
                    callback.request_evict_binding(name, requester_id)
                }
            }
        });
        let released = match result {
            Ok(true) if downgrade => self
                .lock_manager
                .downgrade_lock(&owner.locker, key)
                .map_err(Error::from),
            Ok(true) => self.release_lock(owner, key),
            Ok(false) => {
                trace!(owner = %owner.node_id, %key, "callback accepted, release pending");
                Ok(())
            }
            Err(Error::ShuttingDown) => {
                debug!(owner = %owner.node_id, %key, "callback abandoned");
                Ok(())
            }
            Err(e) if e.is_network() => {
                warn!(owner = %owner.node_id, %key, %e, "node unreachable, shutting it down");
                self.shutdown_node(owner.node_id);
                Ok(())
            }
            Err(e) => Err(e),
        };
        if let Err(e) = released {
            warn!(owner = %owner.node_id, %key, %e, "callback failed");
        }
    }

    fn shutdown_node(&self, node_id: NodeId) {
        let Some(node) = self.nodes.get(&node_id).map(|node| Arc::clone(node.value())) else {
            return;
        };
        if !node.shutdown() {
            return;
        }
        self.nodes.remove(&node_id);
        info!(%node_id, "shutting down node");
        node.queue_server.disconnect();
        node.locker.interrupt();
        node.await_calls_finished();
        let locked = node.take_locked();
        debug!(%node_id, count = locked.len(), "releasing all locks");
        for key in locked {
            if let Err(e) = self.lock_manager.release_lock(&node.locker, &key) {
                warn!(%node_id, %key, %e, "cannot release lock");
            }
        }
    }
}

/// How many times a commit is attempted when locking what it creates times out or
/// deadlocks.
const MAX_COMMIT_ATTEMPTS: usize = 1000;

fn consistency_failure(message: String) -> Error {
    let error = Error::CacheConsistency(message);
    warn!(%error, "cache consistency failure");
    error
}

fn too_many_retries(name: &str) -> Error {
    Error::ResourceExhausted(format!("too many retries locking the range of {name:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use cachestore_api::UpdateRequest;
    use cachestore_queue::{Handled, RequestNumber};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct Releasing;

    impl CallbackServer for Releasing {
        fn request_downgrade_object(&self, _oid: ObjectId, _requester: NodeId) -> Result<bool> {
            Ok(true)
        }

        fn request_evict_object(&self, _oid: ObjectId, _requester: NodeId) -> Result<bool> {
            Ok(true)
        }

        fn request_downgrade_binding(&self, _key: &BindingKey, _requester: NodeId) -> Result<bool> {
            Ok(true)
        }

        fn request_evict_binding(&self, _key: &BindingKey, _requester: NodeId) -> Result<bool> {
            Ok(true)
        }
    }

    fn server() -> CachingServer {
        CachingServer::new(
            ServerConfig {
                lock_timeout: Duration::from_secs(5),
                ..Default::default()
            },
            Arc::new(MemoryStorage::new()),
        )
        .unwrap()
    }

    fn perform(
        server: &CachingServer,
        node_id: NodeId,
        number: u16,
        request: UpdateRequest,
    ) -> Result<()> {
        let queue = server.request_queue_server(node_id).unwrap();
        match queue
            .handle(RequestNumber::new(number).unwrap(), &request)
            .unwrap()
        {
            Handled::Performed(result) => result,
            Handled::Duplicate => panic!("request {number} was a duplicate"),
        }
    }

    fn node(server: &CachingServer, node_id: NodeId) -> Arc<NodeInfo> {
        Arc::clone(server.inner.nodes.get(&node_id).unwrap().value())
    }

    #[test_log::test]
    fn node_ids_come_in_blocks() {
        let server = CachingServer::new(
            ServerConfig {
                node_id_block: 2,
                ..Default::default()
            },
            Arc::new(MemoryStorage::new()),
        )
        .unwrap();
        let ids: Vec<_> = (0..5)
            .map(|_| {
                server
                    .register_node(Arc::new(Releasing))
                    .unwrap()
                    .node_id
                    .as_u64()
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(server.node_count(), 5);
    }

    #[test_log::test]
    fn locks_are_tracked_per_node() {
        let server = server();
        let node_id = server.register_node(Arc::new(Releasing)).unwrap().node_id;
        let oid = server.new_object_ids(1).unwrap();
        perform(
            &server,
            node_id,
            0,
            UpdateRequest::Commit(CommitRequest {
                oids: vec![oid],
                oid_values: vec![Some(Bytes::from_static(&[1, 2, 3]))],
                new_oids: 1,
                ..Default::default()
            }),
        )
        .unwrap();
        assert_eq!(node(&server, node_id).locked_count(), 1);

        server.get_binding(node_id, "alice").unwrap();
        assert_eq!(node(&server, node_id).locked_count(), 2);

        perform(&server, node_id, 1, UpdateRequest::EvictObject(oid)).unwrap();
        perform(&server, node_id, 2, UpdateRequest::EvictBinding(BindingKey::LAST)).unwrap();
        assert_eq!(node(&server, node_id).locked_count(), 0);
    }

    #[test_log::test]
    fn commit_waits_for_locks_without_blocking_reads() {
        let server = server();
        let holder = server.register_node(Arc::new(Pending)).unwrap().node_id;
        let writer = server.register_node(Arc::new(Releasing)).unwrap().node_id;
        let reader = server.register_node(Arc::new(Releasing)).unwrap().node_id;
        let create = |oid, value: &'static [u8]| {
            UpdateRequest::Commit(CommitRequest {
                oids: vec![oid],
                oid_values: vec![Some(Bytes::from_static(value))],
                new_oids: 1,
                ..Default::default()
            })
        };

        let existing = server.new_object_ids(1).unwrap();
        perform(&server, writer, 0, create(existing, b"old")).unwrap();
        perform(&server, writer, 1, UpdateRequest::EvictObject(existing)).unwrap();

        // Reading an object that does not exist yet still locks it
        let created = server.new_object_ids(1).unwrap();
        assert_eq!(server.get_object(holder, created).unwrap(), None);

        std::thread::scope(|scope| {
            let commit = scope.spawn(|| perform(&server, writer, 2, create(created, b"new")));
            std::thread::sleep(Duration::from_millis(50));
            let read = server.get_object(reader, existing).unwrap().unwrap();
            assert_eq!(read.data, Bytes::from_static(b"old"));
            assert!(!commit.is_finished());

            perform(&server, holder, 0, UpdateRequest::EvictObject(created)).unwrap();
            commit.join().unwrap().unwrap();
        });
        let read = server.get_object(reader, created).unwrap().unwrap();
        assert_eq!(read.data, Bytes::from_static(b"new"));
    }

    #[test_log::test]
    fn interrupt_fails_the_next_wait_only() {
        let server = server();
        let a = server.register_node(Arc::new(Releasing)).unwrap().node_id;
        let a_node = node(&server, a);
        let key = DataKey::Object(ObjectId::MIN);
        a_node.locker.interrupt();
        let other = server.register_node(Arc::new(Pending::default())).unwrap().node_id;
        server
            .inner
            .lock(&node(&server, other), key.clone(), true, "test")
            .unwrap();
        let err = server.inner.lock(&a_node, key.clone(), false, "test").unwrap_err();
        assert!(matches!(err, Error::Interrupted(_)), "{err}");

        server.inner.release_lock(&node(&server, other), &key).unwrap();
        server.inner.lock(&a_node, key, false, "test").unwrap();
    }

    #[test_log::test]
    fn shut_down_server_refuses_calls() {
        let server = server();
        let node_id = server.register_node(Arc::new(Releasing)).unwrap().node_id;
        server.shutdown();
        assert_eq!(
            server.get_object(node_id, ObjectId::MIN).unwrap_err(),
            Error::ShuttingDown
        );
        assert_eq!(server.new_object_ids(1).unwrap_err(), Error::ShuttingDown);
        // A second shutdown is harmless
        server.shutdown();
    }

    /// Accepts callbacks but never releases.
    #[derive(Debug, Default)]
    struct Pending;

    impl CallbackServer for Pending {
        fn request_downgrade_object(&self, _oid: ObjectId, _requester: NodeId) -> Result<bool> {
            Ok(false)
        }

        fn request_evict_object(&self, _oid: ObjectId, _requester: NodeId) -> Result<bool> {
            Ok(false)
        }

        fn request_downgrade_binding(&self, _key: &BindingKey, _requester: NodeId) -> Result<bool> {
            Ok(false)
        }

        fn request_evict_binding(&self, _key: &BindingKey, _requester: NodeId) -> Result<bool> {
            Ok(false)
        }
    }
}
