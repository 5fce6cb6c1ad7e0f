//! The requests a node makes of the caching server, and the callbacks the server makes
//! of its nodes.

use crate::{Result, update::CommitRequest};
use bytes::Bytes;
use cachestore_id::{BindingKey, ClassId, NodeId, ObjectId};
use std::{fmt::Debug, net::SocketAddr, sync::Arc};

/// How a newly registered node reaches its update queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateQueueEndpoint {
    /// Connect over TCP.
    Tcp(SocketAddr),
    /// The server runs in the same process; requests are handed over directly.
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterNodeResult {
    pub node_id: NodeId,
    pub update_queue: UpdateQueueEndpoint,
}

/// The result of reading an object that exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetObjectResults {
    pub data: Bytes,
    /// Another node is waiting for write access, so the object should be evicted soon.
    pub callback_evict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetObjectForUpdateResults {
    pub data: Bytes,
    pub callback_evict: bool,
    /// Another node is waiting for read access, so the object should be downgraded soon.
    pub callback_downgrade: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeObjectResults {
    pub callback_evict: bool,
    pub callback_downgrade: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextObjectResults {
    pub oid: ObjectId,
    pub data: Bytes,
    pub callback_evict: bool,
}

/// The answer to "is `name` bound?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBindingResults {
    pub found: bool,
    /// The next bound name after the requested one, or LAST. `None` when `found`.
    pub next_key: Option<BindingKey>,
    /// The object bound to the requested name if `found`, otherwise the one bound to
    /// `next_key`, which is `None` for LAST.
    pub oid: Option<ObjectId>,
    pub callback_evict: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBindingForUpdateResults {
    pub found: bool,
    pub next_key: Option<BindingKey>,
    pub oid: Option<ObjectId>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
}

/// The answer to a lookup made before removing `name`. The `next_*` fields describe the
/// bound name that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetBindingForRemoveResults {
    pub found: bool,
    pub next_key: BindingKey,
    /// The object bound to the name, if `found`.
    pub oid: Option<ObjectId>,
    pub callback_evict: bool,
    pub callback_downgrade: bool,
    pub next_oid: Option<ObjectId>,
    pub next_callback_evict: bool,
    pub next_callback_downgrade: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextBoundNameResults {
    /// The first bound name after the requested one, or LAST.
    pub next_key: BindingKey,
    pub oid: Option<ObjectId>,
    pub callback_evict: bool,
}

/// Calls a node makes on the caching server.
///
/// Every call that returns data also grants the calling node a lock on what it read:
/// a read lock for the plain variants and a write lock for the `_for_update` and
/// `_for_remove` variants. Locks are given back through the update queue.
pub trait DataServer: Debug + Send + Sync + 'static {
    /// Registers a node, which the server calls back through `callback`.
    fn register_node(&self, callback: Arc<dyn CallbackServer>) -> Result<RegisterNodeResult>;

    /// Reserves `count` new object ids, returning the first.
    fn new_object_ids(&self, count: u32) -> Result<ObjectId>;

    /// Reads an object. Returns `None` if it does not exist; the read lock is still held.
    fn get_object(&self, node_id: NodeId, oid: ObjectId) -> Result<Option<GetObjectResults>>;

    fn get_object_for_update(
        &self,
        node_id: NodeId,
        oid: ObjectId,
    ) -> Result<Option<GetObjectForUpdateResults>>;

    /// Upgrades a read lock the node already holds to a write lock.
    fn upgrade_object(&self, node_id: NodeId, oid: ObjectId) -> Result<UpgradeObjectResults>;

    /// Returns the first existing object after `oid`, or the first object if `oid` is
    /// `None`.
    fn next_object_id(
        &self,
        node_id: NodeId,
        oid: Option<ObjectId>,
    ) -> Result<Option<NextObjectResults>>;

    fn get_binding(&self, node_id: NodeId, name: &str) -> Result<GetBindingResults>;

    fn get_binding_for_update(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> Result<GetBindingForUpdateResults>;

    fn get_binding_for_remove(
        &self,
        node_id: NodeId,
        name: &str,
    ) -> Result<GetBindingForRemoveResults>;

    /// Returns the first bound name after `name`, or after the start if `name` is `None`.
    fn next_bound_name(&self, node_id: NodeId, name: Option<&str>) -> Result<NextBoundNameResults>;

    /// Returns the id for the class descriptor, registering it if needed.
    fn get_class_id(&self, class_info: &[u8]) -> Result<ClassId>;

    fn get_class_info(&self, class_id: ClassId) -> Result<Option<Bytes>>;
}

/// Requests the server makes of a node holding a lock another node wants.
///
/// Each call returns `true` if the node gave the lock up before returning, and `false`
/// if it will do so later, reporting back through its update queue.
pub trait CallbackServer: Debug + Send + Sync + 'static {
    fn request_downgrade_object(&self, oid: ObjectId, requester: NodeId) -> Result<bool>;

    fn request_evict_object(&self, oid: ObjectId, requester: NodeId) -> Result<bool>;

    fn request_downgrade_binding(&self, key: &BindingKey, requester: NodeId) -> Result<bool>;

    fn request_evict_binding(&self, key: &BindingKey, requester: NodeId) -> Result<bool>;
}

/// Requests that arrive at the server through a node's update queue. Each call fails
/// with [`Error::CacheConsistency`](crate::Error::CacheConsistency) if the node does not
/// hold the lock it is modifying or giving up.
pub trait UpdateQueueServer: Debug + Send + Sync + 'static {
    fn commit(&self, node_id: NodeId, commit: &CommitRequest) -> Result<()>;

    fn evict_object(&self, node_id: NodeId, oid: ObjectId) -> Result<()>;

    fn downgrade_object(&self, node_id: NodeId, oid: ObjectId) -> Result<()>;

    fn evict_binding(&self, node_id: NodeId, key: &BindingKey) -> Result<()>;

    fn downgrade_binding(&self, node_id: NodeId, key: &BindingKey) -> Result<()>;
}
