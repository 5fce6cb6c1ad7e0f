//! The interfaces between cache nodes and the caching server: the shared error
//! taxonomy, the calls each side makes of the other, and the requests carried by a
//! node's update queue.

use cachestore_id::{BindingKey, ObjectId};
use std::fmt::{Debug, Display};

mod error;
mod retry;
mod server;
mod update;

pub use error::{Error, ErrorCategory, Result};
pub use retry::RetryPolicy;
pub use server::{
    CallbackServer, DataServer, GetBindingForRemoveResults, GetBindingForUpdateResults,
    GetBindingResults, GetObjectForUpdateResults, GetObjectResults, NextBoundNameResults,
    NextObjectResults, RegisterNodeResult, UpdateQueueEndpoint, UpgradeObjectResults,
    UpdateQueueServer,
};
pub use update::{CommitRequest, UpdateRequest};

/// The key of anything that can be cached and locked.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataKey {
    Object(ObjectId),
    Binding(BindingKey),
}

impl Display for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Object(oid) => write!(f, "object {oid}"),
            Self::Binding(key) => write!(f, "binding {key}"),
        }
    }
}

impl From<ObjectId> for DataKey {
    fn from(oid: ObjectId) -> Self {
        Self::Object(oid)
    }
}

impl From<BindingKey> for DataKey {
    fn from(key: BindingKey) -> Self {
        Self::Binding(key)
    }
}

/// Told about failures that leave a node unable to continue.
pub trait FailureReporter: Debug + Send + Sync + 'static {
    fn report_failure(&self, error: &Error);
}
