use cachestore_api::DataKey;
use cachestore_id::NodeId;
use crossbeam_channel::Receiver;
use parking_lot::RwLock;
use std::{
    fmt::Debug,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::{debug, trace, warn};

/// Another node asked for data this node had cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataConflict {
    /// The object or binding the other node wanted.
    pub access_id: DataKey,
    /// The node that wanted it.
    pub node_id: NodeId,
    /// Whether the other node wanted it for update.
    pub for_update: bool,
}

/// Told about each [`DataConflict`], on a thread of its own.
pub trait DataConflictListener: Debug + Send + Sync + 'static {
    fn node_conflict_detected(&self, access_id: &DataKey, node_id: NodeId, for_update: bool);
}

pub(crate) type Listeners = Arc<RwLock<Vec<Arc<dyn DataConflictListener>>>>;

/// Delivers conflicts to the listeners until `stop` is closed or the conflict
/// senders are gone. A listener that panics is logged and skipped.
pub(crate) fn deliver_conflicts(
    conflicts: Receiver<DataConflict>,
    stop: Receiver<()>,
    listeners: Listeners,
) {
    loop {
        crossbeam_channel::select! {
            recv(conflicts) -> conflict => match conflict {
                Ok(conflict) => notify(&conflict, &listeners),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    debug!("data conflict thread stopped");
}

fn notify(conflict: &DataConflict, listeners: &Listeners) {
    let listeners = listeners.read().clone();
    for listener in listeners {
        trace!(access_id = %conflict.access_id, node_id = %conflict.node_id, for_update = conflict.for_update, "notify listener");
        let result = catch_unwind(AssertUnwindSafe(|| {
            listener.node_conflict_detected(&conflict.access_id, conflict.node_id, conflict.for_update)
        }));
        if result.is_err() {
            warn!(?listener, access_id = %conflict.access_id, "data conflict listener panicked");
        }
    }
}
