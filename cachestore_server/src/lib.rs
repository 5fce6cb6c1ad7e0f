//! The caching server: the authority every cache node reads through and commits to.
//!
//! Nodes read objects and bindings with [`DataServer`](cachestore_api::DataServer)
//! calls, each of which grants the node a read or write lock on what it read. When a
//! node asks for a lock another node holds, the server queues the request and asks the
//! holders, through their [`CallbackServer`](cachestore_api::CallbackServer), to evict
//! or downgrade. Nodes send commits and lock releases through their update queue, which
//! the server serves with one [`RequestQueueServer`](cachestore_queue::RequestQueueServer)
//! per node.
//!
//! Bindings are locked with next-key locking: a lookup of an unbound name locks the next
//! bound name (or LAST), which covers the whole gap before it.

use cachestore_api::{Error, Result, RetryPolicy};
use std::time::Duration;

mod node;
mod server;
pub mod storage;

pub use server::CachingServer;
pub use storage::{MemoryStorage, Storage, StorageWrite};

/// The default transaction timeout, from which the default lock timeout is derived.
pub const DEFAULT_TXN_TIMEOUT: Duration = Duration::from_millis(100);

/// The share of the transaction timeout a single lock wait may take.
pub const DEFAULT_LOCK_TIMEOUT_PROPORTION: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerConfig {
    /// The longest a node's request waits for a lock.
    pub lock_timeout: Duration,
    /// The number of separately synchronized maps the lock manager spreads keys over.
    pub num_key_maps: usize,
    /// The number of threads making callbacks to nodes.
    pub callback_threads: usize,
    /// How many node ids to reserve from storage at a time.
    pub node_id_block: u64,
    /// How often to retry locking a binding range that keeps changing.
    pub max_range_lock_retries: usize,
    /// Retries for callbacks that fail with network errors.
    pub retry: RetryPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: lock_timeout_for(DEFAULT_TXN_TIMEOUT),
            num_key_maps: 8,
            callback_threads: 4,
            node_id_block: 100,
            max_range_lock_retries: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_timeout < Duration::from_millis(1) {
            return Err(Error::InvalidArgument(
                "lock timeout must not be less than 1 ms".to_string(),
            ));
        }
        for (value, what) in [
            (self.num_key_maps, "number of key maps"),
            (self.callback_threads, "number of callback threads"),
            (self.node_id_block as usize, "node id block"),
            (self.max_range_lock_retries, "max range lock retries"),
        ] {
            if value < 1 {
                return Err(Error::InvalidArgument(format!(
                    "{what} must not be less than 1"
                )));
            }
        }
        Ok(())
    }
}

/// The lock timeout that goes with a transaction timeout, never less than 1 ms.
pub fn lock_timeout_for(txn_timeout: Duration) -> Duration {
    txn_timeout
        .mul_f64(DEFAULT_LOCK_TIMEOUT_PROPORTION)
        .max(Duration::from_millis(1))
}
