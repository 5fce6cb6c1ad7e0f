//! The cache node: a transactional view of the data held by the caching server, kept in
//! a local cache that stays coherent with the caches of every other node.
//!
//! A [`CachingStore`] registers with the server, and [`Transaction`]s read and write
//! objects and name bindings through it. What a transaction reads is fetched from the
//! server on first use, together with a read or write lock that the node keeps for as
//! long as the data stays cached. When another node needs that data, the server calls
//! back and the node evicts or downgrades its copy as soon as no local transaction is
//! using it. Changes reach the server on commit, in transaction order, through the
//! node's update queue.
//!
//! Bindings are cached with next-key information: each binding entry may record that
//! every name between some earlier key and its own is unbound, which lets the node
//! answer lookups of unbound names and iterate over bound names without asking the
//! server.
//!
//! Transactions on the same node are isolated from each other by a local lock manager,
//! with the same next-key scheme for names.

use cachestore_api::{Error, Result, RetryPolicy};
use std::time::Duration;

mod bindings;
mod cache;
mod callbacks;
mod conflicts;
mod entry;
mod evictor;
mod lifecycle;
mod object_ids;
mod objects;
mod reserve;
mod store;
mod txn;
mod workers;

pub use bindings::BindingValue;
pub use conflicts::{DataConflict, DataConflictListener};
pub use store::{CacheStats, CachingStore};
pub use txn::{Transaction, TxnInterrupter};

/// The smallest cache a node may have.
pub const MIN_CACHE_SIZE: usize = 1000;

/// The default transaction timeout.
pub const DEFAULT_TXN_TIMEOUT: Duration = Duration::from_millis(100);

/// The share of the transaction timeout a single wait may take.
pub const DEFAULT_LOCK_TIMEOUT_PROPORTION: f64 = 0.2;

/// Returns the lock timeout for transactions with the given timeout.
pub fn lock_timeout_for(txn_timeout: Duration) -> Duration {
    txn_timeout
        .mul_f64(DEFAULT_LOCK_TIMEOUT_PROPORTION)
        .max(Duration::from_millis(1))
}

/// When to check the consistency of cached bindings. Checking is slow, and meant for
/// tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum CheckBindings {
    #[default]
    None,
    /// After every transaction.
    Txn,
    /// After every binding operation, and every transaction.
    Operation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeConfig {
    /// The number of objects and bindings the cache may hold.
    pub cache_size: usize,
    /// How many entries the evictor looks at to pick one to evict.
    pub eviction_batch_size: usize,
    /// How much space the evictor keeps in reserve, and starts evicting once it runs out
    /// of.
    pub eviction_reserve_size: usize,
    /// How long a transaction may run.
    pub txn_timeout: Duration,
    /// The longest a single wait within a transaction may take.
    pub lock_timeout: Duration,
    pub retry: RetryPolicy,
    /// The number of locks protecting cache entries.
    pub num_locks: usize,
    /// How many commits may be waiting for the server.
    pub update_queue_size: usize,
    /// Threads making calls to the server on behalf of transactions.
    pub fetch_threads: usize,
    /// Threads evicting and downgrading entries the server asked for.
    pub task_threads: usize,
    pub check_bindings: CheckBindings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            cache_size: 5000,
            eviction_batch_size: 100,
            eviction_reserve_size: 50,
            txn_timeout: DEFAULT_TXN_TIMEOUT,
            lock_timeout: lock_timeout_for(DEFAULT_TXN_TIMEOUT),
            retry: RetryPolicy::default(),
            num_locks: 20,
            update_queue_size: 100,
            fetch_threads: 8,
            task_threads: 2,
            check_bindings: CheckBindings::None,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cache_size < MIN_CACHE_SIZE {
            return Err(Error::InvalidArgument(format!(
                "cache size must not be less than {MIN_CACHE_SIZE}, got {}",
                self.cache_size
            )));
        }
        if self.eviction_reserve_size < 1 || self.eviction_reserve_size * 2 > self.cache_size {
            return Err(Error::InvalidArgument(format!(
                "eviction reserve size must be between 1 and half the cache size, got {}",
                self.eviction_reserve_size
            )));
        }
        for (value, what) in [
            (self.eviction_batch_size, "eviction batch size"),
            (self.num_locks, "number of locks"),
            (self.update_queue_size, "update queue size"),
            (self.fetch_threads, "number of fetch threads"),
            (self.task_threads, "number of task threads"),
        ] {
            if value < 1 {
                return Err(Error::InvalidArgument(format!(
                    "{what} must not be less than 1"
                )));
            }
        }
        for (value, what) in [
            (self.txn_timeout, "transaction timeout"),
            (self.lock_timeout, "lock timeout"),
            (self.retry.max_retry, "max retry"),
            (self.retry.retry_wait, "retry wait"),
        ] {
            if value < Duration::from_millis(1) {
                return Err(Error::InvalidArgument(format!(
                    "{what} must not be less than 1 ms"
                )));
            }
        }
        Ok(())
    }
}
