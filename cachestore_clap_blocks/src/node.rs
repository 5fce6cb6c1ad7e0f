//! CLI config for cache nodes.

use cachestore_api::RetryPolicy;
use cachestore_node::{CheckBindings, NodeConfig, lock_timeout_for};
use std::time::Duration;

/// When to check cached bindings for consistency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CheckBindingsArg {
    #[default]
    None,
    Txn,
    Operation,
}

impl From<CheckBindingsArg> for CheckBindings {
    fn from(arg: CheckBindingsArg) -> Self {
        match arg {
            CheckBindingsArg::None => Self::None,
            CheckBindingsArg::Txn => Self::Txn,
            CheckBindingsArg::Operation => Self::Operation,
        }
    }
}

/// CLI config for a cache node.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct NodeArgs {
    /// The number of objects and bindings a node may cache.
    #[clap(
        long = "cache-size",
        env = "CACHESTORE_CACHE_SIZE",
        default_value = "5000",
        action
    )]
    pub cache_size: usize,

    /// How many entries the evictor looks at to pick one to evict.
    #[clap(
        long = "eviction-batch-size",
        env = "CACHESTORE_EVICTION_BATCH_SIZE",
        default_value = "100",
        action
    )]
    pub eviction_batch_size: usize,

    /// How much space the evictor keeps in reserve.
    #[clap(
        long = "eviction-reserve-size",
        env = "CACHESTORE_EVICTION_RESERVE_SIZE",
        default_value = "50",
        action
    )]
    pub eviction_reserve_size: usize,

    /// How long a transaction may run.
    #[clap(
        long = "txn-timeout",
        env = "CACHESTORE_TXN_TIMEOUT",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub txn_timeout: Duration,

    /// The longest a single wait within a transaction may take.
    ///
    /// Defaults to a fifth of the transaction timeout.
    #[clap(
        long = "lock-timeout",
        env = "CACHESTORE_LOCK_TIMEOUT",
        value_parser = humantime::parse_duration
    )]
    pub lock_timeout: Option<Duration>,

    /// How long to keep retrying server calls that fail with network errors.
    #[clap(
        long = "max-retry",
        env = "CACHESTORE_MAX_RETRY",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub max_retry: Duration,

    /// How long to wait between retries.
    #[clap(
        long = "retry-wait",
        env = "CACHESTORE_RETRY_WAIT",
        default_value = "10ms",
        value_parser = humantime::parse_duration
    )]
    pub retry_wait: Duration,

    /// The number of locks protecting cache entries.
    #[clap(
        long = "num-locks",
        env = "CACHESTORE_NUM_LOCKS",
        default_value = "20",
        action
    )]
    pub num_locks: usize,

    /// How many commits may be waiting for the server.
    #[clap(
        long = "update-queue-size",
        env = "CACHESTORE_UPDATE_QUEUE_SIZE",
        default_value = "100",
        action
    )]
    pub update_queue_size: usize,

    /// Threads making server calls for transactions.
    #[clap(
        long = "fetch-threads",
        env = "CACHESTORE_FETCH_THREADS",
        default_value = "8",
        action
    )]
    pub fetch_threads: usize,

    /// Threads evicting and downgrading entries other nodes asked for.
    #[clap(
        long = "task-threads",
        env = "CACHESTORE_TASK_THREADS",
        default_value = "2",
        action
    )]
    pub task_threads: usize,

    /// When to check cached bindings for consistency. Slow.
    #[clap(
        long = "check-bindings",
        env = "CACHESTORE_CHECK_BINDINGS",
        default_value_t = CheckBindingsArg::default(),
        value_enum,
        action
    )]
    pub check_bindings: CheckBindingsArg,
}

impl NodeArgs {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            cache_size: self.cache_size,
            eviction_batch_size: self.eviction_batch_size,
            eviction_reserve_size: self.eviction_reserve_size,
            txn_timeout: self.txn_timeout,
            lock_timeout: self
                .lock_timeout
                .unwrap_or_else(|| lock_timeout_for(self.txn_timeout)),
            retry: RetryPolicy {
                max_retry: self.max_retry,
                retry_wait: self.retry_wait,
            },
            num_locks: self.num_locks,
            update_queue_size: self.update_queue_size,
            fetch_threads: self.fetch_threads,
            task_threads: self.task_threads,
            check_bindings: self.check_bindings.into(),
        }
    }
}
