//! CLI config for the caching server.

use crate::socket_addr::SocketAddr;
use cachestore_api::RetryPolicy;
use cachestore_server::{ServerConfig, lock_timeout_for};
use std::time::Duration;

/// CLI config for the caching server.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct ServerArgs {
    /// The address nodes connect to for their update queues. The host may be a name,
    /// resolved at startup.
    #[clap(
        long = "update-queue-bind",
        env = "CACHESTORE_UPDATE_QUEUE_BIND",
        default_value = "127.0.0.1:0",
        action
    )]
    pub update_queue_bind: SocketAddr,

    /// The transaction timeout of the nodes, from which the lock timeout is derived.
    #[clap(
        id = "server_txn_timeout",
        long = "server-txn-timeout",
        env = "CACHESTORE_SERVER_TXN_TIMEOUT",
        default_value = "100ms",
        value_parser = humantime::parse_duration
    )]
    pub txn_timeout: Duration,

    /// The longest a node's request waits for a lock. Overrides the derived timeout.
    #[clap(
        id = "server_lock_timeout",
        long = "server-lock-timeout",
        env = "CACHESTORE_SERVER_LOCK_TIMEOUT",
        value_parser = humantime::parse_duration
    )]
    pub lock_timeout: Option<Duration>,

    /// The number of maps the lock manager spreads keys over.
    #[clap(
        long = "num-key-maps",
        env = "CACHESTORE_NUM_KEY_MAPS",
        default_value = "8",
        action
    )]
    pub num_key_maps: usize,

    /// The number of threads making callbacks to nodes.
    #[clap(
        long = "callback-threads",
        env = "CACHESTORE_CALLBACK_THREADS",
        default_value = "4",
        action
    )]
    pub callback_threads: usize,

    /// How many node ids to allocate at a time.
    #[clap(
        long = "node-id-block",
        env = "CACHESTORE_NODE_ID_BLOCK",
        default_value = "100",
        action
    )]
    pub node_id_block: u64,

    /// How often to retry locking a range of names that keeps changing.
    #[clap(
        long = "max-range-lock-retries",
        env = "CACHESTORE_MAX_RANGE_LOCK_RETRIES",
        default_value = "100",
        action
    )]
    pub max_range_lock_retries: usize,

    /// How long to keep retrying callbacks that fail with network errors.
    #[clap(
        long = "callback-max-retry",
        env = "CACHESTORE_CALLBACK_MAX_RETRY",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub callback_max_retry: Duration,

    /// How long to wait between callback retries.
    #[clap(
        long = "callback-retry-wait",
        env = "CACHESTORE_CALLBACK_RETRY_WAIT",
        default_value = "10ms",
        value_parser = humantime::parse_duration
    )]
    pub callback_retry_wait: Duration,
}

impl ServerArgs {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            lock_timeout: self
                .lock_timeout
                .unwrap_or_else(|| lock_timeout_for(self.txn_timeout)),
            num_key_maps: self.num_key_maps,
            callback_threads: self.callback_threads,
            node_id_block: self.node_id_block,
            max_range_lock_retries: self.max_range_lock_retries,
            retry: RetryPolicy {
                max_retry: self.callback_max_retry,
                retry_wait: self.callback_retry_wait,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_match_server_defaults() {
        let args = ServerArgs::try_parse_from(["server"]).unwrap();
        assert_eq!(args.server_config(), ServerConfig::default());
        assert_eq!(*args.update_queue_bind, std::net::SocketAddr::from(([127, 0, 0, 1], 0)));
    }

    #[test]
    fn overrides() {
        let args = ServerArgs::try_parse_from([
            "server",
            "--update-queue-bind",
            "127.0.0.1:7000",
            "--server-lock-timeout",
            "2s",
            "--callback-threads",
            "1",
        ])
        .unwrap();
        let config = args.server_config();
        assert_eq!(config.lock_timeout, Duration::from_secs(2));
        assert_eq!(config.callback_threads, 1);
        assert_eq!(args.update_queue_bind.port(), 7000);

        let args =
            ServerArgs::try_parse_from(["server", "--update-queue-bind", "localhost:7001"]).unwrap();
        assert!(args.update_queue_bind.ip().is_loopback());
        assert_eq!(args.update_queue_bind.port(), 7001);
    }
}
