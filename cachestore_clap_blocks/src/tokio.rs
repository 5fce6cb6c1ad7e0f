//! CLI config for the tokio runtime.

use std::num::NonZeroUsize;

/// CLI config for the tokio runtime running the update queue listener.
#[derive(Debug, Clone, Copy, clap::Parser)]
pub struct TokioConfig {
    /// Set the maximum number of runtime threads to use.
    ///
    /// Defaults to the number of logical cores on the system.
    #[clap(long = "num-threads", env = "CACHESTORE_NUM_THREADS", action)]
    pub num_threads: Option<NonZeroUsize>,
}

impl TokioConfig {
    pub fn builder(&self) -> tokio::runtime::Builder {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("cachestore-io");
        if let Some(num_threads) = self.num_threads {
            builder.worker_threads(num_threads.get());
        }
        builder
    }
}
