//! Runs a caching server with in-memory storage.

use anyhow::Context;
use cachestore_api::UpdateQueueEndpoint;
use cachestore_clap_blocks::{logging::LoggingConfig, server::ServerArgs};
use cachestore_queue::{NodeQueues, RequestQueueListener};
use cachestore_server::{CachingServer, MemoryStorage};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    #[clap(flatten)]
    server: ServerArgs,
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    let server_config = config.server.server_config();
    server_config.validate()?;
    let server = Arc::new(
        CachingServer::new(server_config, Arc::new(MemoryStorage::new()))
            .context("starting server")?,
    );
    let listener = RequestQueueListener::bind(
        *config.server.update_queue_bind,
        Arc::clone(&server) as Arc<dyn NodeQueues>,
    )
    .await
    .context("starting update queue listener")?;
    let local_addr = listener.local_addr();
    server.set_update_queue_endpoint(UpdateQueueEndpoint::Tcp(local_addr));
    info!(update_queue = %local_addr, "serving, ctrl-c to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!(nodes = server.node_count(), "stopping");
    listener.shutdown();
    tokio::task::spawn_blocking(move || server.shutdown()).await?;
    Ok(())
}
