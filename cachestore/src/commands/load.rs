//! Runs a random object and binding workload on the nodes of an in-process cluster.

use anyhow::Context;
use bytes::Bytes;
use cachestore_api::{DataServer, Error, ErrorCategory, UpdateQueueEndpoint};
use cachestore_clap_blocks::{logging::LoggingConfig, node::NodeArgs, server::ServerArgs};
use cachestore_node::{CachingStore, Transaction};
use cachestore_queue::{NodeQueues, RequestQueueListener};
use cachestore_server::{CachingServer, MemoryStorage};
use rand::Rng;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tracing::{debug, info};

#[derive(Debug, clap::Parser)]
pub(crate) struct Config {
    #[clap(flatten)]
    pub(crate) logging_config: LoggingConfig,

    /// The number of nodes to start.
    #[clap(long = "nodes", env = "CACHESTORE_LOAD_NODES", default_value = "2", action)]
    nodes: usize,

    /// The number of threads running transactions on each node.
    #[clap(
        long = "threads-per-node",
        env = "CACHESTORE_LOAD_THREADS_PER_NODE",
        default_value = "4",
        action
    )]
    threads_per_node: usize,

    /// How long to run.
    #[clap(
        long = "duration",
        env = "CACHESTORE_LOAD_DURATION",
        default_value = "10s",
        value_parser = humantime::parse_duration
    )]
    duration: Duration,

    /// How many distinct names the workload binds.
    #[clap(long = "names", env = "CACHESTORE_LOAD_NAMES", default_value = "100", action)]
    names: usize,

    #[clap(flatten)]
    node: NodeArgs,

    #[clap(flatten)]
    server: ServerArgs,
}

#[derive(Debug, Default)]
struct Counts {
    commits: AtomicU64,
    aborts: AtomicU64,
}

pub(crate) async fn command(config: Config) -> anyhow::Result<()> {
    anyhow::ensure!(config.nodes > 0, "at least one node is needed");
    anyhow::ensure!(config.names > 0, "at least one name is needed");
    let server = Arc::new(
        CachingServer::new(config.server.server_config(), Arc::new(MemoryStorage::new()))
            .context("starting server")?,
    );
    let listener = RequestQueueListener::bind(
        *config.server.update_queue_bind,
        Arc::clone(&server) as Arc<dyn NodeQueues>,
    )
    .await
    .context("starting update queue listener")?;
    server.set_update_queue_endpoint(UpdateQueueEndpoint::Tcp(listener.local_addr()));

    let node_config = config.node.node_config();
    let nodes = {
        let server = Arc::clone(&server);
        let count = config.nodes;
        tokio::task::spawn_blocking(move || {
            (0..count)
                .map(|_| -> Result<_, Error> {
                    let store = CachingStore::new(
                        node_config,
                        Arc::clone(&server) as Arc<dyn DataServer>,
                        None,
                    )?;
                    store.ready()?;
                    Ok(Arc::new(store))
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .await?
        .context("starting nodes")?
    };
    info!(
        nodes = nodes.len(),
        threads_per_node = config.threads_per_node,
        duration = %humantime::format_duration(config.duration),
        "running workload"
    );

    let counts = Arc::new(Counts::default());
    let deadline = Instant::now() + config.duration;
    let mut workers = vec![];
    for store in &nodes {
        for _ in 0..config.threads_per_node {
            let store = Arc::clone(store);
            let counts = Arc::clone(&counts);
            let names = config.names;
            workers.push(tokio::task::spawn_blocking(move || {
                run_worker(&store, &counts, names, deadline)
            }));
        }
    }
    let mut result = Ok(());
    for worker in workers {
        if let Err(e) = worker.await? {
            result = Err(e);
        }
    }

    let commits = counts.commits.load(Ordering::Relaxed);
    let aborts = counts.aborts.load(Ordering::Relaxed);
    println!("commits: {commits}, aborts: {aborts}");
    for store in &nodes {
        let stats = store.cache_stats();
        println!(
            "node {}: {} objects, {} bindings cached",
            store.local_node_id(),
            stats.objects,
            stats.bindings
        );
    }

    tokio::task::spawn_blocking(move || {
        for store in nodes {
            store.shutdown();
        }
        server.shutdown();
    })
    .await?;
    listener.shutdown();
    result.context("workload failed")
}

fn run_worker(
    store: &CachingStore,
    counts: &Counts,
    names: usize,
    deadline: Instant,
) -> Result<(), Error> {
    let mut rng = rand::thread_rng();
    while Instant::now() < deadline {
        let name = format!("name-{}", rng.gen_range(0..names));
        let op = rng.gen_range(0..5);
        let result = store
            .begin()
            .and_then(|mut txn| run_txn(&mut txn, op, &name).and_then(|()| txn.prepare_and_commit()));
        match result {
            Ok(()) => {
                counts.commits.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) if e.category() == ErrorCategory::Fatal => return Err(e),
            Err(Error::ShuttingDown) => return Ok(()),
            Err(e) => {
                debug!(%name, op, %e, "transaction aborted");
                counts.aborts.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    Ok(())
}

fn run_txn(txn: &mut Transaction, op: u32, name: &str) -> Result<(), Error> {
    match op {
        // Bind the name to a new object
        0 => {
            let oid = txn.create_object()?;
            txn.set_object(oid, Bytes::from(format!("{name} @ {}", txn.context_id())))?;
            let previous = txn.set_binding(name, oid)?;
            if let Some(previous) = previous.oid {
                txn.remove_object(previous)?;
            }
        }
        1 => {
            if let Some(oid) = txn.get_binding(name)?.oid {
                txn.get_object(oid)?;
            }
        }
        2 => {
            if let Some(oid) = txn.remove_binding(name)?.oid {
                txn.remove_object(oid)?;
            }
        }
        3 => {
            let mut next = Some(name.to_string());
            for _ in 0..5 {
                next = txn.next_bound_name(next.as_deref())?;
                if next.is_none() {
                    break;
                }
            }
        }
        _ => {
            if let Some(oid) = txn.get_binding(name)?.oid {
                txn.get_object_for_update(oid)?;
                txn.set_object(oid, Bytes::from(format!("{name} @ {}", txn.context_id())))?;
            }
        }
    }
    Ok(())
}
