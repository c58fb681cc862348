//! Grove Node - multi-group BFT replication.
//!
//! This is the composition root: it owns the stores, the identity, the
//! publish queue and the group manager, and tears them down on shutdown.

use anyhow::Context;
use clap::Parser;
use grove_consensus::{LocalNetwork, Transport};
use grove_node::{init_logging, keys, Cli, GroupManager, NodeConfig, NodeContext, NodeMetrics, StorageBackend};
use grove_pubqueue::PublishQueue;
use grove_storage::{BlockStore, FileStore, GroupStore, MemoryStore, QueueStore};
use grove_types::Identity;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

type Stores = (Arc<dyn BlockStore>, Arc<dyn GroupStore>, Arc<dyn QueueStore>);

/// Opens the block, group and queue stores. Failures here are fatal.
fn open_stores(config: &NodeConfig) -> anyhow::Result<Stores> {
    let queue_dir = config.queue_dir();
    match config.storage {
        StorageBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            let blocks: Arc<dyn BlockStore> = store.clone();
            let groups: Arc<dyn GroupStore> = store.clone();
            let queue: Arc<dyn QueueStore> = store;
            Ok((blocks, groups, queue))
        }
        StorageBackend::File => {
            let chain = Arc::new(
                FileStore::open(config.peer_dir())
                    .with_context(|| format!("opening store at {}", config.peer_dir().display()))?,
            );
            let queue: Arc<dyn QueueStore> = Arc::new(
                FileStore::open(&queue_dir)
                    .with_context(|| format!("opening queue at {}", queue_dir.display()))?,
            );
            let blocks: Arc<dyn BlockStore> = chain.clone();
            let groups: Arc<dyn GroupStore> = chain;
            Ok((blocks, groups, queue))
        }
        #[cfg(feature = "rocksdb-backend")]
        StorageBackend::Rocksdb => {
            let path = config.peer_dir().join("db");
            let chain = Arc::new(
                grove_storage::RocksDbStore::open_default(&path)
                    .with_context(|| format!("opening rocksdb at {}", path.display()))?,
            );
            let queue: Arc<dyn QueueStore> = Arc::new(
                grove_storage::RocksDbStore::open_default(queue_dir.join("db"))
                    .with_context(|| format!("opening queue at {}", queue_dir.display()))?,
            );
            let blocks: Arc<dyn BlockStore> = chain.clone();
            let groups: Arc<dyn GroupStore> = chain;
            Ok((blocks, groups, queue))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn report_health(manager: &GroupManager) {
    for group_id in manager.group_ids() {
        let Some(info) = manager.group_info(&group_id) else {
            continue;
        };
        match info.status {
            Some(status) => info!(
                group_id = %group_id,
                name = %info.group_name,
                running = info.running,
                height = status.height,
                round = status.round,
                state = %status.state,
                health = %status.health,
                pending = status.pending_trxs,
                "Group status"
            ),
            None => warn!(group_id = %group_id, name = %info.group_name, "Group has no engine"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::load(&cli).context("loading configuration")?;

    init_logging(&config.log_filter(), config.json_logs);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        peer = %config.peer_name,
        data_dir = %config.data_dir.display(),
        storage = ?config.storage,
        auto_ack = config.queue.auto_ack,
        "Starting Grove node"
    );

    std::fs::create_dir_all(config.peer_dir())
        .with_context(|| format!("creating {}", config.peer_dir().display()))?;
    let (blocks, groups, queue_store) = open_stores(&config)?;
    let identity = Arc::new(keys::load_or_generate(&config.key_path()).context("loading node key")?);
    let metrics = NodeMetrics::new();
    let queue = PublishQueue::open(queue_store, config.queue.clone(), metrics.queue.clone())
        .context("opening publish queue")?;

    // No peer-to-peer layer is wired in: the node runs on an in-process hub.
    let network = LocalNetwork::new();
    let (endpoint, inbound) = network.register(identity.node_id());
    let transport: Arc<dyn Transport> = Arc::new(endpoint);

    let manager = Arc::new(GroupManager::new(NodeContext {
        node_name: config.peer_name.clone(),
        identity,
        blocks,
        groups,
        transport,
        queue,
        engine_config: config.engine.engine_config(),
        metrics: metrics.clone(),
    }));

    if let Some(dir) = &config.seed_dir {
        if let Err(e) = manager.import_seeds(dir) {
            warn!(dir = %dir.display(), error = %e, "Failed to import seeds");
        }
    }
    manager.load_all_groups().context("loading groups")?;
    manager.start_sync_all_groups();

    let inbound_task = tokio::spawn({
        let manager = manager.clone();
        async move { manager.run_inbound(inbound).await }
    });

    let health_task = (config.health_report_secs > 0).then(|| {
        let manager = manager.clone();
        let period = Duration::from_secs(config.health_report_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                report_health(&manager);
            }
        })
    });

    info!(groups = manager.group_ids().len(), "Node is ready. Press Ctrl+C to stop.");
    shutdown_signal().await;
    info!("Shutting down");

    if let Some(task) = health_task {
        task.abort();
    }
    manager.teardown_all_groups().await;
    network.unregister(&manager.context().identity.node_id());
    inbound_task.abort();

    match metrics.encode() {
        Ok(text) => debug!(metrics = %text, "Final metrics"),
        Err(e) => warn!(error = %e, "Failed to encode metrics"),
    }
    info!("Grove node stopped");
    Ok(())
}
