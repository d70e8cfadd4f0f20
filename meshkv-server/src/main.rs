use anyhow::{Context, Result};
use clap::Parser;
use meshkv_server::core::store::StoreOptions;
use meshkv_server::{
    KvStore, NodeContext, ReplicationCoordinator, ServerConfig, StoreRegistry, WireServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "meshkv-server", version, about = "Replicated key-value store server")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    info!("Starting MeshKV Server v{}", env!("CARGO_PKG_VERSION"));

    let host_id = config.replication.enabled.then_some(config.replication.host_id);
    let ctx = NodeContext::new(host_id);

    let coordinator = if config.replication.enabled {
        Some(ReplicationCoordinator::new(config.replication.clone())?)
    } else {
        None
    };

    let registry = StoreRegistry::new();
    for store_cfg in &config.stores {
        let store = KvStore::open(
            &store_cfg.name,
            &ctx,
            StoreOptions {
                engine: store_cfg.engine.clone(),
                data_dir: store_cfg.data_dir.clone(),
                replicated: store_cfg.replicated,
                log_capacity: config.replication.log_capacity,
            },
        )
        .with_context(|| format!("opening store {}", store_cfg.name))?;

        if store_cfg.replicated {
            match &coordinator {
                Some(coordinator) => coordinator.register_store(Arc::clone(&store))?,
                None => warn!(
                    store = %store_cfg.name,
                    "store marked replicated but replication is disabled"
                ),
            }
        }
        registry.insert(store);
    }

    if let Some(coordinator) = &coordinator {
        coordinator.start().await?;
    }

    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .context("invalid server address")?;
    let server = WireServer::new(Arc::clone(&registry));
    let bound = server.start(addr).await?;
    info!("Listening on {}", bound);

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    server.shutdown();
    if let Some(coordinator) = &coordinator {
        coordinator.shutdown();
    }

    Ok(())
}
