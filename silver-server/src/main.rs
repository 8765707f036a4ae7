mod config;
use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use silver_core::{CoordinationBuilder, DiscoveryCache, StorageGateway};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "silver")]
#[command(about = "Shard routing and cluster metadata for an embedded key-value store")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node: follow cluster metadata and serve the local data files
    Server {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "silver=info,silver_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config } => {
            tracing::info!("Starting Silver with config: {}", config);

            let cfg = match Config::from_file(&config) {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    std::process::exit(1);
                }
            };

            if let Err(e) = run(cfg).await {
                tracing::error!("Server error: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let store = CoordinationBuilder::new()
        .backend(cfg.coordination.backend.as_str())
        .etcd_endpoints(cfg.coordination.endpoints.clone())
        .dial_timeout(cfg.coordination.dial_timeout())
        .build()
        .await
        .context("failed to connect to the coordination store")?;

    let discovery = DiscoveryCache::initialize_with_options(
        store,
        cfg.coordination.metadata_prefix.clone(),
        cfg.coordination.node_prefix.clone(),
        cfg.discovery.options(),
    )
    .await
    .context("failed to initialize discovery cache")?;

    let directories = cfg.storage.directories.clone();
    let gateway = tokio::task::spawn_blocking(move || StorageGateway::open(directories))
        .await
        .context("storage open task panicked")?
        .context("failed to open storage gateway")?;

    tracing::info!(
        "Silver ready: {} tables, {} clusters, {} databases",
        discovery.tables().len(),
        discovery.addresses().len(),
        gateway.index().bindings().len()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");

    discovery.shutdown().await;
    gateway.close();

    let stats = gateway.stats();
    tracing::info!(
        "Silver stopped: {} entries added, {} removed this run",
        stats.added,
        stats.removed
    );
    Ok(())
}
