use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ceramic_anchor_service::blockchain::{BlockchainClient, DevBlockchain};
use ceramic_anchor_service::config::{load_config, BlockchainKind};
use ceramic_anchor_service::ipfs::{IpldStore, MemoryIpldStore};
use ceramic_anchor_service::server;
use ceramic_anchor_service::shutdown::Shutdown;
use ceramic_anchor_service::task_monitor::TaskMonitor;
use ceramic_anchor_service::App;

#[derive(Debug, Parser)]
#[command(version, about = "Ceramic anchor service")]
struct Args {
    /// Path to a TOML config file; CAS__* environment variables override it.
    #[arg(short, long, env = "CAS_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config(args.config.as_deref())?;

    info!(
        service = config.service.service_name,
        scheduler_id = config.app.scheduler_id,
        "starting anchor service"
    );

    let shutdown = Shutdown::spawn();

    // Deployment glue: the block store and chain client are external
    // collaborators; only the local flavors are built in.
    let ipfs: Arc<dyn IpldStore> = Arc::new(MemoryIpldStore::new());
    let blockchain: Arc<dyn BlockchainClient> = match config.blockchain.kind {
        BlockchainKind::Dev => Arc::new(DevBlockchain::new(config.blockchain.chain_id.clone())),
    };

    let app = App::new(config.clone(), ipfs, blockchain, None).await?;

    TaskMonitor::init(app.clone(), shutdown.clone()).await;

    server::run(app, config.server.clone(), shutdown.clone()).await?;

    // The server only returns once shutdown has begun; give cancelled tasks
    // a moment to reach an await point before the process exits.
    shutdown.shutdown();
    tokio::time::sleep(config.app.shutdown_delay).await;

    info!("Program terminating normally");
    Ok(())
}
