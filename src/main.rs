use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pastel_gateway::alert::LogAlertSink;
use pastel_gateway::burnpool::BurnPool;
use pastel_gateway::config::GatewayConfig;
use pastel_gateway::error::{GatewayError, Result};
use pastel_gateway::finisher::Finisher;
use pastel_gateway::pipeline::queue::PipelineQueue;
use pastel_gateway::pipeline::PipelineCtx;
use pastel_gateway::reprocessor::ReProcessor;
use pastel_gateway::rpc::{PastelRpc, RpcConfig};
use pastel_gateway::secrets::EnvSecretStore;
use pastel_gateway::state::Database;
use pastel_gateway::storage::ipfs::{IpfsConfig, IpfsStore};
use pastel_gateway::storage::local::LocalCache;
use pastel_gateway::storage::pinner::RemotePinner;
use pastel_gateway::walletnode::WalletNodeClient;

#[derive(Parser)]
#[command(name = "pastel-gateway")]
#[command(about = "Asynchronous registration gateway for the Pastel network")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, default_value = "gateway.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline workers and control loops
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
}

fn rpc_config(config: &GatewayConfig) -> RpcConfig {
    RpcConfig {
        url: config.rpc_url.clone(),
        username: std::env::var("PASTEL_RPC_USER").unwrap_or_default(),
        password: std::env::var("PASTEL_RPC_PASSWORD").unwrap_or_default(),
    }
}

async fn build_ctx(config: GatewayConfig) -> Result<PipelineCtx> {
    let db = Database::connect(&config.database_url).await?;
    let rpc = PastelRpc::new(rpc_config(&config));
    let wn = WalletNodeClient::new(config.walletnode_url.clone());
    let blobs = Arc::new(IpfsStore::new(IpfsConfig {
        api_url: config.ipfs_api_url.clone(),
    }));
    let cache = LocalCache::new(config.local_cache_dir.clone());
    let pinner = Arc::new(RemotePinner::new(config.pinner_url.clone()));
    let burn_pool = Arc::new(BurnPool::new(&db, rpc.clone(), &config));
    let secrets = Arc::new(EnvSecretStore::new(&config.pastel_id)?);

    Ok(PipelineCtx {
        db,
        rpc,
        wn,
        blobs,
        cache,
        pinner,
        burn_pool,
        secrets,
        alerts: Arc::new(LogAlertSink),
        config: Arc::new(config),
    })
}

/// Run the fee pre-burner: reconcile the pool with the chain, then top
/// up the configured tiers.
async fn fee_pre_burner_loop(ctx: PipelineCtx) {
    let mut ticker = tokio::time::interval(ctx.config.fee_pre_burner_interval());
    loop {
        ticker.tick().await;
        if let Err(e) = ctx.burn_pool.reconcile().await {
            warn!(error = %e, "burn pool reconcile failed");
        }
        if let Err(e) = ctx.burn_pool.prewarm(ctx.alerts.as_ref()).await {
            warn!(error = %e, "burn pool prewarm failed");
        }
    }
}

async fn serve(config: GatewayConfig) -> Result<()> {
    config.check_loops_allowed()?;

    let ctx = build_ctx(config).await?;
    ctx.db.migrate().await?;

    let (queue, workers) = PipelineQueue::start(
        ctx.clone(),
        ctx.config.worker_count,
        ctx.config.queue_depth,
    );

    // Advisory locks make each loop a singleton across gateway
    // instances sharing the database. A lock someone else holds means
    // that instance runs the loop; we only run the workers.
    let mut loops = Vec::new();

    match ctx.db.try_loop_lock("finisher").await? {
        Some(lock) => {
            let finisher = Finisher::new(ctx.clone());
            loops.push(tokio::spawn(async move {
                let _lock = lock;
                finisher.run().await;
            }));
        }
        None => info!("finisher lock is held elsewhere, skipping"),
    }

    match ctx.db.try_loop_lock("re_processor").await? {
        Some(lock) => {
            let reprocessor = ReProcessor::new(ctx.clone(), queue.clone());
            loops.push(tokio::spawn(async move {
                let _lock = lock;
                reprocessor.run().await;
            }));
        }
        None => info!("re-processor lock is held elsewhere, skipping"),
    }

    match ctx.db.try_loop_lock("fee_pre_burner").await? {
        Some(lock) => {
            let loop_ctx = ctx.clone();
            loops.push(tokio::spawn(async move {
                let _lock = lock;
                fee_pre_burner_loop(loop_ctx).await;
            }));
        }
        None => info!("fee pre-burner lock is held elsewhere, skipping"),
    }

    info!(
        workers = ctx.config.worker_count,
        loops = loops.len(),
        "gateway is running"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(GatewayError::Io)?;
    info!("shutdown signal received");

    drop(queue);
    for worker in workers {
        worker.abort();
    }
    for task in loops {
        task.abort();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::load(&cli.config)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Migrate => {
            let db = Database::connect(&config.database_url).await?;
            db.migrate().await?;
            info!("migrations applied");
            Ok(())
        }
    }
}
