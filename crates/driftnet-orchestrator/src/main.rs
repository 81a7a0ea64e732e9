use anyhow::Result;
use clap::Parser;
use driftnet_orchestrator::{OrchestratorConfig, OrchestratorService};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "driftnet-orchestrator")]
#[command(about = "Driftnet crawl orchestration service")]
struct Args {
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost:5432/driftnet"
    )]
    database_url: String,

    /// Consumer-group name shared by all orchestrator replicas.
    #[arg(long, env = "DRIFTNET_GROUP", default_value = "driftnet")]
    group: String,

    /// Concurrent message handlers per stream.
    #[arg(long, env = "DRIFTNET_CONCURRENCY", default_value = "8")]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    let args = Args::parse();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        redis_url = %args.redis_url,
        group = %args.group,
        concurrency = args.concurrency,
        "starting driftnet orchestrator"
    );

    let mut config = OrchestratorConfig::default();
    config.redis_url = args.redis_url;
    config.database_url = args.database_url;
    config.consumer.group = args.group;
    config.consumer.max_concurrency = args.concurrency;

    let mut service = OrchestratorService::new(config).await?;
    service.start().await?;

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for Ctrl+C");
    tracing::info!("shutdown signal received");

    service.stop().await;
    tracing::info!("driftnet orchestrator shutdown complete");
    Ok(())
}
