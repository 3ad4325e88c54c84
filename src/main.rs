use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use shardlease::clock::SystemClock;
use shardlease::coordinator::{CoordinatorSettings, WorkCoordinator};
use shardlease::documents::{DirectorySink, JsonLinesSource, NoopPreparer};
use shardlease::pipeline::{PipelineSettings, ShardMigrationPipeline};
use shardlease::settings::AppConfig;
use shardlease::trace;
use shardlease::work_item_store::open_store;
use shardlease::worker::{ExitReason, WorkerLoop, WorkerSettings};

#[derive(Parser, Debug)]
#[clap(version, about)]
/// Migrate shards from a JSON-lines snapshot directory into a target
/// directory, coordinating with other workers through a shared lease store.
struct Args {
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// root of `<index>/<shard>.jsonl` source files
    #[arg(long = "source-dir")]
    source_dir: PathBuf,

    /// root the migrated documents are written under
    #[arg(long = "target-dir")]
    target_dir: PathBuf,

    /// create a work item for every source shard before working
    #[arg(long)]
    seed: bool,

    /// worker identity recorded on leases; a random UUID when omitted
    #[arg(long = "worker-id")]
    worker_id: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    trace::init(cfg.log_format)?;

    let worker_id = args
        .worker_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let store = open_store(&cfg.store).await?;
    let coordinator = Arc::new(WorkCoordinator::new(
        store,
        Arc::new(SystemClock),
        CoordinatorSettings::from(&cfg.lease),
        worker_id,
    ));

    let source = Arc::new(JsonLinesSource::new(args.source_dir.clone()));
    if args.seed {
        let shards = source.list_shards().await?;
        coordinator.seed(&shards).await?;
    }

    let pipeline = ShardMigrationPipeline::new(
        Arc::clone(&coordinator),
        Arc::new(NoopPreparer),
        source,
        Arc::new(DirectorySink::new(args.target_dir.clone())),
        PipelineSettings::from(&cfg.pipeline),
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested, releasing current work item");
            let _ = shutdown_tx.send(true);
        }
    });

    let worker = WorkerLoop::new(pipeline, WorkerSettings::from(&cfg.worker), shutdown_rx);
    let summary = worker.run().await;
    if summary.exit == ExitReason::MigrationComplete {
        tracing::info!("all work items completed");
    }

    coordinator.store().close().await?;
    Ok(())
}
