//! Top-level driver: claim an item, migrate it, repeat until every item is
//! completed or the worker is told to stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::coordinator::{AcquireOutcome, CoordinatorError, MigrationProgress, WorkCoordinator};
use crate::pipeline::{PipelineError, PipelineOutcome, ShardMigrationPipeline};
use crate::settings::WorkerConfig;
use crate::work_item::WorkItemId;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error("migrating {id} failed: {source}")]
    Pipeline {
        id: WorkItemId,
        #[source]
        source: PipelineError,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_backoff: Duration,
    pub max_idle_cycles: Option<u32>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerSettings {
    fn from(cfg: &WorkerConfig) -> Self {
        Self {
            idle_backoff: Duration::from_millis(cfg.idle_backoff_ms),
            max_idle_cycles: cfg.max_idle_cycles,
        }
    }
}

/// What a single cycle did.
#[derive(Debug)]
pub enum CycleOutcome {
    /// An item was claimed and run through the pipeline.
    Processed {
        id: WorkItemId,
        outcome: PipelineOutcome,
    },
    /// Nothing claimable right now, but other workers still hold items.
    Idle(MigrationProgress),
    /// Every item in the store is completed.
    MigrationComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    MigrationComplete,
    Shutdown,
    IdleLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub exit: ExitReason,
    pub cycles: u64,
    pub completed: u64,
    pub yielded: u64,
    pub lease_lost: u64,
    pub failed_cycles: u64,
    pub idle_cycles: u64,
    pub documents_written: u64,
    pub documents_failed: u64,
}

impl WorkerSummary {
    fn new() -> Self {
        Self {
            exit: ExitReason::Shutdown,
            cycles: 0,
            completed: 0,
            yielded: 0,
            lease_lost: 0,
            failed_cycles: 0,
            idle_cycles: 0,
            documents_written: 0,
            documents_failed: 0,
        }
    }
}

pub struct WorkerLoop {
    pipeline: ShardMigrationPipeline,
    settings: WorkerSettings,
    shutdown: watch::Receiver<bool>,
}

impl WorkerLoop {
    pub fn new(
        pipeline: ShardMigrationPipeline,
        settings: WorkerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pipeline,
            settings,
            shutdown,
        }
    }

    fn coordinator(&self) -> &Arc<WorkCoordinator> {
        self.pipeline.coordinator()
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// One claim-and-migrate cycle.
    pub async fn run_once(&self) -> Result<CycleOutcome, WorkerError> {
        let coordinator = self.coordinator();
        match coordinator.acquire_next_item().await? {
            AcquireOutcome::Acquired(claimed) => {
                let id = claimed.id.clone();
                let outcome = self
                    .pipeline
                    .run(claimed, &self.shutdown)
                    .await
                    .map_err(|source| WorkerError::Pipeline {
                        id: id.clone(),
                        source,
                    })?;
                Ok(CycleOutcome::Processed { id, outcome })
            }
            AcquireOutcome::NoWorkAvailable => {
                let progress = coordinator.progress().await?;
                if progress.is_complete() {
                    Ok(CycleOutcome::MigrationComplete)
                } else {
                    Ok(CycleOutcome::Idle(progress))
                }
            }
        }
    }

    /// Run cycles until the migration is complete, shutdown is signalled, or
    /// the idle limit is reached.
    pub async fn run(&self) -> WorkerSummary {
        let worker = self.coordinator().worker_id().to_string();
        let mut summary = WorkerSummary::new();
        let mut consecutive_idle = 0u32;
        info!(worker = %worker, "worker started");

        loop {
            if self.is_shutdown() {
                summary.exit = ExitReason::Shutdown;
                break;
            }
            summary.cycles += 1;
            match self.run_once().await {
                Ok(CycleOutcome::Processed { id, outcome }) => {
                    consecutive_idle = 0;
                    let stats = outcome.stats();
                    summary.documents_written += stats.documents_written;
                    summary.documents_failed += stats.documents_failed;
                    match outcome {
                        PipelineOutcome::Completed(_) => summary.completed += 1,
                        PipelineOutcome::Yielded { cursor, .. } => {
                            summary.yielded += 1;
                            info!(
                                worker = %worker,
                                item = %id,
                                cursor = %cursor,
                                "yielded work item"
                            );
                        }
                        PipelineOutcome::LeaseLost { .. } => summary.lease_lost += 1,
                    }
                }
                Ok(CycleOutcome::Idle(progress)) => {
                    summary.idle_cycles += 1;
                    consecutive_idle += 1;
                    debug!(
                        worker = %worker,
                        remaining = progress.remaining(),
                        claimed = progress.claimed,
                        "no claimable work items, waiting"
                    );
                    if self
                        .settings
                        .max_idle_cycles
                        .is_some_and(|max| consecutive_idle >= max)
                    {
                        summary.exit = ExitReason::IdleLimit;
                        break;
                    }
                    self.wait_idle().await;
                }
                Ok(CycleOutcome::MigrationComplete) => {
                    summary.exit = ExitReason::MigrationComplete;
                    break;
                }
                Err(e) => {
                    summary.failed_cycles += 1;
                    consecutive_idle = 0;
                    warn!(worker = %worker, error = %e, "work cycle failed, moving on");
                    self.wait_idle().await;
                }
            }
        }

        info!(
            worker = %worker,
            exit = ?summary.exit,
            cycles = summary.cycles,
            completed = summary.completed,
            failed_cycles = summary.failed_cycles,
            documents_written = summary.documents_written,
            documents_failed = summary.documents_failed,
            "worker stopped"
        );
        summary
    }

    /// Sleep for the idle backoff, waking early on shutdown.
    async fn wait_idle(&self) {
        if self.is_shutdown() {
            return;
        }
        let mut shutdown_rx = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.idle_backoff) => {}
            res = shutdown_rx.wait_for(|stop| *stop) => {
                // Sender dropped; shutdown can no longer be signalled.
                if res.is_err() {
                    tokio::time::sleep(self.settings.idle_backoff).await;
                }
            }
        }
    }
}
