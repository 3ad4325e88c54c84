//! Per-shard migration run under a held lease.
//!
//! prepare -> size the next lease from prep time -> open source at the claimed
//! cursor -> write batches to the sink -> checkpoint every few batches ->
//! complete at end of source.
//!
//! Every sink write happens under a lease that was verified fresh first;
//! when renewal reports the lease lost, nothing further is written and the
//! run ends without completing. Per-document and whole-batch sink failures
//! are logged and counted but never stop the shard.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::coordinator::{ClaimedWork, CoordinatorError, WorkCoordinator};
use crate::documents::{
    DocumentRecord, DocumentSink, DocumentSource, PrepareError, ShardPreparer, SinkError,
    SourceError, WriteOutcome,
};
use crate::settings::{FailureLogConfig, PipelineConfig};
use crate::work_item::Cursor;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub batch_size: usize,
    pub checkpoint_every_batches: usize,
    pub failure_log: FailureLogConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for PipelineSettings {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            batch_size: cfg.batch_size.max(1),
            checkpoint_every_batches: cfg.checkpoint_every_batches.max(1),
            failure_log: cfg.failure_log.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationStats {
    pub documents_read: u64,
    pub documents_written: u64,
    pub documents_failed: u64,
    pub batches: u64,
    pub checkpoints: u64,
    pub renewals: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// End of source reached and the item marked COMPLETED.
    Completed(MigrationStats),
    /// Shutdown requested; progress saved and the lease left to expire.
    Yielded { cursor: Cursor, stats: MigrationStats },
    /// Another worker took the item over. `last_checkpoint` is the last
    /// cursor this attempt durably recorded.
    LeaseLost {
        last_checkpoint: Cursor,
        stats: MigrationStats,
    },
}

impl PipelineOutcome {
    pub fn stats(&self) -> &MigrationStats {
        match self {
            PipelineOutcome::Completed(stats) => stats,
            PipelineOutcome::Yielded { stats, .. } => stats,
            PipelineOutcome::LeaseLost { stats, .. } => stats,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Prepare(#[from] PrepareError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

pub struct ShardMigrationPipeline {
    coordinator: Arc<WorkCoordinator>,
    preparer: Arc<dyn ShardPreparer>,
    source: Arc<dyn DocumentSource>,
    sink: Arc<dyn DocumentSink>,
    settings: PipelineSettings,
}

/// Lease lost while the attempt was running.
struct Fenced;

impl ShardMigrationPipeline {
    pub fn new(
        coordinator: Arc<WorkCoordinator>,
        preparer: Arc<dyn ShardPreparer>,
        source: Arc<dyn DocumentSource>,
        sink: Arc<dyn DocumentSink>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            coordinator,
            preparer,
            source,
            sink,
            settings,
        }
    }

    pub fn coordinator(&self) -> &Arc<WorkCoordinator> {
        &self.coordinator
    }

    /// Drive `claimed` until the source is exhausted, shutdown is requested,
    /// or the lease is lost.
    pub async fn run(
        &self,
        mut claimed: ClaimedWork,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let coordinator = &self.coordinator;
        let mut sample = claimed.time_sample();
        let mut stats = MigrationStats::default();

        self.preparer.prepare(&claimed.id).await?;
        sample.record_migration_start(coordinator.clock().now_ms());
        debug!(
            item = %claimed.id,
            prep_ms = sample.shard_prep_time().map(|d| d.as_millis() as u64),
            cursor = %claimed.cursor,
            "shard prepared, streaming documents"
        );

        // Prep time is final now. Store the next exponent right away so a
        // successor benefits even if this attempt dies before a checkpoint.
        let next = coordinator.record_completion(&mut claimed, &sample);
        if next != claimed.exponent {
            if let Err(Fenced) = self.ensure_lease(&mut claimed, &mut stats, true).await {
                return Ok(lease_lost(&claimed, stats));
            }
        }

        // Fused: a short final batch polls once more after the end
        let mut documents = self.source.open(&claimed.id, claimed.cursor).fuse();
        let mut cursor = claimed.cursor;
        let mut batches_since_checkpoint = 0usize;

        loop {
            if *shutdown.borrow() {
                let last_checkpoint = claimed.cursor;
                return match coordinator.release(claimed, cursor).await {
                    Ok(()) => Ok(PipelineOutcome::Yielded { cursor, stats }),
                    Err(CoordinatorError::LeaseLost { .. }) => Ok(PipelineOutcome::LeaseLost {
                        last_checkpoint,
                        stats,
                    }),
                    Err(e) => Err(e.into()),
                };
            }

            let mut batch = Vec::with_capacity(self.settings.batch_size);
            while batch.len() < self.settings.batch_size {
                match documents.next().await {
                    Some(record) => batch.push(record?),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            stats.documents_read += batch.len() as u64;

            match self.ensure_lease(&mut claimed, &mut stats, false).await {
                Ok(()) => {}
                Err(Fenced) => return Ok(lease_lost(&claimed, stats)),
            }

            self.write_batch(&claimed, &batch, &mut stats).await;
            if let Some(last) = batch.last() {
                cursor = cursor.max(last.cursor_after());
            }

            batches_since_checkpoint += 1;
            if batches_since_checkpoint >= self.settings.checkpoint_every_batches {
                match coordinator.checkpoint(&mut claimed, cursor).await {
                    Ok(()) => {
                        stats.checkpoints += 1;
                        batches_since_checkpoint = 0;
                    }
                    Err(CoordinatorError::LeaseLost { .. }) => {
                        return Ok(lease_lost(&claimed, stats));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let id = claimed.id.clone();
        let last_checkpoint = claimed.cursor;
        match coordinator.complete(claimed).await {
            Ok(()) => {
                info!(
                    item = %id,
                    read = stats.documents_read,
                    written = stats.documents_written,
                    failed = stats.documents_failed,
                    batches = stats.batches,
                    "shard migration finished"
                );
                Ok(PipelineOutcome::Completed(stats))
            }
            Err(CoordinatorError::LeaseLost { .. }) => {
                warn!(item = %id, "lease lost before completion could be recorded");
                Ok(PipelineOutcome::LeaseLost {
                    last_checkpoint,
                    stats,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renew if the lease is expired or close to it, or unconditionally with
    /// `force`.
    async fn ensure_lease(
        &self,
        claimed: &mut ClaimedWork,
        stats: &mut MigrationStats,
        force: bool,
    ) -> Result<(), Fenced> {
        if !force && !self.coordinator.needs_renewal(claimed) {
            return Ok(());
        }
        match self.coordinator.renew(claimed).await {
            Ok(_) => {
                stats.renewals += 1;
                Ok(())
            }
            Err(CoordinatorError::LeaseLost { .. }) => Err(Fenced),
            Err(e) => {
                // Without a confirmed lease nothing more may be written.
                warn!(item = %claimed.id, error = %e, "lease renewal failed, abandoning attempt");
                Err(Fenced)
            }
        }
    }

    async fn write_batch(
        &self,
        claimed: &ClaimedWork,
        batch: &[DocumentRecord],
        stats: &mut MigrationStats,
    ) {
        let index = claimed.id.index.as_str();
        stats.batches += 1;
        let outcomes = match self.sink.write(index, batch).await {
            Ok(mut outcomes) => {
                if outcomes.len() < batch.len() {
                    outcomes.resize(
                        batch.len(),
                        WriteOutcome::Failure {
                            reason: "no outcome reported for document".to_string(),
                        },
                    );
                }
                outcomes
            }
            Err(e) => {
                let reason = e.to_string();
                self.log_request_failure(claimed, batch, &e);
                vec![WriteOutcome::Failure { reason }; batch.len()]
            }
        };

        let failed = outcomes.iter().filter(|o| o.is_failure()).count();
        stats.documents_failed += failed as u64;
        stats.documents_written += (batch.len() - failed) as u64;
        if failed > 0 {
            self.log_partial_failure(claimed, batch, &outcomes, failed);
        }
    }

    fn log_request_failure(&self, claimed: &ClaimedWork, batch: &[DocumentRecord], e: &SinkError) {
        warn!(
            index = %claimed.id.index,
            item = %claimed.id,
            failed = batch.len(),
            cause = %e,
            request = %truncate(&request_body(batch), self.settings.failure_log.max_body_chars),
            "bulk request failed; counting whole batch as failed"
        );
    }

    fn log_partial_failure(
        &self,
        claimed: &ClaimedWork,
        batch: &[DocumentRecord],
        outcomes: &[WriteOutcome],
        failed: usize,
    ) {
        let limit = self.settings.failure_log.max_body_chars;
        let failures: Vec<(&DocumentRecord, &str)> = batch
            .iter()
            .zip(outcomes)
            .filter_map(|(record, outcome)| match outcome {
                WriteOutcome::Failure { reason } => Some((record, reason.as_str())),
                WriteOutcome::Success => None,
            })
            .collect();
        let Some((first, cause)) = failures.first() else {
            return;
        };
        let failed_docs: Vec<DocumentRecord> =
            failures.iter().map(|(r, _)| (*r).clone()).collect();
        warn!(
            index = %claimed.id.index,
            item = %claimed.id,
            failed,
            batch_size = batch.len(),
            first_failed_id = %first.id,
            cause = %truncate(cause, limit),
            request = %truncate(&request_body(&failed_docs), limit),
            "documents failed to migrate"
        );
        if self.settings.failure_log.log_each_failure {
            for (record, reason) in &failures {
                warn!(
                    index = %claimed.id.index,
                    doc_id = %record.id,
                    ordinal = record.ordinal,
                    reason = %truncate(reason, limit),
                    "document failed to migrate"
                );
            }
        }
    }
}

fn lease_lost(claimed: &ClaimedWork, stats: MigrationStats) -> PipelineOutcome {
    warn!(
        item = %claimed.id,
        last_checkpoint = %claimed.cursor,
        "lease lost, stopping work on shard"
    );
    PipelineOutcome::LeaseLost {
        last_checkpoint: claimed.cursor,
        stats,
    }
}

/// Newline-delimited JSON bodies, the way they would go over the wire.
fn request_body(batch: &[DocumentRecord]) -> String {
    batch
        .iter()
        .map(|r| r.body.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

/// First `max_chars` characters of `s`, marked when cut.
pub fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...[truncated]", &s[..byte_idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...[truncated]");
        assert_eq!(truncate("abc", 3), "abc");
        assert_eq!(truncate("", 0), "");
    }
}
