//! Claim, renew, checkpoint and complete work items on behalf of one worker.
//!
//! Mutual exclusion comes entirely from the store's version-conditioned
//! writes. Any conditional write that loses its version check means another
//! worker is now authoritative for the item; it is reported as
//! `CoordinatorError::LeaseLost` and the caller must stop touching the target
//! for that item.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{Clock, duration_ms};
use crate::lease_timing::{MAX_EXPONENT, WorkItemTimeSample, lease_duration, next_exponent};
use crate::retry::{RetryPolicy, retry_transient};
use crate::settings::LeaseConfig;
use crate::work_item::{Cursor, LeaseGrant, WorkItem, WorkItemId, WorkItemStatus};
use crate::work_item_store::{StoreError, WorkItemStore};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// Another worker reclaimed the item; this attempt must stop.
    #[error("lease lost on work item {id} during {op}")]
    LeaseLost { id: String, op: &'static str },
    /// Transient failures outlasted the retry policy.
    #[error("coordination store unavailable during {op}: {source}")]
    StoreUnavailable {
        op: &'static str,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub base_lease: Duration,
    /// Renew once less than this fraction of the lease remains.
    pub renew_margin: f64,
    pub scan_page_size: usize,
    /// Exponent written into items created by `seed`.
    pub initial_exponent: u32,
    pub store_retry: RetryPolicy,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&LeaseConfig::default())
    }
}

impl From<&LeaseConfig> for CoordinatorSettings {
    fn from(cfg: &LeaseConfig) -> Self {
        Self {
            base_lease: cfg.base_lease(),
            renew_margin: cfg.renew_margin,
            scan_page_size: cfg.scan_page_size,
            initial_exponent: cfg.initial_lease_exponent.min(MAX_EXPONENT),
            store_retry: cfg.store_retry.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
    /// Length of every grant and renewal under this claim.
    pub duration: Duration,
}

/// A work item this worker currently believes it holds.
#[derive(Debug, Clone)]
pub struct ClaimedWork {
    pub id: WorkItemId,
    /// Version token of our last successful write.
    pub version: u64,
    pub lease: Lease,
    /// Exponent the lease was sized with.
    pub exponent: u32,
    /// Where the previous holders got to; resume from here.
    pub cursor: Cursor,
    pub num_attempts: u32,
    /// Decided by `record_completion`, written by the next persisted update.
    pending_exponent: Option<u32>,
}

impl ClaimedWork {
    fn from_claimed_item(item: WorkItem, duration: Duration) -> Self {
        Self {
            lease: Lease {
                acquired_at_ms: item.lease_acquisition_ms,
                expires_at_ms: item.lease_expiration_ms,
                duration,
            },
            exponent: item.next_acquisition_lease_exponent,
            cursor: item.cursor,
            num_attempts: item.num_attempts,
            version: item.version,
            id: item.id,
            pending_exponent: None,
        }
    }

    /// A fresh timing sample for this attempt.
    pub fn time_sample(&self) -> WorkItemTimeSample {
        WorkItemTimeSample::new(self.lease.acquired_at_ms)
    }

    /// The exponent the next write stores for whoever claims the item next.
    pub fn next_exponent(&self) -> u32 {
        self.pending_exponent.unwrap_or(self.exponent)
    }
}

#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(ClaimedWork),
    NoWorkAvailable,
}

/// Store-wide tally, from a full scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationProgress {
    pub total: usize,
    pub unclaimed: usize,
    pub claimed: usize,
    pub completed: usize,
}

impl MigrationProgress {
    pub fn remaining(&self) -> usize {
        self.total - self.completed
    }

    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }
}

pub struct WorkCoordinator {
    store: Arc<dyn WorkItemStore>,
    clock: Arc<dyn Clock>,
    settings: CoordinatorSettings,
    worker_id: String,
}

impl WorkCoordinator {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        clock: Arc<dyn Clock>,
        settings: CoordinatorSettings,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            settings,
            worker_id: worker_id.into(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn WorkItemStore> {
        &self.store
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Seed one unclaimed item per id. Returns how many were newly created.
    pub async fn seed<'a, I>(&self, ids: I) -> Result<usize, CoordinatorError>
    where
        I: IntoIterator<Item = &'a WorkItemId>,
    {
        let initial_exponent = self.settings.initial_exponent;
        let mut created = 0;
        for id in ids {
            let was_created = self
                .retrying("create_unassigned", || {
                    self.store.create_unassigned(id, initial_exponent)
                })
                .await?;
            if was_created {
                created += 1;
            }
        }
        info!(worker = %self.worker_id, created, initial_exponent, "seeded work items");
        Ok(created)
    }

    /// Claim the first claimable item, leasing it for `base_lease * 2^exponent`
    /// with the base from settings.
    pub async fn acquire_next_item(&self) -> Result<AcquireOutcome, CoordinatorError> {
        self.acquire_next_item_with(self.settings.base_lease).await
    }

    /// Scan claimable items page by page and try each until one claim sticks.
    /// Losing a race just moves on to the next candidate.
    pub async fn acquire_next_item_with(
        &self,
        base_lease: Duration,
    ) -> Result<AcquireOutcome, CoordinatorError> {
        let mut after: Option<WorkItemId> = None;
        loop {
            let now_ms = self.clock.now_ms();
            let page = self
                .retrying("list_unclaimed_or_expired", || {
                    self.store.list_unclaimed_or_expired(
                        now_ms,
                        after.as_ref(),
                        self.settings.scan_page_size,
                    )
                })
                .await?;

            for candidate in &page.items {
                match self.try_claim_candidate(candidate, base_lease).await {
                    Ok(claimed) => return Ok(AcquireOutcome::Acquired(claimed)),
                    Err(CoordinatorError::Store(e))
                        if e.is_conflict() || matches!(e, StoreError::InvalidState { .. }) =>
                    {
                        debug!(
                            worker = %self.worker_id,
                            item = %candidate.id,
                            "lost claim race, trying next candidate"
                        );
                    }
                    Err(CoordinatorError::Store(e)) => {
                        warn!(
                            worker = %self.worker_id,
                            item = %candidate.id,
                            error = %e,
                            "skipping work item that could not be claimed"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            match page.next {
                Some(next) => after = Some(next),
                None => return Ok(AcquireOutcome::NoWorkAvailable),
            }
        }
    }

    async fn try_claim_candidate(
        &self,
        candidate: &WorkItem,
        base_lease: Duration,
    ) -> Result<ClaimedWork, CoordinatorError> {
        let exponent = candidate.next_acquisition_lease_exponent;
        let duration = lease_duration(base_lease, exponent);
        let now_ms = self.clock.now_ms();
        let grant = LeaseGrant {
            worker_id: self.worker_id.clone(),
            acquired_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(duration_ms(duration)),
            exponent,
        };

        let item = self
            .retrying("try_claim", || {
                self.store
                    .try_claim(&candidate.id, Some(candidate.version), &grant)
            })
            .await?;

        info!(
            worker = %self.worker_id,
            item = %item.id,
            attempt = item.num_attempts,
            exponent,
            lease_ms = duration_ms(duration),
            cursor = %item.cursor,
            "claimed work item"
        );
        Ok(ClaimedWork::from_claimed_item(item, duration))
    }

    /// Push the lease out by another full lease duration from now.
    pub async fn renew(&self, claimed: &mut ClaimedWork) -> Result<Lease, CoordinatorError> {
        let expires_at_ms = self
            .clock
            .now_ms()
            .saturating_add(duration_ms(claimed.lease.duration));
        let exponent = claimed.next_exponent();
        let version = self
            .retrying("renew_lease", || {
                self.store
                    .renew_lease(&claimed.id, claimed.version, expires_at_ms, exponent)
            })
            .await
            .map_err(|e| fenced(&claimed.id, "renew", e))?;

        claimed.version = version;
        claimed.lease.expires_at_ms = expires_at_ms;
        debug!(
            worker = %self.worker_id,
            item = %claimed.id,
            version,
            expires_at_ms,
            "renewed lease"
        );
        Ok(claimed.lease)
    }

    /// Persist `cursor` as the resume point for this item.
    pub async fn checkpoint(
        &self,
        claimed: &mut ClaimedWork,
        cursor: Cursor,
    ) -> Result<(), CoordinatorError> {
        let exponent = claimed.next_exponent();
        let version = self
            .retrying("checkpoint", || {
                self.store
                    .checkpoint(&claimed.id, claimed.version, cursor, exponent)
            })
            .await
            .map_err(|e| fenced(&claimed.id, "checkpoint", e))?;

        claimed.version = version;
        claimed.cursor = cursor;
        debug!(
            worker = %self.worker_id,
            item = %claimed.id,
            version,
            cursor = %cursor,
            "checkpointed work item"
        );
        Ok(())
    }

    /// Give the item back early. The cursor is saved but the lease is left to
    /// run out instead of being cleared, so idle workers don't all pounce at once.
    pub async fn release(
        &self,
        mut claimed: ClaimedWork,
        cursor: Cursor,
    ) -> Result<(), CoordinatorError> {
        self.checkpoint(&mut claimed, cursor).await?;
        info!(
            worker = %self.worker_id,
            item = %claimed.id,
            cursor = %cursor,
            expires_at_ms = claimed.lease.expires_at_ms,
            "released work item; lease left to expire"
        );
        Ok(())
    }

    /// Mark the item COMPLETED. The write is conditioned on the version of our
    /// last write, so a worker that lost its lease can never complete the item.
    pub async fn complete(&self, mut claimed: ClaimedWork) -> Result<(), CoordinatorError> {
        let exponent = claimed.next_exponent();
        let version = self
            .retrying("complete", || {
                self.store.complete(&claimed.id, claimed.version, exponent)
            })
            .await
            .map_err(|e| fenced(&claimed.id, "complete", e))?;
        claimed.version = version;
        info!(
            worker = %self.worker_id,
            item = %claimed.id,
            attempt = claimed.num_attempts,
            "completed work item"
        );
        Ok(())
    }

    /// Decide the exponent for the item's next claim from this attempt's
    /// timing. It is stored by the next renewal, checkpoint, release or
    /// completion, whichever comes first.
    ///
    /// If streaming never started, preparation is taken to have lasted until now.
    pub fn record_completion(
        &self,
        claimed: &mut ClaimedWork,
        sample: &WorkItemTimeSample,
    ) -> u32 {
        let prep_time = sample.shard_prep_time().unwrap_or_else(|| {
            let elapsed = self
                .clock
                .now_ms()
                .saturating_sub(sample.lease_acquisition_ms)
                .max(0);
            Duration::from_millis(elapsed as u64)
        });
        let next = next_exponent(claimed.exponent, claimed.lease.duration, prep_time);
        if next != claimed.exponent {
            info!(
                worker = %self.worker_id,
                item = %claimed.id,
                from = claimed.exponent,
                to = next,
                prep_ms = duration_ms(prep_time),
                lease_ms = duration_ms(claimed.lease.duration),
                "adjusting lease exponent for next claim"
            );
        }
        claimed.pending_exponent = Some(next);
        next
    }

    /// Milliseconds left on the lease, negative once it has run out.
    pub fn lease_remaining_ms(&self, claimed: &ClaimedWork) -> i64 {
        claimed.lease.expires_at_ms.saturating_sub(self.clock.now_ms())
    }

    pub fn is_lease_expired(&self, claimed: &ClaimedWork) -> bool {
        self.lease_remaining_ms(claimed) <= 0
    }

    /// True once less than `renew_margin` of the lease is left.
    pub fn needs_renewal(&self, claimed: &ClaimedWork) -> bool {
        let margin = duration_ms(claimed.lease.duration) as f64 * self.settings.renew_margin;
        (self.lease_remaining_ms(claimed) as f64) < margin
    }

    /// Tally every item in the store.
    pub async fn progress(&self) -> Result<MigrationProgress, CoordinatorError> {
        let mut progress = MigrationProgress::default();
        let mut after: Option<WorkItemId> = None;
        loop {
            let page = self
                .retrying("scan", || {
                    self.store
                        .scan(after.as_ref(), self.settings.scan_page_size)
                })
                .await?;
            for item in &page.items {
                progress.total += 1;
                match item.status {
                    WorkItemStatus::Unclaimed => progress.unclaimed += 1,
                    WorkItemStatus::Claimed => progress.claimed += 1,
                    WorkItemStatus::Completed => progress.completed += 1,
                }
            }
            match page.next {
                Some(next) => after = Some(next),
                None => return Ok(progress),
            }
        }
    }

    pub async fn is_migration_complete(&self) -> Result<bool, CoordinatorError> {
        Ok(self.progress().await?.is_complete())
    }

    async fn retrying<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, CoordinatorError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        retry_transient(op, &self.settings.store_retry, StoreError::is_transient, f)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    CoordinatorError::StoreUnavailable { op, source: e }
                } else {
                    CoordinatorError::Store(e)
                }
            })
    }
}

/// Conflicts on an item we hold mean someone else took it over.
fn fenced(id: &WorkItemId, op: &'static str, e: CoordinatorError) -> CoordinatorError {
    match e {
        CoordinatorError::Store(ref store_err) if store_err.is_conflict() => {
            CoordinatorError::LeaseLost {
                id: id.to_string(),
                op,
            }
        }
        other => other,
    }
}
