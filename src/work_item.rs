//! The per-shard work item document and its state transitions.
//!
//! Transitions are pure: they take the currently stored document (if any) and
//! the caller's expected version and return the document to persist. Store
//! implementations only have to make read-validate-write atomic per key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::work_item_store::StoreError;

/// One shard of one source index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkItemId {
    pub index: String,
    pub shard: u32,
}

impl WorkItemId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for WorkItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}__{}", self.index, self.shard)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid work item id {0:?}: expected <index>__<shard>")]
pub struct ParseWorkItemIdError(String);

impl FromStr for WorkItemId {
    type Err = ParseWorkItemIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (index, shard) = s
            .rsplit_once("__")
            .ok_or_else(|| ParseWorkItemIdError(s.to_string()))?;
        if index.is_empty() {
            return Err(ParseWorkItemIdError(s.to_string()));
        }
        let shard = shard
            .parse::<u32>()
            .map_err(|_| ParseWorkItemIdError(s.to_string()))?;
        Ok(Self::new(index, shard))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkItemStatus {
    Unclaimed,
    Claimed,
    Completed,
}

/// Number of leading documents of the shard's stream already handed to the sink.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    pub const START: Cursor = Cursor(0);

    pub fn is_start(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted coordination state for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub status: WorkItemStatus,
    /// Epoch ms after which the current lease no longer protects the item.
    pub lease_expiration_ms: i64,
    pub lease_acquisition_ms: i64,
    /// Lease for the next claim is `base * 2^exponent`.
    pub next_acquisition_lease_exponent: u32,
    pub num_attempts: u32,
    pub cursor: Cursor,
    /// Most recent claimant. Informational only.
    #[serde(default)]
    pub leased_by: Option<String>,
    pub version: u64,
}

/// The lease terms a claimant asks the store to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub worker_id: String,
    pub acquired_at_ms: i64,
    pub expires_at_ms: i64,
    pub exponent: u32,
}

impl WorkItem {
    /// A freshly seeded item nobody has claimed yet. Its first claim is
    /// leased for `base * 2^initial_exponent`.
    pub fn unassigned(id: WorkItemId, initial_exponent: u32) -> Self {
        Self {
            id,
            status: WorkItemStatus::Unclaimed,
            lease_expiration_ms: 0,
            lease_acquisition_ms: 0,
            next_acquisition_lease_exponent: initial_exponent,
            num_attempts: 0,
            cursor: Cursor::START,
            leased_by: None,
            version: 1,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == WorkItemStatus::Completed
    }

    /// Unclaimed, or claimed under a lease that has run out by `now_ms`.
    pub fn is_claimable(&self, now_ms: i64) -> bool {
        match self.status {
            WorkItemStatus::Unclaimed => true,
            WorkItemStatus::Claimed => self.lease_expiration_ms <= now_ms,
            WorkItemStatus::Completed => false,
        }
    }

    fn check_version(&self, expected: u64) -> Result<(), StoreError> {
        if self.version != expected {
            return Err(StoreError::Conflict {
                id: self.id.to_string(),
                expected: Some(expected),
                actual: Some(self.version),
            });
        }
        Ok(())
    }

    fn check_claimed(&self, op: &'static str) -> Result<(), StoreError> {
        if self.status != WorkItemStatus::Claimed {
            return Err(StoreError::InvalidState {
                id: self.id.to_string(),
                op,
                status: self.status,
            });
        }
        Ok(())
    }

    fn bumped(mut self) -> Self {
        self.version += 1;
        self
    }
}

/// Claim `id`. `existing` is what the store currently holds for the key.
///
/// With `expected == None` the claim only succeeds by creating the item; with
/// `Some(v)` the stored version must be `v` and the item must be claimable at
/// `grant.acquired_at_ms`.
pub fn claim(
    existing: Option<&WorkItem>,
    id: &WorkItemId,
    expected: Option<u64>,
    grant: &LeaseGrant,
) -> Result<WorkItem, StoreError> {
    let base = match (existing, expected) {
        (None, None) => WorkItem {
            version: 0,
            ..WorkItem::unassigned(id.clone(), grant.exponent)
        },
        (None, Some(_)) => return Err(StoreError::NotFound(id.to_string())),
        (Some(current), None) => {
            return Err(StoreError::Conflict {
                id: id.to_string(),
                expected: None,
                actual: Some(current.version),
            });
        }
        (Some(current), Some(expected)) => {
            current.check_version(expected)?;
            if current.is_completed() {
                return Err(StoreError::InvalidState {
                    id: id.to_string(),
                    op: "claim",
                    status: current.status,
                });
            }
            if !current.is_claimable(grant.acquired_at_ms) {
                // Someone holds a live lease on this exact version.
                return Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected: Some(expected),
                    actual: Some(current.version),
                });
            }
            current.clone()
        }
    };

    Ok(WorkItem {
        status: WorkItemStatus::Claimed,
        lease_acquisition_ms: grant.acquired_at_ms,
        lease_expiration_ms: grant.expires_at_ms,
        next_acquisition_lease_exponent: grant.exponent,
        num_attempts: base.num_attempts.saturating_add(1),
        leased_by: Some(grant.worker_id.clone()),
        ..base
    }
    .bumped())
}

pub fn renew(
    existing: Option<&WorkItem>,
    id: &WorkItemId,
    expected: u64,
    expires_at_ms: i64,
    exponent: u32,
) -> Result<WorkItem, StoreError> {
    let current = existing.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    current.check_version(expected)?;
    current.check_claimed("renew")?;
    Ok(WorkItem {
        lease_expiration_ms: expires_at_ms,
        next_acquisition_lease_exponent: exponent,
        ..current.clone()
    }
    .bumped())
}

pub fn checkpoint(
    existing: Option<&WorkItem>,
    id: &WorkItemId,
    expected: u64,
    cursor: Cursor,
    exponent: u32,
) -> Result<WorkItem, StoreError> {
    let current = existing.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    current.check_version(expected)?;
    current.check_claimed("checkpoint")?;
    if cursor < current.cursor {
        return Err(StoreError::CursorRegression {
            id: id.to_string(),
            stored: current.cursor,
            attempted: cursor,
        });
    }
    Ok(WorkItem {
        cursor,
        next_acquisition_lease_exponent: exponent,
        ..current.clone()
    }
    .bumped())
}

pub fn complete(
    existing: Option<&WorkItem>,
    id: &WorkItemId,
    expected: u64,
    exponent: u32,
) -> Result<WorkItem, StoreError> {
    let current = existing.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    current.check_version(expected)?;
    current.check_claimed("complete")?;
    Ok(WorkItem {
        status: WorkItemStatus::Completed,
        next_acquisition_lease_exponent: exponent,
        ..current.clone()
    }
    .bumped())
}
