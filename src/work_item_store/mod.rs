//! Durable, per-key conditional storage for work items.
//!
//! Two implementations are available:
//!
//! - `memory`: a process-local map, for single-process fleets and tests
//! - `slate`: JSON documents in SlateDB, shareable through an object store
//!
//! Every mutating operation is conditioned on the caller's expected version
//! and is atomic for that one key. Nothing is promised across keys.

use async_trait::async_trait;
use std::sync::Arc;

use crate::settings::{Backend, StoreConfig};
use crate::storage::StorageError;
use crate::work_item::{Cursor, LeaseGrant, WorkItem, WorkItemId, WorkItemStatus};

pub mod memory;
pub mod slate;

pub use memory::MemoryWorkItemStore;
pub use slate::SlateWorkItemStore;

/// One page of a keyset-paginated listing.
#[derive(Debug, Clone, Default)]
pub struct WorkItemPage {
    pub items: Vec<WorkItem>,
    /// Pass as `after` to continue; None once the listing is exhausted.
    pub next: Option<WorkItemId>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Another writer changed the document first.
    #[error("version conflict on work item {id} (expected {expected:?}, found {actual:?})")]
    Conflict {
        id: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
    #[error("work item not found: {0}")]
    NotFound(String),
    #[error("checkpoint for {id} would move cursor back from {stored} to {attempted}")]
    CursorRegression {
        id: String,
        stored: Cursor,
        attempted: Cursor,
    },
    #[error("cannot {op} work item {id} in status {status:?}")]
    InvalidState {
        id: String,
        op: &'static str,
        status: WorkItemStatus,
    },
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt work item document at {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Slate(#[from] slatedb::Error),
    #[error("json serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
            || matches!(self, StoreError::Slate(e) if e.kind() == slatedb::ErrorKind::Transaction)
    }

    /// Worth retrying the same request after a pause.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Slate(e) => e.kind() != slatedb::ErrorKind::Transaction,
            _ => false,
        }
    }
}

#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Seed an unclaimed item whose first lease uses `initial_exponent`.
    /// Returns false, leaving the stored item untouched, when `id` already exists.
    async fn create_unassigned(
        &self,
        id: &WorkItemId,
        initial_exponent: u32,
    ) -> Result<bool, StoreError>;

    /// Take the lease on `id`.
    ///
    /// Succeeds only if the stored version equals `expected` and the item is
    /// unclaimed or its lease expired by `grant.acquired_at_ms`, or if
    /// `expected` is None and the item does not exist yet. Returns the stored
    /// document, whose `version` is the new version token.
    async fn try_claim(
        &self,
        id: &WorkItemId,
        expected: Option<u64>,
        grant: &LeaseGrant,
    ) -> Result<WorkItem, StoreError>;

    /// Extend a held lease. Returns the new version.
    async fn renew_lease(
        &self,
        id: &WorkItemId,
        expected: u64,
        expires_at_ms: i64,
        exponent: u32,
    ) -> Result<u64, StoreError>;

    /// Record progress. The cursor may not move backwards. Returns the new version.
    async fn checkpoint(
        &self,
        id: &WorkItemId,
        expected: u64,
        cursor: Cursor,
        exponent: u32,
    ) -> Result<u64, StoreError>;

    /// Mark the item COMPLETED. Returns the new version.
    async fn complete(&self, id: &WorkItemId, expected: u64, exponent: u32)
    -> Result<u64, StoreError>;

    async fn get(&self, id: &WorkItemId) -> Result<WorkItem, StoreError>;

    /// Items claimable at `now_ms` with ids strictly after `after`, at most
    /// `limit` per page.
    async fn list_unclaimed_or_expired(
        &self,
        now_ms: i64,
        after: Option<&WorkItemId>,
        limit: usize,
    ) -> Result<WorkItemPage, StoreError>;

    /// Every item with id strictly after `after`, at most `limit` per page.
    async fn scan(&self, after: Option<&WorkItemId>, limit: usize)
    -> Result<WorkItemPage, StoreError>;

    /// Flush and release whatever backs the store.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Open the store described by `cfg`.
pub async fn open_store(cfg: &StoreConfig) -> Result<Arc<dyn WorkItemStore>, StoreError> {
    match cfg.backend {
        Backend::Memory => Ok(Arc::new(MemoryWorkItemStore::new())),
        Backend::Fs | Backend::SlateMemory | Backend::Url => {
            Ok(Arc::new(SlateWorkItemStore::open(cfg).await?))
        }
    }
}
