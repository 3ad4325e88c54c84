//! Seams to the document-moving collaborators: where a shard's documents
//! come from, where they go, and the per-shard setup that precedes reading.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::work_item::{Cursor, WorkItemId};

pub mod fs;
pub mod memory;

pub use fs::{DirectorySink, JsonLinesSource};
pub use memory::{MemoryDocumentSink, MemoryDocumentSource};

/// One document of a shard, in stream order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    /// Zero-based position in the shard's document stream.
    pub ordinal: u64,
    pub body: serde_json::Value,
}

impl DocumentRecord {
    /// Resume point just past this record.
    pub fn cursor_after(&self) -> Cursor {
        Cursor(self.ordinal + 1)
    }
}

/// Result of writing one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    Failure { reason: String },
}

impl WriteOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, WriteOutcome::Failure { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no documents found for shard {0}")]
    ShardNotFound(String),
    #[error("malformed document at ordinal {ordinal} in {shard}: {reason}")]
    Malformed {
        shard: String,
        ordinal: u64,
        reason: String,
    },
    #[error("source io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("bulk request rejected: {0}")]
    Rejected(String),
    #[error("sink io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
#[error("preparing shard {shard} failed: {reason}")]
pub struct PrepareError {
    pub shard: String,
    pub reason: String,
}

/// A boxed stream of a shard's documents.
pub type DocumentStream = Pin<Box<dyn Stream<Item = Result<DocumentRecord, SourceError>> + Send>>;

/// Ordered, finite documents of a shard.
///
/// Opening at a cursor returned earlier must not skip any document at or
/// after that position. Re-delivering earlier documents is allowed.
pub trait DocumentSource: Send + Sync {
    fn open(&self, shard: &WorkItemId, cursor: Cursor) -> DocumentStream;
}

/// Bulk writer for the target cluster. Writes must be idempotent per document id.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// One outcome per record, in order. `Err` means the request as a whole failed.
    async fn write(
        &self,
        index: &str,
        batch: &[DocumentRecord],
    ) -> Result<Vec<WriteOutcome>, SinkError>;
}

/// Per-shard setup done before reading, e.g. fetching and unpacking snapshot files.
#[async_trait]
pub trait ShardPreparer: Send + Sync {
    async fn prepare(&self, shard: &WorkItemId) -> Result<(), PrepareError>;
}

/// Nothing to prepare.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPreparer;

#[async_trait]
impl ShardPreparer for NoopPreparer {
    async fn prepare(&self, _shard: &WorkItemId) -> Result<(), PrepareError> {
        Ok(())
    }
}
