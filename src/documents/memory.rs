use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use crate::work_item::{Cursor, WorkItemId};

use super::{
    DocumentRecord, DocumentSink, DocumentSource, DocumentStream, SinkError, SourceError,
    WriteOutcome,
};

/// Documents held in memory, keyed by shard.
#[derive(Debug, Default)]
pub struct MemoryDocumentSource {
    shards: HashMap<WorkItemId, Vec<DocumentRecord>>,
}

impl MemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard whose documents are `bodies` in order, with ids `<shard>-<n>`.
    pub fn with_shard(mut self, shard: WorkItemId, bodies: Vec<serde_json::Value>) -> Self {
        let records = bodies
            .into_iter()
            .enumerate()
            .map(|(n, body)| DocumentRecord {
                id: format!("{}-{}", shard, n),
                ordinal: n as u64,
                body,
            })
            .collect();
        self.shards.insert(shard, records);
        self
    }

    pub fn shard_ids(&self) -> Vec<WorkItemId> {
        let mut ids: Vec<_> = self.shards.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl DocumentSource for MemoryDocumentSource {
    fn open(&self, shard: &WorkItemId, cursor: Cursor) -> DocumentStream {
        let items: Vec<Result<DocumentRecord, SourceError>> = match self.shards.get(shard) {
            Some(records) => records
                .iter()
                .filter(|r| r.ordinal >= cursor.0)
                .cloned()
                .map(Ok)
                .collect(),
            None => vec![Err(SourceError::ShardNotFound(shard.to_string()))],
        };
        Box::pin(futures::stream::iter(items))
    }
}

/// Collects written documents per index, last write per id wins.
///
/// Ids listed with `fail_ids` are reported as per-document failures, and
/// `fail_next_requests` makes whole requests fail.
#[derive(Debug, Default)]
pub struct MemoryDocumentSink {
    written: Mutex<BTreeMap<String, BTreeMap<String, serde_json::Value>>>,
    fail_ids: Mutex<HashSet<String>>,
    fail_next_requests: Mutex<usize>,
    requests: Mutex<usize>,
    deliveries: Mutex<usize>,
}

impl MemoryDocumentSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_ids<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fail = self.fail_ids.lock().unwrap_or_else(|e| e.into_inner());
        fail.extend(ids.into_iter().map(Into::into));
    }

    pub fn fail_next_requests(&self, n: usize) {
        *self.fail_next_requests.lock().unwrap_or_else(|e| e.into_inner()) = n;
    }

    /// Distinct documents stored under `index`.
    pub fn document_count(&self, index: &str) -> usize {
        let written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        written.get(index).map_or(0, BTreeMap::len)
    }

    pub fn document(&self, index: &str, id: &str) -> Option<serde_json::Value> {
        let written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        written.get(index).and_then(|docs| docs.get(id).cloned())
    }

    /// Successful per-document writes, duplicates included.
    pub fn deliveries(&self) -> usize {
        *self.deliveries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn requests(&self) -> usize {
        *self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentSink for MemoryDocumentSink {
    async fn write(
        &self,
        index: &str,
        batch: &[DocumentRecord],
    ) -> Result<Vec<WriteOutcome>, SinkError> {
        *self.requests.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        {
            let mut remaining = self
                .fail_next_requests
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SinkError::Rejected("injected request failure".into()));
            }
        }

        let fail = self
            .fail_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        let docs = written.entry(index.to_string()).or_default();
        let mut outcomes = Vec::with_capacity(batch.len());
        let mut delivered = 0;
        for record in batch {
            if fail.contains(&record.id) {
                outcomes.push(WriteOutcome::Failure {
                    reason: format!("mapper_parsing_exception: document {}", record.id),
                });
            } else {
                docs.insert(record.id.clone(), record.body.clone());
                delivered += 1;
                outcomes.push(WriteOutcome::Success);
            }
        }
        drop(written);
        *self.deliveries.lock().unwrap_or_else(|e| e.into_inner()) += delivered;
        Ok(outcomes)
    }
}
