//! Filesystem adapters used by the worker binary.
//!
//! Source layout: `<root>/<index>/<shard>.jsonl`, one document per line. A
//! line shaped like `{"_id": ..., "_source": {...}}` keeps its id and body;
//! any other JSON line is the body itself and gets id `<index>-<shard>-<ordinal>`.
//! Blank lines are skipped but still occupy an ordinal, so cursors stay stable.
//!
//! Sink layout: `<root>/<index>/<hex of id>.json`, so any id maps to its own
//! file. Rewriting a document overwrites the file, which makes redelivery
//! harmless.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};

use crate::work_item::{Cursor, WorkItemId};

use super::{
    DocumentRecord, DocumentSink, DocumentSource, DocumentStream, SinkError, SourceError,
    WriteOutcome,
};

pub struct JsonLinesSource {
    root: PathBuf,
}

impl JsonLinesSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn shard_path(&self, shard: &WorkItemId) -> PathBuf {
        self.root
            .join(&shard.index)
            .join(format!("{}.jsonl", shard.shard))
    }

    /// Every `<index>/<n>.jsonl` under the root, sorted.
    pub async fn list_shards(&self) -> Result<Vec<WorkItemId>, SourceError> {
        let mut shards = Vec::new();
        let mut indices = tokio::fs::read_dir(&self.root).await?;
        while let Some(index_dir) = indices.next_entry().await? {
            if !index_dir.file_type().await?.is_dir() {
                continue;
            }
            let index = index_dir.file_name().to_string_lossy().to_string();
            let mut files = tokio::fs::read_dir(index_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                let Some(shard) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u32>().ok())
                else {
                    continue;
                };
                shards.push(WorkItemId::new(index.clone(), shard));
            }
        }
        shards.sort();
        Ok(shards)
    }
}

enum ReadState {
    Unopened {
        path: PathBuf,
        shard: WorkItemId,
    },
    Reading {
        lines: Lines<BufReader<File>>,
        next_ordinal: u64,
        shard: WorkItemId,
    },
    Done,
}

impl DocumentSource for JsonLinesSource {
    fn open(&self, shard: &WorkItemId, cursor: Cursor) -> DocumentStream {
        let initial = ReadState::Unopened {
            path: self.shard_path(shard),
            shard: shard.clone(),
        };
        let stream = futures::stream::unfold(initial, move |state| async move {
            let (mut lines, mut next_ordinal, shard) = match state {
                ReadState::Done => return None,
                ReadState::Reading {
                    lines,
                    next_ordinal,
                    shard,
                } => (lines, next_ordinal, shard),
                ReadState::Unopened { path, shard } => match File::open(&path).await {
                    Ok(file) => (BufReader::new(file).lines(), 0, shard),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        let err = SourceError::ShardNotFound(shard.to_string());
                        return Some((Err(err), ReadState::Done));
                    }
                    Err(e) => return Some((Err(e.into()), ReadState::Done)),
                },
            };
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let ordinal = next_ordinal;
                        next_ordinal += 1;
                        if ordinal < cursor.0 || line.trim().is_empty() {
                            continue;
                        }
                        let record = parse_line(&shard, ordinal, &line);
                        let next = if record.is_ok() {
                            ReadState::Reading {
                                lines,
                                next_ordinal,
                                shard,
                            }
                        } else {
                            ReadState::Done
                        };
                        return Some((record, next));
                    }
                    Ok(None) => return None,
                    Err(e) => return Some((Err(e.into()), ReadState::Done)),
                }
            }
        });
        Box::pin(stream)
    }
}

fn parse_line(
    shard: &WorkItemId,
    ordinal: u64,
    line: &str,
) -> Result<DocumentRecord, SourceError> {
    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| SourceError::Malformed {
            shard: shard.to_string(),
            ordinal,
            reason: e.to_string(),
        })?;
    let explicit_id = value.get("_id").and_then(|v| v.as_str()).map(str::to_string);
    let (id, body) = match explicit_id {
        Some(id) => {
            let body = value
                .get("_source")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            (id, body)
        }
        None => (format!("{}-{}-{}", shard.index, shard.shard, ordinal), value),
    };
    Ok(DocumentRecord { id, ordinal, body })
}

pub struct DirectorySink {
    root: PathBuf,
}

impl DirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the document with `id` is written.
    pub fn document_path(&self, index: &str, id: &str) -> PathBuf {
        self.root
            .join(index)
            .join(format!("{}.json", hex::encode(id.as_bytes())))
    }
}

#[async_trait]
impl DocumentSink for DirectorySink {
    async fn write(
        &self,
        index: &str,
        batch: &[DocumentRecord],
    ) -> Result<Vec<WriteOutcome>, SinkError> {
        tokio::fs::create_dir_all(self.root.join(index)).await?;
        let mut outcomes = Vec::with_capacity(batch.len());
        for record in batch {
            let bytes = serde_json::to_vec(&record.body)?;
            let outcome = match tokio::fs::write(self.document_path(index, &record.id), bytes).await
            {
                Ok(()) => WriteOutcome::Success,
                Err(e) => WriteOutcome::Failure {
                    reason: e.to_string(),
                },
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn json_lines_source_resumes_at_cursor_and_lists_shards() {
        let tmp = tempfile::tempdir().unwrap();
        let index_dir = tmp.path().join("books");
        std::fs::create_dir_all(&index_dir).unwrap();
        std::fs::write(
            index_dir.join("0.jsonl"),
            "{\"_id\":\"a\",\"_source\":{\"t\":1}}\n\n{\"t\":2}\n{\"t\":3}\n",
        )
        .unwrap();
        std::fs::write(index_dir.join("3.jsonl"), "").unwrap();
        std::fs::write(index_dir.join("notes.txt"), "ignored").unwrap();

        let source = JsonLinesSource::new(tmp.path());
        let shards = source.list_shards().await.unwrap();
        assert_eq!(
            shards,
            vec![WorkItemId::new("books", 0), WorkItemId::new("books", 3)]
        );

        let shard = WorkItemId::new("books", 0);
        let all: Vec<_> = source.open(&shard, Cursor::START).collect().await;
        let all: Vec<_> = all.into_iter().map(Result::unwrap).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[0].body, serde_json::json!({"t": 1}));
        assert_eq!(all[1].ordinal, 2);
        assert_eq!(all[1].id, "books-0-2");

        let resumed: Vec<_> = source.open(&shard, Cursor(3)).collect().await;
        assert_eq!(resumed.len(), 1);
        assert_eq!(resumed[0].as_ref().unwrap().ordinal, 3);

        let missing: Vec<_> = source
            .open(&WorkItemId::new("books", 9), Cursor::START)
            .collect()
            .await;
        assert!(matches!(missing[0], Err(SourceError::ShardNotFound(_))));
    }

    #[tokio::test]
    async fn directory_sink_overwrites_by_id() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(tmp.path());
        let record = |body| DocumentRecord {
            id: "doc/1".to_string(),
            ordinal: 0,
            body,
        };
        sink.write("books", &[record(serde_json::json!({"v": 1}))])
            .await
            .unwrap();
        let outcomes = sink
            .write("books", &[record(serde_json::json!({"v": 2}))])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![WriteOutcome::Success]);

        let stored = std::fs::read_to_string(sink.document_path("books", "doc/1")).unwrap();
        assert_eq!(stored, "{\"v\":2}");
    }

    #[tokio::test]
    async fn directory_sink_keeps_lookalike_ids_apart() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = DirectorySink::new(tmp.path());
        let batch = ["doc/1", "doc_1", "doc\\1", "../doc1"].map(|id| DocumentRecord {
            id: id.to_string(),
            ordinal: 0,
            body: serde_json::json!({ "id": id }),
        });
        let outcomes = sink.write("books", &batch).await.unwrap();
        assert!(outcomes.iter().all(|o| *o == WriteOutcome::Success));

        assert_eq!(std::fs::read_dir(tmp.path().join("books")).unwrap().count(), 4);
        for record in &batch {
            let path = sink.document_path("books", &record.id);
            assert_eq!(path.parent(), Some(tmp.path().join("books").as_path()));
            let stored: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
            assert_eq!(stored, record.body);
        }
    }
}
