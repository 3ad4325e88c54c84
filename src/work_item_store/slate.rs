//! Work items as JSON documents in SlateDB.
//!
//! Each conditional write runs in a `SerializableSnapshot` transaction: read the
//! document, validate it against the caller's expected version, write the next
//! document and commit. A commit that loses to a concurrent writer of the same
//! key surfaces as `StoreError::Conflict`.

use async_trait::async_trait;
use slatedb::config::WriteOptions;
use slatedb::{Db, DbIterator, ErrorKind as SlateErrorKind, IsolationLevel};
use std::sync::Arc;
use tracing::{debug, info};

use crate::keys::{work_item_key, work_item_scan_bounds};
use crate::settings::StoreConfig;
use crate::storage::store_location;
use crate::work_item::{self, Cursor, LeaseGrant, WorkItem, WorkItemId};

use super::{StoreError, WorkItemPage, WorkItemStore};

pub struct SlateWorkItemStore {
    db: Arc<Db>,
}

impl SlateWorkItemStore {
    pub async fn open(cfg: &StoreConfig) -> Result<Self, StoreError> {
        let location = store_location(cfg)?;
        let mut db_builder =
            slatedb::DbBuilder::new(location.db_path.as_str(), location.object_store);
        if let Some(flush_ms) = cfg.flush_interval_ms {
            let settings = slatedb::config::Settings {
                flush_interval: Some(std::time::Duration::from_millis(flush_ms)),
                ..Default::default()
            };
            db_builder = db_builder.with_settings(settings);
        }

        let db = db_builder.build().await?;
        info!(path = %location.db_path, backend = ?cfg.backend, "opened work item store");
        Ok(Self::from_db(Arc::new(db)))
    }

    /// Wrap an already open database, e.g. one shared with other components.
    pub fn from_db(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    async fn update<F>(&self, id: &WorkItemId, transition: F) -> Result<WorkItem, StoreError>
    where
        F: FnOnce(Option<&WorkItem>) -> Result<WorkItem, StoreError> + Send,
    {
        let key = work_item_key(id);
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;

        let current = match txn.get(key.as_bytes()).await? {
            Some(raw) => Some(decode(&key, &raw)?),
            None => None,
        };
        let next = transition(current.as_ref())?;
        let value = serde_json::to_vec(&next)?;
        txn.put(key.as_bytes(), &value)?;

        match txn
            .commit_with_options(&WriteOptions {
                await_durable: true,
            })
            .await
        {
            Ok(_) => Ok(next),
            Err(e) if e.kind() == SlateErrorKind::Transaction => {
                debug!(item = %id, "work item commit lost to a concurrent writer");
                Err(StoreError::Conflict {
                    id: id.to_string(),
                    expected: current.map(|c| c.version),
                    actual: None,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn page<P>(
        &self,
        after: Option<&WorkItemId>,
        limit: usize,
        keep: P,
    ) -> Result<WorkItemPage, StoreError>
    where
        P: Fn(&WorkItem) -> bool + Send,
    {
        let limit = limit.max(1);
        let (start, end) = work_item_scan_bounds(after);
        let mut iter: DbIterator = self.db.scan::<Vec<u8>, _>(start..=end).await?;

        let mut page = WorkItemPage::default();
        let mut last_seen = None;
        while let Some(kv) = iter.next().await? {
            if page.items.len() >= limit {
                page.next = last_seen;
                return Ok(page);
            }
            let key = String::from_utf8_lossy(&kv.key).to_string();
            let item = decode(&key, &kv.value)?;
            last_seen = Some(item.id.clone());
            if keep(&item) {
                page.items.push(item);
            }
        }
        Ok(page)
    }
}

fn decode(key: &str, raw: &[u8]) -> Result<WorkItem, StoreError> {
    serde_json::from_slice(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl WorkItemStore for SlateWorkItemStore {
    async fn create_unassigned(
        &self,
        id: &WorkItemId,
        initial_exponent: u32,
    ) -> Result<bool, StoreError> {
        let key = work_item_key(id);
        let txn = self.db.begin(IsolationLevel::SerializableSnapshot).await?;
        if txn.get(key.as_bytes()).await?.is_some() {
            return Ok(false);
        }
        let value = serde_json::to_vec(&WorkItem::unassigned(id.clone(), initial_exponent))?;
        txn.put(key.as_bytes(), &value)?;
        match txn
            .commit_with_options(&WriteOptions {
                await_durable: true,
            })
            .await
        {
            Ok(_) => Ok(true),
            // A concurrent seeder created it first
            Err(e) if e.kind() == SlateErrorKind::Transaction => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn try_claim(
        &self,
        id: &WorkItemId,
        expected: Option<u64>,
        grant: &LeaseGrant,
    ) -> Result<WorkItem, StoreError> {
        self.update(id, |current| work_item::claim(current, id, expected, grant))
            .await
    }

    async fn renew_lease(
        &self,
        id: &WorkItemId,
        expected: u64,
        expires_at_ms: i64,
        exponent: u32,
    ) -> Result<u64, StoreError> {
        let item = self
            .update(id, |current| {
                work_item::renew(current, id, expected, expires_at_ms, exponent)
            })
            .await?;
        Ok(item.version)
    }

    async fn checkpoint(
        &self,
        id: &WorkItemId,
        expected: u64,
        cursor: Cursor,
        exponent: u32,
    ) -> Result<u64, StoreError> {
        let item = self
            .update(id, |current| {
                work_item::checkpoint(current, id, expected, cursor, exponent)
            })
            .await?;
        Ok(item.version)
    }

    async fn complete(
        &self,
        id: &WorkItemId,
        expected: u64,
        exponent: u32,
    ) -> Result<u64, StoreError> {
        let item = self
            .update(id, |current| work_item::complete(current, id, expected, exponent))
            .await?;
        Ok(item.version)
    }

    async fn get(&self, id: &WorkItemId) -> Result<WorkItem, StoreError> {
        let key = work_item_key(id);
        match self.db.get(key.as_bytes()).await? {
            Some(raw) => decode(&key, &raw),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn list_unclaimed_or_expired(
        &self,
        now_ms: i64,
        after: Option<&WorkItemId>,
        limit: usize,
    ) -> Result<WorkItemPage, StoreError> {
        self.page(after, limit, |item| item.is_claimable(now_ms))
            .await
    }

    async fn scan(
        &self,
        after: Option<&WorkItemId>,
        limit: usize,
    ) -> Result<WorkItemPage, StoreError> {
        self.page(after, limit, |_| true).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.db.close().await?;
        info!("closed work item store");
        Ok(())
    }
}
