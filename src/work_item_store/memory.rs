use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Mutex;

use crate::work_item::{self, Cursor, LeaseGrant, WorkItem, WorkItemId};

use super::{StoreError, WorkItemPage, WorkItemStore};

/// Work items in a process-local ordered map.
///
/// Each operation holds the lock only for its own read-validate-write, so
/// per-key atomicity holds without any lock spanning an await point.
#[derive(Debug, Default)]
pub struct MemoryWorkItemStore {
    items: Mutex<BTreeMap<WorkItemId, WorkItem>>,
}

impl MemoryWorkItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: &WorkItemId, transition: F) -> Result<WorkItem, StoreError>
    where
        F: FnOnce(Option<&WorkItem>) -> Result<WorkItem, StoreError>,
    {
        let mut items = self
            .items
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        let next = transition(items.get(id))?;
        items.insert(id.clone(), next.clone());
        Ok(next)
    }

    fn page<P>(
        &self,
        after: Option<&WorkItemId>,
        limit: usize,
        keep: P,
    ) -> Result<WorkItemPage, StoreError>
    where
        P: Fn(&WorkItem) -> bool,
    {
        let limit = limit.max(1);
        let items = self
            .items
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        let lower = match after {
            Some(id) => Bound::Excluded(id.clone()),
            None => Bound::Unbounded,
        };
        let mut page = WorkItemPage::default();
        let mut last_seen = None;
        for (id, item) in items.range((lower, Bound::Unbounded)) {
            if page.items.len() >= limit {
                page.next = last_seen;
                return Ok(page);
            }
            last_seen = Some(id.clone());
            if keep(item) {
                page.items.push(item.clone());
            }
        }
        Ok(page)
    }
}

#[async_trait]
impl WorkItemStore for MemoryWorkItemStore {
    async fn create_unassigned(
        &self,
        id: &WorkItemId,
        initial_exponent: u32,
    ) -> Result<bool, StoreError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        if items.contains_key(id) {
            return Ok(false);
        }
        items.insert(id.clone(), WorkItem::unassigned(id.clone(), initial_exponent));
        Ok(true)
    }

    async fn try_claim(
        &self,
        id: &WorkItemId,
        expected: Option<u64>,
        grant: &LeaseGrant,
    ) -> Result<WorkItem, StoreError> {
        self.update(id, |current| work_item::claim(current, id, expected, grant))
    }

    async fn renew_lease(
        &self,
        id: &WorkItemId,
        expected: u64,
        expires_at_ms: i64,
        exponent: u32,
    ) -> Result<u64, StoreError> {
        self.update(id, |current| {
            work_item::renew(current, id, expected, expires_at_ms, exponent)
        })
        .map(|item| item.version)
    }

    async fn checkpoint(
        &self,
        id: &WorkItemId,
        expected: u64,
        cursor: Cursor,
        exponent: u32,
    ) -> Result<u64, StoreError> {
        self.update(id, |current| {
            work_item::checkpoint(current, id, expected, cursor, exponent)
        })
        .map(|item| item.version)
    }

    async fn complete(
        &self,
        id: &WorkItemId,
        expected: u64,
        exponent: u32,
    ) -> Result<u64, StoreError> {
        self.update(id, |current| work_item::complete(current, id, expected, exponent))
            .map(|item| item.version)
    }

    async fn get(&self, id: &WorkItemId) -> Result<WorkItem, StoreError> {
        let items = self
            .items
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        items
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_unclaimed_or_expired(
        &self,
        now_ms: i64,
        after: Option<&WorkItemId>,
        limit: usize,
    ) -> Result<WorkItemPage, StoreError> {
        self.page(after, limit, |item| item.is_claimable(now_ms))
    }

    async fn scan(
        &self,
        after: Option<&WorkItemId>,
        limit: usize,
    ) -> Result<WorkItemPage, StoreError> {
        self.page(after, limit, |_| true)
    }
}
