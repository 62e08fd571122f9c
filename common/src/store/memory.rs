// In-memory job store, for tests and for embedding without a database

use super::{JobFilter, JobStore, JobUpdate};
use crate::errors::StoreError;
use crate::models::{JobRecord, JobStatus, StoredJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    rows: BTreeMap<i64, StoredJob>,
}

/// Mutex-guarded job table
///
/// Predicate evaluation and mutation happen under the same lock, which gives
/// each `update` the same compare-and-set behaviour as a single SQL statement.
#[derive(Debug, Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Control blocks of every row of `kind`, ordered by id
    pub fn records(&self, kind: &str) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rows
            .values()
            .filter(|row| row.record.kind == kind)
            .map(|row| row.record.clone())
            .collect())
    }

    /// Number of rows across all kinds
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.rows.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.rows.is_empty())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(
        &self,
        kind: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let mut state = self.lock()?;
        state.next_id += 1;
        let record = JobRecord::created(state.next_id, kind, now);
        state.rows.insert(
            record.id,
            StoredJob {
                record: record.clone(),
                payload,
            },
        );
        Ok(record)
    }

    async fn update(
        &self,
        kind: &str,
        filter: &JobFilter,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let mut affected = 0;
        for row in state.rows.values_mut() {
            if row.record.kind == kind && filter.matches(&row.record) {
                update.apply(&mut row.record, now);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn count(&self, kind: &str, statuses: &[JobStatus]) -> Result<i64, StoreError> {
        let state = self.lock()?;
        let count = state
            .rows
            .values()
            .filter(|row| row.record.kind == kind && statuses.contains(&row.record.status))
            .count();
        Ok(count as i64)
    }

    async fn fetch(
        &self,
        kind: &str,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let state = self.lock()?;
        let mut rows: Vec<StoredJob> = state
            .rows
            .values()
            .filter(|row| row.record.kind == kind && row.record.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.record.created_at, row.record.id));
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn delete_created_before(
        &self,
        kind: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut state = self.lock()?;
        let before = state.rows.len();
        state
            .rows
            .retain(|_, row| !(row.record.kind == kind && row.record.created_at < cutoff));
        Ok((before - state.rows.len()) as u64)
    }

    async fn find(&self, kind: &str, id: i64) -> Result<Option<StoredJob>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .rows
            .get(&id)
            .filter(|row| row.record.kind == kind)
            .cloned())
    }
}
