// Job store abstraction
//
// Every status mutation goes through `JobStore::update`, a single atomic
// conditional update whose filter always names the statuses the row must
// currently be in. That predicate is the only synchronization between engine
// instances sharing a store.

pub mod memory;

pub use memory::MemoryJobStore;

use crate::errors::StoreError;
use crate::models::{JobRecord, JobStatus, StoredJob};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Timestamp column stamped with `now` by an update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stamp {
    QueuedAt,
    InProgressedAt,
}

/// Row predicate for conditional updates
///
/// A filter with no statuses matches nothing, so an update can never be
/// issued without a status guard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub id: Option<i64>,
    pub statuses: Vec<JobStatus>,
    pub queued_before: Option<DateTime<Utc>>,
    pub in_progressed_before: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub retry_count_below: Option<i32>,
}

impl JobFilter {
    /// Match rows currently in one of `statuses`
    pub fn status_in(statuses: impl IntoIterator<Item = JobStatus>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn queued_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.queued_before = Some(cutoff);
        self
    }

    pub fn in_progressed_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.in_progressed_before = Some(cutoff);
        self
    }

    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    pub fn retry_count_below(mut self, limit: i32) -> Self {
        self.retry_count_below = Some(limit);
        self
    }

    /// Evaluate the predicate against a record
    ///
    /// Rows with a missing timestamp never match a `*_before` bound.
    pub fn matches(&self, record: &JobRecord) -> bool {
        fn before(value: Option<DateTime<Utc>>, cutoff: Option<DateTime<Utc>>) -> bool {
            match cutoff {
                None => true,
                Some(cutoff) => value.is_some_and(|v| v < cutoff),
            }
        }

        self.statuses.contains(&record.status)
            && self.id.map_or(true, |id| record.id == id)
            && before(record.queued_at, self.queued_before)
            && before(record.in_progressed_at, self.in_progressed_before)
            && before(Some(record.updated_at), self.updated_before)
            && self
                .retry_count_below
                .map_or(true, |limit| record.retry_count < limit)
    }
}

/// Column changes applied by a conditional update
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: JobStatus,
    pub stamp: Option<Stamp>,
    /// `Some(message)` overwrites the column, `None` leaves it alone
    pub failure_message: Option<Option<String>>,
    pub increment_retry: bool,
}

impl JobUpdate {
    /// Move matching rows to `status`
    pub fn to(status: JobStatus) -> Self {
        Self {
            status,
            stamp: None,
            failure_message: None,
            increment_retry: false,
        }
    }

    pub fn stamp(mut self, stamp: Stamp) -> Self {
        self.stamp = Some(stamp);
        self
    }

    pub fn failure_message(mut self, message: Option<String>) -> Self {
        self.failure_message = Some(message);
        self
    }

    pub fn increment_retry(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    /// Apply the changes to a record in place
    pub fn apply(&self, record: &mut JobRecord, now: DateTime<Utc>) {
        debug_assert!(
            record.status.can_transition_to(self.status),
            "no lifecycle edge from {} to {}",
            record.status,
            self.status
        );
        record.status = self.status;
        record.updated_at = now;
        match self.stamp {
            Some(Stamp::QueuedAt) => record.queued_at = Some(now),
            Some(Stamp::InProgressedAt) => record.in_progressed_at = Some(now),
            None => {}
        }
        if let Some(message) = &self.failure_message {
            record.failure_message = message.clone();
        }
        if self.increment_retry {
            record.retry_count += 1;
        }
    }
}

/// Persistence layer holding job rows
///
/// All operations are scoped to one job `kind` so engines for different job
/// types can share a table.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `Created` row and return its control block
    async fn insert(
        &self,
        kind: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError>;

    /// Atomically apply `update` to every row matching `filter`
    ///
    /// Returns the number of rows affected.
    async fn update(
        &self,
        kind: &str,
        filter: &JobFilter,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Count rows currently in one of `statuses`
    async fn count(&self, kind: &str, statuses: &[JobStatus]) -> Result<i64, StoreError>;

    /// Fetch up to `limit` rows in `status`, oldest `created_at` first
    async fn fetch(
        &self,
        kind: &str,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<StoredJob>, StoreError>;

    /// Delete every row created before `cutoff`, whatever its status
    async fn delete_created_before(
        &self,
        kind: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Look up a single row
    async fn find(&self, kind: &str, id: i64) -> Result<Option<StoredJob>, StoreError>;
}
