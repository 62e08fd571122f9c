// Job repository implementation
// PostgreSQL-backed `JobStore` over the scheduled_jobs table

use super::queries::job_queries::{RECORD_COLUMNS, TABLE};
use crate::db::DbPool;
use crate::errors::StoreError;
use crate::models::{JobRecord, JobStatus, StoredJob};
use crate::store::{JobFilter, JobStore, JobUpdate, Stamp};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};
use tracing::instrument;

/// Repository for scheduled job rows
///
/// Each status change is one `UPDATE ... WHERE status = ANY(..)` statement, so
/// PostgreSQL re-checks the predicate under the row lock and concurrent engine
/// instances cannot both win the same transition.
#[derive(Debug, Clone)]
pub struct JobRepository {
    pool: DbPool,
}

impl JobRepository {
    /// Create a new JobRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn status_names(statuses: &[JobStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_str().to_string()).collect()
    }

    /// Append the `WHERE` clause for `kind` and `filter`
    fn push_filter(builder: &mut QueryBuilder<'_, Postgres>, kind: &str, filter: &JobFilter) {
        builder.push(" WHERE kind = ");
        builder.push_bind(kind.to_string());
        builder.push(" AND status = ANY(");
        builder.push_bind(Self::status_names(&filter.statuses));
        builder.push(")");

        if let Some(id) = filter.id {
            builder.push(" AND id = ");
            builder.push_bind(id);
        }
        if let Some(cutoff) = filter.queued_before {
            builder.push(" AND queued_at < ");
            builder.push_bind(cutoff);
        }
        if let Some(cutoff) = filter.in_progressed_before {
            builder.push(" AND in_progressed_at < ");
            builder.push_bind(cutoff);
        }
        if let Some(cutoff) = filter.updated_before {
            builder.push(" AND updated_at < ");
            builder.push_bind(cutoff);
        }
        if let Some(limit) = filter.retry_count_below {
            builder.push(" AND retry_count < ");
            builder.push_bind(limit);
        }
    }

    /// Build the conditional update statement
    fn build_update<'a>(
        kind: &str,
        filter: &JobFilter,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> QueryBuilder<'a, Postgres> {
        let mut builder = QueryBuilder::new(format!("UPDATE {} SET status = ", TABLE));
        builder.push_bind(update.status.as_str().to_string());
        builder.push(", updated_at = ");
        builder.push_bind(now);

        match update.stamp {
            Some(Stamp::QueuedAt) => {
                builder.push(", queued_at = ");
                builder.push_bind(now);
            }
            Some(Stamp::InProgressedAt) => {
                builder.push(", in_progressed_at = ");
                builder.push_bind(now);
            }
            None => {}
        }

        if let Some(message) = &update.failure_message {
            builder.push(", failure_message = ");
            builder.push_bind(message.clone());
        }

        if update.increment_retry {
            builder.push(", retry_count = retry_count + 1");
        }

        Self::push_filter(&mut builder, kind, filter);
        builder
    }
}

#[async_trait]
impl JobStore for JobRepository {
    #[instrument(skip(self, payload))]
    async fn insert(
        &self,
        kind: &str,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            INSERT INTO {} (kind, status, retry_count, payload, created_at, updated_at)
            VALUES ($1, $2, 0, $3, $4, $4)
            RETURNING {}
            "#,
            TABLE, RECORD_COLUMNS
        ))
        .bind(kind)
        .bind(JobStatus::Created.as_str())
        .bind(payload)
        .bind(now)
        .fetch_one(self.pool.pool())
        .await?;

        tracing::debug!(job_id = record.id, "Job row inserted");
        Ok(record)
    }

    #[instrument(skip(self))]
    async fn update(
        &self,
        kind: &str,
        filter: &JobFilter,
        update: &JobUpdate,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        if filter.statuses.is_empty() {
            return Ok(0);
        }

        let result = Self::build_update(kind, filter, update, now)
            .build()
            .execute(self.pool.pool())
            .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn count(&self, kind: &str, statuses: &[JobStatus]) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE kind = $1 AND status = ANY($2)",
            TABLE
        ))
        .bind(kind)
        .bind(Self::status_names(statuses))
        .fetch_one(self.pool.pool())
        .await?;

        Ok(count)
    }

    #[instrument(skip(self))]
    async fn fetch(
        &self,
        kind: &str,
        status: JobStatus,
        limit: i64,
    ) -> Result<Vec<StoredJob>, StoreError> {
        let rows = sqlx::query_as::<_, StoredJob>(&format!(
            r#"
            SELECT {}, payload
            FROM {}
            WHERE kind = $1 AND status = $2
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#,
            RECORD_COLUMNS, TABLE
        ))
        .bind(kind)
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(self.pool.pool())
        .await?;

        Ok(rows)
    }

    #[instrument(skip(self))]
    async fn delete_created_before(
        &self,
        kind: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE kind = $1 AND created_at < $2",
            TABLE
        ))
        .bind(kind)
        .bind(cutoff)
        .execute(self.pool.pool())
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn find(&self, kind: &str, id: i64) -> Result<Option<StoredJob>, StoreError> {
        let row = sqlx::query_as::<_, StoredJob>(&format!(
            "SELECT {}, payload FROM {} WHERE kind = $1 AND id = $2",
            RECORD_COLUMNS, TABLE
        ))
        .bind(kind)
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await?;

        Ok(row)
    }
}
