use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;

// ============================================================================
// Job Status
// ============================================================================

/// JobStatus represents where a job sits in its lifecycle
///
/// ```text
/// Created -> Queued -> InProgress -> Succeeded
///                                  -> Failed
///            Queued | InProgress  -> Timeout
/// Failed | Timeout -> Created   (retry)
/// ```
///
/// A worker may also report a final result straight from `Queued` when the
/// progress signal was lost or arrived late.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Queued,
    InProgress,
    Succeeded,
    Failed,
    Timeout,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::InProgress,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Timeout,
    ];

    /// Statuses counted against the in-flight ceiling
    pub const IN_FLIGHT: [JobStatus; 2] = [JobStatus::Queued, JobStatus::InProgress];

    /// Statuses the retry loop resubmits
    pub const RETRYABLE: [JobStatus; 2] = [JobStatus::Failed, JobStatus::Timeout];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }

    pub fn is_retryable(&self) -> bool {
        Self::RETRYABLE.contains(self)
    }

    /// Terminal statuses, including the ones the retry loop may revive
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Timeout
        )
    }

    /// Whether the lifecycle has an edge from `self` to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Created, Queued)
                | (Queued, InProgress)
                | (Queued, Succeeded)
                | (Queued, Failed)
                | (Queued, Timeout)
                | (InProgress, Succeeded)
                | (InProgress, Failed)
                | (InProgress, Timeout)
                | (Failed, Created)
                | (Timeout, Created)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobStatus::Created),
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "timeout" => Ok(JobStatus::Timeout),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

// ============================================================================
// Job Record
// ============================================================================

/// JobRecord is the control block the engine tracks for every unit of work
///
/// The caller's job type embeds one of these next to its own payload. The
/// engine owns every field except `kind`, which is stamped on insert.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct JobRecord {
    /// Store-assigned identifier, zero until the job is added
    pub id: i64,
    /// Job type discriminator, see `Schedulable::KIND`
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub in_progressed_at: Option<DateTime<Utc>>,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub retry_count: i32,
    pub failure_message: Option<String>,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            id: 0,
            kind: String::new(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            queued_at: None,
            in_progressed_at: None,
            status: JobStatus::Created,
            retry_count: 0,
            failure_message: None,
        }
    }
}

impl JobRecord {
    /// A fresh control block for a row inserted at `now`
    pub fn created(id: i64, kind: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: kind.into(),
            created_at: now,
            updated_at: now,
            ..Self::default()
        }
    }

    /// Whether the record has been persisted
    pub fn is_persisted(&self) -> bool {
        self.id > 0
    }
}

/// StoredJob is a row as read back from the job store
#[derive(Debug, Clone, FromRow)]
pub struct StoredJob {
    #[sqlx(flatten)]
    pub record: JobRecord,
    pub payload: serde_json::Value,
}
