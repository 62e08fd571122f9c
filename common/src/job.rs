// Schedulable work capability and the built-in relay job

use crate::errors::{QueueError, SchedulerError, StoreError};
use crate::models::{JobRecord, StoredJob};
use crate::queue::{JobMessage, JobPublisher, OutgoingMessage};
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref KIND_PATTERN: Regex =
        Regex::new(r"^[a-z][a-z0-9_.-]*$").expect("kind pattern is a valid regex");
}

/// A unit of work the engine can schedule
///
/// Implementors embed a [`JobRecord`] next to their own payload. The payload
/// is stored as JSON and never interpreted by the engine; mark the record
/// field `#[serde(skip)]` so the control block is not duplicated into it.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct ReportJob {
///     #[serde(skip)]
///     record: JobRecord,
///     report_id: u64,
/// }
///
/// impl Schedulable for ReportJob {
///     const KIND: &'static str = "report";
///     fn record(&self) -> &JobRecord { &self.record }
///     fn record_mut(&mut self) -> &mut JobRecord { &mut self.record }
/// }
/// ```
#[async_trait]
pub trait Schedulable: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Job type name, also the store discriminator
    const KIND: &'static str;

    /// Read-only view of the control block
    fn record(&self) -> &JobRecord;

    fn record_mut(&mut self) -> &mut JobRecord;

    /// Dispatch the job to workers
    ///
    /// The default publishes a [`JobMessage`] on `jobs.<kind>`.
    async fn enqueue(&self, publisher: &dyn JobPublisher) -> Result<(), QueueError> {
        let message = JobMessage::from(self.record());
        publisher.publish(OutgoingMessage::for_job(&message)?).await
    }
}

/// Check that a job kind is usable as a discriminator and subject token
pub fn validate_kind(kind: &str) -> Result<(), SchedulerError> {
    if KIND_PATTERN.is_match(kind) {
        Ok(())
    } else {
        Err(SchedulerError::Configuration(format!(
            "job kind '{}' must match {}",
            kind,
            KIND_PATTERN.as_str()
        )))
    }
}

/// Serialize the caller's payload for storage
pub(crate) fn encode_payload<J: Schedulable>(job: &J) -> Result<serde_json::Value, SchedulerError> {
    serde_json::to_value(job).map_err(|e| SchedulerError::Payload(e.to_string()))
}

/// Rebuild a job from a stored row, with the row's control block
pub(crate) fn decode_job<J: Schedulable>(stored: StoredJob) -> Result<J, StoreError> {
    let mut job: J = serde_json::from_value(stored.payload)?;
    *job.record_mut() = stored.record;
    Ok(job)
}

// ============================================================================
// Relay Job
// ============================================================================

/// Envelope published by [`RelayJob`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayEnvelope {
    pub job: JobMessage,
    pub payload: serde_json::Value,
}

/// Generic job that forwards an opaque JSON payload to its own subject
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayJob {
    #[serde(skip)]
    pub record: JobRecord,
    pub subject: String,
    pub payload: serde_json::Value,
}

impl RelayJob {
    pub fn new(subject: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            record: JobRecord::default(),
            subject: subject.into(),
            payload,
        }
    }
}

#[async_trait]
impl Schedulable for RelayJob {
    const KIND: &'static str = "relay";

    fn record(&self) -> &JobRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut JobRecord {
        &mut self.record
    }

    async fn enqueue(&self, publisher: &dyn JobPublisher) -> Result<(), QueueError> {
        let envelope = RelayEnvelope {
            job: JobMessage::from(&self.record),
            payload: self.payload.clone(),
        };
        let dedup_key = envelope.job.dedup_key();
        let payload = serde_json::to_vec(&envelope)?;

        publisher
            .publish(OutgoingMessage::new(self.subject.clone(), payload).with_dedup_key(dedup_key))
            .await
    }
}
