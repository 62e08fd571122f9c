// Job publisher: the transport behind `Schedulable::enqueue`

use crate::errors::QueueError;
use crate::models::JobRecord;
use crate::queue::nats::NatsClient;
use async_nats::jetstream::context::PublishAckFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Message announcing an admitted job to workers
///
/// Workers report back with `set_in_progress_by_id` / `set_result_by_id`
/// using `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub job_id: i64,
    pub kind: String,
    /// Retry pass this dispatch belongs to, zero for the first attempt
    pub retry_count: i32,
    pub published_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobMessage {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.id,
            kind: record.kind.clone(),
            retry_count: record.retry_count,
            published_at: Utc::now(),
        }
    }
}

impl JobMessage {
    /// Deduplication key, stable across re-dispatches of the same pass
    pub fn dedup_key(&self) -> String {
        format!("{}-{}-{}", self.kind, self.job_id, self.retry_count)
    }
}

/// Default subject for jobs of `kind`
pub fn subject_for(kind: &str) -> String {
    format!("jobs.{}", kind)
}

/// Outgoing message with optional deduplication id
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub dedup_key: Option<String>,
}

impl OutgoingMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            dedup_key: None,
        }
    }

    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Encode a `JobMessage` for the default subject of its kind
    pub fn for_job(message: &JobMessage) -> Result<Self, QueueError> {
        let payload = serde_json::to_vec(message)?;
        Ok(Self::new(subject_for(&message.kind), payload).with_dedup_key(message.dedup_key()))
    }
}

/// JobPublisher trait for handing messages to the work channel
#[async_trait::async_trait]
pub trait JobPublisher: Send + Sync {
    /// Publish a message and wait until the transport has accepted it
    async fn publish(&self, message: OutgoingMessage) -> Result<(), QueueError>;
}

/// NATS-based job publisher implementation
pub struct NatsJobPublisher {
    client: NatsClient,
    publish_timeout: Duration,
}

impl NatsJobPublisher {
    /// Create a new NATS job publisher
    pub fn new(client: NatsClient) -> Self {
        let publish_timeout = Duration::from_secs(client.config().publish_timeout_seconds);
        Self {
            client,
            publish_timeout,
        }
    }
}

#[async_trait::async_trait]
impl JobPublisher for NatsJobPublisher {
    #[instrument(skip(self, message), fields(subject = %message.subject))]
    async fn publish(&self, message: OutgoingMessage) -> Result<(), QueueError> {
        let mut headers = async_nats::HeaderMap::new();
        if let Some(key) = &message.dedup_key {
            headers.insert("Nats-Msg-Id", key.as_str());
        }

        let publish_future: PublishAckFuture = self
            .client
            .jetstream()
            .publish_with_headers(message.subject.clone(), headers, message.payload.into())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("Failed to publish message: {}", e)))?;

        match tokio::time::timeout(self.publish_timeout, publish_future).await {
            Ok(Ok(_ack)) => {
                debug!("Message published");
                Ok(())
            }
            Ok(Err(e)) => Err(QueueError::PublishFailed(format!(
                "Failed to get publish acknowledgment: {}",
                e
            ))),
            Err(_) => Err(QueueError::Timeout(format!(
                "Publish acknowledgment timeout after {:?}",
                self.publish_timeout
            ))),
        }
    }
}
