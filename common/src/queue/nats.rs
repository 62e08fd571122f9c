// NATS JetStream client used to dispatch admitted jobs

use crate::config::NatsConfig;
use crate::errors::QueueError;
use async_nats::jetstream::{
    stream::{Config as StreamConfig, RetentionPolicy, Stream},
    Context as JetStreamContext,
};
use std::time::Duration;
use tracing::{info, instrument};

/// Subject filter covering every job kind
pub const JOB_SUBJECTS: &str = "jobs.>";

/// Maximum age of undelivered messages in the stream
const STREAM_MAX_AGE: Duration = Duration::from_secs(86400);

/// NATS JetStream client
pub struct NatsClient {
    jetstream: JetStreamContext,
    config: NatsConfig,
}

impl NatsClient {
    /// Create a NatsClient from an existing async_nats::Client
    pub fn from_client(client: async_nats::Client, config: NatsConfig) -> Self {
        Self {
            jetstream: async_nats::jetstream::new(client),
            config,
        }
    }

    /// Create a new NATS client and connect to the server
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn connect(config: NatsConfig) -> Result<Self, QueueError> {
        info!("Connecting to NATS server");

        let client = async_nats::connect(&config.url)
            .await
            .map_err(|e| QueueError::Connection(format!("Failed to connect to NATS: {}", e)))?;

        info!("Connected to NATS server successfully");
        Ok(Self::from_client(client, config))
    }

    /// Create the work-queue stream if it does not exist yet
    #[instrument(skip(self))]
    pub async fn initialize_stream(&self) -> Result<Stream, QueueError> {
        info!(stream_name = %self.config.stream_name, "Initializing JetStream stream");

        let stream_config = StreamConfig {
            name: self.config.stream_name.clone(),
            subjects: vec![JOB_SUBJECTS.to_string()],
            // Messages are removed once a worker acknowledges them
            retention: RetentionPolicy::WorkQueue,
            max_age: STREAM_MAX_AGE,
            ..Default::default()
        };

        let stream = self
            .jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| QueueError::StreamCreation(format!("Failed to create stream: {}", e)))?;

        info!(stream_name = %self.config.stream_name, "Stream initialized successfully");
        Ok(stream)
    }

    /// Get the JetStream context for publishing
    pub fn jetstream(&self) -> &JetStreamContext {
        &self.jetstream
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Health check - verify the stream is reachable
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), QueueError> {
        self.jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| QueueError::HealthCheck(format!("Health check failed: {}", e)))?;

        Ok(())
    }
}
