// Queue module for NATS JetStream dispatch

pub mod nats;
pub mod publisher;

pub use nats::NatsClient;
pub use publisher::{
    subject_for, JobMessage, JobPublisher, NatsJobPublisher, OutgoingMessage,
};
