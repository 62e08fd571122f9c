// Common library for the job orchestration engine and its scheduler binary

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod errors;
pub mod job;
pub mod models;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod telemetry;
