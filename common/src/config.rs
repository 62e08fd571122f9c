// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::scheduler::{EngineConfig, SupervisorConfig};

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub nats: NatsConfig,
    pub engine: EngineSettings,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

fn default_run_migrations() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    pub url: String,
    pub stream_name: String,
    pub publish_timeout_seconds: u64,
}

/// Engine tuning, all durations in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    pub max_retry: u32,
    pub max_in_flight_jobs: u32,
    pub queued_timeout_seconds: u64,
    pub in_progress_timeout_seconds: u64,
    pub old_job_retention_seconds: u64,
    pub enqueue_check_interval_seconds: u64,
    pub timeout_check_interval_seconds: u64,
    pub retry_check_interval_seconds: u64,
    pub max_loop_restarts: u32,
    pub loop_restart_delay_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_port: u16,
    pub tracing_endpoint: Option<String>,
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with built-in defaults so partial files are enough
            .add_source(Config::try_from(&Settings::default())?)
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        // Validate database config
        if self.database.url.is_empty() {
            return Err("Database URL cannot be empty".to_string());
        }
        if self.database.max_connections == 0 {
            return Err("Database max_connections must be greater than 0".to_string());
        }

        // Validate NATS config
        if self.nats.url.is_empty() {
            return Err("NATS URL cannot be empty".to_string());
        }
        if self.nats.stream_name.is_empty() {
            return Err("NATS stream_name cannot be empty".to_string());
        }

        // Validate engine config
        let engine = &self.engine;
        if engine.max_in_flight_jobs == 0 {
            return Err("Engine max_in_flight_jobs must be greater than 0".to_string());
        }
        if engine.enqueue_check_interval_seconds == 0
            || engine.timeout_check_interval_seconds == 0
            || engine.retry_check_interval_seconds == 0
        {
            return Err("Engine check intervals must be greater than 0".to_string());
        }

        // Cleanup deletes by age regardless of status, so retention has to
        // outlive the longest legitimate stay in flight plus one retry pass.
        let in_flight_budget = engine
            .queued_timeout_seconds
            .checked_add(engine.in_progress_timeout_seconds)
            .and_then(|sum| sum.checked_add(engine.retry_check_interval_seconds))
            .ok_or_else(|| {
                "Engine queued + in-progress timeouts plus the retry interval overflow".to_string()
            })?;
        if engine.old_job_retention_seconds <= in_flight_budget {
            return Err(format!(
                "Engine old_job_retention_seconds ({}) must exceed queued + in-progress timeouts plus the retry interval ({})",
                engine.old_job_retention_seconds, in_flight_budget
            ));
        }

        Ok(())
    }
}

impl EngineSettings {
    /// Convert to the engine's runtime configuration
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_retry: self.max_retry,
            max_in_flight_jobs: self.max_in_flight_jobs,
            queued_timeout: Duration::from_secs(self.queued_timeout_seconds),
            in_progress_timeout: Duration::from_secs(self.in_progress_timeout_seconds),
            old_job_retention: Duration::from_secs(self.old_job_retention_seconds),
            enqueue_check_interval: Duration::from_secs(self.enqueue_check_interval_seconds),
            timeout_check_interval: Duration::from_secs(self.timeout_check_interval_seconds),
            retry_check_interval: Duration::from_secs(self.retry_check_interval_seconds),
            supervisor: SupervisorConfig {
                max_restarts: self.max_loop_restarts,
                restart_delay: Duration::from_secs(self.loop_restart_delay_seconds),
                ..SupervisorConfig::default()
            },
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgresql://localhost/job_orchestrator".to_string(),
                max_connections: 10,
                min_connections: 2,
                connect_timeout_seconds: 30,
                run_migrations: true,
            },
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                stream_name: "JOBS".to_string(),
                publish_timeout_seconds: 5,
            },
            engine: EngineSettings {
                max_retry: 3,
                max_in_flight_jobs: 100,
                queued_timeout_seconds: 300,
                in_progress_timeout_seconds: 1800,
                old_job_retention_seconds: 7 * 24 * 3600,
                enqueue_check_interval_seconds: 5,
                timeout_check_interval_seconds: 30,
                retry_check_interval_seconds: 60,
                max_loop_restarts: 10,
                loop_restart_delay_seconds: 5,
            },
            observability: ObservabilityConfig {
                log_level: "info".to_string(),
                metrics_port: 9090,
                tracing_endpoint: None,
            },
        }
    }
}
