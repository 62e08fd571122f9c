// Restarting supervisor for the engine's control loops

use crate::errors::SchedulerError;
use crate::telemetry;
use futures::future::BoxFuture;
use std::any::Any;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Restart policy for a supervised loop
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Relaunches allowed after consecutive panics before giving up
    pub max_restarts: u32,
    /// Pause before each relaunch
    pub restart_delay: Duration,
    /// An incarnation that survives this long resets the consecutive count
    pub reset_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            restart_delay: Duration::from_secs(5),
            reset_after: Duration::from_secs(300),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run a loop as a tokio task and relaunch it when it panics
///
/// `factory` builds a fresh incarnation of the loop from a shutdown receiver.
/// Returns `Ok(())` once the loop exits on its own (normally after shutdown)
/// and `SchedulerError::LoopExhausted` once it has panicked more than
/// `max_restarts` times in a row.
pub async fn supervise<F>(
    name: &'static str,
    config: SupervisorConfig,
    factory: F,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), SchedulerError>
where
    F: Fn(watch::Receiver<bool>) -> BoxFuture<'static, ()> + Send + Sync,
{
    let mut consecutive_panics: u32 = 0;

    loop {
        let started = Instant::now();
        let outcome = tokio::spawn(factory(shutdown.clone())).await;

        let err = match outcome {
            Ok(()) => {
                info!(loop_name = name, "Loop exited");
                return Ok(());
            }
            Err(err) if err.is_panic() => err,
            Err(err) => {
                warn!(loop_name = name, error = %err, "Loop task was cancelled");
                return Ok(());
            }
        };

        if started.elapsed() >= config.reset_after {
            consecutive_panics = 0;
        }
        consecutive_panics += 1;
        telemetry::record_loop_restart(name);

        let message = panic_message(err.into_panic());
        if consecutive_panics > config.max_restarts {
            error!(
                loop_name = name,
                panic = %message,
                max_restarts = config.max_restarts,
                "Loop panicked too many times in a row, giving up"
            );
            return Err(SchedulerError::LoopExhausted {
                loop_name: name.to_string(),
                restarts: config.max_restarts,
            });
        }

        error!(
            loop_name = name,
            panic = %message,
            attempt = consecutive_panics,
            max_restarts = config.max_restarts,
            delay_ms = config.restart_delay.as_millis() as u64,
            "Loop panicked, restarting"
        );

        tokio::select! {
            _ = tokio::time::sleep(config.restart_delay) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => {
                info!(loop_name = name, "Shutdown requested during restart delay");
                return Ok(());
            }
        }
    }
}
