// Scheduler module: job engine, its control loops and their supervisor

pub mod clock;
pub mod engine;
pub mod supervisor;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineConfig, EnqueueSummary, Scheduler, SchedulerEngine, TimeoutSummary};
pub use supervisor::{supervise, SupervisorConfig};
