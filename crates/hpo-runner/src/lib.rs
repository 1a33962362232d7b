pub mod config;
pub mod executor;
pub mod runner;
pub mod simulated;

pub use config::RunnerConfig;
pub use executor::{ExecutorError, ExecutorResult, TrialExecutor};
pub use runner::{RunnerEvent, SweepRunner, TickOutcome};
pub use simulated::{SimulatedConfig, SimulatedExecutor};
