//! Executor abstraction: the component that actually runs trials.

use async_trait::async_trait;
use hpo_optimizer::Action;
use hpo_types::ParamValue;
use std::collections::BTreeMap;

/// Errors surfaced by executor operations.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("trial {sweep_id}/{trial_index} is not known to the executor")]
    TrialNotFound { sweep_id: String, trial_index: usize },
    #[error("launch of trial {sweep_id}/{trial_index} rejected: {reason}")]
    LaunchRejected {
        sweep_id: String,
        trial_index: usize,
        reason: String,
    },
    #[error("executor internal error: {message}")]
    Internal { message: String },
}

pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Runs, stops and cleans up trials on behalf of the runner.
///
/// Executors learn nothing back through this trait; progress flows the other
/// way, as [`hpo_types::TrialReport`]s written to the sweep store.
#[async_trait]
pub trait TrialExecutor: Send + Sync {
    async fn launch(
        &self,
        sweep_id: &str,
        trial_index: usize,
        params: &BTreeMap<String, ParamValue>,
    ) -> ExecutorResult<()>;

    /// Stop a trial. Stopping a trial that already finished is not an error.
    async fn stop_trial(&self, sweep_id: &str, trial_index: usize) -> ExecutorResult<()>;

    /// Release sweep-level resources (dashboards, log collectors).
    async fn teardown_sweep(&self, sweep_id: &str) -> ExecutorResult<()>;

    /// Called once per runner pass before reconciling. Executors that push
    /// reports on their own can leave this as is.
    async fn poll(&self) -> ExecutorResult<()> {
        Ok(())
    }

    /// Carry out one controller action.
    async fn execute(&self, action: &Action) -> ExecutorResult<()> {
        match action {
            Action::LaunchTrial {
                sweep_id,
                trial_index,
                params,
            } => self.launch(sweep_id, *trial_index, params).await,
            Action::StopTrial {
                sweep_id,
                trial_index,
            } => self.stop_trial(sweep_id, *trial_index).await,
            Action::StopSweepInfra { sweep_id } => self.teardown_sweep(sweep_id).await,
        }
    }
}
