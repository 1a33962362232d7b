//! In-process simulated executor.
//!
//! Trials "train" one step per [`TrialExecutor::poll`] and write their
//! progress straight into the sweep store. The objective is a deterministic
//! function of the trial's parameters, which makes whole sweeps reproducible
//! for a fixed seed.

use async_trait::async_trait;
use hpo_types::{HpoError, ParamValue, SweepError, TrialReport, TrialStage};
use hpo_store::SweepStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::executor::{ExecutorError, ExecutorResult, TrialExecutor};

/// Configuration for the simulated executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedConfig {
    /// Number of polls a trial needs to finish.
    pub steps_per_trial: u32,
    /// Trial indices whose launch is rejected.
    pub reject_launches: BTreeSet<usize>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            steps_per_trial: 4,
            reject_launches: BTreeSet::new(),
        }
    }
}

impl SimulatedConfig {
    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps_per_trial = steps.max(1);
        self
    }

    pub fn rejecting(mut self, trial_index: usize) -> Self {
        self.reject_launches.insert(trial_index);
        self
    }
}

#[derive(Debug, Clone)]
struct SimTrial {
    target: f64,
    step: u32,
}

type TrialKey = (String, usize);

/// A fully in-process executor used for tests and local runs.
pub struct SimulatedExecutor<S: SweepStore> {
    store: Arc<S>,
    config: SimulatedConfig,
    trials: Mutex<BTreeMap<TrialKey, SimTrial>>,
    torn_down: Mutex<Vec<String>>,
}

impl<S: SweepStore> SimulatedExecutor<S> {
    pub fn new(store: Arc<S>, config: SimulatedConfig) -> Self {
        Self {
            store,
            config,
            trials: Mutex::new(BTreeMap::new()),
            torn_down: Mutex::new(Vec::new()),
        }
    }

    pub fn with_defaults(store: Arc<S>) -> Self {
        Self::new(store, SimulatedConfig::default())
    }

    /// Trials currently being simulated.
    pub fn live_trials(&self, sweep_id: &str) -> Vec<usize> {
        self.trials
            .lock()
            .keys()
            .filter(|(id, _)| id == sweep_id)
            .map(|(_, index)| *index)
            .collect()
    }

    /// Sweeps whose infrastructure has been torn down, in call order.
    pub fn torn_down(&self) -> Vec<String> {
        self.torn_down.lock().clone()
    }

    /// Move every live trial forward by one step and report it.
    /// Returns the number of reports the store accepted.
    ///
    /// A trial stays live until its final report is stored. Reports the store
    /// fails to take are retried on the next call; the rest of the batch is
    /// still delivered and the failures are returned together.
    pub fn advance(&self) -> ExecutorResult<usize> {
        let steps = self.config.steps_per_trial;
        let reports: Vec<TrialReport> = self
            .trials
            .lock()
            .iter_mut()
            .map(|((sweep_id, index), trial)| {
                // A finished trial whose final report was lost repeats it.
                if trial.step < steps {
                    trial.step += 1;
                }
                let progress = f64::from(trial.step) / f64::from(steps);
                let stage = if trial.step >= steps {
                    TrialStage::Succeeded
                } else {
                    TrialStage::Running
                };
                TrialReport::new(sweep_id.clone(), *index)
                    .with_stage(stage)
                    .with_metric(learning_curve(trial.target, progress), progress.min(1.0))
            })
            .collect();

        let mut accepted = 0;
        let mut failures = Vec::new();
        for report in &reports {
            let key = (report.sweep_id.clone(), report.trial_index);
            let finished = report.stage == Some(TrialStage::Succeeded);
            match self.store.report(report) {
                Ok(applied) => {
                    if applied {
                        accepted += 1;
                    }
                    if finished {
                        self.trials.lock().remove(&key);
                    }
                }
                // The sweep was deleted underneath the trial.
                Err(HpoError::Sweep(SweepError::NotFound { .. })) => {
                    self.trials.lock().remove(&key);
                }
                Err(e) => {
                    warn!(sweep = %report.sweep_id, trial = report.trial_index, error = %e, "report not stored, will retry");
                    failures.push(format!("{}/{}: {e}", report.sweep_id, report.trial_index));
                }
            }
        }

        if failures.is_empty() {
            Ok(accepted)
        } else {
            Err(ExecutorError::Internal {
                message: format!(
                    "{} of {} reports not stored: {}",
                    failures.len(),
                    reports.len(),
                    failures.join("; ")
                ),
            })
        }
    }
}

#[async_trait]
impl<S: SweepStore> TrialExecutor for SimulatedExecutor<S> {
    async fn launch(
        &self,
        sweep_id: &str,
        trial_index: usize,
        params: &BTreeMap<String, ParamValue>,
    ) -> ExecutorResult<()> {
        if self.config.reject_launches.contains(&trial_index) {
            return Err(ExecutorError::LaunchRejected {
                sweep_id: sweep_id.to_string(),
                trial_index,
                reason: "simulated launch failure".to_string(),
            });
        }
        let target = objective(params);
        debug!(sweep = %sweep_id, trial = trial_index, objective = target, "simulated trial started");
        self.trials.lock().insert(
            (sweep_id.to_string(), trial_index),
            SimTrial { target, step: 0 },
        );
        Ok(())
    }

    async fn stop_trial(&self, sweep_id: &str, trial_index: usize) -> ExecutorResult<()> {
        let removed = self
            .trials
            .lock()
            .remove(&(sweep_id.to_string(), trial_index))
            .is_some();
        debug!(sweep = %sweep_id, trial = trial_index, removed, "simulated trial stopped");
        Ok(())
    }

    async fn teardown_sweep(&self, sweep_id: &str) -> ExecutorResult<()> {
        self.trials.lock().retain(|(id, _), _| id != sweep_id);
        self.torn_down.lock().push(sweep_id.to_string());
        info!(sweep = %sweep_id, "simulated sweep infrastructure torn down");
        Ok(())
    }

    async fn poll(&self) -> ExecutorResult<()> {
        self.advance().map(|_| ())
    }
}

/// Final metric a trial converges to. Floats below 0.1 are scored on a log10
/// scale around 1e-3, other floats around 0.5. Strings add a fixed offset.
fn objective(params: &BTreeMap<String, ParamValue>) -> f64 {
    params
        .values()
        .map(|value| match value {
            ParamValue::Float(f) if *f > 0.0 && *f < 1e-1 => (f.log10() + 3.0).powi(2) * 0.1,
            ParamValue::Float(f) => (f - 0.5).powi(2),
            ParamValue::Int(i) => (*i as f64).abs().ln_1p() * 0.01,
            ParamValue::Str(s) => f64::from(s.bytes().map(u32::from).sum::<u32>() % 7) * 0.05,
        })
        .sum()
}

/// Metric observed at `progress`, decaying towards `target`.
fn learning_curve(target: f64, progress: f64) -> f64 {
    target + (1.0 - progress.min(1.0))
}
