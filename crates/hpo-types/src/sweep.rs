//! Sweep records: the desired/observed state of one hyperparameter search.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::distribution::{parse_script_arguments, Distribution, ParamValue};
use crate::errors::{HpoError, HpoResult};
use crate::stage::{SweepStage, TrialStage};
use crate::trial::TrialRecord;

/// Whether the sweep is minimizing or maximizing its metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Minimize,
    Maximize,
}

impl Default for Direction {
    fn default() -> Self {
        Self::Minimize
    }
}

impl Direction {
    /// True when `candidate` strictly improves on `incumbent`.
    pub fn is_better(&self, candidate: f64, incumbent: f64) -> bool {
        match self {
            Direction::Maximize => candidate > incumbent,
            Direction::Minimize => candidate < incumbent,
        }
    }

    /// The better of an optional incumbent and a new observation.
    pub fn best_of(&self, incumbent: Option<f64>, candidate: f64) -> f64 {
        match incumbent {
            Some(current) if !self.is_better(candidate, current) => current,
            _ => candidate,
        }
    }
}

/// One sweep: trial budget, search space, and the two lifecycle fields.
///
/// `stage` is written only by the reconciliation controller; `desired_stage`
/// only by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    pub sweep_id: String,
    pub total_trials: usize,
    pub concurrency_limit: usize,
    #[serde(default)]
    pub trials_launched: usize,
    pub distributions: BTreeMap<String, Distribution>,
    /// Non-distributed script arguments copied into every trial.
    #[serde(default)]
    pub fixed_params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub direction: Direction,
    pub metric_name: String,
    /// Root seed; trial `i` samples from stream `i` of this seed.
    pub seed: u64,
    #[serde(default)]
    pub stage: SweepStage,
    #[serde(default = "default_desired_stage")]
    pub desired_stage: SweepStage,
}

fn default_desired_stage() -> SweepStage {
    SweepStage::Running
}

impl SweepSpec {
    pub fn new(sweep_id: impl Into<String>, total_trials: usize, concurrency_limit: usize) -> Self {
        Self {
            sweep_id: sweep_id.into(),
            total_trials,
            concurrency_limit,
            trials_launched: 0,
            distributions: BTreeMap::new(),
            fixed_params: BTreeMap::new(),
            direction: Direction::Minimize,
            metric_name: "val_loss".to_string(),
            seed: rand::random(),
            stage: SweepStage::NotStarted,
            desired_stage: SweepStage::Running,
        }
    }

    pub fn with_distribution(mut self, name: impl Into<String>, distribution: Distribution) -> Self {
        self.distributions.insert(name.into(), distribution);
        self
    }

    pub fn with_fixed_param(mut self, name: impl Into<String>, value: ParamValue) -> Self {
        self.fixed_params.insert(name.into(), value);
        self
    }

    pub fn with_objective(mut self, metric: &str, direction: Direction) -> Self {
        self.metric_name = metric.to_string();
        self.direction = direction;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// User part of a `user-hash` sweep id.
    pub fn owner(&self) -> &str {
        self.sweep_id.split('-').next().unwrap_or(&self.sweep_id)
    }

    pub fn budget_exhausted(&self) -> bool {
        self.trials_launched >= self.total_trials
    }

    /// Check the record's own invariants.
    pub fn validate(&self) -> HpoResult<()> {
        let id = &self.sweep_id;
        if id.trim().is_empty() {
            return Err(HpoError::configuration(id, "sweep_id must not be empty"));
        }
        if self.total_trials == 0 {
            return Err(HpoError::configuration(id, "total_trials must be positive"));
        }
        if self.concurrency_limit == 0 {
            return Err(HpoError::configuration(id, "concurrency_limit must be positive"));
        }
        if self.concurrency_limit > self.total_trials {
            return Err(HpoError::configuration(
                id,
                format!(
                    "concurrency_limit {} exceeds total_trials {}",
                    self.concurrency_limit, self.total_trials
                ),
            ));
        }
        if self.trials_launched > self.total_trials {
            return Err(HpoError::configuration(
                id,
                format!(
                    "trials_launched {} exceeds total_trials {}",
                    self.trials_launched, self.total_trials
                ),
            ));
        }
        for (name, distribution) in &self.distributions {
            distribution.validate(name)?;
            if self.fixed_params.contains_key(name) {
                return Err(HpoError::configuration(
                    id,
                    format!("parameter '{name}' is both distributed and fixed"),
                ));
            }
        }
        Ok(())
    }

    /// Check the spec together with the trial records that claim to belong to
    /// it: ids must match, indices must be unique and below `trials_launched`,
    /// and every launched index must be present.
    pub fn validate_snapshot(&self, trials: &[TrialRecord]) -> HpoResult<()> {
        self.validate()?;

        let mut seen = BTreeSet::new();
        for trial in trials {
            if trial.sweep_id != self.sweep_id {
                return Err(HpoError::configuration(
                    &self.sweep_id,
                    format!(
                        "trial {} belongs to sweep '{}'",
                        trial.trial_index, trial.sweep_id
                    ),
                ));
            }
            if !seen.insert(trial.trial_index) {
                return Err(HpoError::configuration(
                    &self.sweep_id,
                    format!("trial index {} appears more than once", trial.trial_index),
                ));
            }
            if trial.trial_index >= self.trials_launched {
                return Err(HpoError::configuration(
                    &self.sweep_id,
                    format!(
                        "trial index {} was never launched (trials_launched = {})",
                        trial.trial_index, self.trials_launched
                    ),
                ));
            }
        }
        if seen.len() != self.trials_launched {
            return Err(HpoError::configuration(
                &self.sweep_id,
                format!(
                    "{} trials launched but {} records present",
                    self.trials_launched,
                    seen.len()
                ),
            ));
        }
        Ok(())
    }
}

/// Caller-facing request to start a sweep from command-style arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepRequest {
    #[serde(default)]
    pub sweep_id: Option<String>,
    pub total_trials: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency_limit: usize,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default = "default_metric")]
    pub metric_name: String,
    /// `--name=value` tokens; distributions and fixed arguments mixed.
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_concurrency() -> usize {
    1
}

fn default_metric() -> String {
    "val_loss".to_string()
}

impl SweepRequest {
    /// Build and validate the sweep record this request describes.
    pub fn into_spec(self) -> HpoResult<SweepSpec> {
        let sweep_id = self.sweep_id.unwrap_or_else(generate_sweep_id);
        let arguments = parse_script_arguments(self.arguments.as_slice()).map_err(|e| match e {
            HpoError::Sweep(crate::errors::SweepError::Configuration { message, .. }) => {
                HpoError::configuration(&sweep_id, message)
            }
            other => other,
        })?;

        let mut spec = SweepSpec::new(sweep_id, self.total_trials, self.concurrency_limit)
            .with_objective(&self.metric_name, self.direction);
        spec.distributions = arguments.distributions;
        spec.fixed_params = arguments.fixed;
        if let Some(seed) = self.seed {
            spec.seed = seed;
        }

        spec.validate()?;
        Ok(spec)
    }
}

/// `"{user}-{8 hex digits}"`, user taken from `$USER`.
pub fn generate_sweep_id() -> String {
    let user = std::env::var("USER")
        .ok()
        .filter(|u| !u.is_empty() && !u.contains('-'))
        .unwrap_or_else(|| "user".to_string());
    let hash = Uuid::new_v4().simple().to_string();
    format!("{user}-{}", &hash[..8])
}

/// Per-stage counts and the best finished trial of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub sweep_id: String,
    pub stage: SweepStage,
    pub desired_stage: SweepStage,
    pub total_trials: usize,
    pub trials_launched: usize,
    pub not_started: usize,
    pub running: usize,
    pub succeeded: usize,
    pub pruned: usize,
    pub failed: usize,
    pub best_trial: Option<usize>,
    pub best_metric_value: Option<f64>,
}

impl SweepSummary {
    pub fn from_snapshot(spec: &SweepSpec, trials: &[TrialRecord]) -> Self {
        let count = |stage: TrialStage| trials.iter().filter(|t| t.stage == stage).count();

        let mut best: Option<(usize, f64)> = None;
        for trial in trials.iter().filter(|t| t.stage == TrialStage::Succeeded) {
            let Some(value) = trial.best_metric_value.or(trial.metric_value) else {
                continue;
            };
            let improves = match best {
                None => true,
                Some((idx, current)) => {
                    spec.direction.is_better(value, current)
                        || (value == current && trial.trial_index < idx)
                }
            };
            if improves {
                best = Some((trial.trial_index, value));
            }
        }

        Self {
            sweep_id: spec.sweep_id.clone(),
            stage: spec.stage,
            desired_stage: spec.desired_stage,
            total_trials: spec.total_trials,
            trials_launched: spec.trials_launched,
            not_started: count(TrialStage::NotStarted),
            running: count(TrialStage::Running),
            succeeded: count(TrialStage::Succeeded),
            pruned: count(TrialStage::Pruned),
            failed: count(TrialStage::Failed),
            best_trial: best.map(|(idx, _)| idx),
            best_metric_value: best.map(|(_, v)| v),
        }
    }
}
