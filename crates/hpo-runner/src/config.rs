//! Runner configuration.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use hpo_optimizer::{ControllerConfig, PruningConfig, PruningMode};
use hpo_types::{config_error, HpoResult};
use serde::{Deserialize, Serialize};

use crate::runner::RunnerEvent;

/// Settings for [`crate::SweepRunner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Pause between two passes over all sweeps.
    pub tick_interval_ms: u64,
    /// Upper bound on passes in [`crate::SweepRunner::run_until_idle`].
    pub max_ticks: usize,
    pub controller: ControllerConfig,
    /// Capacity of the runner event channel. Events beyond it are dropped.
    pub event_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            max_ticks: 10_000,
            controller: ControllerConfig::default(),
            event_capacity: 1024,
        }
    }
}

impl RunnerConfig {
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_ticks(mut self, max_ticks: usize) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    pub fn with_pruning(mut self, pruning: PruningMode) -> Self {
        self.controller = self.controller.with_pruning(pruning);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn event_channel(&self) -> (Sender<RunnerEvent>, Receiver<RunnerEvent>) {
        bounded(self.event_capacity.max(1))
    }

    /// Defaults overridden by `HPO_*` environment variables.
    pub fn from_env() -> HpoResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> HpoResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64, _>(&lookup, "HPO_TICK_INTERVAL_MS")? {
            config.tick_interval_ms = ms;
        }
        if let Some(max) = parse_var::<usize, _>(&lookup, "HPO_MAX_TICKS")? {
            config.max_ticks = max;
        }

        let mut pruning = PruningConfig::default();
        if let Some(p) = parse_var::<f64, _>(&lookup, "HPO_PRUNE_PERCENTILE")? {
            pruning = pruning.with_percentile(p);
        }
        if let Some(p) = parse_var::<f64, _>(&lookup, "HPO_PRUNE_MIN_PROGRESS")? {
            pruning = pruning.with_min_progress(p);
        }

        let mode = match lookup("HPO_PRUNING").as_deref().map(str::trim) {
            None | Some("") | Some("percentile") => {
                pruning.validate()?;
                PruningMode::Percentile(pruning)
            }
            Some("none") | Some("off") => PruningMode::None,
            Some(other) => {
                return Err(config_error!(
                    "HPO_PRUNING must be 'none' or 'percentile', got '{other}'"
                ))
            }
        };
        config.controller = config.controller.with_pruning(mode);

        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> HpoResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| config_error!("invalid {key}='{raw}': {e}")),
    }
}
