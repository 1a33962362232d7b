//! Early-stopping policies for running trials.

use hpo_types::{config_error, Direction, HpoResult, TrialRecord, TrialStage};
use serde::{Deserialize, Serialize};

/// Decides whether a running trial should be stopped early.
///
/// `peers` is the full trial snapshot of the sweep and may contain `trial`
/// itself; implementations skip it by index. The decision must not depend on
/// the order of `peers`.
pub trait PruningPolicy: Send + Sync {
    fn evaluate(&self, trial: &TrialRecord, peers: &[TrialRecord], direction: Direction) -> bool;

    /// Human-readable policy name.
    fn name(&self) -> &str;
}

/// Never prunes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPruning;

impl PruningPolicy for NoPruning {
    fn evaluate(&self, _trial: &TrialRecord, _peers: &[TrialRecord], _direction: Direction) -> bool {
        false
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// Thresholds for [`PercentilePruning`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningConfig {
    /// Keep trials within the best `percentile`% of their progress bucket.
    /// 50 prunes anything worse than the median.
    pub percentile: f64,
    /// No pruning before a trial has completed this fraction of its run.
    pub min_progress: f64,
    /// Minimum number of comparable peers before any decision is made.
    pub min_peers: usize,
    /// Width of the progress buckets peers are grouped into.
    pub bucket_width: f64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            percentile: 50.0,
            min_progress: 0.25,
            min_peers: 2,
            bucket_width: 0.1,
        }
    }
}

impl PruningConfig {
    pub fn with_percentile(mut self, percentile: f64) -> Self {
        self.percentile = percentile;
        self
    }

    pub fn with_min_progress(mut self, min_progress: f64) -> Self {
        self.min_progress = min_progress;
        self
    }

    pub fn with_min_peers(mut self, min_peers: usize) -> Self {
        self.min_peers = min_peers;
        self
    }

    pub fn validate(&self) -> HpoResult<()> {
        if !(self.percentile > 0.0 && self.percentile < 100.0) {
            return Err(config_error!(
                "pruning percentile must be in (0, 100), got {}",
                self.percentile
            ));
        }
        if !(0.0..=1.0).contains(&self.min_progress) {
            return Err(config_error!(
                "pruning min_progress must be in [0, 1], got {}",
                self.min_progress
            ));
        }
        if !(self.bucket_width > 0.0 && self.bucket_width <= 1.0) {
            return Err(config_error!(
                "pruning bucket_width must be in (0, 1], got {}",
                self.bucket_width
            ));
        }
        if self.min_peers == 0 {
            return Err(config_error!("pruning min_peers must be at least 1"));
        }
        Ok(())
    }

    fn bucket(&self, progress: f64) -> u64 {
        // Nudge so that exact bucket edges (0.3 / 0.1) land in the upper bucket.
        ((progress + 1e-9) / self.bucket_width).floor() as u64
    }
}

/// Percentile pruning over peers at a comparable progress bucket.
///
/// A running trial with a metric and at least `min_progress` completed is
/// compared with every other trial (running, succeeded or already pruned)
/// whose progress falls into the same bucket. If it is worse than the
/// `percentile` threshold of those peers, it is pruned. Failed peers are
/// ignored.
#[derive(Debug, Clone)]
pub struct PercentilePruning {
    config: PruningConfig,
}

impl PercentilePruning {
    pub fn new(config: PruningConfig) -> HpoResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PruningConfig {
        &self.config
    }
}

impl Default for PercentilePruning {
    fn default() -> Self {
        Self {
            config: PruningConfig::default(),
        }
    }
}

impl PruningPolicy for PercentilePruning {
    fn evaluate(&self, trial: &TrialRecord, peers: &[TrialRecord], direction: Direction) -> bool {
        if trial.stage != TrialStage::Running {
            return false;
        }
        let (Some(value), Some(progress)) = (trial.metric_value, trial.progress) else {
            return false;
        };
        if progress < self.config.min_progress {
            return false;
        }

        let bucket = self.config.bucket(progress);
        let mut values: Vec<f64> = peers
            .iter()
            .filter(|p| p.trial_index != trial.trial_index)
            .filter(|p| {
                matches!(
                    p.stage,
                    TrialStage::Running | TrialStage::Succeeded | TrialStage::Pruned
                )
            })
            .filter_map(|p| match (p.metric_value, p.progress) {
                (Some(v), Some(pr)) if self.config.bucket(pr) == bucket => Some(v),
                _ => None,
            })
            .collect();

        if values.len() < self.config.min_peers {
            return false;
        }

        match direction {
            Direction::Minimize => {
                value > compute_percentile(&mut values, self.config.percentile)
            }
            Direction::Maximize => {
                value < compute_percentile(&mut values, 100.0 - self.config.percentile)
            }
        }
    }

    fn name(&self) -> &str {
        "percentile"
    }
}

/// Percentile of a non-empty slice with linear interpolation between the two
/// nearest ranks. Sorts the slice in place.
pub(crate) fn compute_percentile(values: &mut [f64], percentile: f64) -> f64 {
    values.sort_unstable_by(|a, b| a.total_cmp(b));
    let len = values.len();
    if len == 1 {
        return values[0];
    }
    let rank = percentile / 100.0 * (len - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        values[lower]
    } else {
        let frac = rank - lower as f64;
        values[lower] * (1.0 - frac) + values[upper] * frac
    }
}

/// Which pruning policy a controller runs with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PruningMode {
    None,
    Percentile(PruningConfig),
}

impl Default for PruningMode {
    fn default() -> Self {
        Self::Percentile(PruningConfig::default())
    }
}

impl PruningMode {
    pub fn build(&self) -> HpoResult<Box<dyn PruningPolicy>> {
        Ok(match self {
            Self::None => Box::new(NoPruning),
            Self::Percentile(config) => Box::new(PercentilePruning::new(config.clone())?),
        })
    }
}
