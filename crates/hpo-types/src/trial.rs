//! Trial records and the reports external executors send about them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::distribution::ParamValue;
use crate::errors::{HpoResult, SweepError};
use crate::stage::TrialStage;
use crate::sweep::Direction;
use crate::validation_error;

/// One sampled training run, keyed by `(sweep_id, trial_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub sweep_id: String,
    pub trial_index: usize,
    pub params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub stage: TrialStage,
    pub metric_name: String,
    #[serde(default)]
    pub metric_value: Option<f64>,
    /// Best value reported so far, according to the sweep's direction.
    #[serde(default)]
    pub best_metric_value: Option<f64>,
    /// Fraction of the run completed, in `[0, 1]`.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl TrialRecord {
    pub fn new(
        sweep_id: impl Into<String>,
        trial_index: usize,
        params: BTreeMap<String, ParamValue>,
        metric_name: impl Into<String>,
    ) -> Self {
        Self {
            sweep_id: sweep_id.into(),
            trial_index,
            params,
            stage: TrialStage::NotStarted,
            metric_name: metric_name.into(),
            metric_value: None,
            best_metric_value: None,
            progress: None,
            failure_reason: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.stage.is_active()
    }

    /// Fold an executor report into this record.
    ///
    /// Returns `Ok(false)` when the report would move the trial backwards
    /// (for instance a late `Running` after `Failed`); such reports are
    /// dropped without touching the record. Malformed values are rejected
    /// before anything is written.
    pub fn apply_report(&mut self, report: &TrialReport, direction: Direction) -> HpoResult<bool> {
        if report.sweep_id != self.sweep_id || report.trial_index != self.trial_index {
            return Err(SweepError::UnknownTrial {
                sweep_id: report.sweep_id.clone(),
                trial_index: report.trial_index,
            }
            .into());
        }
        if let Some(progress) = report.progress {
            if !(0.0..=1.0).contains(&progress) {
                return Err(validation_error!(
                    "progress {progress} for trial {} is outside [0, 1]",
                    self.trial_index
                ));
            }
        }
        if let Some(value) = report.metric_value {
            if !value.is_finite() {
                return Err(validation_error!(
                    "metric value {value} for trial {} is not finite",
                    self.trial_index
                ));
            }
        }

        let target = report.stage.unwrap_or(self.stage);
        if !self.stage.can_transition_to(target) {
            return Ok(false);
        }

        self.stage = target;
        if let Some(progress) = report.progress {
            self.progress = Some(progress);
        }
        if let Some(value) = report.metric_value {
            self.metric_value = Some(value);
            self.best_metric_value = Some(direction.best_of(self.best_metric_value, value));
        }
        if target == TrialStage::Failed {
            if let Some(reason) = &report.failure_reason {
                self.failure_reason = Some(reason.clone());
            }
        }
        Ok(true)
    }
}

/// Stage/metric/progress update for one trial, as observed by an executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialReport {
    pub sweep_id: String,
    pub trial_index: usize,
    #[serde(default)]
    pub stage: Option<TrialStage>,
    #[serde(default)]
    pub metric_value: Option<f64>,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl TrialReport {
    pub fn new(sweep_id: impl Into<String>, trial_index: usize) -> Self {
        Self {
            sweep_id: sweep_id.into(),
            trial_index,
            stage: None,
            metric_value: None,
            progress: None,
            failure_reason: None,
        }
    }

    pub fn with_stage(mut self, stage: TrialStage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_metric(mut self, value: f64, progress: f64) -> Self {
        self.metric_value = Some(value);
        self.progress = Some(progress);
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.stage = Some(TrialStage::Failed);
        self.failure_reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::HpoError;

    fn running_trial() -> TrialRecord {
        let mut params = BTreeMap::new();
        params.insert("lr".to_string(), ParamValue::Float(0.01));
        let mut trial = TrialRecord::new("a", 0, params, "val_loss");
        trial.stage = TrialStage::Running;
        trial
    }

    #[test]
    fn best_metric_tracks_direction() {
        let mut trial = running_trial();
        for value in [0.9, 0.5, 0.7] {
            let report = TrialReport::new("a", 0).with_metric(value, 0.5);
            assert!(trial.apply_report(&report, Direction::Minimize).unwrap());
        }
        assert_eq!(trial.metric_value, Some(0.7));
        assert_eq!(trial.best_metric_value, Some(0.5));

        let mut trial = running_trial();
        for value in [0.2, 0.8, 0.6] {
            let report = TrialReport::new("a", 0).with_metric(value, 0.5);
            trial.apply_report(&report, Direction::Maximize).unwrap();
        }
        assert_eq!(trial.best_metric_value, Some(0.8));
    }

    #[test]
    fn failed_trial_is_never_revived() {
        let mut trial = running_trial();
        let failed = TrialReport::new("a", 0).failed("CUDA out of memory");
        assert!(trial.apply_report(&failed, Direction::Minimize).unwrap());
        assert_eq!(trial.stage, TrialStage::Failed);
        assert_eq!(trial.failure_reason.as_deref(), Some("CUDA out of memory"));

        for stage in [TrialStage::Running, TrialStage::NotStarted, TrialStage::Succeeded] {
            let late = TrialReport::new("a", 0).with_stage(stage).with_metric(0.1, 0.9);
            assert!(!trial.apply_report(&late, Direction::Minimize).unwrap());
            assert_eq!(trial.stage, TrialStage::Failed);
            assert_eq!(trial.metric_value, None);
        }
    }

    #[test]
    fn failure_reason_only_recorded_for_failed() {
        let mut trial = running_trial();
        let mut report = TrialReport::new("a", 0).with_stage(TrialStage::Succeeded);
        report.failure_reason = Some("ignored".into());
        trial.apply_report(&report, Direction::Minimize).unwrap();
        assert_eq!(trial.stage, TrialStage::Succeeded);
        assert!(trial.failure_reason.is_none());
    }

    #[test]
    fn rejects_out_of_range_progress() {
        let mut trial = running_trial();
        let report = TrialReport::new("a", 0).with_metric(0.3, 1.5);
        let err = trial.apply_report(&report, Direction::Minimize).unwrap_err();
        assert!(matches!(err, HpoError::Validation(_)));
        assert_eq!(trial.metric_value, None);
    }

    #[test]
    fn rejects_report_for_other_trial() {
        let mut trial = running_trial();
        let report = TrialReport::new("a", 3).with_stage(TrialStage::Running);
        let err = trial.apply_report(&report, Direction::Minimize).unwrap_err();
        assert!(matches!(err, HpoError::Sweep(SweepError::UnknownTrial { trial_index: 3, .. })));
    }
}
