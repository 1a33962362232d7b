//! Persistence for sweeps and their trial records.
//!
//! Every sweep is stored together with its trials under a revision number.
//! Writers commit against the revision they read; if anything else wrote in
//! between (an executor report, a stop request) the commit fails with
//! [`StoreError::StaleSnapshot`] and the caller re-reads on its next tick.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use hpo_types::{
    HpoResult, StoreError, SweepError, SweepSpec, SweepStage, TrialRecord, TrialReport,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A sweep and all of its trials as of one revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSnapshot {
    pub spec: SweepSpec,
    pub trials: Vec<TrialRecord>,
    pub revision: u64,
    pub updated_at: DateTime<Utc>,
}

impl SweepSnapshot {
    fn new(spec: SweepSpec, revision: u64) -> Self {
        Self {
            spec,
            trials: Vec::new(),
            revision,
            updated_at: Utc::now(),
        }
    }

    fn check_revision(&self, expected: u64) -> HpoResult<()> {
        if self.revision != expected {
            return Err(StoreError::StaleSnapshot {
                sweep_id: self.spec.sweep_id.clone(),
                expected,
                actual: self.revision,
            }
            .into());
        }
        Ok(())
    }

    fn touch(&mut self) -> u64 {
        self.revision += 1;
        self.updated_at = Utc::now();
        self.revision
    }

    /// Replace spec and trials if nothing was written since `expected`.
    fn commit(&mut self, spec: &SweepSpec, trials: &[TrialRecord], expected: u64) -> HpoResult<u64> {
        self.check_revision(expected)?;
        if spec.sweep_id != self.spec.sweep_id {
            return Err(hpo_types::HpoError::configuration(
                &self.spec.sweep_id,
                format!("cannot commit sweep '{}' over it", spec.sweep_id),
            ));
        }
        spec.validate_snapshot(trials)?;

        let mut trials = trials.to_vec();
        trials.sort_by_key(|t| t.trial_index);
        self.spec = spec.clone();
        self.trials = trials;
        Ok(self.touch())
    }

    fn apply_report(&mut self, report: &TrialReport) -> HpoResult<bool> {
        let direction = self.spec.direction;
        let trial = self
            .trials
            .iter_mut()
            .find(|t| t.trial_index == report.trial_index)
            .ok_or_else(|| SweepError::UnknownTrial {
                sweep_id: report.sweep_id.clone(),
                trial_index: report.trial_index,
            })?;

        let applied = trial.apply_report(report, direction)?;
        if applied {
            self.touch();
        } else {
            debug!(
                sweep = %report.sweep_id,
                trial = report.trial_index,
                stage = %trial.stage,
                reported = ?report.stage,
                "ignored backwards trial report"
            );
        }
        Ok(applied)
    }

    fn set_desired_stage(&mut self, stage: SweepStage) -> u64 {
        self.spec.desired_stage = stage;
        self.touch()
    }

    fn is_live(&self) -> bool {
        !self.spec.stage.is_terminal() && self.spec.trials_launched > 0
    }
}

/// Record store keyed by `sweep_id` and `(sweep_id, trial_index)`.
///
/// Implementations must apply each call atomically with respect to other
/// calls on the same sweep.
pub trait SweepStore: Send + Sync {
    /// Consistent snapshot of one sweep.
    fn get(&self, sweep_id: &str) -> HpoResult<Option<SweepSnapshot>>;

    /// Atomically replace a sweep's spec and trials. Fails with
    /// `StaleSnapshot` unless the store is still at `expected_revision`.
    /// Returns the new revision.
    fn put(&self, spec: &SweepSpec, trials: &[TrialRecord], expected_revision: u64)
        -> HpoResult<u64>;

    /// Register a new sweep, replacing a finished or never-started one with
    /// the same id. Refuses to replace a sweep that is still running.
    fn insert(&self, spec: SweepSpec) -> HpoResult<u64>;

    fn list_by_sweep(&self, sweep_id: &str) -> HpoResult<Vec<TrialRecord>>;

    fn list_sweeps(&self) -> HpoResult<Vec<String>>;

    /// Fold an executor report into the stored trial. `Ok(false)` when the
    /// report was dropped as a backwards transition.
    fn report(&self, report: &TrialReport) -> HpoResult<bool>;

    /// Caller-side write of `desired_stage`.
    fn set_desired_stage(&self, sweep_id: &str, stage: SweepStage) -> HpoResult<u64>;

    /// Remove a sweep together with all its trials. Returns whether it existed.
    fn delete(&self, sweep_id: &str) -> HpoResult<bool>;
}

fn not_found(sweep_id: &str) -> hpo_types::HpoError {
    SweepError::NotFound {
        sweep_id: sweep_id.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_types::{HpoError, TrialStage};
    use std::collections::BTreeMap;

    fn snapshot_with_trials(n: usize) -> SweepSnapshot {
        let mut spec = SweepSpec::new("a", 5, 2).with_seed(1);
        spec.trials_launched = n;
        spec.stage = SweepStage::Running;
        let mut snap = SweepSnapshot::new(spec, 1);
        snap.trials = (0..n)
            .map(|i| TrialRecord::new("a", i, BTreeMap::new(), "val_loss"))
            .collect();
        snap
    }

    #[test]
    fn commit_requires_matching_revision() {
        let mut snap = snapshot_with_trials(1);
        let spec = snap.spec.clone();
        let trials = snap.trials.clone();

        let err = snap.commit(&spec, &trials, 0).unwrap_err();
        assert!(err.is_stale_snapshot());
        assert_eq!(snap.commit(&spec, &trials, 1).unwrap(), 2);
    }

    #[test]
    fn report_for_missing_trial_is_unknown() {
        let mut snap = snapshot_with_trials(1);
        let report = TrialReport::new("a", 4).with_stage(TrialStage::Running);
        let err = snap.apply_report(&report).unwrap_err();
        assert!(matches!(
            err,
            HpoError::Sweep(SweepError::UnknownTrial { trial_index: 4, .. })
        ));
        assert_eq!(snap.revision, 1);
    }

    #[test]
    fn ignored_report_keeps_revision() {
        let mut snap = snapshot_with_trials(1);
        snap.trials[0].stage = TrialStage::Failed;
        let report = TrialReport::new("a", 0).with_stage(TrialStage::Running);
        assert!(!snap.apply_report(&report).unwrap());
        assert_eq!(snap.revision, 1);
    }
}
