//! Sweep reconciliation.
//!
//! [`Controller::reconcile`] takes one consistent snapshot of a sweep and its
//! trials and returns the next snapshot plus the side effects the caller must
//! carry out. It performs no I/O, so calling it again on the same snapshot
//! yields the same answer and a failed commit can simply be retried on the
//! next tick.

use hpo_types::{
    HpoResult, ParamValue, SweepSpec, SweepStage, TrialRecord, TrialStage,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::pruning::{NoPruning, PruningMode, PruningPolicy};
use crate::sampler::sample_trial;

/// Side effect requested from the external executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    LaunchTrial {
        sweep_id: String,
        trial_index: usize,
        params: BTreeMap<String, ParamValue>,
    },
    StopTrial {
        sweep_id: String,
        trial_index: usize,
    },
    /// Tear down sweep-level infrastructure such as metric dashboards.
    StopSweepInfra { sweep_id: String },
}

impl Action {
    pub fn sweep_id(&self) -> &str {
        match self {
            Action::LaunchTrial { sweep_id, .. }
            | Action::StopTrial { sweep_id, .. }
            | Action::StopSweepInfra { sweep_id } => sweep_id,
        }
    }

    pub fn trial_index(&self) -> Option<usize> {
        match self {
            Action::LaunchTrial { trial_index, .. } | Action::StopTrial { trial_index, .. } => {
                Some(*trial_index)
            }
            Action::StopSweepInfra { .. } => None,
        }
    }
}

/// Result of one reconciliation step.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub spec: SweepSpec,
    /// All trial records of the sweep, ordered by index.
    pub trials: Vec<TrialRecord>,
    pub actions: Vec<Action>,
    pub stage_changed: bool,
}

impl Reconciliation {
    fn unchanged(spec: &SweepSpec, trials: Vec<TrialRecord>) -> Self {
        Self {
            spec: spec.clone(),
            trials,
            actions: Vec::new(),
            stage_changed: false,
        }
    }

    /// Nothing to persist and nothing to execute.
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty() && !self.stage_changed
    }

    pub fn launched(&self) -> impl Iterator<Item = usize> + '_ {
        self.actions.iter().filter_map(|a| match a {
            Action::LaunchTrial { trial_index, .. } => Some(*trial_index),
            _ => None,
        })
    }

    pub fn stopped(&self) -> impl Iterator<Item = usize> + '_ {
        self.actions.iter().filter_map(|a| match a {
            Action::StopTrial { trial_index, .. } => Some(*trial_index),
            _ => None,
        })
    }
}

/// Controller settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub pruning: PruningMode,
}

impl ControllerConfig {
    pub fn with_pruning(mut self, pruning: PruningMode) -> Self {
        self.pruning = pruning;
        self
    }
}

/// Reconciliation controller parameterised by a pruning policy.
pub struct Controller {
    policy: Box<dyn PruningPolicy>,
}

impl Controller {
    pub fn new(policy: Box<dyn PruningPolicy>) -> Self {
        Self { policy }
    }

    pub fn from_config(config: &ControllerConfig) -> HpoResult<Self> {
        Ok(Self::new(config.pruning.build()?))
    }

    pub fn without_pruning() -> Self {
        Self::new(Box::new(NoPruning))
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Advance `spec` and its `trials` by one step.
    pub fn reconcile(&self, spec: &SweepSpec, trials: &[TrialRecord]) -> HpoResult<Reconciliation> {
        reconcile(spec, trials, self.policy.as_ref())
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::without_pruning()
    }
}

/// One reconciliation step with an explicit pruning policy.
///
/// The input is validated first; on error nothing is returned but the error,
/// so the caller never sees a partially applied step.
pub fn reconcile(
    spec: &SweepSpec,
    trials: &[TrialRecord],
    policy: &dyn PruningPolicy,
) -> HpoResult<Reconciliation> {
    spec.validate_snapshot(trials)?;

    let mut trials = trials.to_vec();
    trials.sort_by_key(|t| t.trial_index);

    // Terminal sweeps are frozen, including against late stop requests.
    if spec.stage.is_terminal() {
        return Ok(Reconciliation::unchanged(spec, trials));
    }

    let mut spec = spec.clone();
    let mut actions = Vec::new();

    if spec.desired_stage == SweepStage::Stopped {
        for trial in trials.iter().filter(|t| t.is_active()) {
            actions.push(Action::StopTrial {
                sweep_id: spec.sweep_id.clone(),
                trial_index: trial.trial_index,
            });
        }
        actions.push(Action::StopSweepInfra {
            sweep_id: spec.sweep_id.clone(),
        });
        spec.stage = SweepStage::Stopped;
        debug!(sweep = %spec.sweep_id, stopped = actions.len() - 1, "sweep stopped");
        return Ok(Reconciliation {
            spec,
            trials,
            actions,
            stage_changed: true,
        });
    }

    // NotStarted trials hold their slot until the executor reports on them.
    let mut active = trials.iter().filter(|t| t.is_active()).count();
    while active < spec.concurrency_limit && !spec.budget_exhausted() {
        let trial_index = spec.trials_launched;
        let params = sample_trial(&spec, trial_index);
        trials.push(TrialRecord::new(
            spec.sweep_id.clone(),
            trial_index,
            params.clone(),
            spec.metric_name.clone(),
        ));
        actions.push(Action::LaunchTrial {
            sweep_id: spec.sweep_id.clone(),
            trial_index,
            params,
        });
        spec.trials_launched += 1;
        active += 1;
        debug!(sweep = %spec.sweep_id, trial = trial_index, "trial launched");
    }

    // Every decision sees the same peer snapshot, so pruning one trial cannot
    // influence another within this step.
    let to_prune: Vec<usize> = trials
        .iter()
        .filter(|t| t.stage == TrialStage::Running)
        .filter(|t| policy.evaluate(t, &trials, spec.direction))
        .map(|t| t.trial_index)
        .collect();
    for trial in trials.iter_mut().filter(|t| to_prune.contains(&t.trial_index)) {
        trial.stage = TrialStage::Pruned;
        actions.push(Action::StopTrial {
            sweep_id: spec.sweep_id.clone(),
            trial_index: trial.trial_index,
        });
        debug!(
            sweep = %spec.sweep_id,
            trial = trial.trial_index,
            metric = ?trial.metric_value,
            progress = ?trial.progress,
            policy = policy.name(),
            "trial pruned"
        );
    }

    // Executor-reported terminal stages are taken as they are; nothing above
    // writes to a trial that is not Running.
    let observed = observed_stage(&spec, &trials);
    let stage_changed = observed != spec.stage && spec.stage.can_transition_to(observed);
    if stage_changed {
        debug!(sweep = %spec.sweep_id, from = %spec.stage, to = %observed, "sweep stage changed");
        spec.stage = observed;
    }

    Ok(Reconciliation {
        spec,
        trials,
        actions,
        stage_changed,
    })
}

/// Stage a sweep should be in given its launch count and trial stages.
pub fn observed_stage(spec: &SweepSpec, trials: &[TrialRecord]) -> SweepStage {
    if spec.budget_exhausted() && trials.iter().all(TrialRecord::is_terminal) {
        SweepStage::Succeeded
    } else if spec.trials_launched > 0 {
        SweepStage::Running
    } else {
        SweepStage::NotStarted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pruning::{PercentilePruning, PruningConfig};
    use hpo_types::{Direction, Distribution, DistributionError, HpoError, SweepError};

    fn spec(total: usize, limit: usize) -> SweepSpec {
        SweepSpec::new("alice-1", total, limit)
            .with_distribution("lr", Distribution::LogUniform { low: 1e-4, high: 1e-1 })
            .with_distribution(
                "optimizer",
                Distribution::Categorical {
                    choices: vec!["adam".into(), "sgd".into()],
                },
            )
            .with_seed(11)
    }

    fn set_stage(trials: &mut [TrialRecord], index: usize, stage: TrialStage) {
        let trial = trials.iter_mut().find(|t| t.trial_index == index).unwrap();
        trial.stage = stage;
    }

    fn running_count(trials: &[TrialRecord]) -> usize {
        trials.iter().filter(|t| t.stage == TrialStage::Running).count()
    }

    #[test]
    fn first_step_fills_concurrency_slots_in_index_order() {
        let controller = Controller::default();
        let step = controller.reconcile(&spec(10, 3), &[]).unwrap();

        assert_eq!(step.launched().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(step.spec.trials_launched, 3);
        assert_eq!(step.spec.stage, SweepStage::Running);
        assert!(step.stage_changed);
        assert!(step.trials.iter().all(|t| t.stage == TrialStage::NotStarted));
        for trial in &step.trials {
            assert!(trial.params.contains_key("lr"));
            assert!(trial.params.contains_key("optimizer"));
            assert_eq!(trial.metric_name, "val_loss");
        }
    }

    #[test]
    fn repeated_calls_without_reports_reach_a_fixed_point() {
        let controller = Controller::new(Box::new(PercentilePruning::default()));
        let first = controller.reconcile(&spec(7, 3), &[]).unwrap();
        let second = controller.reconcile(&first.spec, &first.trials).unwrap();
        assert!(second.is_noop());
        assert_eq!(second.spec, first.spec);
        assert_eq!(second.trials, first.trials);

        let third = controller.reconcile(&second.spec, &second.trials).unwrap();
        assert_eq!(third, second);
    }

    #[test]
    fn single_slot_sweep_runs_trials_one_at_a_time() {
        let controller = Controller::default();
        let mut current = spec(5, 1);
        let mut trials = Vec::new();
        let mut order = Vec::new();

        for _ in 0..20 {
            let step = controller.reconcile(&current, &trials).unwrap();
            assert!(step.launched().count() <= 1);
            order.extend(step.launched());
            current = step.spec;
            trials = step.trials;

            assert!(trials.iter().filter(|t| t.is_active()).count() <= 1);
            assert!(running_count(&trials) <= current.concurrency_limit);

            if current.stage == SweepStage::Succeeded {
                break;
            }
            // Executor picks the trial up, then finishes it.
            let newest = current.trials_launched - 1;
            set_stage(&mut trials, newest, TrialStage::Running);
            set_stage(&mut trials, newest, TrialStage::Succeeded);
        }

        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(current.stage, SweepStage::Succeeded);
        assert_eq!(current.trials_launched, 5);
    }

    #[test]
    fn trials_launched_is_monotone_and_bounded() {
        let controller = Controller::default();
        let mut current = spec(6, 4);
        let mut trials: Vec<TrialRecord> = Vec::new();
        let mut last = 0;

        for round in 0..10 {
            let step = controller.reconcile(&current, &trials).unwrap();
            assert!(step.spec.trials_launched >= last);
            assert!(step.spec.trials_launched <= step.spec.total_trials);
            last = step.spec.trials_launched;
            current = step.spec;
            trials = step.trials;
            // Finish the lowest active trial each round.
            if let Some(t) = trials.iter_mut().find(|t| t.is_active()) {
                t.stage = if round % 2 == 0 {
                    TrialStage::Succeeded
                } else {
                    TrialStage::Failed
                };
            }
        }
        assert_eq!(current.trials_launched, 6);
    }

    #[test]
    fn succeeded_only_when_budget_exhausted_and_all_terminal() {
        let controller = Controller::default();
        let first = controller.reconcile(&spec(2, 2), &[]).unwrap();
        let mut trials = first.trials.clone();

        set_stage(&mut trials, 0, TrialStage::Succeeded);
        let step = controller.reconcile(&first.spec, &trials).unwrap();
        assert_eq!(step.spec.stage, SweepStage::Running);

        set_stage(&mut trials, 1, TrialStage::Pruned);
        let step = controller.reconcile(&first.spec, &trials).unwrap();
        assert_eq!(step.spec.stage, SweepStage::Succeeded);
        assert!(step.actions.is_empty());
    }

    #[test]
    fn succeeded_sweep_is_never_touched() {
        let controller = Controller::default();
        let mut done = spec(1, 1);
        done.trials_launched = 1;
        done.stage = SweepStage::Succeeded;
        let mut trial = TrialRecord::new("alice-1", 0, BTreeMap::new(), "val_loss");
        trial.stage = TrialStage::Succeeded;

        let step = controller.reconcile(&done, &[trial.clone()]).unwrap();
        assert!(step.is_noop());
        assert_eq!(step.spec, done);

        done.desired_stage = SweepStage::Stopped;
        let step = controller.reconcile(&done, &[trial]).unwrap();
        assert!(step.is_noop());
        assert_eq!(step.spec.stage, SweepStage::Succeeded);
    }

    #[test]
    fn stop_request_stops_every_running_trial_at_once() {
        let controller = Controller::default();
        let first = controller.reconcile(&spec(10, 3), &[]).unwrap();
        let mut trials = first.trials.clone();
        for i in 0..3 {
            set_stage(&mut trials, i, TrialStage::Running);
        }
        let mut requested = first.spec.clone();
        requested.desired_stage = SweepStage::Stopped;

        let step = controller.reconcile(&requested, &trials).unwrap();
        let stops = step
            .actions
            .iter()
            .filter(|a| matches!(a, Action::StopTrial { .. }))
            .count();
        let infra = step
            .actions
            .iter()
            .filter(|a| matches!(a, Action::StopSweepInfra { .. }))
            .count();
        assert_eq!(stops, 3);
        assert_eq!(infra, 1);
        assert_eq!(step.actions.len(), 4);
        assert_eq!(step.spec.stage, SweepStage::Stopped);
        assert_eq!(step.spec.desired_stage, SweepStage::Stopped);
        assert_eq!(step.spec.trials_launched, 3);

        let again = controller.reconcile(&step.spec, &step.trials).unwrap();
        assert!(again.is_noop());
    }

    #[test]
    fn failed_trial_is_never_revived() {
        let controller = Controller::new(Box::new(PercentilePruning::default()));
        let first = controller.reconcile(&spec(4, 2), &[]).unwrap();
        let mut trials = first.trials.clone();
        set_stage(&mut trials, 0, TrialStage::Failed);
        trials[0].failure_reason = Some("exit code 1".into());

        let mut current = first.spec.clone();
        for _ in 0..3 {
            let step = controller.reconcile(&current, &trials).unwrap();
            let failed = step.trials.iter().find(|t| t.trial_index == 0).unwrap();
            assert_eq!(failed.stage, TrialStage::Failed);
            assert_eq!(failed.failure_reason.as_deref(), Some("exit code 1"));
            current = step.spec;
            trials = step.trials;
        }
        // The failed trial freed a slot, which was refilled exactly once.
        assert_eq!(current.trials_launched, 3);
    }

    #[test]
    fn pruning_stops_underperforming_trial() {
        let controller = Controller::new(Box::new(
            PercentilePruning::new(PruningConfig::default()).unwrap(),
        ));
        let first = controller.reconcile(&spec(6, 4), &[]).unwrap();
        let mut trials = first.trials.clone();
        for (trial, value) in trials.iter_mut().zip([0.9, 0.2, 0.3, 0.25]) {
            trial.stage = TrialStage::Running;
            trial.metric_value = Some(value);
            trial.progress = Some(0.5);
        }

        // Each trial is compared with the other three: the two worse than
        // their peers' median are pruned.
        let step = controller.reconcile(&first.spec, &trials).unwrap();
        assert_eq!(step.stopped().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(step.trials[0].stage, TrialStage::Pruned);
        assert_eq!(step.trials[2].stage, TrialStage::Pruned);
        assert_eq!(step.trials[3].stage, TrialStage::Running);
        // Freed slots are refilled on the following step.
        let next = controller.reconcile(&step.spec, &step.trials).unwrap();
        assert_eq!(next.launched().collect::<Vec<_>>(), vec![4, 5]);
        assert_eq!(next.stopped().count(), 0);
    }

    #[test]
    fn direction_controls_pruning() {
        let controller = Controller::new(Box::new(PercentilePruning::default()));
        let base = spec(6, 4).with_objective("val_acc", Direction::Maximize);
        let first = controller.reconcile(&base, &[]).unwrap();
        let mut trials = first.trials.clone();
        for (trial, value) in trials.iter_mut().zip([0.9, 0.2, 0.8, 0.85]) {
            trial.stage = TrialStage::Running;
            trial.metric_value = Some(value);
            trial.progress = Some(0.5);
        }
        let step = controller.reconcile(&first.spec, &trials).unwrap();
        assert_eq!(step.stopped().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(step.trials[0].stage, TrialStage::Running);
    }

    #[test]
    fn invalid_limits_fail_without_mutation() {
        let controller = Controller::default();
        let mut bad = spec(3, 3);
        bad.concurrency_limit = 4;
        let err = controller.reconcile(&bad, &[]).unwrap_err();
        assert!(matches!(err, HpoError::Sweep(SweepError::Configuration { .. })));
        assert_eq!(bad.trials_launched, 0);
        assert_eq!(bad.stage, SweepStage::NotStarted);
    }

    #[test]
    fn overflowing_uniform_range_is_an_error_not_a_panic() {
        let wide = SweepSpec::new("alice-1", 2, 1).with_distribution(
            "x",
            Distribution::Uniform {
                low: -1e308,
                high: 1e308,
            },
        );
        let err = Controller::default().reconcile(&wide, &[]).unwrap_err();
        assert!(matches!(
            err,
            HpoError::Distribution(DistributionError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn index_collision_is_a_configuration_error() {
        let controller = Controller::default();
        let first = controller.reconcile(&spec(4, 2), &[]).unwrap();
        let mut trials = first.trials.clone();
        trials[1].trial_index = 0;
        let err = controller.reconcile(&first.spec, &trials).unwrap_err();
        assert!(matches!(err, HpoError::Sweep(SweepError::Configuration { .. })));
    }

    #[test]
    fn reconciliation_is_deterministic_for_a_seed() {
        let controller = Controller::default();
        let a = controller.reconcile(&spec(5, 5), &[]).unwrap();
        let b = controller.reconcile(&spec(5, 5), &[]).unwrap();
        assert_eq!(a.actions, b.actions);
    }

    #[test]
    fn converges_within_ceil_total_over_limit_steps() {
        let controller = Controller::default();
        let (total, limit) = (7, 3);
        let mut current = spec(total, limit);
        let mut trials: Vec<TrialRecord> = Vec::new();
        let mut steps = 0;

        loop {
            let step = controller.reconcile(&current, &trials).unwrap();
            if step.is_noop() {
                break;
            }
            steps += 1;
            current = step.spec;
            trials = step.trials;
            for t in trials.iter_mut().filter(|t| t.is_active()) {
                t.stage = TrialStage::Succeeded;
            }
            assert!(steps <= total.div_ceil(limit) + 1);
        }
        assert_eq!(current.stage, SweepStage::Succeeded);
    }

    #[test]
    fn action_serializes_with_tag() {
        let action = Action::StopTrial {
            sweep_id: "a".into(),
            trial_index: 2,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "stop_trial");
        assert_eq!(json["trial_index"], 2);
        assert_eq!(action.sweep_id(), "a");
        assert_eq!(action.trial_index(), Some(2));
    }
}
