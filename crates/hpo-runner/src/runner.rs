//! Tick loop driving sweeps through the controller.
//!
//! One tick per sweep: read a snapshot, reconcile it, commit the result
//! against the snapshot's revision, and only then hand the actions to the
//! executor. A commit that loses the race is dropped whole and the sweep is
//! picked up again on the next tick.

use crossbeam_channel::{Sender, TrySendError};
use hpo_optimizer::{Action, Controller, Reconciliation};
use hpo_store::{SweepSnapshot, SweepStore};
use hpo_types::{
    HpoResult, SweepError, SweepRequest, SweepSpec, SweepStage, SweepSummary, TrialReport,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use crate::config::RunnerConfig;
use crate::executor::TrialExecutor;

/// Events emitted by the runner for external consumption (logging, UI).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunnerEvent {
    SweepSubmitted {
        sweep_id: String,
    },
    StopRequested {
        sweep_id: String,
    },
    TrialLaunched {
        sweep_id: String,
        trial_index: usize,
    },
    TrialStopped {
        sweep_id: String,
        trial_index: usize,
    },
    SweepInfraStopped {
        sweep_id: String,
    },
    StageChanged {
        sweep_id: String,
        from: SweepStage,
        to: SweepStage,
    },
    CommitConflict {
        sweep_id: String,
        revision: u64,
    },
    SweepFailed {
        sweep_id: String,
        error: String,
    },
    PollFailed {
        error: String,
    },
    DispatchFailed {
        sweep_id: String,
        trial_index: Option<usize>,
        error: String,
    },
    SweepDeleted {
        sweep_id: String,
    },
}

/// What one tick did to one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutcome {
    pub sweep_id: String,
    pub stage: SweepStage,
    /// Actions handed to the executor, failed ones included.
    pub dispatched: usize,
    /// The commit lost against a concurrent write; nothing was dispatched.
    pub conflict: bool,
    /// Reconciling or committing this sweep failed; nothing was dispatched.
    pub error: Option<String>,
}

impl TickOutcome {
    fn new(sweep_id: String, stage: SweepStage) -> Self {
        Self {
            sweep_id,
            stage,
            dispatched: 0,
            conflict: false,
            error: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.dispatched == 0 && !self.conflict && self.error.is_none()
    }

    /// The sweep needs no further passes.
    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal() && self.error.is_none()
    }
}

/// Drives every sweep in a store towards completion. Generic over the store
/// and executor so tests can run against in-memory and simulated parts.
pub struct SweepRunner<S: SweepStore, E: TrialExecutor> {
    store: Arc<S>,
    executor: Arc<E>,
    controller: Controller,
    config: RunnerConfig,
    events: Sender<RunnerEvent>,
}

impl<S: SweepStore, E: TrialExecutor> SweepRunner<S, E> {
    pub fn new(
        store: Arc<S>,
        executor: Arc<E>,
        config: RunnerConfig,
        events: Sender<RunnerEvent>,
    ) -> HpoResult<Self> {
        let controller = Controller::from_config(&config.controller)?;
        info!(pruning = controller.policy_name(), "sweep runner created");
        Ok(Self {
            store,
            executor,
            controller,
            config,
            events,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Register a sweep described by `--name=value` arguments.
    /// Returns the sweep id, generated if the request had none.
    pub fn submit(&self, request: SweepRequest) -> HpoResult<String> {
        self.submit_spec(request.into_spec()?)
    }

    pub fn submit_spec(&self, spec: SweepSpec) -> HpoResult<String> {
        let sweep_id = spec.sweep_id.clone();
        self.store.insert(spec)?;
        info!(sweep = %sweep_id, "sweep submitted");
        self.emit(RunnerEvent::SweepSubmitted {
            sweep_id: sweep_id.clone(),
        });
        Ok(sweep_id)
    }

    /// Ask for a sweep to be stopped. Takes effect on its next tick.
    pub fn request_stop(&self, sweep_id: &str) -> HpoResult<()> {
        self.store.set_desired_stage(sweep_id, SweepStage::Stopped)?;
        self.emit(RunnerEvent::StopRequested {
            sweep_id: sweep_id.to_string(),
        });
        Ok(())
    }

    /// Remove a sweep and its trials, stop whatever is still running and tear
    /// down its infrastructure. Returns whether the sweep existed.
    pub async fn delete(&self, sweep_id: &str) -> HpoResult<bool> {
        let Some(snapshot) = self.store.get(sweep_id)? else {
            return Ok(false);
        };
        if !self.store.delete(sweep_id)? {
            return Ok(false);
        }

        let mut actions: Vec<Action> = snapshot
            .trials
            .iter()
            .filter(|t| t.is_active())
            .map(|t| Action::StopTrial {
                sweep_id: sweep_id.to_string(),
                trial_index: t.trial_index,
            })
            .collect();
        actions.push(Action::StopSweepInfra {
            sweep_id: sweep_id.to_string(),
        });
        self.dispatch(&actions).await;

        info!(sweep = %sweep_id, "sweep deleted");
        self.emit(RunnerEvent::SweepDeleted {
            sweep_id: sweep_id.to_string(),
        });
        Ok(true)
    }

    pub fn summary(&self, sweep_id: &str) -> HpoResult<SweepSummary> {
        let snapshot = self.snapshot(sweep_id)?;
        Ok(SweepSummary::from_snapshot(&snapshot.spec, &snapshot.trials))
    }

    /// Reconcile one sweep and carry out the resulting actions.
    pub async fn tick(&self, sweep_id: &str) -> HpoResult<TickOutcome> {
        let snapshot = self.snapshot(sweep_id)?;
        let step = self.controller.reconcile(&snapshot.spec, &snapshot.trials)?;
        self.apply(snapshot, step).await
    }

    /// One pass over every sweep in the store. Reconciliation is pure, so all
    /// sweeps are reconciled in parallel; commits and dispatch run in order.
    /// A sweep that fails to reconcile or commit gets an outcome carrying the
    /// error; the other sweeps of the pass still go ahead.
    pub async fn tick_all(&self) -> HpoResult<Vec<TickOutcome>> {
        let mut snapshots = Vec::new();
        for sweep_id in self.store.list_sweeps()? {
            // Deleted between list and get.
            if let Some(snapshot) = self.store.get(&sweep_id)? {
                snapshots.push(snapshot);
            }
        }

        let controller = &self.controller;
        let steps: Vec<(SweepSnapshot, HpoResult<Reconciliation>)> = snapshots
            .into_par_iter()
            .map(|snapshot| {
                let step = controller.reconcile(&snapshot.spec, &snapshot.trials);
                (snapshot, step)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(steps.len());
        for (snapshot, step) in steps {
            let sweep_id = snapshot.spec.sweep_id.clone();
            let stage = snapshot.spec.stage;
            let result = match step {
                Ok(step) => self.apply(snapshot, step).await,
                Err(e) => Err(e),
            };
            let outcome =
                result.unwrap_or_else(|e| self.sweep_failed(sweep_id, stage, e.to_string()));
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Tick until every sweep in the store is terminal or `max_ticks` passes
    /// have run. The executor is polled before each pass. A sweep that keeps
    /// failing counts as unfinished. Returns the number of passes.
    pub async fn run_until_idle(&self) -> HpoResult<usize> {
        let interval = self.config.tick_interval();
        for pass in 1..=self.config.max_ticks {
            if let Err(e) = self.executor.poll().await {
                warn!(error = %e, "executor poll failed");
                self.emit(RunnerEvent::PollFailed {
                    error: e.to_string(),
                });
            }

            let outcomes = self.tick_all().await?;
            if outcomes.is_empty() {
                info!(passes = pass, "no sweeps to run");
                return Ok(pass);
            }
            if outcomes.iter().all(TickOutcome::is_finished) {
                info!(passes = pass, sweeps = outcomes.len(), "all sweeps finished");
                return Ok(pass);
            }
            trace!(pass, "runner pass complete");

            if !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }

        warn!(max_ticks = self.config.max_ticks, "runner stopped before all sweeps finished");
        Ok(self.config.max_ticks)
    }

    fn snapshot(&self, sweep_id: &str) -> HpoResult<SweepSnapshot> {
        self.store.get(sweep_id)?.ok_or_else(|| {
            SweepError::NotFound {
                sweep_id: sweep_id.to_string(),
            }
            .into()
        })
    }

    fn sweep_failed(&self, sweep_id: String, stage: SweepStage, error: String) -> TickOutcome {
        error!(sweep = %sweep_id, error = %error, "sweep tick failed");
        self.emit(RunnerEvent::SweepFailed {
            sweep_id: sweep_id.clone(),
            error: error.clone(),
        });
        TickOutcome {
            error: Some(error),
            ..TickOutcome::new(sweep_id, stage)
        }
    }

    async fn apply(&self, snapshot: SweepSnapshot, step: Reconciliation) -> HpoResult<TickOutcome> {
        let sweep_id = snapshot.spec.sweep_id.clone();
        if step.is_noop() {
            return Ok(TickOutcome::new(sweep_id, step.spec.stage));
        }

        match self.store.put(&step.spec, &step.trials, snapshot.revision) {
            Ok(revision) => {
                debug!(sweep = %sweep_id, revision, actions = step.actions.len(), "step committed");
            }
            Err(e) if e.is_stale_snapshot() => {
                warn!(sweep = %sweep_id, revision = snapshot.revision, "stale snapshot, step dropped");
                self.emit(RunnerEvent::CommitConflict {
                    sweep_id: sweep_id.clone(),
                    revision: snapshot.revision,
                });
                return Ok(TickOutcome {
                    conflict: true,
                    ..TickOutcome::new(sweep_id, snapshot.spec.stage)
                });
            }
            Err(e) => return Err(e),
        }

        if step.stage_changed {
            info!(sweep = %sweep_id, from = %snapshot.spec.stage, to = %step.spec.stage, "sweep stage changed");
            self.emit(RunnerEvent::StageChanged {
                sweep_id: sweep_id.clone(),
                from: snapshot.spec.stage,
                to: step.spec.stage,
            });
        }

        self.dispatch(&step.actions).await;
        Ok(TickOutcome {
            dispatched: step.actions.len(),
            ..TickOutcome::new(sweep_id, step.spec.stage)
        })
    }

    async fn dispatch(&self, actions: &[Action]) {
        for action in actions {
            match self.executor.execute(action).await {
                Ok(()) => self.emit(match action {
                    Action::LaunchTrial {
                        sweep_id,
                        trial_index,
                        ..
                    } => RunnerEvent::TrialLaunched {
                        sweep_id: sweep_id.clone(),
                        trial_index: *trial_index,
                    },
                    Action::StopTrial {
                        sweep_id,
                        trial_index,
                    } => RunnerEvent::TrialStopped {
                        sweep_id: sweep_id.clone(),
                        trial_index: *trial_index,
                    },
                    Action::StopSweepInfra { sweep_id } => RunnerEvent::SweepInfraStopped {
                        sweep_id: sweep_id.clone(),
                    },
                }),
                Err(e) => {
                    warn!(sweep = %action.sweep_id(), trial = ?action.trial_index(), error = %e, "action failed");
                    self.emit(RunnerEvent::DispatchFailed {
                        sweep_id: action.sweep_id().to_string(),
                        trial_index: action.trial_index(),
                        error: e.to_string(),
                    });
                    if let Action::LaunchTrial {
                        sweep_id,
                        trial_index,
                        ..
                    } = action
                    {
                        self.fail_trial(sweep_id, *trial_index, e.to_string());
                    }
                }
            }
        }
    }

    /// A trial that never started is marked failed so its slot is released.
    fn fail_trial(&self, sweep_id: &str, trial_index: usize, reason: String) {
        let report = TrialReport::new(sweep_id, trial_index).failed(reason);
        if let Err(e) = self.store.report(&report) {
            warn!(sweep = %sweep_id, trial = trial_index, error = %e, "could not record launch failure");
        }
    }

    fn emit(&self, event: RunnerEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            trace!(?event, "event channel full, event dropped");
        }
    }
}
