//! # hpo-optimizer
//!
//! Trial sampling, pruning policies, and the reconciliation controller that
//! advances a sweep one step at a time.
//!
//! The controller is a pure function from a sweep snapshot to the next
//! snapshot plus the [`Action`]s an executor must carry out.

mod controller;
mod pruning;
mod sampler;

pub use controller::{observed_stage, reconcile, Action, Controller, ControllerConfig, Reconciliation};
pub use pruning::{NoPruning, PercentilePruning, PruningConfig, PruningMode, PruningPolicy};
pub use sampler::{generate_params, sample_trial, trial_rng};
