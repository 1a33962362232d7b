//! Lifecycle stages for sweeps and trials.
//!
//! Both machines only move forward. Terminal stages never transition out, and
//! re-entering the current stage is always allowed so that redundant reports
//! are harmless.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of a sweep as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStage {
    NotStarted,
    Running,
    Succeeded,
    Stopped,
}

impl SweepStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Stopped)
    }

    /// Whether the sweep may move from `self` to `next`.
    pub fn can_transition_to(&self, next: SweepStage) -> bool {
        use SweepStage::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (NotStarted, Running | Succeeded | Stopped) => true,
            (Running, Succeeded | Stopped) => true,
            _ => false,
        }
    }
}

impl Default for SweepStage {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for SweepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Lifecycle stage of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStage {
    NotStarted,
    Running,
    Succeeded,
    Pruned,
    Failed,
}

impl TrialStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Pruned | Self::Failed)
    }

    /// Occupies a concurrency slot.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether a trial may move from `self` to `next`. A trial that never
    /// reported `Running` may still finish directly.
    pub fn can_transition_to(&self, next: TrialStage) -> bool {
        use TrialStage::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (NotStarted, Running) => true,
            (NotStarted | Running, Succeeded | Pruned | Failed) => true,
            _ => false,
        }
    }
}

impl Default for TrialStage {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for TrialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Pruned => "pruned",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}
