//! Run, stage and patch status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a whole pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created but no stage has started.
    #[default]
    Pending,
    /// A stage is executing.
    Running,
    /// Every stage settled (some possibly with fallback).
    Completed,
    /// A stage without fallback was exhausted.
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    /// Returns true if the run can no longer change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// An attempt is in flight (or about to be).
    #[default]
    Running,
    /// The stage produced its output or a fallback.
    Done,
    /// The stage was exhausted and broke the run.
    Failed,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns true if the stage has settled.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// The status carried by a status patch sent to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    /// The run or a stage is in progress.
    Running,
    /// A stage finished.
    Done,
    /// A stage broke the run.
    Failed,
    /// The whole run finished.
    Completed,
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl From<StageStatus> for PatchStatus {
    fn from(status: StageStatus) -> Self {
        match status {
            StageStatus::Running => Self::Running,
            StageStatus::Done => Self::Done,
            StageStatus::Failed => Self::Failed,
        }
    }
}
