//! Status patches written to the external run-status store.

use super::PatchStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Warning attached when a stage settled with its fallback value.
pub const FALLBACK_USED: &str = "fallback_used";

/// Stage label written when a run is marked as started.
pub const RUN_STARTED_STAGE: &str = "Processing";

/// Stage label written when a run completes.
pub const RUN_COMPLETED_STAGE: &str = "Done";

/// A partial update to a run's status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPatch {
    /// The stage (or run phase) the patch describes.
    pub stage: String,
    /// Progress percentage, 0 to 100.
    pub progress: u8,
    /// The reported status.
    pub status: PatchStatus,
    /// The attempt number, for stage attempt patches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Error text, for failed stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Warning flag such as [`FALLBACK_USED`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// When the patch was produced.
    pub updated_at: DateTime<Utc>,
}

impl StatusPatch {
    fn new(stage: impl Into<String>, progress: u8, status: PatchStatus) -> Self {
        Self {
            stage: stage.into(),
            progress: progress.min(100),
            status,
            attempt: None,
            error: None,
            warning: None,
            updated_at: Utc::now(),
        }
    }

    /// Marks the run as started, before any stage executes.
    #[must_use]
    pub fn run_started() -> Self {
        Self::new(RUN_STARTED_STAGE, 0, PatchStatus::Running)
    }

    /// Marks the run as completed.
    #[must_use]
    pub fn run_completed(fallback_used: bool) -> Self {
        let patch = Self::new(RUN_COMPLETED_STAGE, 100, PatchStatus::Completed);
        if fallback_used {
            patch.with_warning(FALLBACK_USED)
        } else {
            patch
        }
    }

    /// A stage attempt is starting.
    #[must_use]
    pub fn running(stage: impl Into<String>, progress: u8, attempt: u32) -> Self {
        let mut patch = Self::new(stage, progress, PatchStatus::Running);
        patch.attempt = Some(attempt);
        patch
    }

    /// A stage produced its output.
    #[must_use]
    pub fn done(stage: impl Into<String>, progress: u8) -> Self {
        Self::new(stage, progress, PatchStatus::Done)
    }

    /// A stage settled with its fallback value.
    #[must_use]
    pub fn fallback(stage: impl Into<String>, progress: u8, error: impl Into<String>) -> Self {
        Self::done(stage, progress)
            .with_error(error)
            .with_warning(FALLBACK_USED)
    }

    /// A stage broke the run.
    #[must_use]
    pub fn failed(stage: impl Into<String>, progress: u8, error: impl Into<String>) -> Self {
        Self::new(stage, progress, PatchStatus::Failed).with_error(error)
    }

    /// Sets the error text.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the warning flag.
    #[must_use]
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    /// Returns true if the patch carries the fallback warning.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.warning.as_deref() == Some(FALLBACK_USED)
    }

    /// Converts to the JSON document sent to the store.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "stage": self.stage,
                "progress": self.progress,
                "status": self.status.to_string(),
            })
        })
    }
}
