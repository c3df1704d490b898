//! Status reporter trait and implementations.

use crate::core::{PatchStatus, StatusPatch};
use crate::errors::ReportingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn, Level};

/// Persists run and stage status to an external store.
///
/// The engine calls the reporter; the reporter never calls back into the
/// engine. Writes may be repeated or overwritten later in the same run.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Applies a partial update to the run's status record.
    async fn report(&self, run_id: &str, patch: StatusPatch) -> Result<(), ReportingError>;
}

/// Reports a patch, logging and swallowing any failure.
///
/// Returns true if the store accepted the patch.
pub async fn report_best_effort(
    reporter: &dyn StatusReporter,
    run_id: &str,
    patch: StatusPatch,
) -> bool {
    let stage = patch.stage.clone();
    match reporter.report(run_id, patch).await {
        Ok(()) => true,
        Err(err) => {
            warn!(
                run_id = %run_id,
                stage = %stage,
                error = %err,
                "Status report failed; continuing"
            );
            false
        }
    }
}

/// A no-op reporter that discards all patches.
///
/// Used as the default when no reporter is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpStatusReporter;

#[async_trait]
impl StatusReporter for NoOpStatusReporter {
    async fn report(&self, _run_id: &str, _patch: StatusPatch) -> Result<(), ReportingError> {
        Ok(())
    }
}

/// A reporter that logs patches using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingStatusReporter {
    level: Level,
}

impl Default for LoggingStatusReporter {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingStatusReporter {
    /// Creates a new logging reporter with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging reporter.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl StatusReporter for LoggingStatusReporter {
    async fn report(&self, run_id: &str, patch: StatusPatch) -> Result<(), ReportingError> {
        let warning = patch.warning.as_deref().unwrap_or("");
        let error = patch.error.as_deref().unwrap_or("");
        if self.level == Level::DEBUG {
            debug!(
                run_id = %run_id,
                stage = %patch.stage,
                status = %patch.status,
                progress = patch.progress,
                attempt = patch.attempt,
                warning,
                error,
                "Status: {}",
                patch.status
            );
        } else {
            info!(
                run_id = %run_id,
                stage = %patch.stage,
                status = %patch.status,
                progress = patch.progress,
                attempt = patch.attempt,
                warning,
                error,
                "Status: {}",
                patch.status
            );
        }
        Ok(())
    }
}

/// The latest merged state of a run's status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// The last reported stage.
    pub stage: String,
    /// The last reported progress.
    pub progress: u8,
    /// The last reported status.
    pub status: PatchStatus,
    /// The last reported error, kept until overwritten.
    pub error: Option<String>,
    /// The last reported warning, kept until overwritten.
    pub warning: Option<String>,
    /// When the record was last updated.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    fn from_patch(patch: &StatusPatch) -> Self {
        Self {
            stage: patch.stage.clone(),
            progress: patch.progress,
            status: patch.status,
            error: patch.error.clone(),
            warning: patch.warning.clone(),
            updated_at: patch.updated_at,
        }
    }

    fn merge(&mut self, patch: &StatusPatch) {
        self.stage.clone_from(&patch.stage);
        self.progress = patch.progress;
        self.status = patch.status;
        if patch.error.is_some() {
            self.error.clone_from(&patch.error);
        }
        if patch.warning.is_some() {
            self.warning.clone_from(&patch.warning);
        }
        self.updated_at = patch.updated_at;
    }
}

/// An in-memory store keeping every patch per run.
///
/// Useful for tests and for embedding the engine without a database.
#[derive(Debug, Default)]
pub struct InMemoryStatusReporter {
    history: RwLock<HashMap<String, Vec<StatusPatch>>>,
    records: RwLock<HashMap<String, RunRecord>>,
}

impl InMemoryStatusReporter {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every patch reported for a run, in order.
    #[must_use]
    pub fn patches(&self, run_id: &str) -> Vec<StatusPatch> {
        self.history.read().get(run_id).cloned().unwrap_or_default()
    }

    /// Returns the merged record for a run.
    #[must_use]
    pub fn record(&self, run_id: &str) -> Option<RunRecord> {
        self.records.read().get(run_id).cloned()
    }

    /// Returns the ids of all runs seen so far.
    #[must_use]
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.history.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Clears all stored state.
    pub fn clear(&self) {
        self.history.write().clear();
        self.records.write().clear();
    }
}

#[async_trait]
impl StatusReporter for InMemoryStatusReporter {
    async fn report(&self, run_id: &str, patch: StatusPatch) -> Result<(), ReportingError> {
        self.records
            .write()
            .entry(run_id.to_string())
            .and_modify(|record| record.merge(&patch))
            .or_insert_with(|| RunRecord::from_patch(&patch));
        self.history
            .write()
            .entry(run_id.to_string())
            .or_default()
            .push(patch);
        Ok(())
    }
}
