//! In-memory state of a single pipeline run.

use super::{RunStatus, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress record for one stage of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    /// The stage name.
    pub stage_name: String,
    /// Attempts made so far (1-based once the first attempt starts).
    pub attempt_count: u32,
    /// Current status of the stage.
    pub status: StageStatus,
    /// Whether the stage settled with its fallback value.
    pub used_fallback: bool,
    /// The most recent error, if any attempt failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When this record was last written.
    pub timestamp: DateTime<Utc>,
}

impl StageOutcome {
    fn new(stage_name: impl Into<String>) -> Self {
        Self {
            stage_name: stage_name.into(),
            attempt_count: 0,
            status: StageStatus::Running,
            used_fallback: false,
            error: None,
            timestamp: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.timestamp = Utc::now();
    }
}

/// One end-to-end execution of the stage sequence.
///
/// Owned exclusively by the orchestrator invocation that created it;
/// outcomes are kept in stage order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    /// The run identifier.
    pub run_id: String,
    /// The overall run status.
    pub status: RunStatus,
    /// The stage currently executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,
    outcomes: Vec<StageOutcome>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Creates a pending run.
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Pending,
            current_stage: None,
            outcomes: Vec::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Returns the outcomes in stage order.
    #[must_use]
    pub fn outcomes(&self) -> &[StageOutcome] {
        &self.outcomes
    }

    /// Returns the outcome for a stage.
    #[must_use]
    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.outcomes.iter().find(|o| o.stage_name == stage)
    }

    /// Returns true if any stage settled with its fallback value.
    #[must_use]
    pub fn used_fallback(&self) -> bool {
        self.outcomes.iter().any(|o| o.used_fallback)
    }

    /// Returns the names of stages that fell back.
    #[must_use]
    pub fn fallback_stages(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.used_fallback)
            .map(|o| o.stage_name.as_str())
            .collect()
    }

    /// Returns the number of stages that have settled as done.
    #[must_use]
    pub fn completed_stage_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == StageStatus::Done)
            .count()
    }

    fn outcome_mut(&mut self, stage: &str) -> &mut StageOutcome {
        let index = match self.outcomes.iter().position(|o| o.stage_name == stage) {
            Some(index) => index,
            None => {
                self.outcomes.push(StageOutcome::new(stage));
                self.outcomes.len() - 1
            }
        };
        &mut self.outcomes[index]
    }

    /// Records the start of an attempt.
    pub fn begin_attempt(&mut self, stage: &str, attempt: u32) {
        self.status = RunStatus::Running;
        self.current_stage = Some(stage.to_string());

        let outcome = self.outcome_mut(stage);
        outcome.attempt_count = attempt;
        outcome.status = StageStatus::Running;
        outcome.touch();
    }

    /// Records a failed attempt.
    pub fn record_attempt_failure(&mut self, stage: &str, attempt: u32, error: impl Into<String>) {
        let outcome = self.outcome_mut(stage);
        outcome.attempt_count = attempt;
        outcome.error = Some(error.into());
        outcome.touch();
    }

    /// Settles a stage that produced its own output.
    pub fn settle_done(&mut self, stage: &str, attempts: u32) {
        let outcome = self.outcome_mut(stage);
        outcome.attempt_count = attempts;
        outcome.status = StageStatus::Done;
        outcome.error = None;
        outcome.touch();
    }

    /// Settles a stage with its fallback value.
    pub fn settle_fallback(&mut self, stage: &str, attempts: u32, error: impl Into<String>) {
        let outcome = self.outcome_mut(stage);
        outcome.attempt_count = attempts;
        outcome.status = StageStatus::Done;
        outcome.used_fallback = true;
        outcome.error = Some(error.into());
        outcome.touch();
    }

    /// Settles a stage as failed and fails the run.
    pub fn settle_failed(&mut self, stage: &str, attempts: u32, error: impl Into<String>) {
        let outcome = self.outcome_mut(stage);
        outcome.attempt_count = attempts;
        outcome.status = StageStatus::Failed;
        outcome.error = Some(error.into());
        outcome.touch();

        self.status = RunStatus::Failed;
        self.finished_at = Some(Utc::now());
    }

    /// Marks the run completed.
    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.current_stage = None;
        self.finished_at = Some(Utc::now());
    }

    /// Returns the run duration if it has finished.
    #[must_use]
    pub fn duration_ms(&self) -> Option<i64> {
        self.finished_at
            .map(|end| (end - self.created_at).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_new_run_is_pending() {
        let run = PipelineRun::new("run-1");
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.outcomes().is_empty());
        assert!(run.current_stage.is_none());
        assert!(run.duration_ms().is_none());
    }

    #[test]
    fn test_attempt_lifecycle() {
        let mut run = PipelineRun::new("run-1");

        run.begin_attempt("embed", 1);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.current_stage.as_deref(), Some("embed"));

        run.record_attempt_failure("embed", 1, "quota");
        run.begin_attempt("embed", 2);

        let outcome = run.outcome("embed").unwrap();
        assert_eq!(outcome.attempt_count, 2);
        assert_eq!(outcome.status, StageStatus::Running);
        assert_eq!(outcome.error.as_deref(), Some("quota"));

        run.settle_done("embed", 2);
        let outcome = run.outcome("embed").unwrap();
        assert_eq!(outcome.status, StageStatus::Done);
        assert!(outcome.error.is_none());
        assert_eq!(run.completed_stage_count(), 1);
    }

    #[test]
    fn test_outcomes_keep_stage_order() {
        let mut run = PipelineRun::new("run-1");
        for stage in ["download", "parse", "embed"] {
            run.begin_attempt(stage, 1);
            run.settle_done(stage, 1);
        }
        run.begin_attempt("parse", 2);

        let names: Vec<_> = run.outcomes().iter().map(|o| o.stage_name.as_str()).collect();
        assert_eq!(names, vec!["download", "parse", "embed"]);
    }

    #[test]
    fn test_fallback_marks_run() {
        let mut run = PipelineRun::new("run-1");
        run.begin_attempt("summarize", 1);
        run.settle_fallback("summarize", 2, "timed out");
        run.complete();

        assert!(run.used_fallback());
        assert_eq!(run.fallback_stages(), vec!["summarize"]);
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_settle_failed_fails_run() {
        let mut run = PipelineRun::new("run-1");
        run.begin_attempt("persist", 1);
        run.settle_failed("persist", 3, "store offline");

        assert_eq!(run.status, RunStatus::Failed);
        let outcome = run.outcome("persist").unwrap();
        assert_eq!(outcome.status, StageStatus::Failed);
        assert_eq!(outcome.attempt_count, 3);
    }
}
