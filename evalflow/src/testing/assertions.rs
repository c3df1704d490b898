//! Test assertions for runs and status trails.

use crate::core::{PatchStatus, PipelineRun, RunStatus, StageStatus};
use crate::reporting::InMemoryStatusReporter;

/// Asserts that the run finished successfully.
pub fn assert_run_completed(run: &PipelineRun) {
    assert_eq!(
        run.status,
        RunStatus::Completed,
        "Expected run '{}' to complete, got status: {:?}",
        run.run_id,
        run.status
    );
}

/// Asserts a stage's final status and attempt count.
pub fn assert_stage_outcome(run: &PipelineRun, stage: &str, status: StageStatus, attempts: u32) {
    let Some(outcome) = run.outcome(stage) else {
        panic!(
            "Run '{}' has no outcome for stage '{}'. Stages: {:?}",
            run.run_id,
            stage,
            run.outcomes().iter().map(|o| &o.stage_name).collect::<Vec<_>>()
        );
    };
    assert_eq!(
        (outcome.status, outcome.attempt_count),
        (status, attempts),
        "Unexpected (status, attempts) for stage '{stage}'"
    );
}

/// Asserts that a stage was never started.
pub fn assert_stage_not_run(run: &PipelineRun, stage: &str) {
    assert!(
        run.outcome(stage).is_none(),
        "Expected stage '{}' not to run, but it has outcome {:?}",
        stage,
        run.outcome(stage)
    );
}

/// Returns the `(stage, status)` trail a reporter saw for a run.
#[must_use]
pub fn patch_trail(reporter: &InMemoryStatusReporter, run_id: &str) -> Vec<(String, PatchStatus)> {
    reporter
        .patches(run_id)
        .into_iter()
        .map(|patch| (patch.stage, patch.status))
        .collect()
}

/// Asserts that reported progress never decreases over a run.
pub fn assert_progress_monotonic(reporter: &InMemoryStatusReporter, run_id: &str) {
    let progress: Vec<u8> = reporter
        .patches(run_id)
        .iter()
        .map(|patch| patch.progress)
        .collect();
    assert!(
        progress.windows(2).all(|pair| pair[0] <= pair[1]),
        "Progress went backwards for run '{run_id}': {progress:?}"
    );
}
