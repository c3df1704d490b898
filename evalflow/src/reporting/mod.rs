//! Status reporting for pipeline runs.
//!
//! The orchestrator is the only writer of a run's status record. Apart
//! from the initial run-start write, every report is best-effort: a failed
//! write is logged and the run carries on.

mod reporter;

pub use reporter::{
    report_best_effort, InMemoryStatusReporter, LoggingStatusReporter, NoOpStatusReporter,
    RunRecord, StatusReporter,
};

#[cfg(test)]
pub use reporter::MockStatusReporter;
