//! Core domain model types for evalflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Run, stage and patch status enums
//! - The in-memory run record with per-stage outcomes
//! - Status patches sent to the external store

mod patch;
mod run;
mod status;

pub use patch::{StatusPatch, FALLBACK_USED, RUN_COMPLETED_STAGE, RUN_STARTED_STAGE};
pub use run::{PipelineRun, StageOutcome};
pub use status::{PatchStatus, RunStatus, StageStatus};
