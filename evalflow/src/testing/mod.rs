//! Testing utilities for evalflow pipelines.
//!
//! This module provides:
//! - Scripted stages that fail, stall or succeed on cue
//! - Fixtures for registries and orchestrators
//! - Assertions over run records and status trails

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_progress_monotonic, assert_run_completed, assert_stage_not_run, assert_stage_outcome,
    patch_trail,
};
pub use fixtures::{fast_policy, linear_registry, orchestrator_for};
pub use mocks::{ScriptStep, ScriptedStage};
