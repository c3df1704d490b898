//! Pipeline definition and execution.
//!
//! This module provides:
//! - Per-stage resilience policies
//! - The ordered stage registry
//! - The retry executor with timeout and jittered backoff
//! - The sequential orchestrator

mod orchestrator;
mod policy;
mod retry;
mod spec;


pub use orchestrator::{OrchestratorBuilder, PipelineOrchestrator, RunOutput};
pub use policy::{PolicyOverride, ResiliencePolicy};
pub use retry::{
    AttemptObserver, Attempted, NoOpObserver, RetryExecutor, DEFAULT_MAX_JITTER_MS,
};
pub use spec::{StageDefinition, StageRegistry, StageRegistryBuilder};
