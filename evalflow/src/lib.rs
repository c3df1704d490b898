//! # Evalflow
//!
//! A resilient staged-pipeline engine, shipped with a candidate
//! evaluation pipeline built on it.
//!
//! Evalflow runs an ordered list of stages on one input, with:
//!
//! - **Per-stage policies**: attempt budget, exponential backoff with
//!   jitter, per-attempt timeout and an optional fallback value
//! - **Status reporting**: one status patch per attempt start and stage
//!   settle, written to a pluggable store
//! - **Isolation**: concurrent runs share only the orchestrator and the
//!   status store
//! - **A worker pool**: bounded concurrency over a channel of run requests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use evalflow::prelude::*;
//!
//! let registry = StageRegistry::builder()
//!     .stage("fetch", 50, ResiliencePolicy::new().with_max_attempts(2))
//!     .stage("store", 100, ResiliencePolicy::new())
//!     .build()?;
//!
//! let orchestrator = PipelineOrchestrator::builder(registry)
//!     .stage("fetch", Arc::new(FetchStage::new()))
//!     .stage("store", Arc::new(StoreStage::new()))
//!     .reporter(Arc::new(LoggingStatusReporter::debug()))
//!     .build()?;
//!
//! let result = orchestrator.run("run-1", input).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod evaluation;
pub mod observability;
pub mod pipeline;
pub mod reporting;
pub mod stages;
pub mod testing;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{EngineConfig, LogConfig, WorkerConfig};
    pub use crate::core::{PatchStatus, PipelineRun, RunStatus, StageStatus, StatusPatch};
    pub use crate::errors::{
        AttemptError, EvalflowError, PipelineFailedError, ReportingError,
        RegistryValidationError, StageError, StageExhaustedError,
    };
    pub use crate::evaluation::{
        evaluation_pipeline, evaluation_registry, Collaborators, Evaluation, EvaluationRequest,
        EvaluationState,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        PipelineOrchestrator, ResiliencePolicy, RetryExecutor, RunOutput, StageRegistry,
    };
    pub use crate::reporting::{
        InMemoryStatusReporter, LoggingStatusReporter, NoOpStatusReporter, StatusReporter,
    };
    pub use crate::stages::{FnStage, PassThroughStage, StageHandler};
    pub use crate::worker::{RunRequest, WorkerPool, WorkerStats};
}
