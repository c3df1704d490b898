//! Error types for the evalflow engine.
//!
//! Errors are layered the same way failures propagate through a run:
//! an [`AttemptError`] fails one attempt, a [`StageExhaustedError`] ends a
//! stage, and a [`PipelineFailedError`] ends the run. Reporting failures
//! live beside them because they only abort a run at its very first write.

use crate::core::PipelineRun;
use serde_json::json;
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for evalflow operations.
#[derive(Debug, Error)]
pub enum EvalflowError {
    /// A stage consumed every attempt without succeeding.
    #[error("{0}")]
    StageExhausted(#[from] StageExhaustedError),

    /// The run aborted on a stage that does not allow fallback.
    #[error("{0}")]
    PipelineFailed(Box<PipelineFailedError>),

    /// The status store rejected a write that the run depends on.
    #[error("{0}")]
    Reporting(#[from] ReportingError),

    /// A stage registry or orchestrator failed validation.
    #[error("{0}")]
    Validation(#[from] RegistryValidationError),

    /// Configuration could not be loaded.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PipelineFailedError> for EvalflowError {
    fn from(err: PipelineFailedError) -> Self {
        Self::PipelineFailed(Box::new(err))
    }
}

impl EvalflowError {
    /// Returns the name of the stage that broke the run, if any.
    #[must_use]
    pub fn failed_stage(&self) -> Option<&str> {
        match self {
            Self::PipelineFailed(err) => Some(&err.stage),
            Self::StageExhausted(err) => Some(&err.stage),
            _ => None,
        }
    }

    /// Returns true if this error aborted a run at a stage.
    #[must_use]
    pub fn is_pipeline_failure(&self) -> bool {
        matches!(self, Self::PipelineFailed(_))
    }
}

/// Error returned by a stage function.
///
/// Stage functions must fail with one of these rather than returning a
/// sentinel value; every variant counts as a rejected attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    /// The collaborator call failed.
    #[error("{0}")]
    Rejected(String),

    /// The collaborator answered with something unusable.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The stage received an intermediate result it cannot consume.
    #[error("Stage '{stage}' expected {expected} input but received {found}")]
    UnexpectedInput {
        /// The stage name.
        stage: String,
        /// The input kind the stage consumes.
        expected: &'static str,
        /// The input kind that arrived.
        found: &'static str,
    },
}

impl StageError {
    /// Creates a rejected error.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected(message.into())
    }

    /// Creates a malformed response error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse(message.into())
    }

    /// Creates an unexpected input error.
    #[must_use]
    pub fn unexpected_input(
        stage: impl Into<String>,
        expected: &'static str,
        found: &'static str,
    ) -> Self {
        Self::UnexpectedInput {
            stage: stage.into(),
            expected,
            found,
        }
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::Rejected(format!("{err:#}"))
    }
}

/// Why a single attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    /// The operation did not settle within the stage timeout.
    #[error("Stage '{stage}' timed out after {timeout_ms} ms")]
    Timeout {
        /// The stage name.
        stage: String,
        /// The configured timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The operation settled with an error.
    #[error("Stage '{stage}' rejected: {source}")]
    Rejected {
        /// The stage name.
        stage: String,
        /// The error raised by the stage function.
        #[source]
        source: StageError,
    },
}

impl AttemptError {
    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(stage: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            stage: stage.into(),
            timeout_ms,
        }
    }

    /// Creates a rejection error.
    #[must_use]
    pub fn rejected(stage: impl Into<String>, source: StageError) -> Self {
        Self::Rejected {
            stage: stage.into(),
            source,
        }
    }

    /// Returns a short name for the failure kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "StageTimeout",
            Self::Rejected { .. } => "StageRejected",
        }
    }

    /// Returns true if the attempt timed out.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Error raised when a stage consumed all configured attempts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Stage '{stage}' exhausted {attempts} attempt(s): {last_error}")]
pub struct StageExhaustedError {
    /// The stage name.
    pub stage: String,
    /// How many attempts were made.
    pub attempts: u32,
    /// The error observed on the final attempt.
    pub last_error: AttemptError,
}

impl StageExhaustedError {
    /// Creates a new exhausted error.
    #[must_use]
    pub fn new(stage: impl Into<String>, attempts: u32, last_error: AttemptError) -> Self {
        Self {
            stage: stage.into(),
            attempts,
            last_error,
        }
    }

    /// Returns the last observed error message.
    #[must_use]
    pub fn message(&self) -> String {
        self.last_error.to_string()
    }
}

/// Error raised when a run aborts on a stage without fallback.
#[derive(Debug, Clone, Error)]
#[error("Pipeline run '{run_id}' failed at stage '{stage}': {cause}")]
pub struct PipelineFailedError {
    /// The run identifier.
    pub run_id: String,
    /// The stage that broke the run.
    pub stage: String,
    /// The exhaustion that caused the failure.
    #[source]
    pub cause: StageExhaustedError,
    /// Snapshot of the run at the moment it failed.
    pub run: PipelineRun,
}

impl PipelineFailedError {
    /// Creates a new pipeline failed error.
    #[must_use]
    pub fn new(run: PipelineRun, cause: StageExhaustedError) -> Self {
        Self {
            run_id: run.run_id.clone(),
            stage: cause.stage.clone(),
            cause,
            run,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), json!("PipelineFailed"));
        map.insert("run_id".to_string(), json!(self.run_id));
        map.insert("stage".to_string(), json!(self.stage));
        map.insert("attempts".to_string(), json!(self.cause.attempts));
        map.insert("cause".to_string(), json!(self.cause.last_error.kind()));
        map.insert("message".to_string(), json!(self.cause.message()));
        map
    }
}

/// Error raised when a status patch could not be persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Failed to report status for run '{run_id}': {message}")]
pub struct ReportingError {
    /// The run identifier.
    pub run_id: String,
    /// The store's error message.
    pub message: String,
}

impl ReportingError {
    /// Creates a new reporting error.
    #[must_use]
    pub fn new(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            message: message.into(),
        }
    }
}

/// Error raised when a stage registry or orchestrator is misconfigured.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RegistryValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
}

impl RegistryValidationError {
    /// Creates a new validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Adds a single involved stage.
    #[must_use]
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stages.push(stage.into());
        self
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        /// The file path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration text is not valid JSON for the schema.
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment variable holds an unusable value.
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue {
        /// The variable name.
        key: String,
        /// The offending value.
        value: String,
    },
}
