//! Observability utilities.
//!
//! Runs log through `tracing`: every run executes inside a `pipeline_run`
//! span and every stage inside a `stage` span, so attempt-level events
//! carry `run_id`, `stage` and `order` without repeating them.

use crate::config::LogConfig;
use crate::errors::{ConfigError, EvalflowError};
use crate::pipeline::StageDefinition;
use tracing::{info_span, Span};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Builds the event filter for a logging configuration.
///
/// # Errors
///
/// Returns an error if the filter directives don't parse.
pub fn env_filter(config: &LogConfig) -> Result<EnvFilter, ConfigError> {
    EnvFilter::try_new(&config.filter).map_err(|_| ConfigError::InvalidValue {
        key: "log.filter".to_string(),
        value: config.filter.clone(),
    })
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a global subscriber is
/// already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), EvalflowError> {
    let filter = env_filter(config)?;
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_events(span_events),
            )
            .try_init()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_span_events(span_events),
            )
            .try_init()
    };

    installed.map_err(|err| EvalflowError::Internal(format!("Failed to install tracing: {err}")))
}

/// The span wrapping one pipeline run.
#[must_use]
pub fn run_span(run_id: &str) -> Span {
    info_span!("pipeline_run", run_id = %run_id)
}

/// The span wrapping one stage of a run.
#[must_use]
pub fn stage_span(definition: &StageDefinition) -> Span {
    info_span!("stage", stage = %definition.name, order = definition.order)
}
