//! The candidate evaluation pipeline.
//!
//! Ten stages take an [`EvaluationRequest`] from two stored PDF documents
//! to a persisted, sanitized [`Evaluation`]:
//!
//! ```text
//! download -> parse -> embed -> retrieve-context -> score-cv ->
//! score-project -> summarize -> combine -> sanitize -> persist
//! ```
//!
//! Only `summarize` may fall back; its substitute is a templated summary
//! built from the two scores.

mod parse;
mod ports;
mod prompts;
mod stages;
mod state;

pub use parse::{
    fallback_summary, parse_cv_assessment, parse_model_json, parse_project_assessment,
    parse_summary, sanitize,
};
pub use ports::{
    Collaborators, ContextRetriever, DocumentStore, DocumentType, Embedder, LanguageModel,
    TextExtractor,
};
pub use prompts::{cv_prompt, project_prompt, summary_prompt, PASSAGE_SEPARATOR};
pub use stages::{
    names, CombineStage, DownloadStage, EmbedStage, ParseStage, PersistStage,
    RetrieveContextStage, SanitizeStage, ScoreCvStage, ScoreProjectStage, SummarizeStage,
};
pub use state::{
    CvAssessment, DocumentTexts, Embeddings, Evaluation, EvaluationRequest, EvaluationState,
    ProjectAssessment, RetrievedContext, SourceDocuments, SummaryAssessment,
};

use crate::config::EngineConfig;
use crate::errors::{EvalflowError, RegistryValidationError};
use crate::pipeline::{PipelineOrchestrator, ResiliencePolicy, StageRegistry};
use crate::reporting::StatusReporter;
use crate::stages::StageHandler;
use std::sync::Arc;

fn policy(max_attempts: u32, base_delay_ms: u64, timeout_ms: u64) -> ResiliencePolicy {
    ResiliencePolicy::new()
        .with_max_attempts(max_attempts)
        .with_base_delay_ms(base_delay_ms)
        .with_timeout_ms(timeout_ms)
}

/// The evaluation stages with their progress and resilience policies.
///
/// # Errors
///
/// Never fails for the built-in table; the result mirrors
/// [`StageRegistry::new`].
pub fn evaluation_registry() -> Result<StageRegistry, RegistryValidationError> {
    StageRegistry::builder()
        .stage(names::DOWNLOAD, 10, policy(2, 1000, 30_000))
        .stage(names::PARSE, 20, policy(2, 1000, 30_000))
        .stage(names::EMBED, 30, policy(3, 2000, 60_000))
        .stage(names::RETRIEVE_CONTEXT, 40, policy(3, 2000, 45_000))
        .stage(names::SCORE_CV, 55, policy(3, 3000, 90_000))
        .stage(names::SCORE_PROJECT, 70, policy(3, 3000, 90_000))
        .stage(names::SUMMARIZE, 80, policy(2, 2000, 60_000).with_fallback())
        .stage(names::COMBINE, 90, policy(2, 1000, 30_000))
        .stage(names::SANITIZE, 95, policy(2, 1000, 15_000))
        .stage(names::PERSIST, 100, policy(3, 1000, 15_000))
        .build()
}

/// Wires the evaluation stages to their collaborators.
///
/// The all-stage and per-stage policy overrides and the jitter ceiling come
/// from `config`.
///
/// # Errors
///
/// Returns [`EvalflowError::Validation`] if a configured override names an
/// unknown stage, produces an invalid policy, or allows fallback on a stage
/// that has none.
pub fn evaluation_pipeline(
    collaborators: &Collaborators,
    reporter: Arc<dyn StatusReporter>,
    config: &EngineConfig,
) -> Result<PipelineOrchestrator<EvaluationState>, EvalflowError> {
    let registry = config.apply_overrides(&evaluation_registry()?)?;

    let handlers: [(&str, Arc<dyn StageHandler<EvaluationState>>); 10] = [
        (names::DOWNLOAD, Arc::new(DownloadStage::new(collaborators.store.clone()))),
        (names::PARSE, Arc::new(ParseStage::new(collaborators.extractor.clone()))),
        (names::EMBED, Arc::new(EmbedStage::new(collaborators.embedder.clone()))),
        (
            names::RETRIEVE_CONTEXT,
            Arc::new(RetrieveContextStage::new(collaborators.retriever.clone())),
        ),
        (names::SCORE_CV, Arc::new(ScoreCvStage::new(collaborators.model.clone()))),
        (
            names::SCORE_PROJECT,
            Arc::new(ScoreProjectStage::new(collaborators.model.clone())),
        ),
        (names::SUMMARIZE, Arc::new(SummarizeStage::new(collaborators.model.clone()))),
        (names::COMBINE, Arc::new(CombineStage)),
        (names::SANITIZE, Arc::new(SanitizeStage)),
        (names::PERSIST, Arc::new(PersistStage::new(collaborators.store.clone()))),
    ];

    let orchestrator = handlers
        .into_iter()
        .fold(PipelineOrchestrator::builder(registry), |builder, (name, handler)| {
            builder.stage(name, handler)
        })
        .reporter(reporter)
        .executor(config.executor())
        .build()?;
    Ok(orchestrator)
}
