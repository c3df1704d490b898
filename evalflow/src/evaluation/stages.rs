//! The ten evaluation stage handlers.

use super::parse::{
    fallback_summary, parse_cv_assessment, parse_project_assessment, parse_summary, sanitize,
};
use super::ports::{
    ContextRetriever, DocumentStore, DocumentType, Embedder, LanguageModel, TextExtractor,
};
use super::prompts::{cv_prompt, project_prompt, summary_prompt};
use super::state::{
    DocumentTexts, Embeddings, Evaluation, EvaluationState, RetrievedContext, SourceDocuments,
};
use crate::errors::StageError;
use crate::stages::StageHandler;
use anyhow::Context as _;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Stage names, in run order.
pub mod names {
    /// Fetches both documents.
    pub const DOWNLOAD: &str = "download";
    /// Extracts text.
    pub const PARSE: &str = "parse";
    /// Embeds both texts.
    pub const EMBED: &str = "embed";
    /// Retrieves reference passages.
    pub const RETRIEVE_CONTEXT: &str = "retrieve-context";
    /// Scores the CV.
    pub const SCORE_CV: &str = "score-cv";
    /// Scores the project report.
    pub const SCORE_PROJECT: &str = "score-project";
    /// Writes the overall summary.
    pub const SUMMARIZE: &str = "summarize";
    /// Merges the assessments.
    pub const COMBINE: &str = "combine";
    /// Normalizes scores and text.
    pub const SANITIZE: &str = "sanitize";
    /// Saves the result.
    pub const PERSIST: &str = "persist";
}

fn unexpected(stage: &str, expected: &'static str, found: &EvaluationState) -> StageError {
    StageError::unexpected_input(stage, expected, found.kind())
}

/// Downloads the CV and project report.
pub struct DownloadStage {
    store: Arc<dyn DocumentStore>,
}

impl DownloadStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageHandler<EvaluationState> for DownloadStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Requested(request) = input else {
            return Err(unexpected(names::DOWNLOAD, "requested", &input));
        };

        let (cv, project) = tokio::try_join!(
            async {
                self.store
                    .download(&request.cv_path)
                    .await
                    .with_context(|| format!("download {}", request.cv_path))
            },
            async {
                self.store
                    .download(&request.project_path)
                    .await
                    .with_context(|| format!("download {}", request.project_path))
            },
        )?;
        debug!(cv_bytes = cv.len(), project_bytes = project.len(), "Documents downloaded");

        Ok(EvaluationState::Downloaded {
            request,
            documents: SourceDocuments { cv, project },
        })
    }
}

/// Extracts text from both documents.
pub struct ParseStage {
    extractor: Arc<dyn TextExtractor>,
}

impl ParseStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(extractor: Arc<dyn TextExtractor>) -> Self {
        Self { extractor }
    }

    async fn extract(&self, label: &str, document: &[u8]) -> Result<String, StageError> {
        let text = self
            .extractor
            .extract_text(document)
            .await
            .with_context(|| format!("extract {label} text"))?;
        if text.trim().is_empty() {
            return Err(StageError::malformed(format!("{label} contains no text")));
        }
        Ok(text)
    }
}

#[async_trait]
impl StageHandler<EvaluationState> for ParseStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Downloaded { request, documents } = input else {
            return Err(unexpected(names::PARSE, "downloaded", &input));
        };

        let (cv, project) = tokio::try_join!(
            self.extract("CV", &documents.cv),
            self.extract("project report", &documents.project),
        )?;

        Ok(EvaluationState::Extracted {
            request,
            texts: DocumentTexts { cv, project },
        })
    }
}

/// Embeds both texts.
pub struct EmbedStage {
    embedder: Arc<dyn Embedder>,
}

impl EmbedStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }

    async fn embed(&self, label: &str, text: &str) -> Result<Vec<f32>, StageError> {
        let vector = self
            .embedder
            .embed(text)
            .await
            .with_context(|| format!("embed {label}"))?;
        if vector.is_empty() {
            return Err(StageError::malformed(format!("empty embedding for {label}")));
        }
        Ok(vector)
    }
}

#[async_trait]
impl StageHandler<EvaluationState> for EmbedStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Extracted { request, texts } = input else {
            return Err(unexpected(names::EMBED, "extracted", &input));
        };

        let (cv, project) = tokio::try_join!(
            self.embed("CV", &texts.cv),
            self.embed("project report", &texts.project),
        )?;

        Ok(EvaluationState::Embedded {
            request,
            texts,
            embeddings: Embeddings { cv, project },
        })
    }
}

/// Retrieves job, case study and rubric passages.
pub struct RetrieveContextStage {
    retriever: Arc<dyn ContextRetriever>,
}

impl RetrieveContextStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(retriever: Arc<dyn ContextRetriever>) -> Self {
        Self { retriever }
    }

    async fn retrieve(
        &self,
        embedding: &[f32],
        document_type: DocumentType,
    ) -> anyhow::Result<Vec<String>> {
        self.retriever
            .retrieve(embedding, document_type)
            .await
            .with_context(|| format!("retrieve {document_type} passages"))
    }
}

#[async_trait]
impl StageHandler<EvaluationState> for RetrieveContextStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Embedded {
            request,
            texts,
            embeddings,
        } = input
        else {
            return Err(unexpected(names::RETRIEVE_CONTEXT, "embedded", &input));
        };

        let (job_description, cv_rubric, case_study, project_rubric) = tokio::try_join!(
            self.retrieve(&embeddings.cv, DocumentType::JobDescription),
            self.retrieve(&embeddings.cv, DocumentType::CvRubric),
            self.retrieve(&embeddings.project, DocumentType::CaseStudy),
            self.retrieve(&embeddings.project, DocumentType::ProjectRubric),
        )?;

        Ok(EvaluationState::Grounded {
            request,
            texts,
            context: RetrievedContext {
                job_description,
                cv_rubric,
                case_study,
                project_rubric,
            },
        })
    }
}

/// Scores the CV against the job description and rubric.
pub struct ScoreCvStage {
    model: Arc<dyn LanguageModel>,
}

impl ScoreCvStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl StageHandler<EvaluationState> for ScoreCvStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Grounded {
            request,
            texts,
            context,
        } = input
        else {
            return Err(unexpected(names::SCORE_CV, "grounded", &input));
        };

        let prompt = cv_prompt(&context.job_description, &context.cv_rubric, &texts.cv);
        let reply = self.model.score_cv(&prompt).await.context("score CV")?;
        let cv = parse_cv_assessment(&reply)?;

        Ok(EvaluationState::CvScored {
            request,
            texts,
            context,
            cv,
        })
    }
}

/// Scores the project report against the case study and rubric.
pub struct ScoreProjectStage {
    model: Arc<dyn LanguageModel>,
}

impl ScoreProjectStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl StageHandler<EvaluationState> for ScoreProjectStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::CvScored {
            request,
            texts,
            context,
            cv,
        } = input
        else {
            return Err(unexpected(names::SCORE_PROJECT, "cv_scored", &input));
        };

        let prompt = project_prompt(&context.case_study, &context.project_rubric, &texts.project);
        let reply = self
            .model
            .score_project(&prompt)
            .await
            .context("score project report")?;
        let project = parse_project_assessment(&reply)?;

        Ok(EvaluationState::Scored {
            request,
            cv,
            project,
        })
    }
}

/// Writes the overall summary; falls back to a templated one.
pub struct SummarizeStage {
    model: Arc<dyn LanguageModel>,
}

impl SummarizeStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl StageHandler<EvaluationState> for SummarizeStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Scored {
            request,
            cv,
            project,
        } = input
        else {
            return Err(unexpected(names::SUMMARIZE, "scored", &input));
        };

        let reply = self
            .model
            .summarize(&summary_prompt(&cv, &project))
            .await
            .context("summarize assessments")?;
        let summary = parse_summary(&reply)?;

        Ok(EvaluationState::Summarized {
            request,
            cv,
            project,
            summary,
        })
    }

    fn fallback(&self, input: &EvaluationState) -> Option<EvaluationState> {
        let EvaluationState::Scored {
            request,
            cv,
            project,
        } = input
        else {
            return None;
        };
        Some(EvaluationState::Summarized {
            request: request.clone(),
            cv: cv.clone(),
            project: project.clone(),
            summary: fallback_summary(cv, project),
        })
    }

    fn has_fallback(&self) -> bool {
        true
    }
}

/// Merges the three assessments into one record.
#[derive(Debug, Clone, Copy, Default)]
pub struct CombineStage;

#[async_trait]
impl StageHandler<EvaluationState> for CombineStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Summarized {
            request,
            cv,
            project,
            summary,
        } = input
        else {
            return Err(unexpected(names::COMBINE, "summarized", &input));
        };

        Ok(EvaluationState::Combined {
            request,
            evaluation: Evaluation::combine(&cv, &project, &summary),
        })
    }
}

/// Clamps scores and trims text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SanitizeStage;

#[async_trait]
impl StageHandler<EvaluationState> for SanitizeStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Combined {
            request,
            evaluation,
        } = input
        else {
            return Err(unexpected(names::SANITIZE, "combined", &input));
        };

        Ok(EvaluationState::Sanitized {
            request,
            evaluation: sanitize(&evaluation)?,
        })
    }
}

/// Saves the sanitized evaluation.
pub struct PersistStage {
    store: Arc<dyn DocumentStore>,
}

impl PersistStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageHandler<EvaluationState> for PersistStage {
    async fn run(&self, input: EvaluationState) -> Result<EvaluationState, StageError> {
        let EvaluationState::Sanitized {
            request,
            evaluation,
        } = input
        else {
            return Err(unexpected(names::PERSIST, "sanitized", &input));
        };

        let result_id = self
            .store
            .save_result(&request, &evaluation)
            .await
            .with_context(|| format!("save result for {}", request.candidate_id))?;

        Ok(EvaluationState::Persisted {
            request,
            result_id,
            evaluation,
        })
    }
}
