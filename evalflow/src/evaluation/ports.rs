//! Collaborators the evaluation stages call out to.
//!
//! Every collaborator returns `anyhow::Result`; the stages turn failures
//! into [`StageError`](crate::errors::StageError) rejections so they are
//! retried like any other attempt failure.

use super::state::{Evaluation, EvaluationRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Reads source documents and stores finished evaluations.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Downloads a document's bytes.
    async fn download(&self, path: &str) -> anyhow::Result<Vec<u8>>;

    /// Saves an evaluation and returns its identifier.
    ///
    /// May be called more than once for the same candidate; implementations
    /// should upsert on `request.candidate_id`.
    async fn save_result(
        &self,
        request: &EvaluationRequest,
        evaluation: &Evaluation,
    ) -> anyhow::Result<String>;
}

/// Turns document bytes into plain text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extracts the text of a document.
    async fn extract_text(&self, document: &[u8]) -> anyhow::Result<String>;
}

/// Embeds text into a vector space.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the embedding of `text`.
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Kinds of reference documents held by the retriever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    /// The job description.
    JobDescription,
    /// The CV scoring rubric.
    #[serde(rename = "rubric_cv")]
    CvRubric,
    /// The case study brief.
    CaseStudy,
    /// The project scoring rubric.
    #[serde(rename = "rubric_project")]
    ProjectRubric,
}

impl DocumentType {
    /// The type tag as stored in the vector index.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobDescription => "job_description",
            Self::CvRubric => "rubric_cv",
            Self::CaseStudy => "case_study",
            Self::ProjectRubric => "rubric_project",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finds reference passages near an embedding.
#[async_trait]
pub trait ContextRetriever: Send + Sync {
    /// Returns passages of one document type, most similar first.
    async fn retrieve(
        &self,
        embedding: &[f32],
        document_type: DocumentType,
    ) -> anyhow::Result<Vec<String>>;
}

/// The language model that scores and summarizes.
///
/// Each call receives a fully built prompt and returns the model's raw
/// text, which the stages parse and validate.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Scores a CV.
    async fn score_cv(&self, prompt: &str) -> anyhow::Result<String>;

    /// Scores a project report.
    async fn score_project(&self, prompt: &str) -> anyhow::Result<String>;

    /// Writes the overall summary.
    async fn summarize(&self, prompt: &str) -> anyhow::Result<String>;
}

/// The set of collaborators an evaluation pipeline runs against.
#[derive(Clone)]
pub struct Collaborators {
    /// Document storage.
    pub store: Arc<dyn DocumentStore>,
    /// Text extraction.
    pub extractor: Arc<dyn TextExtractor>,
    /// Embedding service.
    pub embedder: Arc<dyn Embedder>,
    /// Reference passage retrieval.
    pub retriever: Arc<dyn ContextRetriever>,
    /// Language model.
    pub model: Arc<dyn LanguageModel>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! In-memory collaborators for stage and pipeline tests.

    use super::*;
    use anyhow::{anyhow, bail};
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};

    pub const CV_PDF: &[u8] = b"%PDF-1.7 candidate cv";
    pub const PROJECT_PDF: &[u8] = b"%PDF-1.7 project report";

    #[derive(Default)]
    pub struct FakeStore {
        pub files: HashMap<String, Vec<u8>>,
        pub saved: Mutex<Vec<(String, Evaluation)>>,
        pub save_failures: AtomicU32,
    }

    impl FakeStore {
        pub fn with_documents() -> Self {
            let mut files = HashMap::new();
            files.insert("cv/cand-1.pdf".to_string(), CV_PDF.to_vec());
            files.insert("project/cand-1.pdf".to_string(), PROJECT_PDF.to_vec());
            Self {
                files,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl DocumentStore for FakeStore {
        async fn download(&self, path: &str) -> anyhow::Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("object not found: {path}"))
        }

        async fn save_result(
            &self,
            request: &EvaluationRequest,
            evaluation: &Evaluation,
        ) -> anyhow::Result<String> {
            if self
                .save_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                bail!("database unavailable");
            }
            self.saved
                .lock()
                .push((request.candidate_id.clone(), evaluation.clone()));
            Ok(format!("result-{}", request.candidate_id))
        }
    }

    pub struct FakeExtractor;

    #[async_trait]
    impl TextExtractor for FakeExtractor {
        async fn extract_text(&self, document: &[u8]) -> anyhow::Result<String> {
            let text = String::from_utf8_lossy(document);
            Ok(text.trim_start_matches("%PDF-1.7").to_string())
        }
    }

    pub struct FakeEmbedder {
        pub dimensions: usize,
    }

    #[async_trait]
    impl Embedder for FakeEmbedder {
        #[allow(clippy::cast_precision_loss)]
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            let seed = text.len() as f32;
            Ok((0..self.dimensions).map(|i| seed + i as f32).collect())
        }
    }

    pub struct FakeRetriever;

    #[async_trait]
    impl ContextRetriever for FakeRetriever {
        async fn retrieve(
            &self,
            _embedding: &[f32],
            document_type: DocumentType,
        ) -> anyhow::Result<Vec<String>> {
            Ok(vec![
                format!("{document_type} passage 1"),
                format!("{document_type} passage 2"),
            ])
        }
    }

    /// Plays back queued replies per call kind, then a default reply.
    #[derive(Default)]
    pub struct FakeModel {
        pub cv_replies: Mutex<VecDeque<anyhow::Result<String>>>,
        pub project_replies: Mutex<VecDeque<anyhow::Result<String>>>,
        pub summary_replies: Mutex<VecDeque<anyhow::Result<String>>>,
        pub prompts: Mutex<Vec<String>>,
    }

    impl FakeModel {
        fn reply(
            &self,
            queue: &Mutex<VecDeque<anyhow::Result<String>>>,
            prompt: &str,
            default: &str,
        ) -> anyhow::Result<String> {
            self.prompts.lock().push(prompt.to_string());
            queue
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(default.to_string()))
        }
    }

    #[async_trait]
    impl LanguageModel for FakeModel {
        async fn score_cv(&self, prompt: &str) -> anyhow::Result<String> {
            self.reply(
                &self.cv_replies,
                prompt,
                r#"```json
{"result": {"cv_match_rate": 0.82, "cv_feedback": "  Strong backend experience. "}}
```"#,
            )
        }

        async fn score_project(&self, prompt: &str) -> anyhow::Result<String> {
            self.reply(
                &self.project_replies,
                prompt,
                r#"{"project_score": 4.456, "project_feedback": "Meets requirements.\n"}"#,
            )
        }

        async fn summarize(&self, prompt: &str) -> anyhow::Result<String> {
            self.reply(
                &self.summary_replies,
                prompt,
                r#"{"result": {"overall_summary": " Good fit. "}}"#,
            )
        }
    }

    pub fn collaborators(store: Arc<FakeStore>, model: Arc<FakeModel>) -> Collaborators {
        Collaborators {
            store,
            extractor: Arc::new(FakeExtractor),
            embedder: Arc::new(FakeEmbedder { dimensions: 4 }),
            retriever: Arc::new(FakeRetriever),
            model,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_type_tags() {
        assert_eq!(DocumentType::JobDescription.as_str(), "job_description");
        assert_eq!(DocumentType::CvRubric.to_string(), "rubric_cv");
        assert_eq!(
            serde_json::to_string(&DocumentType::ProjectRubric).unwrap(),
            "\"rubric_project\""
        );
        assert_eq!(
            serde_json::from_str::<DocumentType>("\"case_study\"").unwrap(),
            DocumentType::CaseStudy
        );
    }
}
