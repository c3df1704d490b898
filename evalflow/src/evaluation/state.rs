//! Typed intermediate results of an evaluation run.

use serde::{Deserialize, Serialize};

/// A request to evaluate one candidate's CV and project report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationRequest {
    /// The candidate, also the key of the saved result.
    pub candidate_id: String,
    /// Storage path of the CV document.
    pub cv_path: String,
    /// Storage path of the project report.
    pub project_path: String,
    /// Public URL of the CV, stored alongside the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cv_url: Option<String>,
    /// Public URL of the project report, stored alongside the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_url: Option<String>,
}

impl EvaluationRequest {
    /// Creates a request without public URLs.
    pub fn new(
        candidate_id: impl Into<String>,
        cv_path: impl Into<String>,
        project_path: impl Into<String>,
    ) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            cv_path: cv_path.into(),
            project_path: project_path.into(),
            cv_url: None,
            project_url: None,
        }
    }

    /// Attaches the public document URLs.
    #[must_use]
    pub fn with_urls(mut self, cv_url: impl Into<String>, project_url: impl Into<String>) -> Self {
        self.cv_url = Some(cv_url.into());
        self.project_url = Some(project_url.into());
        self
    }
}

/// Raw bytes of both documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocuments {
    /// The CV file.
    pub cv: Vec<u8>,
    /// The project report file.
    pub project: Vec<u8>,
}

/// Plain text extracted from both documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentTexts {
    /// CV text.
    pub cv: String,
    /// Project report text.
    pub project: String,
}

/// Embedding vectors of both texts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embeddings {
    /// CV embedding.
    pub cv: Vec<f32>,
    /// Project report embedding.
    pub project: Vec<f32>,
}

/// Reference passages retrieved for scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievedContext {
    /// Job description passages, matched against the CV.
    pub job_description: Vec<String>,
    /// CV rubric passages, matched against the CV.
    pub cv_rubric: Vec<String>,
    /// Case study passages, matched against the project.
    pub case_study: Vec<String>,
    /// Project rubric passages, matched against the project.
    pub project_rubric: Vec<String>,
}

/// The model's assessment of the CV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvAssessment {
    /// Match rate between 0 and 1.
    pub cv_match_rate: f64,
    /// Free-text feedback.
    #[serde(default)]
    pub cv_feedback: String,
}

/// The model's assessment of the project report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectAssessment {
    /// Score between 1 and 5.
    pub project_score: f64,
    /// Free-text feedback.
    #[serde(default)]
    pub project_feedback: String,
}

/// The overall summary of both assessments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryAssessment {
    /// A few sentences on strengths, gaps and recommendations.
    pub overall_summary: String,
}

/// The merged evaluation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    /// CV match rate; a 0..=1 fraction before sanitizing, a percentage after.
    pub cv_match_rate: f64,
    /// CV feedback.
    pub cv_feedback: String,
    /// Project score between 1 and 5.
    pub project_score: f64,
    /// Project feedback.
    pub project_feedback: String,
    /// Overall summary.
    pub overall_summary: String,
}

impl Evaluation {
    /// Merges the three assessments.
    #[must_use]
    pub fn combine(
        cv: &CvAssessment,
        project: &ProjectAssessment,
        summary: &SummaryAssessment,
    ) -> Self {
        Self {
            cv_match_rate: cv.cv_match_rate,
            cv_feedback: cv.cv_feedback.clone(),
            project_score: project.project_score,
            project_feedback: project.project_feedback.clone(),
            overall_summary: summary.overall_summary.clone(),
        }
    }
}

/// The value threaded through the evaluation stages.
///
/// Each variant is the output of one stage and the input of the next.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationState {
    /// Input of `download`.
    Requested(EvaluationRequest),
    /// Output of `download`.
    Downloaded {
        /// The request.
        request: EvaluationRequest,
        /// Both documents.
        documents: SourceDocuments,
    },
    /// Output of `parse`.
    Extracted {
        /// The request.
        request: EvaluationRequest,
        /// Both texts.
        texts: DocumentTexts,
    },
    /// Output of `embed`.
    Embedded {
        /// The request.
        request: EvaluationRequest,
        /// Both texts.
        texts: DocumentTexts,
        /// Both embeddings.
        embeddings: Embeddings,
    },
    /// Output of `retrieve-context`.
    Grounded {
        /// The request.
        request: EvaluationRequest,
        /// Both texts.
        texts: DocumentTexts,
        /// The retrieved passages.
        context: RetrievedContext,
    },
    /// Output of `score-cv`.
    CvScored {
        /// The request.
        request: EvaluationRequest,
        /// Both texts.
        texts: DocumentTexts,
        /// The retrieved passages.
        context: RetrievedContext,
        /// The CV assessment.
        cv: CvAssessment,
    },
    /// Output of `score-project`.
    Scored {
        /// The request.
        request: EvaluationRequest,
        /// The CV assessment.
        cv: CvAssessment,
        /// The project assessment.
        project: ProjectAssessment,
    },
    /// Output of `summarize`.
    Summarized {
        /// The request.
        request: EvaluationRequest,
        /// The CV assessment.
        cv: CvAssessment,
        /// The project assessment.
        project: ProjectAssessment,
        /// The overall summary.
        summary: SummaryAssessment,
    },
    /// Output of `combine`.
    Combined {
        /// The request.
        request: EvaluationRequest,
        /// The merged record.
        evaluation: Evaluation,
    },
    /// Output of `sanitize`.
    Sanitized {
        /// The request.
        request: EvaluationRequest,
        /// The normalized record.
        evaluation: Evaluation,
    },
    /// Output of `persist`.
    Persisted {
        /// The request.
        request: EvaluationRequest,
        /// Identifier of the saved result.
        result_id: String,
        /// The saved record.
        evaluation: Evaluation,
    },
}

impl EvaluationState {
    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Requested(_) => "requested",
            Self::Downloaded { .. } => "downloaded",
            Self::Extracted { .. } => "extracted",
            Self::Embedded { .. } => "embedded",
            Self::Grounded { .. } => "grounded",
            Self::CvScored { .. } => "cv_scored",
            Self::Scored { .. } => "scored",
            Self::Summarized { .. } => "summarized",
            Self::Combined { .. } => "combined",
            Self::Sanitized { .. } => "sanitized",
            Self::Persisted { .. } => "persisted",
        }
    }

    /// Returns the originating request.
    #[must_use]
    pub fn request(&self) -> &EvaluationRequest {
        match self {
            Self::Requested(request)
            | Self::Downloaded { request, .. }
            | Self::Extracted { request, .. }
            | Self::Embedded { request, .. }
            | Self::Grounded { request, .. }
            | Self::CvScored { request, .. }
            | Self::Scored { request, .. }
            | Self::Summarized { request, .. }
            | Self::Combined { request, .. }
            | Self::Sanitized { request, .. }
            | Self::Persisted { request, .. } => request,
        }
    }

    /// Returns the final record once the run has persisted it.
    #[must_use]
    pub fn persisted(&self) -> Option<(&str, &Evaluation)> {
        match self {
            Self::Persisted {
                result_id,
                evaluation,
                ..
            } => Some((result_id, evaluation)),
            _ => None,
        }
    }
}

impl From<EvaluationRequest> for EvaluationState {
    fn from(request: EvaluationRequest) -> Self {
        Self::Requested(request)
    }
}
