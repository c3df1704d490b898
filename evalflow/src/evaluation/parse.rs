//! Model output parsing, fallback construction and sanitization.

use super::state::{CvAssessment, Evaluation, ProjectAssessment, SummaryAssessment};
use crate::errors::StageError;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Matches Markdown code fences, with or without a language tag.
#[allow(clippy::expect_used)]
static CODE_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```[A-Za-z]*").expect("Invalid code fence pattern"));

/// Parses a model reply into its JSON object.
///
/// Code fences are stripped and a top-level `result` object, if present,
/// is unwrapped.
///
/// # Errors
///
/// Returns [`StageError::MalformedResponse`] if the reply is empty, not
/// JSON, or not an object.
pub fn parse_model_json(raw: &str) -> Result<Map<String, Value>, StageError> {
    let cleaned = CODE_FENCE.replace_all(raw, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Err(StageError::malformed("empty model response"));
    }

    let value: Value = serde_json::from_str(cleaned)
        .map_err(|err| StageError::malformed(format!("model response is not JSON: {err}")))?;

    let Value::Object(mut object) = value else {
        return Err(StageError::malformed("model response is not a JSON object"));
    };
    match object.remove("result") {
        Some(Value::Object(inner)) => Ok(inner),
        Some(other) => {
            object.insert("result".to_string(), other);
            Ok(object)
        }
        None => Ok(object),
    }
}

fn required_number(object: &Map<String, Value>, key: &str) -> Result<f64, StageError> {
    match object.get(key).and_then(Value::as_f64) {
        Some(number) if number.is_finite() => Ok(number),
        Some(_) => Err(StageError::malformed(format!("'{key}' is not a finite number"))),
        None => Err(StageError::malformed(format!("missing numeric '{key}'"))),
    }
}

fn optional_text(object: &Map<String, Value>, key: &str) -> Result<String, StageError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(text)) => Ok(text.clone()),
        Some(_) => Err(StageError::malformed(format!("'{key}' is not a string"))),
    }
}

/// Parses the CV scoring reply.
///
/// # Errors
///
/// Fails if the reply is malformed or lacks `cv_match_rate`.
pub fn parse_cv_assessment(raw: &str) -> Result<CvAssessment, StageError> {
    let object = parse_model_json(raw)?;
    Ok(CvAssessment {
        cv_match_rate: required_number(&object, "cv_match_rate")?,
        cv_feedback: optional_text(&object, "cv_feedback")?,
    })
}

/// Parses the project scoring reply.
///
/// # Errors
///
/// Fails if the reply is malformed or lacks `project_score`.
pub fn parse_project_assessment(raw: &str) -> Result<ProjectAssessment, StageError> {
    let object = parse_model_json(raw)?;
    Ok(ProjectAssessment {
        project_score: required_number(&object, "project_score")?,
        project_feedback: optional_text(&object, "project_feedback")?,
    })
}

/// Parses the summary reply.
///
/// # Errors
///
/// Fails if the reply is malformed or `overall_summary` is missing or blank.
pub fn parse_summary(raw: &str) -> Result<SummaryAssessment, StageError> {
    let object = parse_model_json(raw)?;
    match object.get("overall_summary") {
        Some(Value::String(summary)) if !summary.trim().is_empty() => Ok(SummaryAssessment {
            overall_summary: summary.clone(),
        }),
        _ => Err(StageError::malformed("missing text 'overall_summary'")),
    }
}

/// Builds a summary from the two assessments without the model.
#[must_use]
pub fn fallback_summary(cv: &CvAssessment, project: &ProjectAssessment) -> SummaryAssessment {
    let cv_feedback = non_empty(&cv.cv_feedback, "no CV feedback was recorded");
    let project_feedback = non_empty(&project.project_feedback, "no project feedback was recorded");
    SummaryAssessment {
        overall_summary: format!(
            "Automated summary unavailable. CV match rate {:.2}: {}. Project score {:.2}: {}.",
            cv.cv_match_rate,
            cv_feedback.trim_end_matches('.'),
            project.project_score,
            project_feedback.trim_end_matches('.'),
        ),
    }
}

fn non_empty<'a>(text: &'a str, default: &'a str) -> &'a str {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        default
    } else {
        trimmed
    }
}

/// Normalizes a combined evaluation for storage.
///
/// The CV match rate is clamped to `[0, 1]` and stored as a whole
/// percentage. The project score is clamped to `[1, 5]` and rounded to two
/// decimals. Text fields are trimmed.
///
/// # Errors
///
/// Fails if either score is not a finite number.
pub fn sanitize(evaluation: &Evaluation) -> Result<Evaluation, StageError> {
    if !evaluation.cv_match_rate.is_finite() || !evaluation.project_score.is_finite() {
        return Err(StageError::malformed("evaluation scores must be finite"));
    }
    Ok(Evaluation {
        cv_match_rate: (evaluation.cv_match_rate.clamp(0.0, 1.0) * 100.0).round(),
        cv_feedback: evaluation.cv_feedback.trim().to_string(),
        project_score: (evaluation.project_score.clamp(1.0, 5.0) * 100.0).round() / 100.0,
        project_feedback: evaluation.project_feedback.trim().to_string(),
        overall_summary: evaluation.overall_summary.trim().to_string(),
    })
}
