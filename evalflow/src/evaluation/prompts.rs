//! Prompts sent to the language model.

use super::state::{CvAssessment, ProjectAssessment};

/// Separator placed between retrieved passages.
pub const PASSAGE_SEPARATOR: &str = "\n---\n";

/// Builds the CV scoring prompt.
#[must_use]
pub fn cv_prompt(job_description: &[String], rubric: &[String], cv_text: &str) -> String {
    format!(
        "You are a recruiter evaluating a candidate's CV against the job description \
and the CV scoring rubric.

## Context
- Job description:
{job}

- CV scoring rubric:
{rubric}

## Candidate CV
{cv_text}

## Instructions
1. Evaluate the CV strictly against the job description and rubric criteria.
2. Score each rubric parameter from 1 to 5 and take the weighted average.
3. Convert that average to a cv_match_rate between 0 and 1, rounded to 2 decimals.
4. Give feedback on strengths, weaknesses and areas to improve.
5. Reply with JSON only, shaped like:
{{\"result\": {{\"cv_match_rate\": 0.82, \"cv_feedback\": \"...\"}}}}
",
        job = job_description.join(PASSAGE_SEPARATOR),
        rubric = rubric.join(PASSAGE_SEPARATOR),
    )
}

/// Builds the project scoring prompt.
#[must_use]
pub fn project_prompt(case_study: &[String], rubric: &[String], project_text: &str) -> String {
    format!(
        "You are reviewing a candidate's project report for a case study assignment.

## Context
- Case study brief:
{brief}

- Project scoring rubric:
{rubric}

## Candidate project report
{project_text}

## Instructions
1. Assess the report strictly against the case study brief and rubric criteria.
2. Score each rubric parameter from 1 to 5.
3. project_score is the weighted average from 1 to 5, rounded to 2 decimals.
4. Give feedback on strengths, weaknesses and areas to improve.
5. Reply with JSON only, shaped like:
{{\"result\": {{\"project_score\": 4.5, \"project_feedback\": \"...\"}}}}
",
        brief = case_study.join(PASSAGE_SEPARATOR),
        rubric = rubric.join(PASSAGE_SEPARATOR),
    )
}

/// Builds the overall summary prompt.
#[must_use]
pub fn summary_prompt(cv: &CvAssessment, project: &ProjectAssessment) -> String {
    let cv_json = serde_json::to_string(cv).unwrap_or_default();
    let project_json = serde_json::to_string(project).unwrap_or_default();
    format!(
        "You are writing an overall evaluation summary for a candidate from their CV \
and project assessments.

## Context
- CV assessment:
{cv_json}

- Project assessment:
{project_json}

## Instructions
1. Combine both assessments into one coherent summary.
2. Write 3 to 5 sentences covering strengths, gaps and recommendations.
3. Reply with JSON only, shaped like:
{{\"result\": {{\"overall_summary\": \"...\"}}}}
"
    )
}
