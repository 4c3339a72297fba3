use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::models::{Stage, StructuredQuery};
use crate::oracle::Oracle;

const TEMPERATURE: f32 = 0.1;
const MAX_OUTPUT_TOKENS: u32 = 1000;

const SCHEMA_CONTEXT: &str = r#"You translate questions about educational session ratings into MongoDB aggregation pipelines.

Collection `sessions`, one document per taught session:
- topicCode (string): course topic code, e.g. "DSA-101"
- sessionType (string): e.g. "Lecture", "Workshop", "Lab"
- domain (string): subject category, e.g. "Tech", "Business", "Design"
- class (string): class label
- cohorts (array of strings): cohort names that attended
- instructor (string): instructor full name
- sessionDate (date)
- ratings.overallAverage (number 1-5, may be missing)
- ratings.totalResponses, ratings.studentsAttended, ratings.cohortStrength (integers)
- ratings.percentRated (number 0-100)
- ratings.yesResponses, ratings.noResponses (integers)
- ratings.yesPercentage, ratings.noPercentage (numbers 0-100)
- metadata.sourceRef (string), metadata.rowNumber (integer), metadata.lastSynced (date)
- createdAt, updatedAt (dates)

Rules:
1. Reply with a JSON array of pipeline stages and nothing else. No prose, no markdown.
2. Each stage is an object with exactly one operator key such as "$match", "$group", "$sort", "$project", "$limit", "$unwind".
3. Match names and text case-insensitively with {"$regex": "...", "$options": "i"}.
4. Write dates as extended JSON: {"$date": "2025-01-31T00:00:00Z"}.
5. For averages over ratings use "$ratings.overallAverage" and name the output field avgRating; name counts "count".
6. Use "$unwind": "$cohorts" before grouping by cohort.
7. If the question cannot be answered from this collection, reply with [].
"#;

/// Turns questions into aggregation pipelines and repairs failing ones.
pub struct QueryTranslator {
    oracle: Arc<dyn Oracle>,
    context: OnceLock<String>,
}

impl QueryTranslator {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            context: OnceLock::new(),
        }
    }

    /// Loads the schema and rules preamble. Later calls are no-ops.
    pub fn initialize(&self) {
        self.context.get_or_init(|| {
            info!("query translator initialized");
            SCHEMA_CONTEXT.to_string()
        });
    }

    fn context(&self) -> Result<&str, PipelineError> {
        self.context
            .get()
            .map(String::as_str)
            .ok_or(PipelineError::NotInitialized {
                component: "query translator",
            })
    }

    pub async fn generate(&self, question: &str) -> Result<StructuredQuery, PipelineError> {
        let context = self.context()?;
        let prompt = format!("Question: {}\n\nPipeline:", question.trim());
        let raw = self
            .oracle
            .complete(context, &prompt, TEMPERATURE, MAX_OUTPUT_TOKENS)
            .await
            .map_err(|e| PipelineError::Translation(e.to_string()))?;

        let query = parse_pipeline(&raw)?;
        debug!(stages = query.len(), "generated pipeline");
        Ok(query)
    }

    pub async fn fix(
        &self,
        question: &str,
        error_message: &str,
        failed_query: &StructuredQuery,
    ) -> Result<StructuredQuery, PipelineError> {
        let context = self.context()?;
        let failed = serde_json::to_string_pretty(failed_query)
            .map_err(|e| PipelineError::Translation(e.to_string()))?;
        let prompt = format!(
            "This pipeline failed when run against MongoDB.\n\n\
             Question: {}\n\
             Error: {}\n\
             Failed pipeline:\n{}\n\n\
             Reply with a corrected pipeline as a JSON array only.",
            question.trim(),
            error_message,
            failed
        );

        let raw = self
            .oracle
            .complete(context, &prompt, TEMPERATURE, MAX_OUTPUT_TOKENS)
            .await
            .map_err(|e| PipelineError::Translation(e.to_string()))?;

        let query = parse_pipeline(&raw)?;
        debug!(stages = query.len(), "repaired pipeline");
        Ok(query)
    }
}

/// Parses oracle output into stages, tolerating a surrounding code fence.
pub fn parse_pipeline(raw: &str) -> Result<StructuredQuery, PipelineError> {
    let text = strip_code_fence(raw);
    let value: Value = serde_json::from_str(text)
        .map_err(|e| PipelineError::Translation(format!("oracle output is not JSON: {e}")))?;

    let Value::Array(items) = value else {
        return Err(PipelineError::Translation(
            "oracle output is not a JSON array".to_string(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| into_stage(index, item))
        .collect()
}

fn into_stage(index: usize, item: Value) -> Result<Stage, PipelineError> {
    let Value::Object(stage) = item else {
        return Err(PipelineError::Translation(format!(
            "stage {index} is not an object"
        )));
    };

    if stage.len() == 1 && stage.keys().all(|key| key.starts_with('$')) {
        Ok(stage)
    } else {
        Err(PipelineError::Translation(format!(
            "stage {index} must have exactly one operator key"
        )))
    }
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop an info string such as `json` on the opening fence.
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}
