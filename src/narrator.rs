use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::oracle::Oracle;

pub const NO_DATA: &str = "No data found matching the query.";

const TEMPERATURE: f32 = 0.7;
const MAX_OUTPUT_TOKENS: u32 = 1500;

/// Result sets at or below this size are always shown in full.
const FULL_DETAIL_LIMIT: usize = 10;
/// Aggregated result sets up to this size are shown in full.
const AGGREGATED_LIMIT: usize = 200;
const PREVIEW_RECORDS: usize = 10;
const LISTED_INSTRUCTORS: usize = 5;

const ANALYSIS_CONTEXT: &str = "You are a data analyst for an education program. \
You explain query results about teaching sessions and their student ratings \
(1 to 5 scale) to program managers. Answer the question directly in a few \
short paragraphs, cite the concrete numbers from the results, round ratings \
to two decimals, and say plainly when the results do not answer the question. \
Do not invent data that is not in the results.";

/// Explains result sets in prose.
pub struct ResultNarrator {
    oracle: Arc<dyn Oracle>,
    context: OnceLock<String>,
}

impl ResultNarrator {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            context: OnceLock::new(),
        }
    }

    pub fn initialize(&self) {
        self.context.get_or_init(|| {
            info!("result narrator initialized");
            ANALYSIS_CONTEXT.to_string()
        });
    }

    fn context(&self) -> Result<&str, PipelineError> {
        self.context
            .get()
            .map(String::as_str)
            .ok_or(PipelineError::NotInitialized {
                component: "result narrator",
            })
    }

    pub fn summarize(&self, results: &[Value]) -> Result<String, PipelineError> {
        self.context()?;
        Ok(summarize(results))
    }

    pub async fn analyze(&self, question: &str, results: &[Value]) -> Result<String, PipelineError> {
        let context = self.context()?;
        let digest = self.summarize(results)?;
        let prompt = format!(
            "Question: {}\n\nQuery results ({} records):\n{}\n\nAnalysis:",
            question.trim(),
            results.len(),
            digest
        );
        debug!(digest_chars = digest.len(), "requesting analysis");

        let text = self
            .oracle
            .complete(context, &prompt, TEMPERATURE, MAX_OUTPUT_TOKENS)
            .await
            .map_err(|e| PipelineError::Analysis(e.to_string()))?;

        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Analysis(
                "oracle returned an empty analysis".to_string(),
            ));
        }
        Ok(text.to_string())
    }
}

/// Builds the evidence digest handed to the oracle. Small or aggregated sets
/// are passed through whole; large raw sets are reduced to a preview plus
/// headline statistics.
pub fn summarize(results: &[Value]) -> String {
    if results.is_empty() {
        return NO_DATA.to_string();
    }

    if results.len() <= FULL_DETAIL_LIMIT || is_aggregated(results) {
        return serde_json::to_string_pretty(results).unwrap_or_else(|_| compact_lines(results));
    }

    digest(results)
}

/// Best-effort shape sniff: every record has an `_id` and an aggregate-looking field.
pub fn is_aggregated(results: &[Value]) -> bool {
    results.len() <= AGGREGATED_LIMIT
        && results.iter().all(|record| {
            record.as_object().is_some_and(|fields| {
                fields.contains_key("_id") && fields.keys().any(|key| is_aggregate_field(key))
            })
        })
}

/// `avg*`, `*average*`, `sum*`, `count` or `*Count` names, as `$group` output
/// fields are usually called. Raw session fields such as `totalResponses` do
/// not qualify.
fn is_aggregate_field(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.starts_with("avg")
        || name.contains("average")
        || name.starts_with("sum")
        || name.ends_with("count")
}

fn compact_lines<'a>(records: impl IntoIterator<Item = &'a Value>) -> String {
    records
        .into_iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn digest(results: &[Value]) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "Total records: {}", results.len());
    let _ = writeln!(output);
    let _ = writeln!(output, "First {PREVIEW_RECORDS} records:");
    let _ = writeln!(output, "{}", compact_lines(results.iter().take(PREVIEW_RECORDS)));

    let ratings: Vec<f64> = results.iter().filter_map(rating_of).collect();
    if !ratings.is_empty() {
        let mean = ratings.iter().sum::<f64>() / ratings.len() as f64;
        let _ = writeln!(output);
        let _ = writeln!(
            output,
            "Average rating: {:.2} (from {} records with ratings)",
            mean,
            ratings.len()
        );
    }

    let instructors = distinct_strings(results, "instructor");
    if !instructors.is_empty() {
        let mut listed: Vec<&str> = instructors
            .iter()
            .take(LISTED_INSTRUCTORS)
            .map(String::as_str)
            .collect();
        if instructors.len() > LISTED_INSTRUCTORS {
            listed.push("...");
        }
        let _ = writeln!(
            output,
            "Instructors ({}): {}",
            instructors.len(),
            listed.join(", ")
        );
    }

    let domains = distinct_strings(results, "domain");
    if !domains.is_empty() {
        let domains: Vec<&str> = domains.iter().map(String::as_str).collect();
        let _ = writeln!(output, "Domains: {}", domains.join(", "));
    }

    output
}

fn rating_of(record: &Value) -> Option<f64> {
    record
        .pointer("/ratings/overallAverage")
        .and_then(Value::as_f64)
        .or_else(|| record.get("overallAverage").and_then(Value::as_f64))
        .or_else(|| record.get("avgRating").and_then(Value::as_f64))
}

fn distinct_strings(results: &[Value], field: &str) -> BTreeSet<String> {
    results
        .iter()
        .filter_map(|record| record.get(field).and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}
