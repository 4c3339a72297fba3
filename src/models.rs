use bson::serde_helpers::chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// One aggregation stage, e.g. `{"$match": {...}}`.
pub type Stage = Map<String, Value>;

/// Ordered aggregation pipeline. An empty pipeline means the question could
/// not be expressed as a query.
pub type StructuredQuery = Vec<Stage>;

/// Records returned by the store, raw sessions or aggregated rows alike.
pub type ResultSet = Vec<Value>;

/// Stored shape of one session; serializes straight to the BSON document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDocument {
    pub topic_code: String,
    pub session_type: String,
    pub domain: String,
    #[serde(rename = "class")]
    pub class_label: String,
    pub cohorts: Vec<String>,
    pub instructor: String,
    /// Midnight UTC of the day the session ran.
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub session_date: DateTime<Utc>,
    pub ratings: SessionRatings,
    pub metadata: SessionMetadata,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRatings {
    pub overall_average: Option<f64>,
    pub total_responses: i64,
    pub students_attended: i64,
    pub cohort_strength: i64,
    pub percent_rated: Option<f64>,
    pub yes_responses: i64,
    pub no_responses: i64,
    pub yes_percentage: Option<f64>,
    pub no_percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub source_ref: String,
    pub row_number: i64,
    #[serde(with = "chrono_datetime_as_bson_datetime")]
    pub last_synced: DateTime<Utc>,
}

impl SessionRatings {
    /// Checks the rating bounds: average in [1, 5], percentages in [0, 100].
    pub fn validate(&self) -> Result<(), String> {
        if let Some(avg) = self.overall_average {
            if !(1.0..=5.0).contains(&avg) {
                return Err(format!("overall average {avg} outside 1-5"));
            }
        }

        let percentages = [
            ("percent rated", self.percent_rated),
            ("yes percentage", self.yes_percentage),
            ("no percentage", self.no_percentage),
        ];
        for (label, value) in percentages {
            if let Some(value) = value {
                if !(0.0..=100.0).contains(&value) {
                    return Err(format!("{label} {value} outside 0-100"));
                }
            }
        }

        Ok(())
    }
}

/// What the request boundary hands back for one question.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub result_count: usize,
    pub analysis: String,
    pub sample_results: ResultSet,
    pub timestamp: DateTime<Utc>,
}
