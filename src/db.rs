use std::io::Read;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{NaiveDate, NaiveTime, Utc};
use futures::TryStreamExt;
use mongodb::options::{FindOptions, UpdateOptions};
use mongodb::{Client, Collection, Database};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::models::{
    ResultSet, SessionDocument, SessionMetadata, SessionRatings, Stage, StructuredQuery,
};

/// Read access to the session collection.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn aggregate(&self, pipeline: &StructuredQuery) -> Result<ResultSet, StoreError>;
    async fn count(&self) -> Result<u64, StoreError>;
    async fn sample(&self, limit: usize) -> Result<ResultSet, StoreError>;
    async fn test_connection(&self) -> Result<(), StoreError>;
}

pub struct MongoSessionStore {
    database: Database,
    sessions: Collection<Document>,
    result_cap: usize,
}

impl MongoSessionStore {
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&config.uri)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let database = client.database(&config.database);
        let sessions = database.collection::<Document>(&config.collection);
        info!(
            database = %config.database,
            collection = %config.collection,
            "connected to MongoDB"
        );

        Ok(Self {
            database,
            sessions,
            result_cap: config.result_cap.max(1),
        })
    }

    /// Inserts or refreshes one session keyed on its source reference and row.
    /// Returns true when a new document was created.
    pub async fn upsert_session(&self, session: &SessionDocument) -> Result<bool, StoreError> {
        let filter = doc! {
            "metadata.sourceRef": session.metadata.source_ref.as_str(),
            "metadata.rowNumber": session.metadata.row_number,
        };
        let mut fields = session_to_document(session)?;
        let created_at = fields.remove("createdAt").unwrap_or(Bson::Null);
        let update = doc! {
            "$set": fields,
            "$setOnInsert": { "createdAt": created_at },
        };

        let result = self
            .sessions
            .update_one(filter, update, UpdateOptions::builder().upsert(true).build())
            .await?;
        Ok(result.upserted_id.is_some())
    }
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn aggregate(&self, pipeline: &StructuredQuery) -> Result<ResultSet, StoreError> {
        let stages = pipeline
            .iter()
            .map(stage_to_document)
            .collect::<Result<Vec<_>, _>>()?;

        let mut cursor = self.sessions.aggregate(stages, None).await?;
        let mut results = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            if results.len() >= self.result_cap {
                warn!(cap = self.result_cap, "result cap reached, dropping remaining records");
                break;
            }
            results.push(document_to_json(document));
        }

        debug!(records = results.len(), "aggregation finished");
        Ok(results)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.sessions.count_documents(doc! {}, None).await?)
    }

    async fn sample(&self, limit: usize) -> Result<ResultSet, StoreError> {
        let cursor = self.sessions.find(doc! {}, sample_options(limit)).await?;
        let documents: Vec<Document> = cursor.try_collect().await?;
        Ok(documents.into_iter().map(document_to_json).collect())
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        self.database
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(())
    }
}

/// MongoDB reads a limit of 0 as unlimited, so at least one document is asked for.
fn sample_options(limit: usize) -> FindOptions {
    let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
    FindOptions::builder().limit(limit).build()
}

/// Converts one stage to BSON, honouring extended JSON such as `{"$date": ...}`.
pub fn stage_to_document(stage: &Stage) -> Result<Document, StoreError> {
    match Bson::try_from(Value::Object(stage.clone())) {
        Ok(Bson::Document(document)) => Ok(document),
        Ok(other) => Err(StoreError::Conversion(format!(
            "stage converted to {:?} instead of a document",
            other.element_type()
        ))),
        Err(e) => Err(StoreError::Conversion(e.to_string())),
    }
}

pub fn document_to_json(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}

pub fn session_to_document(session: &SessionDocument) -> Result<Document, StoreError> {
    bson::to_document(session).map_err(|e| StoreError::Conversion(e.to_string()))
}

#[derive(serde::Deserialize)]
struct CsvRow {
    topic_code: String,
    session_type: String,
    domain: String,
    class: String,
    cohorts: String,
    instructor: String,
    session_date: NaiveDate,
    overall_average: Option<f64>,
    total_responses: i64,
    students_attended: i64,
    cohort_strength: i64,
    percent_rated: Option<f64>,
    yes_responses: i64,
    no_responses: i64,
    yes_percentage: Option<f64>,
    no_percentage: Option<f64>,
}

/// Parses a ratings export. Row numbers count the header as row 1.
pub fn read_sessions<R: Read>(reader: R, source_ref: &str) -> anyhow::Result<Vec<SessionDocument>> {
    let mut reader = csv::Reader::from_reader(reader);
    let now = Utc::now();
    let mut sessions = Vec::new();

    for (index, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row_number = index as i64 + 2;
        let row = result.with_context(|| format!("row {row_number} is malformed"))?;

        let ratings = SessionRatings {
            overall_average: row.overall_average,
            total_responses: row.total_responses,
            students_attended: row.students_attended,
            cohort_strength: row.cohort_strength,
            percent_rated: row.percent_rated,
            yes_responses: row.yes_responses,
            no_responses: row.no_responses,
            yes_percentage: row.yes_percentage,
            no_percentage: row.no_percentage,
        };
        ratings
            .validate()
            .map_err(|reason| anyhow::anyhow!("row {row_number}: {reason}"))?;

        sessions.push(SessionDocument {
            topic_code: row.topic_code.trim().to_string(),
            session_type: row.session_type.trim().to_string(),
            domain: row.domain.trim().to_string(),
            class_label: row.class.trim().to_string(),
            cohorts: split_cohorts(&row.cohorts),
            instructor: row.instructor.trim().to_string(),
            session_date: row.session_date.and_time(NaiveTime::MIN).and_utc(),
            ratings,
            metadata: SessionMetadata {
                source_ref: source_ref.to_string(),
                row_number,
                last_synced: now,
            },
            created_at: now,
            updated_at: now,
        });
    }

    Ok(sessions)
}

fn split_cohorts(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn import_csv(store: &MongoSessionStore, csv_path: &Path) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let source_ref = csv_path.display().to_string();
    let sessions = read_sessions(file, &source_ref)?;

    let mut inserted = 0usize;
    for session in &sessions {
        if store.upsert_session(session).await? {
            inserted += 1;
        }
    }

    info!(rows = sessions.len(), inserted, source = %source_ref, "csv import finished");
    Ok(inserted)
}
