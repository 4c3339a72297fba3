use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use crate::db::SessionStore;
use crate::error::PipelineError;
use crate::executor::RetryExecutor;
use crate::models::{QueryResponse, ResultSet};
use crate::narrator::ResultNarrator;
use crate::translator::QueryTranslator;

/// Result sets larger than this are truncated in the response.
const FULL_RESPONSE_LIMIT: usize = 200;
const TRUNCATED_SAMPLE: usize = 50;

/// Question in, narrated answer out. Shared across requests; holds only
/// initialized, read-only services.
pub struct QueryPipeline {
    translator: Arc<QueryTranslator>,
    narrator: Arc<ResultNarrator>,
    executor: RetryExecutor,
    max_retries: usize,
}

impl QueryPipeline {
    pub fn new(
        translator: Arc<QueryTranslator>,
        narrator: Arc<ResultNarrator>,
        store: Arc<dyn SessionStore>,
        max_retries: usize,
    ) -> Self {
        let executor = RetryExecutor::new(store, translator.clone());
        Self {
            translator,
            narrator,
            executor,
            max_retries,
        }
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[instrument(skip(self), fields(max_retries = self.max_retries))]
    pub async fn process_query(&self, question: &str) -> Result<QueryResponse, PipelineError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::EmptyQuestion);
        }

        let query = self.translator.generate(question).await?;
        let results = if query.is_empty() {
            info!("question has no expressible query");
            Vec::new()
        } else {
            self.executor
                .run(query, question, self.max_retries)
                .await?
        };

        let analysis = self.narrator.analyze(question, &results).await?;
        info!(records = results.len(), "question answered");

        Ok(QueryResponse {
            result_count: results.len(),
            analysis,
            sample_results: sample_results(results),
            timestamp: Utc::now(),
        })
    }
}

/// Returns everything up to the full-response limit, otherwise a short head.
pub fn sample_results(mut results: ResultSet) -> ResultSet {
    if results.len() > FULL_RESPONSE_LIMIT {
        results.truncate(TRUNCATED_SAMPLE);
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_RETRIES;
    use crate::testing::{ScriptedOracle, ScriptedStore};
    use serde_json::json;

    const RISHI_PIPELINE: &str = r#"[{"$match":{"instructor":"Rishi Bollu"}},{"$group":{"_id":null,"avgRating":{"$avg":"$ratings.overallAverage"}}}]"#;

    fn pipeline(
        translator_oracle: ScriptedOracle,
        narrator_oracle: ScriptedOracle,
        store: ScriptedStore,
    ) -> (QueryPipeline, Arc<ScriptedStore>, Arc<ScriptedOracle>) {
        let translator = Arc::new(QueryTranslator::new(Arc::new(translator_oracle)));
        translator.initialize();
        let narrator_oracle = Arc::new(narrator_oracle);
        let narrator = Arc::new(ResultNarrator::new(narrator_oracle.clone()));
        narrator.initialize();
        let store = Arc::new(store);
        let pipeline = QueryPipeline::new(translator, narrator, store.clone(), DEFAULT_MAX_RETRIES);
        (pipeline, store, narrator_oracle)
    }

    #[tokio::test]
    async fn answers_average_rating_question() {
        let (pipeline, store, narrator_oracle) = pipeline(
            ScriptedOracle::new().reply(RISHI_PIPELINE),
            ScriptedOracle::new().reply("Rishi Bollu has an average rating of 4.3 across his sessions."),
            ScriptedStore::succeeding(vec![json!({"_id": null, "avgRating": 4.3})]),
        );

        let response = pipeline
            .process_query("Average rating for Rishi Bollu")
            .await
            .unwrap();

        assert_eq!(response.result_count, 1);
        assert!(!response.analysis.is_empty());
        assert!(response.analysis.contains("4.3"));
        assert_eq!(response.sample_results, vec![json!({"_id": null, "avgRating": 4.3})]);

        let executed = store.pipelines();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0][0]["$match"], json!({"instructor": "Rishi Bollu"}));
        assert!(narrator_oracle.calls()[0].prompt.contains("4.3"));
    }

    #[tokio::test]
    async fn translation_failure_is_not_repaired() {
        let (pipeline, store, narrator_oracle) = pipeline(
            ScriptedOracle::new().reply("I don't know").reply("[]"),
            ScriptedOracle::new(),
            ScriptedStore::succeeding(Vec::new()),
        );

        let err = pipeline.process_query("Average rating").await.unwrap_err();
        assert!(matches!(err, PipelineError::Translation(_)));
        assert!(store.pipelines().is_empty());
        assert!(narrator_oracle.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_translation_skips_the_store() {
        let (pipeline, store, narrator_oracle) = pipeline(
            ScriptedOracle::new().reply("[]"),
            ScriptedOracle::new().reply("The data does not cover the weather."),
            ScriptedStore::succeeding(vec![json!({"_id": "x"})]),
        );

        let response = pipeline.process_query("What is the weather?").await.unwrap();
        assert_eq!(response.result_count, 0);
        assert!(store.pipelines().is_empty());
        assert!(narrator_oracle.calls()[0]
            .prompt
            .contains(crate::narrator::NO_DATA));
    }

    #[tokio::test]
    async fn analysis_failure_fails_the_request() {
        let (pipeline, _, _) = pipeline(
            ScriptedOracle::new().reply(RISHI_PIPELINE),
            ScriptedOracle::new().fail("oracle down"),
            ScriptedStore::succeeding(vec![json!({"_id": null, "avgRating": 4.3})]),
        );

        let err = pipeline.process_query("Average rating").await.unwrap_err();
        assert!(matches!(err, PipelineError::Analysis(_)));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_request() {
        let (pipeline, store, _) = pipeline(
            ScriptedOracle::new().reply(RISHI_PIPELINE).reply(RISHI_PIPELINE),
            ScriptedOracle::new().reply("unused"),
            ScriptedStore::always_failing(),
        );
        let pipeline = pipeline.with_max_retries(2);

        let err = pipeline.process_query("Average rating").await.unwrap_err();
        assert!(matches!(err, PipelineError::QueryExecution { attempts: 2, .. }));
        assert_eq!(store.pipelines().len(), 2);
    }

    #[tokio::test]
    async fn blank_question_is_rejected() {
        let (pipeline, _, narrator_oracle) = pipeline(
            ScriptedOracle::new(),
            ScriptedOracle::new(),
            ScriptedStore::succeeding(Vec::new()),
        );
        let err = pipeline.process_query("   ").await.unwrap_err();
        assert!(matches!(err, PipelineError::EmptyQuestion));
        assert!(narrator_oracle.calls().is_empty());
    }

    #[test]
    fn sample_keeps_up_to_two_hundred() {
        let results: ResultSet = (0..200).map(|i| json!({"n": i})).collect();
        assert_eq!(sample_results(results).len(), 200);
    }

    #[test]
    fn sample_truncates_large_sets_to_fifty() {
        let results: ResultSet = (0..201).map(|i| json!({"n": i})).collect();
        let sample = sample_results(results);
        assert_eq!(sample.len(), 50);
        assert_eq!(sample[49], json!({"n": 49}));
    }
}
