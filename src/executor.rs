use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::db::SessionStore;
use crate::error::PipelineError;
use crate::models::{ResultSet, StructuredQuery};
use crate::translator::QueryTranslator;

/// Runs pipelines against the store, feeding failures back to the
/// translator for repair until the attempt budget is spent.
pub struct RetryExecutor {
    store: Arc<dyn SessionStore>,
    translator: Arc<QueryTranslator>,
}

impl RetryExecutor {
    pub fn new(store: Arc<dyn SessionStore>, translator: Arc<QueryTranslator>) -> Self {
        Self { store, translator }
    }

    /// Executes `query` at most `max_retries` times in total (at least once).
    pub async fn run(
        &self,
        query: StructuredQuery,
        original_question: &str,
        max_retries: usize,
    ) -> Result<ResultSet, PipelineError> {
        let max_attempts = max_retries.max(1);
        let mut query = query;
        let mut attempt = 1;

        loop {
            debug!(attempt, max_attempts, stages = query.len(), "executing pipeline");
            let message = match self.store.aggregate(&query).await {
                Ok(results) => {
                    info!(attempt, records = results.len(), "pipeline succeeded");
                    return Ok(results);
                }
                Err(err) => err.to_string(),
            };

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %message, "pipeline attempts exhausted");
                return Err(PipelineError::QueryExecution {
                    attempts: attempt,
                    message,
                });
            }

            warn!(attempt, error = %message, "pipeline failed, requesting repair");
            query = self
                .translator
                .fix(original_question, &message, &query)
                .await
                .map_err(|err| PipelineError::QueryRepair {
                    attempt,
                    message: err.to_string(),
                })?;

            if query.is_empty() {
                info!(attempt, "repair found no expressible query");
                return Ok(Vec::new());
            }
            attempt += 1;
        }
    }
}
