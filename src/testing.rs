//! Scripted stand-ins for the oracle and the session store.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::db::SessionStore;
use crate::error::{OracleError, StoreError};
use crate::models::{ResultSet, StructuredQuery};
use crate::oracle::Oracle;

#[derive(Debug, Clone)]
pub struct OracleCall {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

/// Replays queued replies in order; an exhausted queue reads as unavailable.
#[derive(Default)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<OracleCall>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, text: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Ok(text.to_string()));
        self
    }

    pub fn fail(self, message: &str) -> Self {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<OracleCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn complete(
        &self,
        system: &str,
        prompt: &str,
        temperature: f32,
        max_output_tokens: u32,
    ) -> Result<String, OracleError> {
        self.calls.lock().unwrap().push(OracleCall {
            system: system.to_string(),
            prompt: prompt.to_string(),
            temperature,
            max_output_tokens,
        });
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(OracleError::Unavailable(message)),
            None => Err(OracleError::Unavailable("no scripted reply".to_string())),
        }
    }
}

/// Fails the first `failures` aggregations, then returns `results`.
pub struct ScriptedStore {
    failures: usize,
    results: ResultSet,
    pipelines: Mutex<Vec<StructuredQuery>>,
}

impl ScriptedStore {
    pub fn succeeding(results: ResultSet) -> Self {
        Self::failing_then(0, results)
    }

    pub fn failing_then(failures: usize, results: ResultSet) -> Self {
        Self {
            failures,
            results,
            pipelines: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_then(usize::MAX, Vec::new())
    }

    pub fn pipelines(&self) -> Vec<StructuredQuery> {
        self.pipelines.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionStore for ScriptedStore {
    async fn aggregate(&self, pipeline: &StructuredQuery) -> Result<ResultSet, StoreError> {
        let mut pipelines = self.pipelines.lock().unwrap();
        pipelines.push(pipeline.clone());
        if pipelines.len() <= self.failures {
            return Err(StoreError::Query(format!(
                "unrecognized pipeline stage (call {})",
                pipelines.len()
            )));
        }
        Ok(self.results.clone())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.results.len() as u64)
    }

    async fn sample(&self, limit: usize) -> Result<ResultSet, StoreError> {
        Ok(self.results.iter().take(limit).cloned().collect())
    }

    async fn test_connection(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
