use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(String),
    #[error("oracle returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed oracle response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("document conversion failed: {0}")]
    Conversion(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

/// Every way a single question can fail. Any of these aborts the request.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{component} used before initialize()")]
    NotInitialized { component: &'static str },
    #[error("question is empty")]
    EmptyQuestion,
    #[error("query translation failed: {0}")]
    Translation(String),
    #[error("query failed after {attempts} attempt(s): {message}")]
    QueryExecution { attempts: usize, message: String },
    #[error("query repair failed on attempt {attempt}: {message}")]
    QueryRepair { attempt: usize, message: String },
    #[error("analysis failed: {0}")]
    Analysis(String),
}

impl PipelineError {
    /// Short sentence safe to show the person who asked the question.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::NotInitialized { .. } => "The service is still starting up. Try again shortly.",
            PipelineError::EmptyQuestion => "Please enter a question.",
            PipelineError::Translation(_) => {
                "Could not turn that question into a database query. Try rephrasing it."
            }
            PipelineError::QueryExecution { .. } | PipelineError::QueryRepair { .. } => {
                "The generated query could not be executed. Try rephrasing the question."
            }
            PipelineError::Analysis(_) => "Results were found but could not be analyzed. Try again.",
        }
    }
}
