use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("LLM connectivity error: {0}")]
    LlmConnectivity(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl PipelineError {
    /// True when the text-generation service could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, PipelineError::LlmConnectivity(_))
    }

    /// True for failures the orchestrator routes to the fallback ladder
    /// rather than to its error boundary.
    pub fn is_execution(&self) -> bool {
        matches!(self, PipelineError::Execution(_) | PipelineError::Sqlite(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
