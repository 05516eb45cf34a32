//! Error types for the SQL agent pipeline

use thiserror::Error;

/// Result type for agent operations
pub type AskResult<T> = Result<T, AskError>;

/// Errors that can occur while turning a question into executed SQL
#[derive(Error, Debug)]
pub enum AskError {
    #[error("Schema introspection error: {0}")]
    Introspection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Model API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Malformed model response: {0}")]
    ResponseFormat(String),

    #[error("SQL validation error: {0}")]
    Validation(String),

    #[error("SQL execution error: {0}")]
    Execution(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AskError {
    /// Check if the error is worth retrying with the same prompt
    pub fn is_retryable(&self) -> bool {
        match self {
            AskError::Transport(_) => true,
            AskError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Failure text appended to the re-prompt so the model can self-correct.
    /// Errors that a new generation cannot fix return `None`.
    pub fn feedback(&self) -> Option<String> {
        match self {
            AskError::ResponseFormat(msg) => Some(format!(
                "the response could not be parsed into SQL plus explanation: {msg}"
            )),
            AskError::Validation(msg) => Some(format!("the SQL failed validation: {msg}")),
            AskError::Execution(msg) => Some(format!("the SQL failed to execute: {msg}")),
            _ => None,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            AskError::Introspection(msg) => {
                format!("Could not read the database schema: {msg}")
            }
            AskError::Transport(msg) => {
                format!("Could not reach the model endpoint: {msg}. Check that your model server is running.")
            }
            AskError::Api { status, message } => {
                format!("Model endpoint returned HTTP {status}: {message}")
            }
            AskError::ResponseFormat(msg) => {
                format!("The model reply did not contain usable SQL: {msg}")
            }
            AskError::Validation(msg) => format!("Generated SQL was rejected: {msg}"),
            AskError::Execution(msg) => format!("SQL execution failed: {msg}"),
            AskError::Configuration(msg) => {
                format!("Configuration issue: {msg}. Check your config file or command-line flags.")
            }
            _ => self.to_string(),
        }
    }
}
