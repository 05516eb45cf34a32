pub mod agent;
pub mod config;
pub mod db;
pub mod format;
pub mod logging;
pub mod schema;

pub use agent::client::{HttpLlmClient, LlmBackend, ModelReply};
pub use agent::error::{AskError, AskResult};
pub use agent::{AttemptRecord, ExecutionResult, FailureKind, SqlAgent};
pub use config::Config;
pub use db::Database;
pub use schema::SchemaDescription;
