//! Configuration for the askdb pipeline
//!
//! Loaded from `<config dir>/askdb/config.toml` when present, otherwise
//! defaults apply. Everything is an explicit value handed to the agent's
//! constructor, so the pipeline stays testable with fakes.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::warn;

/// Full configuration: database, model endpoint, agent policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
}

/// Database location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "sales_database.db".to_string(),
        }
    }
}

/// Model endpoint configuration
///
/// Any OpenAI-compatible chat-completions server works; which one is purely
/// a matter of `base_url` and `model`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the endpoint (can also use ASKDB_LLM_URL env var)
    pub base_url: String,

    /// Model identifier as known to the endpoint
    pub model: String,

    /// Sampling temperature (low keeps SQL generation deterministic)
    pub temperature: f32,

    /// Maximum tokens to generate per completion
    pub max_tokens: u32,

    /// Per-request timeout in seconds
    pub timeout_seconds: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:1234".to_string(),
            model: "llama-3.2-3b-instruct".to_string(),
            temperature: 0.1,
            max_tokens: 1024,
            timeout_seconds: 30,
        }
    }
}

impl LlmConfig {
    /// Get the endpoint base URL from config or environment
    pub fn get_base_url(&self) -> String {
        env::var("ASKDB_LLM_URL").unwrap_or_else(|_| self.base_url.clone())
    }
}

/// Agent policy: retry budgets, limits, safety
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Re-prompt attempts after a failed generation (model called at most
    /// max_retries + 1 times per question)
    pub max_retries: usize,

    /// Extra attempts for transport-level failures within one generation
    pub transport_retries: usize,

    /// Wall-clock budget for one question across all retries, in seconds
    pub total_timeout_seconds: u64,

    /// Maximum number of result rows fetched per statement
    pub row_limit: usize,

    /// Per-statement execution timeout in seconds
    pub statement_timeout_seconds: u64,

    /// Only allow read statements (SELECT / WITH)
    pub read_only: bool,

    /// Include sample rows in the schema prompt (data leaves the machine!)
    pub include_sample_data: bool,

    /// Number of sample rows per table if enabled
    pub sample_rows: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            transport_retries: 2,
            total_timeout_seconds: 120,
            row_limit: 500,
            statement_timeout_seconds: 10,
            read_only: true,
            include_sample_data: false,
            sample_rows: 3,
        }
    }
}

impl Config {
    /// Path of the config file under the platform config directory
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("askdb").join("config.toml"))
    }

    /// Load configuration from disk, falling back to defaults when the file
    /// is absent or unreadable.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!("ignoring malformed config {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("could not read config {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.database.path.trim().is_empty() {
            return Err("database path is required".to_string());
        }
        if self.llm.get_base_url().trim().is_empty() {
            return Err("model endpoint base URL is required".to_string());
        }
        if self.llm.model.trim().is_empty() {
            return Err("model name is required".to_string());
        }
        if !(0.0..=1.0).contains(&self.llm.temperature) {
            return Err("temperature must be between 0.0 and 1.0".to_string());
        }
        if self.llm.max_tokens == 0 {
            return Err("max_tokens must be greater than 0".to_string());
        }
        if self.llm.timeout_seconds == 0 {
            return Err("timeout_seconds must be greater than 0".to_string());
        }
        if self.agent.row_limit == 0 {
            return Err("row_limit must be greater than 0".to_string());
        }
        if self.agent.total_timeout_seconds == 0 {
            return Err("total_timeout_seconds must be greater than 0".to_string());
        }
        Ok(())
    }
}
