//! Natural-language-to-SQL agent
//!
//! Orchestrates one question end to end: introspect the schema, prompt the
//! model, validate the returned SQL, execute it, and assemble the result
//! envelope. Generation failures feed back into a bounded re-prompt loop;
//! a wall-clock deadline bounds the whole run. The loop is written as an
//! explicit state machine so the retry budget stays mechanically checkable.

pub mod client;
pub mod error;
pub mod prompt;
pub mod validate;

use crate::config::AgentConfig;
use crate::db::Database;
use crate::schema::SchemaDescription;
use client::{LlmBackend, ModelReply};
use error::AskError;
use prompt::PromptBuilder;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use validate::Validator;

/// Fatal outcome classification surfaced in the result envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The model endpoint could not be reached within the transport budget
    Unreachable,
    /// The wall-clock deadline for the whole run elapsed
    Timeout,
    /// Every generation attempt failed; the last error is recorded
    RetriesExhausted,
}

/// One failed generation attempt, kept for the caller's post-mortem
#[derive(Debug, Clone, Serialize)]
pub struct AttemptRecord {
    pub attempt: usize,
    pub sql: String,
    pub error: String,
}

/// The unit returned to the caller and to the export path
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub question: String,
    pub sql: String,
    pub explanation: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_count: usize,
    pub truncated: bool,
    pub success: bool,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub attempts: Vec<AttemptRecord>,
}

impl ExecutionResult {
    fn empty(question: &str) -> Self {
        Self {
            question: question.to_string(),
            sql: String::new(),
            explanation: String::new(),
            columns: Vec::new(),
            rows: Vec::new(),
            row_count: 0,
            truncated: false,
            success: false,
            error: None,
            failure: None,
            attempts: Vec::new(),
        }
    }

    fn failed(
        question: &str,
        sql: String,
        explanation: String,
        error: &AskError,
        failure: Option<FailureKind>,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            sql,
            explanation,
            error: Some(error.user_message()),
            failure,
            attempts,
            ..Self::empty(question)
        }
    }
}

/// Feedback carried from a failed attempt into the next prompt
struct Feedback {
    sql: String,
    reason: String,
}

/// States of the generation/execution loop
enum AgentState {
    BuildingPrompt,
    AwaitingModel {
        feedback: Option<Feedback>,
        attempt: usize,
    },
    Validating {
        reply: ModelReply,
        attempt: usize,
    },
    Executing {
        sql: String,
        explanation: String,
        attempt: usize,
    },
    Retrying {
        failed_sql: String,
        error: AskError,
        attempt: usize,
    },
    Done(ExecutionResult),
}

/// Agent handling natural-language-to-SQL conversion and execution
pub struct SqlAgent {
    config: AgentConfig,
    db: Database,
    backend: Box<dyn LlmBackend>,
}

impl SqlAgent {
    pub fn new(config: AgentConfig, db: Database, backend: Box<dyn LlmBackend>) -> Self {
        Self {
            config,
            db,
            backend,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Process one natural-language question.
    ///
    /// Never returns a raw error: every failure path yields an envelope with
    /// `success = false` and a human-readable reason.
    pub async fn run(&self, question: &str) -> ExecutionResult {
        let deadline = Instant::now() + Duration::from_secs(self.config.total_timeout_seconds);
        info!("processing question via {}: {question}", self.backend.name());

        // Schema is rebuilt per request; the database owns the truth
        let schema = match SchemaDescription::introspect(self.db.pool()).await {
            Ok(schema) => {
                if schema.is_empty() {
                    warn!("database has no user tables; generation will have nothing to ground on");
                }
                schema
            }
            Err(e) => {
                return ExecutionResult::failed(
                    question,
                    String::new(),
                    String::new(),
                    &e,
                    None,
                    Vec::new(),
                );
            }
        };

        let schema_block = match self.schema_block(&schema).await {
            Ok(block) => block,
            Err(e) => {
                return ExecutionResult::failed(
                    question,
                    String::new(),
                    String::new(),
                    &e,
                    None,
                    Vec::new(),
                );
            }
        };

        let builder = PromptBuilder::new(self.config.read_only);
        let system_prompt = builder.system_prompt(&schema_block);

        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut state = AgentState::BuildingPrompt;

        loop {
            if Instant::now() >= deadline && !matches!(state, AgentState::Done(_)) {
                let e = AskError::Transport(format!(
                    "ran out of the {}s time budget",
                    self.config.total_timeout_seconds
                ));
                return ExecutionResult::failed(
                    question,
                    String::new(),
                    String::new(),
                    &e,
                    Some(FailureKind::Timeout),
                    attempts,
                );
            }

            state = match state {
                AgentState::BuildingPrompt => AgentState::AwaitingModel {
                    feedback: None,
                    attempt: 0,
                },

                AgentState::AwaitingModel { feedback, attempt } => {
                    let user_prompt = match &feedback {
                        None => builder.user_prompt(question),
                        Some(f) => builder.retry_prompt(question, &f.sql, &f.reason),
                    };
                    match self.call_model(&system_prompt, &user_prompt, deadline).await {
                        Ok(reply) => AgentState::Validating { reply, attempt },
                        Err(e @ AskError::ResponseFormat(_)) => {
                            record_attempt(&mut attempts, attempt, String::new(), &e);
                            self.retry_or_done(question, String::new(), String::new(), e, attempt, attempts.clone())
                        }
                        Err(e) => {
                            let kind = if Instant::now() >= deadline {
                                FailureKind::Timeout
                            } else {
                                FailureKind::Unreachable
                            };
                            AgentState::Done(ExecutionResult::failed(
                                question,
                                String::new(),
                                String::new(),
                                &e,
                                Some(kind),
                                attempts.clone(),
                            ))
                        }
                    }
                }

                AgentState::Validating { reply, attempt } => {
                    let validator = Validator::new(&schema, self.config.read_only);
                    match validator.validate(&reply.sql) {
                        Ok(sql) => AgentState::Executing {
                            sql,
                            explanation: reply.explanation,
                            attempt,
                        },
                        Err(e) => {
                            warn!("validation failed on attempt {attempt}: {e}");
                            record_attempt(&mut attempts, attempt, reply.sql.clone(), &e);
                            self.retry_or_done(
                                question,
                                reply.sql,
                                reply.explanation,
                                e,
                                attempt,
                                attempts.clone(),
                            )
                        }
                    }
                }

                AgentState::Executing {
                    sql,
                    explanation,
                    attempt,
                } => {
                    let statement_timeout = Duration::from_secs(self.config.statement_timeout_seconds)
                        .min(deadline.saturating_duration_since(Instant::now()));
                    match self
                        .db
                        .execute(&sql, self.config.row_limit, statement_timeout)
                        .await
                    {
                        Ok(output) => {
                            info!("query succeeded after {} retries", attempt);
                            AgentState::Done(ExecutionResult {
                                question: question.to_string(),
                                row_count: output.rows.len(),
                                columns: output.columns,
                                rows: output.rows,
                                truncated: output.truncated,
                                sql,
                                explanation,
                                success: true,
                                error: None,
                                failure: None,
                                attempts: attempts.clone(),
                            })
                        }
                        Err(e) => {
                            warn!("execution failed on attempt {attempt}: {e}");
                            record_attempt(&mut attempts, attempt, sql.clone(), &e);
                            self.retry_or_done(question, sql, explanation, e, attempt, attempts.clone())
                        }
                    }
                }

                AgentState::Retrying {
                    failed_sql,
                    error,
                    attempt,
                } => {
                    debug!("re-prompting after failure: {error}");
                    let reason = error.feedback().unwrap_or_else(|| error.to_string());
                    AgentState::AwaitingModel {
                        feedback: Some(Feedback {
                            sql: failed_sql,
                            reason,
                        }),
                        attempt: attempt + 1,
                    }
                }

                AgentState::Done(result) => return result,
            };
        }
    }

    /// Decide between another generation attempt and giving up.
    fn retry_or_done(
        &self,
        question: &str,
        failed_sql: String,
        explanation: String,
        error: AskError,
        attempt: usize,
        attempts: Vec<AttemptRecord>,
    ) -> AgentState {
        if attempt < self.config.max_retries {
            AgentState::Retrying {
                failed_sql,
                error,
                attempt,
            }
        } else {
            AgentState::Done(ExecutionResult::failed(
                question,
                failed_sql,
                explanation,
                &error,
                Some(FailureKind::RetriesExhausted),
                attempts,
            ))
        }
    }

    /// One generation attempt with its internal transport-retry budget.
    async fn call_model(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        deadline: Instant,
    ) -> Result<ModelReply, AskError> {
        let mut last: Option<AskError> = None;
        for round in 0..=self.config.transport_retries {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(last.unwrap_or_else(|| {
                    AskError::Transport("time budget exhausted before the model call".to_string())
                }));
            }
            match tokio::time::timeout(remaining, self.backend.complete(system_prompt, user_prompt))
                .await
            {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!("transport failure (round {round}): {e}");
                    last = Some(e);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(AskError::Transport(
                        "model call exceeded the time budget".to_string(),
                    ));
                }
            }
        }
        Err(last.unwrap_or_else(|| AskError::Transport("model endpoint unreachable".to_string())))
    }

    async fn schema_block(&self, schema: &SchemaDescription) -> Result<String, AskError> {
        if !self.config.include_sample_data {
            return Ok(schema.render());
        }
        let mut samples = HashMap::new();
        for table in &schema.tables {
            let rows = self
                .db
                .sample_rows(&table.name, self.config.sample_rows)
                .await?;
            samples.insert(table.name.clone(), rows);
        }
        Ok(schema.render_with_samples(&samples))
    }
}

fn record_attempt(attempts: &mut Vec<AttemptRecord>, attempt: usize, sql: String, error: &AskError) {
    attempts.push(AttemptRecord {
        attempt: attempt + 1,
        sql,
        error: error.to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::error::AskResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::NamedTempFile;

    /// Backend that plays back a scripted sequence of outcomes and records
    /// the prompts it receives. Tests keep clones of the shared handles.
    struct ScriptedBackend {
        replies: Mutex<Vec<AskResult<ModelReply>>>,
        calls: Arc<AtomicUsize>,
        prompts: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<AskResult<ModelReply>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: Arc::new(AtomicUsize::new(0)),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn calls(&self) -> Arc<AtomicUsize> {
            Arc::clone(&self.calls)
        }

        fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
            Arc::clone(&self.prompts)
        }
    }

    #[async_trait]
    impl LlmBackend for ScriptedBackend {
        async fn complete(&self, _system: &str, user: &str) -> AskResult<ModelReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts.lock().unwrap().push(user.to_string());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(AskError::Transport("script exhausted".to_string()));
            }
            replies.remove(0)
        }

        fn name(&self) -> String {
            "scripted".to_string()
        }
    }

    fn reply(sql: &str, explanation: &str) -> ModelReply {
        ModelReply {
            sql: sql.to_string(),
            explanation: explanation.to_string(),
        }
    }

    async fn sales_db() -> (NamedTempFile, Database) {
        let file = NamedTempFile::new().unwrap();
        let db = Database::connect(file.path().to_str().unwrap())
            .await
            .unwrap();
        sqlx::query("CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER, amount REAL)")
            .execute(db.pool())
            .await
            .unwrap();
        for (id, name) in [(1, "Ada"), (2, "Grace"), (3, "Edsger")] {
            sqlx::query("INSERT INTO customers (id, name) VALUES (?, ?)")
                .bind(id)
                .bind(name)
                .execute(db.pool())
                .await
                .unwrap();
        }
        for (id, customer, amount) in [(1, 1, 250.0), (2, 1, 100.0), (3, 2, 400.0)] {
            sqlx::query("INSERT INTO orders (id, customer_id, amount) VALUES (?, ?, ?)")
                .bind(id)
                .bind(customer)
                .bind(amount)
                .execute(db.pool())
                .await
                .unwrap();
        }
        (file, db)
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            max_retries: 2,
            transport_retries: 1,
            total_timeout_seconds: 30,
            row_limit: 100,
            statement_timeout_seconds: 5,
            read_only: true,
            include_sample_data: false,
            sample_rows: 3,
        }
    }

    #[tokio::test]
    async fn test_successful_round_trip() {
        let (_file, db) = sales_db().await;
        let backend = ScriptedBackend::new(vec![Ok(reply(
            "SELECT c.name, SUM(o.amount) AS total FROM customers AS c \
             JOIN orders AS o ON c.id = o.customer_id \
             GROUP BY c.id ORDER BY total DESC LIMIT 5",
            "Top customers by total order amount.",
        ))]);
        let agent = SqlAgent::new(test_config(), db, Box::new(backend));

        let result = agent.run("Show me the top 5 customers by total order amount").await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.columns, vec!["name", "total"]);
        assert_eq!(result.rows[0], vec!["Grace", "400"]);
        assert_eq!(result.rows[1], vec!["Ada", "350"]);
        assert_eq!(result.row_count, 2);
        assert!(result.error.is_none());
        assert!(result.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_retry_feedback_reaches_the_model() {
        let (_file, db) = sales_db().await;
        let broken = || Ok(reply("SELECT * FROM no_such_table", "Broken."));
        let backend = ScriptedBackend::new(vec![broken(), broken(), broken()]);
        let prompts = backend.prompts();
        let agent = SqlAgent::new(test_config(), db, Box::new(backend));

        let result = agent.run("list everything").await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::RetriesExhausted));
        assert_eq!(result.attempts.len(), 3); // initial + 2 retries
        assert!(
            result
                .attempts
                .iter()
                .all(|a| a.error.contains("unknown table: no_such_table"))
        );

        let recorded = prompts.lock().unwrap();
        assert_eq!(recorded.len(), 3);
        assert!(!recorded[0].contains("failed"));
        assert!(recorded[1].contains("unknown table: no_such_table"));
        assert!(recorded[1].contains("list everything"));
    }

    #[tokio::test]
    async fn test_malformed_then_valid_reply_recovers() {
        let (_file, db) = sales_db().await;
        let backend = ScriptedBackend::new(vec![
            Err(AskError::ResponseFormat("prose only".to_string())),
            Ok(reply("SELECT name FROM customers ORDER BY name", "All names.")),
        ]);
        let agent = SqlAgent::new(test_config(), db, Box::new(backend));

        let result = agent.run("who are the customers?").await;

        assert!(result.success);
        assert_eq!(result.rows.len(), 3);
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_persistently_malformed_reply_fails_with_reason() {
        let (_file, db) = sales_db().await;
        let mut config = test_config();
        config.max_retries = 1;
        let backend = ScriptedBackend::new(vec![
            Err(AskError::ResponseFormat("prose only".to_string())),
            Err(AskError::ResponseFormat("prose only".to_string())),
        ]);
        let agent = SqlAgent::new(config, db, Box::new(backend));

        let result = agent.run("who?").await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::RetriesExhausted));
        assert!(result.error.as_deref().unwrap().contains("usable SQL"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_fatal_after_transport_budget() {
        let (_file, db) = sales_db().await;
        let mut config = test_config();
        config.transport_retries = 2;
        let backend = ScriptedBackend::new(vec![
            Err(AskError::Transport("connection refused".to_string())),
            Err(AskError::Transport("connection refused".to_string())),
            Err(AskError::Transport("connection refused".to_string())),
        ]);
        let agent = SqlAgent::new(config, db, Box::new(backend));

        let result = agent.run("anything").await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Unreachable));
        assert!(result.error.as_deref().unwrap().contains("model endpoint"));
    }

    #[tokio::test]
    async fn test_model_called_at_most_max_retries_plus_one_times() {
        let (_file, db) = sales_db().await;
        let mut config = test_config();
        config.max_retries = 2;
        let backend = ScriptedBackend::new(vec![
            Ok(reply("SELECT * FROM ghost", "nope")),
            Ok(reply("SELECT * FROM ghost", "nope")),
            Ok(reply("SELECT * FROM ghost", "nope")),
            Ok(reply("SELECT * FROM ghost", "nope")),
            Ok(reply("SELECT * FROM ghost", "nope")),
        ]);
        let calls = backend.calls();
        let agent = SqlAgent::new(config, db, Box::new(backend));

        let result = agent.run("anything").await;

        assert!(!result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 3); // max_retries = 2 → at most 3 invocations
    }

    #[tokio::test]
    async fn test_execution_error_feeds_back_and_recovers() {
        let (_file, db) = sales_db().await;
        // valid per the lightweight validator, rejected by the engine
        let backend = ScriptedBackend::new(vec![
            Ok(reply(
                "SELECT name FROM customers GROUP BY no_such(name)",
                "broken",
            )),
            Ok(reply("SELECT COUNT(*) FROM orders", "Counts orders.")),
        ]);
        let agent = SqlAgent::new(test_config(), db, Box::new(backend));

        let result = agent.run("how many orders?").await;

        assert!(result.success, "error: {:?}", result.error);
        assert_eq!(result.rows[0][0], "3");
        assert_eq!(result.attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_read_only_agent_never_mutates() {
        let (_file, db) = sales_db().await;
        let backend = ScriptedBackend::new(vec![Ok(reply(
            "DELETE FROM orders",
            "Removes everything.",
        ))]);
        let mut config = test_config();
        config.max_retries = 0;
        let agent = SqlAgent::new(config, db, Box::new(backend));

        let result = agent.run("clear the orders").await;

        assert!(!result.success);
        // the data is untouched
        let count = agent
            .database()
            .execute("SELECT COUNT(*) FROM orders", 1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(count.rows[0][0], "3");
    }

    #[tokio::test]
    async fn test_zero_row_result_is_success() {
        let (_file, db) = sales_db().await;
        let backend = ScriptedBackend::new(vec![Ok(reply(
            "SELECT name FROM customers WHERE id > 1000",
            "Nobody.",
        ))]);
        let agent = SqlAgent::new(test_config(), db, Box::new(backend));

        let result = agent.run("any customer with a huge id?").await;

        assert!(result.success);
        assert_eq!(result.row_count, 0);
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_produces_timeout_failure() {
        let (_file, db) = sales_db().await;
        let mut config = test_config();
        config.total_timeout_seconds = 0;
        let backend = ScriptedBackend::new(vec![Ok(reply("SELECT 1", "One."))]);
        let agent = SqlAgent::new(config, db, Box::new(backend));

        let result = agent.run("anything").await;

        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureKind::Timeout));
    }
}
