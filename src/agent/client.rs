//! Model backend client
//!
//! One implementation speaking the OpenAI-compatible `/v1/chat/completions`
//! wire format, which covers LM Studio, Ollama, and llama.cpp server alike;
//! picking one is a configuration difference, never a code branch. The
//! trait seam exists so the agent loop can be driven by a scripted fake in
//! tests.

use crate::agent::error::{AskError, AskResult};
use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Structured reply the agent requires from the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub sql: String,
    pub explanation: String,
}

/// Trait for model backends
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// One best-effort round trip: prompt in, structured reply out.
    /// Retry policy belongs to the caller.
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> AskResult<ModelReply>;

    /// Get backend display name
    fn name(&self) -> String;
}

/// HTTP client for OpenAI-compatible chat-completions endpoints
pub struct HttpLlmClient {
    client: Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> AskResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| AskError::Transport(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.get_base_url().trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    async fn call_api(&self, system_prompt: &str, user_prompt: &str) -> AskResult<String> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let request_body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        debug!(
            "calling {url} with model {}, max_tokens {}",
            self.model, self.max_tokens
        );

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| AskError::Transport(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AskError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| AskError::ResponseFormat(format!("unparseable completion payload: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| AskError::ResponseFormat("no choices in completion payload".to_string()))
    }
}

#[async_trait]
impl LlmBackend for HttpLlmClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> AskResult<ModelReply> {
        let content = self.call_api(system_prompt, user_prompt).await?;
        parse_reply(&content)
    }

    fn name(&self) -> String {
        format!("{} @ {}", self.model, self.base_url)
    }
}

// OpenAI-compatible wire types
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ReplyJson {
    #[serde(alias = "sql_query", alias = "query")]
    sql: String,
    #[serde(default)]
    explanation: String,
}

/// Decompose raw model output into the two-field reply contract.
///
/// The model is instructed to return `{"sql": ..., "explanation": ...}`, but
/// local models wander: the object may arrive inside a ```json fence, with
/// chatter around it, or as a bare ```sql fence plus prose. Anything beyond
/// that is a format failure.
pub fn parse_reply(content: &str) -> AskResult<ModelReply> {
    let content = content.trim();
    if content.is_empty() {
        return Err(AskError::ResponseFormat("empty model output".to_string()));
    }

    if let Some(json) = fenced_block(content, "json") {
        if let Some(reply) = reply_from_json(&json) {
            return Ok(reply);
        }
    }

    // A bare JSON object, possibly surrounded by chatter
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if start < end {
            if let Some(reply) = reply_from_json(&content[start..=end]) {
                return Ok(reply);
            }
        }
    }

    if let Some(sql) = fenced_block(content, "sql") {
        let explanation = prose_around_fences(content);
        return finish(sql, explanation);
    }

    Err(AskError::ResponseFormat(format!(
        "expected a JSON object with sql and explanation, got: {}",
        truncate(content, 120)
    )))
}

fn reply_from_json(json: &str) -> Option<ModelReply> {
    let parsed: ReplyJson = serde_json::from_str(json.trim()).ok()?;
    finish(parsed.sql, parsed.explanation).ok()
}

fn finish(sql: String, explanation: String) -> AskResult<ModelReply> {
    let sql = clean_sql(&sql);
    if sql.is_empty() {
        return Err(AskError::ResponseFormat(
            "model returned an empty SQL field".to_string(),
        ));
    }
    Ok(ModelReply { sql, explanation })
}

/// Extract the body of the first ```lang fence (or anonymous fence for "sql"
/// bodies that start with a SELECT).
fn fenced_block(content: &str, lang: &str) -> Option<String> {
    let open = format!("```{lang}");
    let body = if let Some(pos) = content.find(&open) {
        &content[pos + open.len()..]
    } else if lang == "sql" {
        let pos = content.find("```")?;
        let rest = &content[pos + 3..];
        let head = rest.trim_start().to_uppercase();
        if head.starts_with("SELECT") || head.starts_with("WITH") {
            rest
        } else {
            return None;
        }
    } else {
        return None;
    };
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

/// Concatenate the text outside any code fences, as the explanation.
fn prose_around_fences(content: &str) -> String {
    content
        .split("```")
        .step_by(2)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip markdown wrapping and trailing semicolon noise from a SQL string
pub fn clean_sql(sql: &str) -> String {
    let mut cleaned = sql.trim();
    if let Some(rest) = cleaned.strip_prefix("```sql") {
        cleaned = rest;
    } else if let Some(rest) = cleaned.strip_prefix("```") {
        cleaned = rest;
    }
    if let Some(rest) = cleaned.strip_suffix("```") {
        cleaned = rest;
    }
    let mut cleaned = cleaned.trim().to_string();
    while cleaned.ends_with(";;") {
        cleaned.pop();
    }
    cleaned
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        text.to_string()
    } else {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}...", &text[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_parse_bare_json_object() {
        let reply = parse_reply(
            r#"{"sql": "SELECT * FROM customers", "explanation": "Lists every customer."}"#,
        )
        .unwrap();
        assert_eq!(reply.sql, "SELECT * FROM customers");
        assert_eq!(reply.explanation, "Lists every customer.");
    }

    #[test]
    fn test_parse_json_inside_fence() {
        let content = "Here you go:\n```json\n{\"sql\": \"SELECT 1\", \"explanation\": \"Constant.\"}\n```\nAnything else?";
        let reply = parse_reply(content).unwrap();
        assert_eq!(reply.sql, "SELECT 1");
    }

    #[test]
    fn test_parse_json_with_chatter_around_it() {
        let content = "Sure! {\"sql\": \"SELECT name FROM products\", \"explanation\": \"Names only.\"} Hope that helps.";
        let reply = parse_reply(content).unwrap();
        assert_eq!(reply.sql, "SELECT name FROM products");
    }

    #[test]
    fn test_parse_sql_query_field_alias() {
        let reply =
            parse_reply(r#"{"sql_query": "SELECT 2", "explanation": "Two."}"#).unwrap();
        assert_eq!(reply.sql, "SELECT 2");
    }

    #[test]
    fn test_parse_sql_fence_with_prose() {
        let content =
            "This query counts orders per customer.\n```sql\nSELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id\n```";
        let reply = parse_reply(content).unwrap();
        assert!(reply.sql.starts_with("SELECT customer_id"));
        assert_eq!(reply.explanation, "This query counts orders per customer.");
    }

    #[test]
    fn test_parse_anonymous_fence_holding_select() {
        let content = "```\nSELECT COUNT(*) FROM orders\n```";
        let reply = parse_reply(content).unwrap();
        assert_eq!(reply.sql, "SELECT COUNT(*) FROM orders");
    }

    #[rstest]
    #[case("")]
    #[case("I cannot answer that question.")]
    #[case("{\"explanation\": \"no sql key here\"}")]
    #[case("{\"sql\": \"\", \"explanation\": \"empty\"}")]
    fn test_parse_rejects_unusable_output(#[case] content: &str) {
        assert!(matches!(
            parse_reply(content),
            Err(AskError::ResponseFormat(_))
        ));
    }

    #[rstest]
    #[case("```sql\nSELECT * FROM users;\n```", "SELECT * FROM users;")]
    #[case("```\nSELECT * FROM users;\n```", "SELECT * FROM users;")]
    #[case("SELECT * FROM users;", "SELECT * FROM users;")]
    #[case("  SELECT * FROM users;  ", "SELECT * FROM users;")]
    #[case("SELECT * FROM users;;", "SELECT * FROM users;")]
    fn test_clean_sql(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(clean_sql(input), expected);
    }
}
