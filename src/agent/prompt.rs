//! Prompt construction for SQL generation and retry feedback

/// Builds the prompts sent to the model backend
pub struct PromptBuilder {
    read_only: bool,
}

impl PromptBuilder {
    pub fn new(read_only: bool) -> Self {
        Self { read_only }
    }

    /// System prompt: schema context, dialect rules, output contract.
    pub fn system_prompt(&self, schema_block: &str) -> String {
        let write_rule = if self.read_only {
            "- The statement must only read data: start with SELECT (optionally introduced by WITH). Never modify the database.\n"
        } else {
            ""
        };

        format!(
            r#"You are an expert SQLite SQL generator. Convert the user's question into a single SQLite query.

{schema_block}
IMPORTANT RULES FOR GENERATING SQL:
- Use only tables and columns that exist in the schema above
- Generate exactly one statement; never chain statements with semicolons
- Fully qualify column references in JOINs (e.g. customers.customer_id)
- Use single quotes for string literals, never double quotes
- For boolean values use 0 for false and 1 for true
- Always introduce aliases with the AS keyword
- Use only functions SQLite supports (count, sum, avg, min, max, group_concat,
  ifnull, coalesce, round, length, date, datetime, strftime)
{write_rule}
Return ONLY a JSON object with the following structure:
{{
    "sql": "THE SQL QUERY",
    "explanation": "ONE SENTENCE EXPLAINING WHAT THE QUERY DOES"
}}"#
        )
    }

    /// First-attempt user prompt
    pub fn user_prompt(&self, question: &str) -> String {
        question.to_string()
    }

    /// Re-prompt after a failed attempt, carrying the failure reason so the
    /// model can self-correct.
    pub fn retry_prompt(&self, question: &str, failed_sql: &str, reason: &str) -> String {
        if failed_sql.is_empty() {
            return format!(
                "{question}\n\nThe previous attempt failed because: {reason}\n\
                 Answer again, returning ONLY the JSON object."
            );
        }
        format!(
            "{question}\n\nThe previous SQL query failed because: {reason}\n\
             Failed SQL:\n{failed_sql}\n\
             Fix the query and return ONLY the JSON object."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_carries_schema_and_contract() {
        let builder = PromptBuilder::new(true);
        let prompt = builder.system_prompt("Database Schema:\n\nTable: customers\n");

        assert!(prompt.contains("Table: customers"));
        assert!(prompt.contains("\"sql\""));
        assert!(prompt.contains("\"explanation\""));
        assert!(prompt.contains("start with SELECT"));
    }

    #[test]
    fn test_write_mode_drops_read_only_rule() {
        let builder = PromptBuilder::new(false);
        let prompt = builder.system_prompt("schema");
        assert!(!prompt.contains("only read data"));
    }

    #[test]
    fn test_retry_prompt_carries_failure_and_sql() {
        let builder = PromptBuilder::new(true);
        let prompt = builder.retry_prompt(
            "top customers",
            "SELECT * FROM customer",
            "unknown table: customer",
        );

        assert!(prompt.contains("top customers"));
        assert!(prompt.contains("unknown table: customer"));
        assert!(prompt.contains("SELECT * FROM customer"));
    }

    #[test]
    fn test_retry_prompt_without_sql() {
        let builder = PromptBuilder::new(true);
        let prompt = builder.retry_prompt("top customers", "", "the response could not be parsed");
        assert!(prompt.contains("previous attempt failed"));
        assert!(!prompt.contains("Failed SQL"));
    }
}
