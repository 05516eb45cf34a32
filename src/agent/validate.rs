//! Static validation of generated SQL
//!
//! Runs before anything touches the database: exactly one statement, an
//! allow-listed statement type, and every referenced table resolvable
//! against the live schema. Qualified `table.column` references are checked
//! against the named table; bare columns are checked when the statement
//! reads a single table (beyond that, resolution would need a full
//! name-binding pass, and the engine reports those at execution time).

use crate::agent::error::{AskError, AskResult};
use crate::schema::SchemaDescription;
use std::collections::{HashMap, HashSet};

const KEYWORDS: &[&str] = &[
    "ABORT", "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CAST", "COLLATE", "CROSS",
    "CURRENT_DATE", "CURRENT_TIME", "CURRENT_TIMESTAMP", "DELETE", "DESC", "DISTINCT", "ELSE",
    "END", "ESCAPE", "EXCEPT", "EXISTS", "FILTER", "FROM", "FULL", "GLOB", "GROUP", "HAVING",
    "IN", "INDEXED", "INNER", "INSERT", "INTERSECT", "INTO", "IS", "ISNULL", "JOIN", "LEFT",
    "LIKE", "LIMIT", "MATCH", "NATURAL", "NOT", "NOTNULL", "NULL", "OFFSET", "ON", "OR", "ORDER",
    "OUTER", "OVER", "PARTITION", "RECURSIVE", "REGEXP", "RIGHT", "SELECT", "SET", "THEN",
    "UNION", "UPDATE", "USING", "VALUES", "WHEN", "WHERE", "WINDOW", "WITH", "CONFLICT", "DO",
    "NOTHING", "RETURNING",
];

// Statement heads that are never executed, even with read_only disabled
const DENIED_HEADS: &[&str] = &[
    "ALTER", "ANALYZE", "ATTACH", "BEGIN", "COMMIT", "CREATE", "DETACH", "DROP", "EXPLAIN",
    "PRAGMA", "REINDEX", "RELEASE", "ROLLBACK", "SAVEPOINT", "VACUUM",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Bare word: identifier or keyword
    Word(String),
    /// Quoted identifier: "x", [x] or `x`
    Quoted(String),
    Number,
    Str,
    Punct(char),
}

impl Token {
    fn ident(&self) -> Option<&str> {
        match self {
            Token::Word(w) => Some(w),
            Token::Quoted(q) => Some(q),
            _ => None,
        }
    }

    fn is_punct(&self, c: char) -> bool {
        matches!(self, Token::Punct(p) if *p == c)
    }
}

fn is_keyword(word: &str) -> bool {
    KEYWORDS.contains(&word.to_uppercase().as_str())
}

/// Validates one generated statement against the introspected schema
pub struct Validator<'a> {
    schema: &'a SchemaDescription,
    read_only: bool,
}

impl<'a> Validator<'a> {
    pub fn new(schema: &'a SchemaDescription, read_only: bool) -> Self {
        Self { schema, read_only }
    }

    /// Check the statement and return it normalized (trailing semicolon and
    /// surrounding whitespace stripped).
    pub fn validate(&self, sql: &str) -> AskResult<String> {
        let tokens = tokenize(sql)?;
        if tokens.is_empty() {
            return Err(AskError::Validation("empty statement".to_string()));
        }

        self.check_single_statement(&tokens)?;
        self.check_statement_type(&tokens)?;
        self.check_identifiers(&tokens)?;

        let mut normalized = sql.trim();
        while let Some(stripped) = normalized.strip_suffix(';') {
            normalized = stripped.trim_end();
        }
        Ok(normalized.to_string())
    }

    fn check_single_statement(&self, tokens: &[Token]) -> AskResult<()> {
        for (idx, token) in tokens.iter().enumerate() {
            if token.is_punct(';') && idx + 1 < tokens.len() {
                return Err(AskError::Validation(
                    "multiple statements are not allowed".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn check_statement_type(&self, tokens: &[Token]) -> AskResult<()> {
        let head = tokens
            .iter()
            .find_map(|t| match t {
                Token::Word(w) => Some(w.to_uppercase()),
                _ => None,
            })
            .ok_or_else(|| AskError::Validation("no statement found".to_string()))?;

        if DENIED_HEADS.contains(&head.as_str()) {
            return Err(AskError::Validation(format!(
                "{head} statements are not allowed"
            )));
        }

        let allowed: &[&str] = if self.read_only {
            &["SELECT", "WITH"]
        } else {
            &["SELECT", "WITH", "INSERT", "UPDATE", "DELETE"]
        };
        if !allowed.contains(&head.as_str()) {
            if self.read_only {
                return Err(AskError::Validation(format!(
                    "only SELECT statements are allowed, got {head}"
                )));
            }
            return Err(AskError::Validation(format!(
                "{head} statements are not allowed"
            )));
        }
        Ok(())
    }

    fn check_identifiers(&self, tokens: &[Token]) -> AskResult<()> {
        let starts_with_with = tokens
            .first()
            .and_then(Token::ident)
            .map(|w| w.eq_ignore_ascii_case("WITH"))
            .unwrap_or(false);

        let ctes = if starts_with_with {
            collect_cte_names(tokens)
        } else {
            HashSet::new()
        };

        let mut consumed = vec![false; tokens.len()];
        let mut referenced: Vec<String> = Vec::new();
        let mut alias_map: HashMap<String, String> = HashMap::new();
        let mut aliases: HashSet<String> = HashSet::new();

        // Pass 1: table references and aliases
        let mut i = 0;
        while i < tokens.len() {
            let word = tokens[i].ident().map(|w| w.to_uppercase());
            match word.as_deref() {
                Some("FROM") | Some("JOIN") | Some("INTO") => {
                    let allow_comma = word.as_deref() == Some("FROM");
                    i = self.consume_table_refs(
                        tokens,
                        i + 1,
                        allow_comma,
                        &ctes,
                        &mut consumed,
                        &mut referenced,
                        &mut alias_map,
                        &mut aliases,
                    )?;
                }
                Some("UPDATE") if i == 0 => {
                    i = self.consume_table_refs(
                        tokens,
                        i + 1,
                        false,
                        &ctes,
                        &mut consumed,
                        &mut referenced,
                        &mut alias_map,
                        &mut aliases,
                    )?;
                }
                Some("AS") => {
                    if let Some(alias) = tokens.get(i + 1).and_then(Token::ident) {
                        aliases.insert(alias.to_lowercase());
                        consumed[i + 1] = true;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        }

        // Pass 2: qualified column references
        let mut i = 0;
        while i + 2 < tokens.len() {
            if consumed[i] || !tokens[i + 1].is_punct('.') {
                i += 1;
                continue;
            }
            let Some(qualifier) = tokens[i].ident() else {
                i += 1;
                continue;
            };
            let column = match &tokens[i + 2] {
                Token::Word(w) => Some(w.as_str()),
                Token::Quoted(q) => Some(q.as_str()),
                Token::Punct('*') => None,
                _ => {
                    i += 1;
                    continue;
                }
            };
            self.resolve_qualified(qualifier, column, &ctes, &alias_map, &aliases)?;
            consumed[i] = true;
            consumed[i + 1] = true;
            consumed[i + 2] = true;
            i += 3;
        }

        // Pass 3: bare columns, only where resolution is unambiguous
        let select_count = tokens
            .iter()
            .filter(|t| {
                t.ident()
                    .map(|w| w.eq_ignore_ascii_case("SELECT"))
                    .unwrap_or(false)
            })
            .count();
        let mut distinct_tables: Vec<&str> = referenced.iter().map(String::as_str).collect();
        distinct_tables.dedup();

        if distinct_tables.len() == 1 && ctes.is_empty() && select_count <= 1 {
            let table = self
                .schema
                .table(distinct_tables[0])
                .ok_or_else(|| {
                    AskError::Validation(format!("unknown table: {}", distinct_tables[0]))
                })?;
            for (idx, token) in tokens.iter().enumerate() {
                if consumed[idx] {
                    continue;
                }
                let Some(word) = token.ident() else { continue };
                if is_keyword(word) {
                    continue;
                }
                // word immediately followed by '(' is a function call
                if tokens.get(idx + 1).map(|t| t.is_punct('(')).unwrap_or(false) {
                    continue;
                }
                if aliases.contains(&word.to_lowercase()) || table.has_column(word) {
                    continue;
                }
                return Err(AskError::Validation(format!("unknown column: {word}")));
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn consume_table_refs(
        &self,
        tokens: &[Token],
        start: usize,
        allow_comma: bool,
        ctes: &HashSet<String>,
        consumed: &mut [bool],
        referenced: &mut Vec<String>,
        alias_map: &mut HashMap<String, String>,
        aliases: &mut HashSet<String>,
    ) -> AskResult<usize> {
        let mut i = start;
        loop {
            // a parenthesis opens a subquery; the main scan handles its body
            if tokens.get(i).map(|t| t.is_punct('(')).unwrap_or(true) {
                return Ok(i);
            }
            let Some(first) = tokens[i].ident() else {
                return Ok(i);
            };
            let mut table = first.to_string();
            consumed[i] = true;
            i += 1;

            // main.table form: the prefix is the attached-database name
            if tokens.get(i).map(|t| t.is_punct('.')).unwrap_or(false) {
                if let Some(second) = tokens.get(i + 1).and_then(Token::ident) {
                    consumed[i] = true;
                    consumed[i + 1] = true;
                    table = second.to_string();
                    i += 2;
                }
            }

            if ctes.contains(&table.to_lowercase()) {
                // CTE reference; optional alias still applies
            } else if self.schema.has_table(&table) {
                referenced.push(table.to_lowercase());
            } else {
                return Err(AskError::Validation(format!("unknown table: {table}")));
            }

            // explicit or implicit alias
            let mut alias: Option<String> = None;
            if tokens
                .get(i)
                .and_then(Token::ident)
                .map(|w| w.eq_ignore_ascii_case("AS"))
                .unwrap_or(false)
            {
                if let Some(name) = tokens.get(i + 1).and_then(Token::ident) {
                    alias = Some(name.to_string());
                    consumed[i] = true;
                    consumed[i + 1] = true;
                    i += 2;
                }
            } else if let Some(name) = tokens.get(i).and_then(Token::ident) {
                if !is_keyword(name) {
                    alias = Some(name.to_string());
                    consumed[i] = true;
                    i += 1;
                }
            }
            if let Some(name) = alias {
                let lower = name.to_lowercase();
                if !ctes.contains(&table.to_lowercase()) {
                    alias_map.insert(lower.clone(), table.to_lowercase());
                }
                aliases.insert(lower);
            }

            if allow_comma && tokens.get(i).map(|t| t.is_punct(',')).unwrap_or(false) {
                consumed[i] = true;
                i += 1;
                continue;
            }
            return Ok(i);
        }
    }

    fn resolve_qualified(
        &self,
        qualifier: &str,
        column: Option<&str>,
        ctes: &HashSet<String>,
        alias_map: &HashMap<String, String>,
        aliases: &HashSet<String>,
    ) -> AskResult<()> {
        let lower = qualifier.to_lowercase();
        // CTE and derived-table columns are not introspectable; existence of
        // the name is enough
        if ctes.contains(&lower) {
            return Ok(());
        }
        let table_name = if let Some(target) = alias_map.get(&lower) {
            target.clone()
        } else if self.schema.has_table(qualifier) {
            lower
        } else if aliases.contains(&lower) {
            return Ok(());
        } else {
            return Err(AskError::Validation(format!(
                "unknown table or alias: {qualifier}"
            )));
        };

        if let Some(column) = column {
            let table = self.schema.table(&table_name).ok_or_else(|| {
                AskError::Validation(format!("unknown table: {table_name}"))
            })?;
            if !table.has_column(column) {
                return Err(AskError::Validation(format!(
                    "unknown column: {qualifier}.{column}"
                )));
            }
        }
        Ok(())
    }
}

/// Collect CTE names: identifiers followed by `AS (`, with an optional
/// column list between name and AS.
fn collect_cte_names(tokens: &[Token]) -> HashSet<String> {
    let mut names = HashSet::new();
    let mut i = 0;
    while i < tokens.len() {
        let Some(name) = tokens[i].ident() else {
            i += 1;
            continue;
        };
        if is_keyword(name) {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        // optional (col, col, ...) list
        if tokens.get(j).map(|t| t.is_punct('(')).unwrap_or(false) {
            let mut depth = 0usize;
            while j < tokens.len() {
                if tokens[j].is_punct('(') {
                    depth += 1;
                } else if tokens[j].is_punct(')') {
                    depth -= 1;
                    if depth == 0 {
                        j += 1;
                        break;
                    }
                }
                j += 1;
            }
        }
        let as_next = tokens
            .get(j)
            .and_then(Token::ident)
            .map(|w| w.eq_ignore_ascii_case("AS"))
            .unwrap_or(false);
        if as_next && tokens.get(j + 1).map(|t| t.is_punct('(')).unwrap_or(false) {
            names.insert(name.to_lowercase());
        }
        i += 1;
    }
    names
}

fn tokenize(sql: &str) -> AskResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            if i + 1 >= chars.len() {
                return Err(AskError::Validation("unterminated comment".to_string()));
            }
            i += 2;
        } else if c == '\'' {
            i += 1;
            loop {
                match chars.get(i) {
                    None => {
                        return Err(AskError::Validation(
                            "unterminated string literal".to_string(),
                        ));
                    }
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => i += 2,
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
            tokens.push(Token::Str);
        } else if c == '"' || c == '`' || c == '[' {
            let close = match c {
                '[' => ']',
                other => other,
            };
            i += 1;
            let start = i;
            while i < chars.len() && chars[i] != close {
                i += 1;
            }
            if i >= chars.len() {
                return Err(AskError::Validation(
                    "unterminated quoted identifier".to_string(),
                ));
            }
            tokens.push(Token::Quoted(chars[start..i].iter().collect()));
            i += 1;
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number);
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            tokens.push(Token::Punct(c));
            i += 1;
        }
    }
    Ok(tokens)
}
