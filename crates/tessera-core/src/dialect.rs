//! Backend dialects and parameter placeholder rewriting.
//!
//! The engine renders every statement in a backend-agnostic intermediate form
//! where each bound parameter is a bare `?`. Before a statement reaches a
//! [`Connection`](crate::Connection), [`Dialect::rewrite_placeholders`] turns
//! it into the backend's native syntax.

use crate::error::{Error, Result, ValidationErrorKind};
use crate::lock::LockMode;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::OnceLock;

/// SQL dialect of the backend behind a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

/// A parameter marker found while scanning statement text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterToken<'a> {
    /// A bare `?` in the intermediate form.
    Positional,
    /// A `:name` marker.
    Named(&'a str),
}

// Literals, comments and `::` casts are matched so that markers inside them are skipped.
const TOKEN_PATTERN: &str =
    r#"'(?:[^']|'')*'|"(?:[^"]|"")*"|--[^\n]*|::|:([A-Za-z_][A-Za-z0-9_]*)|\?"#;

fn token_regex() -> Result<&'static Regex> {
    static TOKENS: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    TOKENS
        .get_or_init(|| Regex::new(TOKEN_PATTERN))
        .as_ref()
        .map_err(|e| Error::Custom(format!("invalid parameter token pattern: {e}")))
}

/// Find every parameter marker in `sql`, in order of appearance.
///
/// Markers inside string literals, quoted identifiers and `--` comments are
/// ignored, as is the PostgreSQL `::type` cast operator.
pub fn scan_parameters(sql: &str) -> Result<Vec<(Range<usize>, ParameterToken<'_>)>> {
    let regex = token_regex()?;
    let mut tokens = Vec::new();
    for caps in regex.captures_iter(sql) {
        let Some(whole) = caps.get(0) else { continue };
        if let Some(name) = caps.get(1) {
            tokens.push((whole.range(), ParameterToken::Named(name.as_str())));
        } else if whole.as_str() == "?" {
            tokens.push((whole.range(), ParameterToken::Positional));
        }
    }
    Ok(tokens)
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are escaped by doubling them.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Rewrite the intermediate `?` form into native placeholders.
    ///
    /// Fails with a [`ValidationErrorKind::ParameterCount`] error when the
    /// number of markers differs from `param_count`.
    pub fn rewrite_placeholders(self, sql: &str, param_count: usize) -> Result<String> {
        let tokens = scan_parameters(sql)?;
        let mut out = String::with_capacity(sql.len() + param_count * 2);
        let mut last = 0;
        let mut index = 0;
        for (range, token) in tokens {
            match token {
                ParameterToken::Positional => {
                    index += 1;
                    out.push_str(&sql[last..range.start]);
                    out.push_str(&self.placeholder(index));
                    last = range.end;
                }
                ParameterToken::Named(name) => {
                    return Err(Error::validation(
                        ValidationErrorKind::UnknownParameter,
                        format!("unexpanded named parameter ':{name}' in statement"),
                    ));
                }
            }
        }
        out.push_str(&sql[last..]);

        if index != param_count {
            return Err(Error::validation(
                ValidationErrorKind::ParameterCount,
                format!("statement has {index} placeholder(s) but {param_count} value(s) were bound"),
            ));
        }
        Ok(out)
    }

    /// SQL that fetches the next value of a sequence, if the backend has sequences.
    pub fn sequence_next_value_sql(self, sequence: &str) -> Option<String> {
        match self {
            Dialect::Postgres => Some(format!("SELECT nextval('{}')", sequence.replace('\'', "''"))),
            Dialect::Sqlite | Dialect::Mysql => None,
        }
    }

    /// `LIMIT`/`OFFSET` clause, or `None` when neither is set.
    pub fn limit_clause(self, limit: Option<usize>, offset: Option<usize>) -> Option<String> {
        match (limit, offset) {
            (None, None) => None,
            (Some(limit), None) => Some(format!("LIMIT {limit}")),
            (Some(limit), Some(offset)) => Some(format!("LIMIT {limit} OFFSET {offset}")),
            (None, Some(offset)) => Some(match self {
                Dialect::Postgres => format!("OFFSET {offset}"),
                Dialect::Sqlite => format!("LIMIT -1 OFFSET {offset}"),
                Dialect::Mysql => format!("LIMIT 18446744073709551615 OFFSET {offset}"),
            }),
        }
    }

    /// Row-lock clause appended to a SELECT for the given lock mode.
    pub fn lock_clause(self, mode: LockMode) -> Option<&'static str> {
        match (self, mode) {
            (Dialect::Postgres | Dialect::Mysql, LockMode::PessimisticWrite) => Some("FOR UPDATE"),
            (Dialect::Postgres, LockMode::PessimisticRead) => Some("FOR SHARE"),
            (Dialect::Mysql, LockMode::PessimisticRead) => Some("LOCK IN SHARE MODE"),
            _ => None,
        }
    }
}
