//! Query definitions.
//!
//! A [`Query`] pairs an immutable definition (native statement text or a
//! [`Criteria`]) with execution settings that may be changed and rebound
//! between executions. It holds no connection and no session state; a
//! session executes it by reference.

use crate::bind::{BoundStatement, expand};
use crate::criteria::Criteria;
use crate::params::{Binding, Parameters};
use crate::tables::{modified_table, referenced_tables};
use serde::{Deserialize, Serialize};
use tessera_core::{Dialect, Error, LockMode, Result, ValidationErrorKind, Value};

/// When pending writes are synchronized with the database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Before queries that touch tables with pending writes, and at commit.
    #[default]
    Auto,
    /// Only at commit.
    Commit,
    /// Only when `flush()` is called.
    Manual,
}

/// What a query executes.
#[derive(Debug, Clone, PartialEq)]
pub enum QuerySource {
    /// Statement text with `?` and `:name` markers.
    Native(String),
    Criteria(Criteria),
}

impl From<&str> for QuerySource {
    fn from(sql: &str) -> Self {
        QuerySource::Native(sql.to_string())
    }
}

impl From<String> for QuerySource {
    fn from(sql: String) -> Self {
        QuerySource::Native(sql)
    }
}

impl From<Criteria> for QuerySource {
    fn from(criteria: Criteria) -> Self {
        QuerySource::Criteria(criteria)
    }
}

/// A query plus its execution settings.
///
/// # Example
///
/// ```ignore
/// let query = session
///     .create_query("SELECT * FROM books WHERE author_id = :author AND id IN (:ids)")
///     .set_parameter("author", 7_i64)
///     .set_parameter_list("ids", [1_i64, 2, 3])
///     .set_max_results(10);
/// let books: Vec<EntityRef<Book>> = session.list(&cx, &query).await?;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    source: QuerySource,
    parameters: Parameters,
    first_result: Option<usize>,
    max_results: Option<usize>,
    lock_mode: LockMode,
    flush_mode: Option<FlushMode>,
    fetched_collection: Option<&'static str>,
    synchronized_tables: Vec<String>,
    read_only: Option<bool>,
}

impl Query {
    pub fn new(source: impl Into<QuerySource>) -> Self {
        Self {
            source: source.into(),
            parameters: Parameters::new(),
            first_result: None,
            max_results: None,
            lock_mode: LockMode::None,
            flush_mode: None,
            fetched_collection: None,
            synchronized_tables: Vec::new(),
            read_only: None,
        }
    }

    pub fn native(sql: impl Into<String>) -> Self {
        Self::new(QuerySource::Native(sql.into()))
    }

    pub fn criteria(criteria: Criteria) -> Self {
        Self::new(QuerySource::Criteria(criteria))
    }

    /// Bind the next positional `?` marker.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.parameters.push(Binding::Single(value.into()));
        self
    }

    /// Bind a `:name` marker, replacing an earlier value.
    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.set(name, Binding::Single(value.into()));
        self
    }

    /// Bind a `:name` marker to a list, expanded to one placeholder per element.
    pub fn set_parameter_list<V: Into<Value>>(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.parameters.set(name, Binding::List(values));
        self
    }

    pub fn clear_parameters(mut self) -> Self {
        self.parameters.clear();
        self
    }

    pub fn set_first_result(mut self, first: usize) -> Self {
        self.first_result = Some(first);
        self
    }

    pub fn set_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    pub fn set_lock_mode(mut self, mode: LockMode) -> Self {
        self.lock_mode = mode;
        self
    }

    /// Override the session's flush mode for this query.
    pub fn set_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = Some(mode);
        self
    }

    /// Declare that the statement also returns the elements of collection
    /// `role`, in columns named `"{role}.{column}"`.
    pub fn fetches_collection(mut self, role: &'static str) -> Self {
        self.fetched_collection = Some(role);
        self
    }

    /// Add a table whose pending writes must be flushed before this query runs.
    pub fn add_synchronized_table(mut self, table: impl Into<String>) -> Self {
        self.synchronized_tables.push(table.into());
        self
    }

    /// Load result entities as read-only.
    pub fn set_read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn source(&self) -> &QuerySource {
        &self.source
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn first_result(&self) -> Option<usize> {
        self.first_result
    }

    pub fn max_results(&self) -> Option<usize> {
        self.max_results
    }

    pub fn is_paginated(&self) -> bool {
        self.first_result.is_some() || self.max_results.is_some()
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn flush_mode(&self) -> Option<FlushMode> {
        self.flush_mode
    }

    pub fn fetched_collection(&self) -> Option<&'static str> {
        self.fetched_collection
    }

    pub fn read_only(&self) -> Option<bool> {
        self.read_only
    }

    /// Expand parameters into the intermediate form, without pagination or locking.
    pub fn statement(&self, dialect: Dialect) -> Result<BoundStatement> {
        match &self.source {
            QuerySource::Native(sql) => expand(sql, &self.parameters),
            QuerySource::Criteria(criteria) => {
                if !self.parameters.is_empty() {
                    return Err(Error::validation(
                        ValidationErrorKind::ParameterCount,
                        "criteria queries carry their own values; parameters cannot be bound",
                    ));
                }
                Ok(criteria.to_statement(dialect))
            }
        }
    }

    /// Tables whose pending writes affect this query, or `None` if unknown.
    pub fn query_spaces(&self) -> Result<Option<Vec<String>>> {
        let mut tables = match &self.source {
            QuerySource::Native(sql) => referenced_tables(sql)?,
            QuerySource::Criteria(criteria) => vec![criteria.table().to_string()],
        };
        for table in &self.synchronized_tables {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }
        Ok((!tables.is_empty()).then_some(tables))
    }

    /// Target table of a bulk INSERT, UPDATE or DELETE.
    pub fn modified_table(&self) -> Result<Option<String>> {
        match &self.source {
            QuerySource::Native(sql) => modified_table(sql),
            QuerySource::Criteria(_) => Ok(None),
        }
    }
}
