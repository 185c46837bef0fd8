//! Error types for Tessera operations.

use crate::value::Value;
use std::fmt;

/// The primary error type for all Tessera operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, closed)
    Connection(ConnectionError),
    /// Statement execution errors reported by the backend
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Transaction state errors
    Transaction(TransactionError),
    /// Programmer errors detected before any asynchronous work starts
    Validation(ValidationError),
    /// An update or delete matched zero rows (optimistic lock failure)
    StaleState(StaleStateError),
    /// A reference pointed at a row that no longer exists
    EntityNotFound(EntityNotFoundError),
    /// A session was used from a thread other than the one it is bound to
    ThreadAffinity(ThreadAffinityError),
    /// Configuration errors
    Config(ConfigError),
    /// I/O errors
    Io(std::io::Error),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// The connection was already closed
    Closed,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// A transaction is already active on this session
    AlreadyActive,
    /// No transaction is active
    NotActive,
    /// The transaction was marked for rollback and cannot commit
    MarkedForRollback,
    /// A before-commit callback failed
    BeforeCompletion,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// Misuse of the session or query API.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub kind: ValidationErrorKind,
    pub message: String,
}

/// The kind of API misuse detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Bound parameter count does not match the statement
    ParameterCount,
    /// A named parameter was bound but not used, or used but not bound
    UnknownParameter,
    /// The query result does not match the requested result type
    ResultType,
    /// Operation not allowed on a removed entity
    RemovedEntity,
    /// A different instance with the same identity is already managed
    NonUniqueObject,
    /// A managed entity references an unsaved entity without cascade
    TransientReference,
    /// Flush requested while a cascade is in progress
    ReentrantFlush,
    /// Operation requires a managed entity
    Detached,
    /// More than one row returned where at most one was expected
    NonUniqueResult,
    /// Pagination requested on a query that fetches a collection
    PaginationOverCollectionFetch,
    /// Identifier missing or otherwise unusable
    InvalidIdentifier,
    /// Operation not valid in the current state
    InvalidState,
}

/// Optimistic lock failure: the row was changed or deleted concurrently.
#[derive(Debug, Clone)]
pub struct StaleStateError {
    pub entity: &'static str,
    pub id: Value,
    pub sql: String,
    pub expected_rows: u64,
    pub actual_rows: u64,
}

/// A reference was dereferenced but its row no longer exists.
#[derive(Debug, Clone)]
pub struct EntityNotFoundError {
    pub entity: &'static str,
    pub id: Value,
}

#[derive(Debug, Clone)]
pub struct ThreadAffinityError {
    pub expected: std::thread::ThreadId,
    pub actual: std::thread::ThreadId,
}

impl ValidationError {
    pub fn new(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl Error {
    /// Shorthand for building a [`Error::Validation`].
    pub fn validation(kind: ValidationErrorKind, message: impl Into<String>) -> Self {
        Error::Validation(ValidationError::new(kind, message))
    }

    /// Shorthand for building a [`Error::Transaction`].
    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Is this a retryable error (deadlock, serialization, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization
            ),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Did an optimistic lock check fail?
    pub fn is_stale_state(&self) -> bool {
        matches!(self, Error::StaleState(_))
    }

    /// Was this misuse detected before any statement ran?
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Return the validation kind if this is a validation error.
    pub fn validation_kind(&self) -> Option<ValidationErrorKind> {
        match self {
            Error::Validation(v) => Some(v.kind),
            _ => None,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::StaleState(s) => Some(&s.sql),
            _ => None,
        }
    }
}

impl QueryError {
    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::StaleState(e) => write!(f, "Stale state: {}", e),
            Error::EntityNotFound(e) => write!(f, "Entity not found: {}", e),
            Error::ThreadAffinity(e) => write!(f, "Thread affinity violation: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl fmt::Display for StaleStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row of {} with id {} was updated or deleted by another transaction \
             (expected {} row(s), got {})",
            self.entity, self.id, self.expected_rows, self.actual_rows
        )
    }
}

impl fmt::Display for EntityNotFoundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no row of {} with id {}", self.entity, self.id)
    }
}

impl fmt::Display for ThreadAffinityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session bound to {:?} was called from {:?}",
            self.expected, self.actual
        )
    }
}

impl std::error::Error for ValidationError {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<StaleStateError> for Error {
    fn from(err: StaleStateError) -> Self {
        Error::StaleState(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for Tessera operations.
pub type Result<T> = std::result::Result<T, Error>;
