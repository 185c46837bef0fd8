//! Session configuration.

use serde::{Deserialize, Serialize};
use tessera_core::error::ConfigError;
use tessera_core::{Dialect, Error, Result};
use tessera_query::FlushMode;

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Statements with identical SQL submitted per round trip (1 disables batching).
    pub batch_size: usize,
    /// Group inserts into the same table inside each dependency sub-pass.
    pub order_inserts: bool,
    /// Update only the columns that changed instead of every updatable column.
    pub dynamic_update: bool,
    /// When pending writes are flushed.
    pub flush_mode: FlushMode,
    /// Load entities as read-only unless a query says otherwise.
    pub default_read_only: bool,
    /// Fail instead of paginating in memory when a query fetches a collection.
    pub fail_on_pagination_over_collection_fetch: bool,
    /// Native statements kept per session (0 disables the cache).
    pub statement_cache_size: usize,
    /// Dialect override; the connection's dialect is used when unset.
    pub dialect: Option<Dialect>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            order_inserts: false,
            dynamic_update: false,
            flush_mode: FlushMode::Auto,
            default_read_only: false,
            fail_on_pagination_over_collection_fetch: true,
            statement_cache_size: 128,
            dialect: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document; missing keys keep their defaults.
    ///
    /// ```
    /// use tessera_session::SessionConfig;
    ///
    /// let config = SessionConfig::from_json(r#"{"batch_size": 50, "flush_mode": "commit"}"#).unwrap();
    /// assert_eq!(config.batch_size, 50);
    /// assert!(config.fail_on_pagination_over_collection_fetch);
    /// ```
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid session configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config(ConfigError {
                message: "batch_size must be at least 1".to_string(),
                source: None,
            }));
        }
        Ok(())
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_order_inserts(mut self, order_inserts: bool) -> Self {
        self.order_inserts = order_inserts;
        self
    }

    pub fn with_dynamic_update(mut self, dynamic_update: bool) -> Self {
        self.dynamic_update = dynamic_update;
        self
    }

    pub fn with_flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    pub fn with_default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = read_only;
        self
    }

    pub fn with_fail_on_pagination_over_collection_fetch(mut self, fail: bool) -> Self {
        self.fail_on_pagination_over_collection_fetch = fail;
        self
    }

    pub fn with_statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = Some(dialect);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.flush_mode, FlushMode::Auto);
        assert!(config.fail_on_pagination_over_collection_fetch);
        assert!(config.dialect.is_none());
    }

    #[test]
    fn json_overrides_selected_keys() {
        let config = SessionConfig::from_json(
            r#"{"batch_size": 25, "order_inserts": true, "dialect": "sqlite", "flush_mode": "manual"}"#,
        )
        .unwrap();
        assert_eq!(config.batch_size, 25);
        assert!(config.order_inserts);
        assert_eq!(config.dialect, Some(Dialect::Sqlite));
        assert_eq!(config.flush_mode, FlushMode::Manual);
        assert!(!config.dynamic_update);
    }

    #[test]
    fn invalid_json_is_config_error() {
        let err = SessionConfig::from_json(r#"{"batch_size": "many"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let err = SessionConfig::from_json(r#"{"batch_size": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn builder_clamps_batch_size() {
        let config = SessionConfig::new().with_batch_size(0).with_dynamic_update(true);
        assert_eq!(config.batch_size, 1);
        assert!(config.dynamic_update);
    }
}
