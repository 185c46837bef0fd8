//! Cache of statements rewritten into native placeholder syntax.
//!
//! Rewriting scans the whole statement text, so sessions keep the native form
//! of every intermediate statement they have already executed.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Instant;
use tessera_core::{Dialect, Result};

/// A cached native statement.
#[derive(Debug, Clone)]
pub struct CachedStatement {
    /// The statement in native placeholder syntax.
    pub sql: String,
    /// When this entry was last accessed.
    pub last_used: Instant,
    /// Number of times this statement has been reused.
    pub hit_count: u64,
}

/// LRU-style cache keyed by intermediate SQL text and dialect.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is evicted.
/// A `max_size` of zero disables caching.
#[derive(Debug)]
pub struct StatementCache {
    cache: HashMap<u64, CachedStatement>,
    max_size: usize,
    hits: u64,
    misses: u64,
}

impl StatementCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size,
            hits: 0,
            misses: 0,
        }
    }

    /// Native form of `sql`, rewriting it on a cache miss.
    ///
    /// Rewriting also validates the placeholder count, so only statements
    /// that passed that check are cached.
    pub fn native(&mut self, dialect: Dialect, sql: &str, param_count: usize) -> Result<String> {
        if self.max_size == 0 {
            return dialect.rewrite_placeholders(sql, param_count);
        }
        let key = cache_key(&(sql, dialect, param_count));
        if let Some(entry) = self.cache.get_mut(&key) {
            entry.last_used = Instant::now();
            entry.hit_count += 1;
            self.hits += 1;
            return Ok(entry.sql.clone());
        }

        let native = dialect.rewrite_placeholders(sql, param_count)?;
        self.misses += 1;
        if self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.cache.insert(
            key,
            CachedStatement {
                sql: native.clone(),
                last_used: Instant::now(),
                hit_count: 0,
            },
        );
        Ok(native)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Clear all cached statements.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Evict the least-recently-used entry.
    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.cache.remove(&lru_key);
        }
    }
}

/// Compute a hash key for caching from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(128)
    }
}
