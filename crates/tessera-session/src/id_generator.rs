//! Identifier generation for new entities.
//!
//! Generators that need no round trip return an already-resolved future.
//! [`SequenceGenerator`] reserves `allocation_size` identifiers per round
//! trip and hands them out from memory until the block is used up; the
//! database sequence must therefore be declared with
//! `INCREMENT BY allocation_size`.

use asupersync::{Cx, Outcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tessera_core::error::ConfigError;
use tessera_core::{AnyEntityRef, Connection, Dialect, Error, Value, ValidationErrorKind};

/// Produces the identifier of an entity being persisted.
pub trait IdGenerator: Send + Sync {
    fn generate<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
        entity: &AnyEntityRef,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send;
}

/// The caller assigns identifiers; generation only checks one is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssignedGenerator;

impl IdGenerator for AssignedGenerator {
    fn generate<C: Connection>(
        &self,
        _cx: &Cx,
        _conn: &C,
        _dialect: Dialect,
        entity: &AnyEntityRef,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        let id = entity.id().ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::InvalidIdentifier,
                format!(
                    "{} uses assigned identifiers; set the id before persist",
                    entity.entity_name()
                ),
            )
        });
        async move {
            match id {
                Ok(id) => Outcome::Ok(id),
                Err(e) => Outcome::Err(e),
            }
        }
    }
}

/// Pooled sequence generator.
#[derive(Debug)]
pub struct SequenceGenerator {
    name: &'static str,
    allocation_size: u32,
    /// `(next, end)`: identifiers in `next..end` are reserved and unused.
    pool: Mutex<(i64, i64)>,
}

impl SequenceGenerator {
    pub fn new(name: &'static str, allocation_size: u32) -> Self {
        Self {
            name,
            allocation_size: allocation_size.max(1),
            pool: Mutex::new((0, 0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn allocation_size(&self) -> u32 {
        self.allocation_size
    }

    /// Identifiers still reserved in memory.
    pub fn remaining(&self) -> i64 {
        let pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        pool.1 - pool.0
    }

    fn take_pooled(&self) -> Option<i64> {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        (pool.0 < pool.1).then(|| {
            let id = pool.0;
            pool.0 += 1;
            id
        })
    }

    fn install(&self, first: i64) -> i64 {
        let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        *pool = (first + 1, first + i64::from(self.allocation_size));
        first
    }
}

impl IdGenerator for SequenceGenerator {
    fn generate<C: Connection>(
        &self,
        cx: &Cx,
        conn: &C,
        dialect: Dialect,
        _entity: &AnyEntityRef,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        async move {
            if let Some(id) = self.take_pooled() {
                return Outcome::Ok(Value::BigInt(id));
            }
            let Some(sql) = dialect.sequence_next_value_sql(self.name) else {
                return Outcome::Err(Error::Config(ConfigError {
                    message: format!("{dialect:?} has no sequences; cannot use '{}'", self.name),
                    source: None,
                }));
            };
            tracing::debug!(sequence = self.name, "Fetching identifier block");
            let row = match conn.query_one(cx, &sql, &[]).await {
                Outcome::Ok(Some(row)) => row,
                Outcome::Ok(None) => {
                    return Outcome::Err(Error::Custom(format!(
                        "sequence '{}' returned no value",
                        self.name
                    )));
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            let first = match row.get_as::<i64>(0) {
                Ok(first) => first,
                Err(e) => return Outcome::Err(e),
            };
            Outcome::Ok(Value::BigInt(self.install(first)))
        }
    }
}

/// Sequence pools shared by every session of a factory.
///
/// Sessions draw from the same block of reserved identifiers, so a block is
/// never fetched twice.
#[derive(Debug, Clone, Default)]
pub struct SequenceRegistry {
    pools: Arc<Mutex<HashMap<&'static str, Arc<SequenceGenerator>>>>,
}

impl SequenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The generator of sequence `name`, created on first use.
    pub fn generator(&self, name: &'static str, allocation_size: u32) -> Arc<SequenceGenerator> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            pools
                .entry(name)
                .or_insert_with(|| Arc::new(SequenceGenerator::new(name, allocation_size))),
        )
    }

    pub fn len(&self) -> usize {
        self.pools.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnection, author, unwrap_outcome};
    use asupersync::runtime::RuntimeBuilder;
    use tessera_core::{Row, Value};

    #[test]
    fn assigned_requires_identifier() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();

        rt.block_on(async {
            let with_id = author(Some(4), "a").erase();
            let id = unwrap_outcome(
                AssignedGenerator
                    .generate(&cx, &conn, Dialect::Postgres, &with_id)
                    .await,
            );
            assert_eq!(id, Value::BigInt(4));

            let without = author(None, "a").erase();
            match AssignedGenerator
                .generate(&cx, &conn, Dialect::Postgres, &without)
                .await
            {
                Outcome::Err(e) => assert_eq!(
                    e.validation_kind(),
                    Some(ValidationErrorKind::InvalidIdentifier)
                ),
                other => panic!("unexpected outcome: {other:?}"),
            }
        });
    }

    #[test]
    fn sequence_pools_identifiers() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("nextval", vec![Row::from_pairs([("nextval", Value::BigInt(100))])]);
        let generator = SequenceGenerator::new("book_seq", 3);
        let entity = author(None, "a").erase();

        rt.block_on(async {
            let mut ids = Vec::new();
            for _ in 0..4 {
                ids.push(unwrap_outcome(
                    generator.generate(&cx, &conn, Dialect::Postgres, &entity).await,
                ));
            }
            // Second block starts at the same scripted value.
            assert_eq!(
                ids,
                vec![
                    Value::BigInt(100),
                    Value::BigInt(101),
                    Value::BigInt(102),
                    Value::BigInt(100)
                ]
            );
        });
        assert_eq!(conn.queries().len(), 2);
        assert_eq!(conn.queries()[0].0, "SELECT nextval('book_seq')");
        assert_eq!(generator.remaining(), 2);
    }

    #[test]
    fn sequence_without_dialect_support_is_config_error() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let generator = SequenceGenerator::new("seq", 10);
        let entity = author(None, "a").erase();

        rt.block_on(async {
            match generator.generate(&cx, &conn, Dialect::Sqlite, &entity).await {
                Outcome::Err(Error::Config(c)) => assert!(c.message.contains("seq")),
                other => panic!("unexpected outcome: {other:?}"),
            }
        });
        assert!(conn.queries().is_empty());
    }

    #[test]
    fn registry_shares_pools() {
        let registry = SequenceRegistry::new();
        let a = registry.generator("book_seq", 10);
        let b = registry.clone().generator("book_seq", 50);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.allocation_size(), 10);
        registry.generator("tag_seq", 1);
        assert_eq!(registry.len(), 2);
    }
}
