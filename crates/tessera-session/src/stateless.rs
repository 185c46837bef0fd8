//! A session without an identity map.
//!
//! [`StatelessSession`] turns every call into statements right away: there is
//! no persistence context, no dirty checking, no cascades and no lifecycle
//! events. Two `get` calls for the same row return two distinct instances.
//! Writes still go through a [`BatchingConnection`], so the `*_all`
//! operations submit statements with identical SQL in batches.

use crate::batching::{BatchedStatement, BatchingConnection};
use crate::config::SessionConfig;
use crate::id_generator::{AssignedGenerator, IdGenerator, SequenceRegistry};
use crate::persister::EntityPersister;
use asupersync::{Cx, Outcome};
use std::thread::ThreadId;
use tessera_core::{
    AnyEntityRef, Connection, Dialect, Entity, EntityMetadata, EntityNotFoundError, EntityRef,
    Error, IdStrategy, LockMode, Result, ThreadAffinityError, Value, ValidationErrorKind,
    try_outcome, try_result,
};
use tessera_query::{BoundStatement, StatementCache};

/// Direct row access for bulk work.
pub struct StatelessSession<C: Connection> {
    conn: BatchingConnection<C>,
    dialect: Dialect,
    statements: StatementCache,
    sequences: SequenceRegistry,
    owner: ThreadId,
}

impl<C: Connection> std::fmt::Debug for StatelessSession<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatelessSession")
            .field("dialect", &self.dialect)
            .field("batch_size", &self.conn.batch_size())
            .finish_non_exhaustive()
    }
}

impl<C: Connection> StatelessSession<C> {
    pub(crate) fn new(conn: C, config: &SessionConfig, sequences: SequenceRegistry) -> Self {
        let dialect = config.dialect.unwrap_or_else(|| conn.dialect());
        Self {
            conn: BatchingConnection::new(conn, config.batch_size),
            dialect,
            statements: StatementCache::new(config.statement_cache_size),
            sequences,
            owner: std::thread::current().id(),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn connection(&self) -> &C {
        self.conn.inner()
    }

    /// Statements executed so far, counting each statement of a batch.
    pub fn statement_count(&self) -> u64 {
        self.conn.statement_count()
    }

    pub fn batch_count(&self) -> u64 {
        self.conn.batch_count()
    }

    #[allow(clippy::result_large_err)]
    fn check_thread(&self) -> Result<()> {
        let actual = std::thread::current().id();
        if actual != self.owner {
            return Err(Error::ThreadAffinity(ThreadAffinityError {
                expected: self.owner,
                actual,
            }));
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn native(&mut self, statement: &BoundStatement) -> Result<String> {
        self.statements
            .native(self.dialect, &statement.sql, statement.params.len())
    }

    #[allow(clippy::result_large_err)]
    fn identifier(instance: &AnyEntityRef) -> Result<Value> {
        instance.id().ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::InvalidIdentifier,
                format!("{} has no identifier", instance.entity_name()),
            )
        })
    }

    async fn select_row(
        &mut self,
        cx: &Cx,
        meta: EntityMetadata,
        id: &Value,
    ) -> Outcome<Option<tessera_core::Row>, Error> {
        let statement = EntityPersister::new(meta, self.dialect).select_by_id(id, LockMode::None);
        let sql = try_result!(self.native(&statement));
        tracing::trace!(sql = %sql, "Executing query");
        self.conn.query_one(cx, &sql, &statement.params).await
    }

    /// Load a fresh instance of the row with identifier `id`.
    pub async fn get<E: Entity>(
        &mut self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityRef<E>>, Error> {
        try_result!(self.check_thread());
        let id = id.into();
        let row = try_outcome!(self.select_row(cx, EntityMetadata::of::<E>(), &id).await);
        match row {
            Some(row) => Outcome::Ok(Some(EntityRef::new(try_result!(E::from_row(&row))))),
            None => Outcome::Ok(None),
        }
    }

    /// Insert one row and return its identifier.
    pub async fn insert<E: Entity>(&mut self, cx: &Cx, entity: &EntityRef<E>) -> Outcome<Value, Error> {
        try_result!(self.check_thread());
        let id = try_outcome!(self.insert_any(cx, &entity.erase(), false).await);
        Outcome::Ok(id)
    }

    /// Update every updatable column of the row, checking and bumping its version.
    pub async fn update<E: Entity>(&mut self, cx: &Cx, entity: &EntityRef<E>) -> Outcome<(), Error> {
        try_result!(self.check_thread());
        try_outcome!(self.update_any(cx, &entity.erase()).await);
        self.conn.execute_batch(cx).await
    }

    /// Delete the row, checking its version when the entity is versioned.
    pub async fn delete<E: Entity>(&mut self, cx: &Cx, entity: &EntityRef<E>) -> Outcome<(), Error> {
        try_result!(self.check_thread());
        try_outcome!(self.delete_any(cx, &entity.erase()).await);
        self.conn.execute_batch(cx).await
    }

    /// Overwrite `entity` with the current row.
    pub async fn refresh<E: Entity>(&mut self, cx: &Cx, entity: &EntityRef<E>) -> Outcome<(), Error> {
        try_result!(self.check_thread());
        let instance = entity.erase();
        let id = try_result!(Self::identifier(&instance));
        let row = try_outcome!(self.select_row(cx, instance.metadata(), &id).await);
        let Some(row) = row else {
            return Outcome::Err(Error::EntityNotFound(EntityNotFoundError {
                entity: E::ENTITY_NAME,
                id,
            }));
        };
        try_result!(instance.apply_row(&row));
        Outcome::Ok(())
    }

    /// Insert every entity; returns how many rows were written.
    pub async fn insert_all<E: Entity>(&mut self, cx: &Cx, entities: &[EntityRef<E>]) -> Outcome<usize, Error> {
        try_result!(self.check_thread());
        for entity in entities {
            try_outcome!(self.insert_any(cx, &entity.erase(), true).await);
        }
        try_outcome!(self.conn.execute_batch(cx).await);
        Outcome::Ok(entities.len())
    }

    pub async fn update_all<E: Entity>(&mut self, cx: &Cx, entities: &[EntityRef<E>]) -> Outcome<usize, Error> {
        try_result!(self.check_thread());
        for entity in entities {
            try_outcome!(self.update_any(cx, &entity.erase()).await);
        }
        try_outcome!(self.conn.execute_batch(cx).await);
        Outcome::Ok(entities.len())
    }

    pub async fn delete_all<E: Entity>(&mut self, cx: &Cx, entities: &[EntityRef<E>]) -> Outcome<usize, Error> {
        try_result!(self.check_thread());
        for entity in entities {
            try_outcome!(self.delete_any(cx, &entity.erase()).await);
        }
        try_outcome!(self.conn.execute_batch(cx).await);
        Outcome::Ok(entities.len())
    }

    /// Generate the identifier and write the row. With `batched`, statements
    /// that do not return a generated key are left in the pending batch.
    async fn insert_any(&mut self, cx: &Cx, instance: &AnyEntityRef, batched: bool) -> Outcome<Value, Error> {
        let meta = instance.metadata();
        match meta.id_strategy {
            IdStrategy::Assigned => {
                try_outcome!(
                    AssignedGenerator
                        .generate(cx, &self.conn, self.dialect, instance)
                        .await
                );
            }
            IdStrategy::Sequence {
                name,
                allocation_size,
            } => {
                let generator = self.sequences.generator(name, allocation_size);
                let id = try_outcome!(generator.generate(cx, &self.conn, self.dialect, instance).await);
                try_result!(instance.set_id(id));
            }
            IdStrategy::Identity => {
                let statement = EntityPersister::new(meta, self.dialect).insert(&instance.values());
                let sql = try_result!(self.native(&statement));
                let key = try_outcome!(self.conn.insert(cx, &sql, &statement.params).await);
                try_result!(instance.set_id(Value::BigInt(key)));
                tracing::trace!(entity = meta.name, id = key, "Inserted row");
                return Outcome::Ok(Value::BigInt(key));
            }
        }

        let id = try_result!(Self::identifier(instance));
        let statement = EntityPersister::new(meta, self.dialect).insert(&instance.values());
        let sql = try_result!(self.native(&statement));
        let write = BatchedStatement::new(sql, statement.params).expect_rows(1, meta.name, id.clone());
        try_outcome!(self.conn.add_to_batch(cx, write).await);
        if !batched {
            try_outcome!(self.conn.execute_batch(cx).await);
        }
        Outcome::Ok(id)
    }

    async fn update_any(&mut self, cx: &Cx, instance: &AnyEntityRef) -> Outcome<(), Error> {
        let meta = instance.metadata();
        let id = try_result!(Self::identifier(instance));
        let columns: Vec<&'static str> = meta.update_columns().collect();
        let previous = instance.version();
        let next = previous.map(|v| v + 1);
        let statement = try_result!(
            EntityPersister::new(meta, self.dialect).update(&instance.values(), &columns, previous, next)
        );
        let sql = try_result!(self.native(&statement));
        let write = BatchedStatement::new(sql, statement.params).expect_rows(1, meta.name, id);
        try_outcome!(self.conn.add_to_batch(cx, write).await);
        // Bumped before the batch runs; a failed check leaves the instance ahead of the row.
        if let Some(next) = next {
            instance.set_version(next);
        }
        Outcome::Ok(())
    }

    async fn delete_any(&mut self, cx: &Cx, instance: &AnyEntityRef) -> Outcome<(), Error> {
        let meta = instance.metadata();
        let id = try_result!(Self::identifier(instance));
        let statement = EntityPersister::new(meta, self.dialect).delete(&id, instance.version());
        let sql = try_result!(self.native(&statement));
        let write = BatchedStatement::new(sql, statement.params).expect_rows(1, meta.name, id);
        self.conn.add_to_batch(cx, write).await
    }
}
