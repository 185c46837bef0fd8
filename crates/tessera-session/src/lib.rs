//! Session and unit-of-work engine for Tessera.
//!
//! `tessera-session` is the **stateful layer**. A [`Session`] owns one
//! persistence context (the identity map), one action queue, one transaction
//! coordinator and one connection wrapped in a [`BatchingConnection`], and
//! exposes the async operations callers use to load, change and query
//! entities.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::new(SessionConfig::default().with_batch_size(50))?;
//! let mut session = factory.open(conn);
//!
//! let author = EntityRef::new(Author { id: None, name: "A".into() });
//! let book = EntityRef::new(Book::new("T", &author));
//! session.persist(&cx, &book).await?; // cascades to the author
//! session.flush(&cx).await?;
//!
//! let same = session.find::<Book>(&cx, book.id().unwrap()).await?;
//! assert!(same.unwrap().ptr_eq(&book));
//! ```
//!
//! # Threading
//!
//! A session is bound to the thread that opened it. The identity map and the
//! action queue are mutated without locks, so every public method checks the
//! calling thread first and fails with [`Error::ThreadAffinity`] otherwise.

pub mod action_queue;
pub mod batching;
pub mod config;
pub mod context;
mod events;
mod flush;
pub mod id_generator;
pub mod persister;
pub mod pipeline;
mod query_executor;
pub mod stateless;
pub mod statistics;
pub mod supplier;
pub mod transaction;

#[cfg(test)]
mod testing;

pub use action_queue::{ActionQueue, DeleteAction, EntityAction, InsertAction, UpdateAction};
pub use batching::{BatchedStatement, BatchingConnection};
pub use config::SessionConfig;
pub use context::{
    CollectionEntry, CollectionKey, ContextId, EntityEntry, EntityStatus, PersistenceContext,
};
pub use id_generator::{AssignedGenerator, IdGenerator, SequenceGenerator, SequenceRegistry};
pub use persister::{CollectionPersister, EntityPersister};
pub use pipeline::{Callback, EntityListener, EventKind, EventPipeline, Stage};
pub use stateless::StatelessSession;
pub use statistics::SessionStatistics;
pub use supplier::{ConnectionSupplier, LazyConnection};
pub use transaction::{CompletionGuard, TransactionCoordinator, TransactionStatus};

use asupersync::{Cx, Outcome};
use statistics::Counters;
use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::thread::ThreadId;
use tessera_core::error::{ConnectionError, ConnectionErrorKind};
use tessera_core::{
    AnyEntityRef, AssociationTarget, CascadeAction, Connection, Dialect, Entity, EntityKey,
    EntityMetadata, EntityRef, Error, Result, Row, ThreadAffinityError, ValidationErrorKind,
    try_outcome, try_result,
};
use tessera_query::{BoundStatement, Criteria, Query, StatementCache};

/// A boxed, sendable future borrowing from `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Session factory
// ============================================================================

/// Opens sessions that share configuration, listeners and sequence pools.
#[derive(Debug, Clone, Default)]
pub struct SessionFactory {
    config: SessionConfig,
    pipeline: Arc<EventPipeline>,
    sequences: SequenceRegistry,
}

impl SessionFactory {
    #[allow(clippy::result_large_err)]
    pub fn new(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            pipeline: Arc::new(EventPipeline::new()),
            sequences: SequenceRegistry::new(),
        })
    }

    /// Use `pipeline` (with its listeners) for every session opened from now on.
    pub fn with_pipeline(mut self, pipeline: EventPipeline) -> Self {
        self.pipeline = Arc::new(pipeline);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &EventPipeline {
        &self.pipeline
    }

    pub fn sequences(&self) -> &SequenceRegistry {
        &self.sequences
    }

    /// Open a session that manages its own transactions.
    pub fn open<C: Connection>(&self, conn: C) -> Session<C> {
        Session::build(self, conn, TransactionCoordinator::new())
    }

    /// Open a session whose transaction boundaries belong to an ambient
    /// transaction manager; it never sends BEGIN, COMMIT or ROLLBACK.
    pub fn open_in_external_transaction<C: Connection>(&self, conn: C) -> Session<C> {
        Session::build(self, conn, TransactionCoordinator::external())
    }

    /// Like [`SessionFactory::open_in_external_transaction`], but the
    /// connection is requested from `supplier` when the session issues its
    /// first statement.
    pub fn open_in_external_transaction_with<S: ConnectionSupplier>(
        &self,
        supplier: S,
    ) -> Session<LazyConnection<S>> {
        Session::build(self, LazyConnection::new(supplier), TransactionCoordinator::external())
    }

    /// Open a session without an identity map.
    pub fn open_stateless<C: Connection>(&self, conn: C) -> StatelessSession<C> {
        StatelessSession::new(conn, &self.config, self.sequences.clone())
    }
}

// ============================================================================
// Session
// ============================================================================

/// Lifecycle state of an instance relative to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceState {
    /// Never persisted; unknown to the session.
    Transient,
    /// This exact instance is managed.
    Managed,
    /// This exact instance is scheduled for deletion.
    Removed,
    /// Has a persistent identity but is not the managed instance.
    Detached,
}

/// The unit of work.
///
/// Methods take `&mut self`: operations on one session never interleave.
pub struct Session<C: Connection> {
    conn: BatchingConnection<C>,
    context: PersistenceContext,
    queue: ActionQueue,
    pipeline: Arc<EventPipeline>,
    transaction: TransactionCoordinator,
    config: SessionConfig,
    dialect: Dialect,
    statements: StatementCache,
    sequences: SequenceRegistry,
    owner: ThreadId,
    closed: bool,
    flushing: bool,
    /// Set when a flush failed and its writes were discarded.
    failed: bool,
    counters: Counters,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("context", &self.context.id())
            .field("entities", &self.context.len())
            .field("pending_actions", &self.queue.len())
            .field("transaction", &self.transaction.status())
            .field("dialect", &self.dialect)
            .field("closed", &self.closed)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    /// Open a session with default configuration and no listeners.
    pub fn new(conn: C) -> Self {
        SessionFactory::default().open(conn)
    }

    fn build(factory: &SessionFactory, conn: C, transaction: TransactionCoordinator) -> Self {
        let config = factory.config.clone();
        let dialect = config.dialect.unwrap_or_else(|| conn.dialect());
        tracing::debug!(
            dialect = ?dialect,
            batch_size = config.batch_size,
            external = transaction.is_externally_managed(),
            "Opening session"
        );
        Self {
            conn: BatchingConnection::new(conn, config.batch_size),
            context: PersistenceContext::new(config.default_read_only),
            queue: ActionQueue::new(),
            pipeline: Arc::clone(&factory.pipeline),
            transaction,
            statements: StatementCache::new(config.statement_cache_size),
            sequences: factory.sequences.clone(),
            config,
            dialect,
            owner: std::thread::current().id(),
            closed: false,
            flushing: false,
            failed: false,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The underlying connection.
    pub fn connection(&self) -> &C {
        self.conn.inner()
    }

    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn transaction(&self) -> &TransactionCoordinator {
        &self.transaction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Did a flush fail since the state was last discarded?
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    // ========================================================================
    // Guards
    // ========================================================================

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
    fn check_open(&self) -> Result<()> {
        self.check_thread()?;
        if self.closed {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Closed,
                message: "session is closed".to_string(),
                source: None,
            }));
        }
        Ok(())
    }

    /// After a failed flush only the operations that discard state
    /// (`rollback`, `commit` of the marked transaction, `clear`, `close`)
    /// are accepted.
    #[allow(clippy::result_large_err)]
    fn check_usable(&self) -> Result<()> {
        self.check_open()?;
        if self.failed {
            return Err(Error::validation(
                ValidationErrorKind::InvalidState,
                "a flush failed and its pending writes were discarded; \
                 roll back, clear or close the session",
            ));
        }
        Ok(())
    }

    /// Entry check of every async operation that does work.
    async fn prepare(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.prepare_cleanup(cx).await);
        try_result!(self.check_usable());
        Outcome::Ok(())
    }

    /// Entry check of the operations that end a transaction or the session.
    ///
    /// Also finishes the cleanup of an operation whose future was dropped:
    /// a transaction abandoned by [`Session::with_transaction`] is rolled
    /// back here, and raised depth counters are reset.
    async fn prepare_cleanup(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if let Err(e) = self.check_open() {
            return Outcome::Err(e);
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }
        if self.context.reset_depths() || self.flushing {
            tracing::warn!("Previous operation was interrupted; resetting session state");
            self.flushing = false;
        }
        if self.transaction.take_rollback_pending() {
            tracing::warn!("Rolling back abandoned transaction");
            self.discard_state();
            match self.conn.rollback(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Shared helpers
    // ========================================================================

    pub(crate) fn instance_state(&self, instance: &AnyEntityRef) -> InstanceState {
        if let Some(entry) = self.context.entry_of(instance) {
            return if entry.is_removed() {
                InstanceState::Removed
            } else {
                InstanceState::Managed
            };
        }
        let Some(key) = instance.key() else {
            return InstanceState::Transient;
        };
        if self.context.get(&key).is_some() {
            return InstanceState::Detached;
        }
        match instance.metadata().id_strategy {
            tessera_core::IdStrategy::Assigned => InstanceState::Transient,
            _ => InstanceState::Detached,
        }
    }

    fn persister(&self, meta: EntityMetadata) -> EntityPersister {
        EntityPersister::new(meta, self.dialect)
    }

    /// Native form of an intermediate statement.
    #[allow(clippy::result_large_err)]
    fn native(&mut self, statement: &BoundStatement) -> Result<String> {
        self.statements
            .native(self.dialect, &statement.sql, statement.params.len())
    }

    /// Run a SELECT through the statement cache.
    async fn select(&mut self, cx: &Cx, statement: &BoundStatement) -> Outcome<Vec<Row>, Error> {
        let sql = try_result!(self.native(statement));
        self.counters.queries += 1;
        tracing::trace!(sql = %sql, "Executing query");
        self.conn.query(cx, &sql, &statement.params).await
    }

    /// Point unresolved to-one associations at instances this session manages.
    fn link_associations(&self, instance: &AnyEntityRef) {
        for (info, target) in instance.associations() {
            if let AssociationTarget::Unresolved(key) = target {
                if let Some(managed) = self.context.get(&key) {
                    let _ = instance
                        .set_association(info.name, AssociationTarget::Resolved(managed.clone()));
                }
            }
        }
    }

    /// Turn a row into the managed instance for its key.
    ///
    /// An instance already managed under the row's key is returned untouched
    /// and the row is ignored. Returns the instance and whether it is new to
    /// the context.
    #[allow(clippy::result_large_err)]
    fn materialize(
        &mut self,
        meta: &EntityMetadata,
        row: &Row,
        read_only: bool,
    ) -> Result<(AnyEntityRef, bool)> {
        if let Some(id) = row.get_by_name(meta.id_column).filter(|v| !v.is_null()) {
            let key = EntityKey::new(meta.name, id.clone());
            if let Some(existing) = self.context.get(&key) {
                return Ok((existing.clone(), false));
            }
        }
        let instance = meta.instantiate(row)?;
        let key = instance.key().ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::InvalidIdentifier,
                format!("row for {} has no identifier", meta.name),
            )
        })?;
        self.link_associations(&instance);
        let state = instance.values();
        let read_only = read_only || self.context.is_default_read_only();
        let entry = self.context.put(key, instance.clone(), Some(state))?;
        if read_only {
            entry.set_status(EntityStatus::ReadOnly);
        }
        Ok((instance, true))
    }

    #[allow(clippy::result_large_err)]
    fn downcast<E: Entity>(instance: &AnyEntityRef) -> Result<EntityRef<E>> {
        instance.downcast::<E>().ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::ResultType,
                format!(
                    "expected {} but the result is a {}",
                    E::ENTITY_NAME,
                    instance.entity_name()
                ),
            )
        })
    }

    // ========================================================================
    // Context operations
    // ========================================================================

    /// Is this exact instance managed by the session (and not removed)?
    #[allow(clippy::result_large_err)]
    pub fn contains<E: Entity>(&self, entity: &EntityRef<E>) -> Result<bool> {
        self.check_usable()?;
        Ok(self.context.contains(&entity.erase()))
    }

    /// Stop managing an instance. Pending writes for it are discarded.
    ///
    /// Cascades along associations marked for detach.
    #[allow(clippy::result_large_err)]
    pub fn detach<E: Entity>(&mut self, entity: &EntityRef<E>) -> Result<()> {
        self.check_usable()?;
        let mut visited = HashSet::new();
        self.detach_any(&entity.erase(), &mut visited);
        Ok(())
    }

    fn detach_any(&mut self, instance: &AnyEntityRef, visited: &mut HashSet<usize>) {
        if !visited.insert(instance.address()) {
            return;
        }
        let Some(key) = self.context.entry_of(instance).map(|e| e.key().clone()) else {
            return;
        };
        for (info, target) in instance.associations() {
            if let (true, Some(target)) = (info.cascades(CascadeAction::Detach), target.resolved()) {
                self.detach_any(target, visited);
            }
        }
        for (info, elements) in instance.collections() {
            if info.cascades(CascadeAction::Detach) {
                for element in elements.into_iter().flatten() {
                    self.detach_any(&element, visited);
                }
            }
        }
        tracing::debug!(entity = %key, "Detaching");
        self.queue.discard(&key);
        self.context.remove(&key);
    }

    /// Detach every instance and discard every pending write.
    #[allow(clippy::result_large_err)]
    pub fn clear(&mut self) -> Result<()> {
        self.check_open()?;
        tracing::debug!(entities = self.context.len(), "Clearing session");
        self.discard_state();
        Ok(())
    }

    /// Mark a managed instance read-only (never dirty-checked) or modifiable.
    #[allow(clippy::result_large_err)]
    pub fn set_read_only<E: Entity>(&mut self, entity: &EntityRef<E>, read_only: bool) -> Result<()> {
        self.check_usable()?;
        let instance = entity.erase();
        let key = self
            .context
            .entry_of(&instance)
            .map(|e| e.key().clone())
            .ok_or_else(|| {
                Error::validation(
                    ValidationErrorKind::Detached,
                    format!("{} instance is not managed by this session", E::ENTITY_NAME),
                )
            })?;
        self.context.set_read_only(&key, read_only)
    }

    /// Load entities as read-only by default from now on.
    #[allow(clippy::result_large_err)]
    pub fn set_default_read_only(&mut self, read_only: bool) -> Result<()> {
        self.check_usable()?;
        self.context.set_default_read_only(read_only);
        Ok(())
    }

    /// Would a flush write anything?
    #[allow(clippy::result_large_err)]
    pub fn is_dirty(&self) -> Result<bool> {
        self.check_usable()?;
        Ok(!self.queue.is_empty() || !self.pending_tables().is_empty())
    }

    /// A reference to `E#id` without a round trip.
    ///
    /// Returns the managed instance when there is one; otherwise an
    /// unresolved association that [`Session::resolve`] loads on demand.
    #[allow(clippy::result_large_err)]
    pub fn get_reference<E: Entity>(
        &mut self,
        id: impl Into<tessera_core::Value>,
    ) -> Result<tessera_core::Association<E>> {
        self.check_usable()?;
        let key = EntityKey::of::<E>(id);
        if let Some(instance) = self.context.get(&key) {
            return Ok(tessera_core::Association::Resolved(Self::downcast::<E>(instance)?));
        }
        self.context.add_proxy(key.clone());
        Ok(tessera_core::Association::Unresolved(key))
    }

    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            entity_count: self.context.len(),
            collection_count: self.context.collection_count(),
            pending_actions: self.queue.len(),
            flushes: self.counters.flushes,
            statements: self.conn.statement_count(),
            batches: self.conn.batch_count(),
            queries: self.counters.queries,
            transactions: self.transaction.transaction_count(),
            bulk_affected_tables: self.counters.bulk_affected_tables.clone(),
        }
    }

    /// A stateless session on this session's connection.
    ///
    /// It borrows the session, so the two never use the connection at the
    /// same time.
    pub fn stateless(&self) -> StatelessSession<&BatchingConnection<C>> {
        StatelessSession::new(&self.conn, &self.config, self.sequences.clone())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// A query over statement text with `?` and `:name` markers.
    pub fn create_query(&self, text: impl Into<String>) -> Query {
        Query::native(text)
    }

    /// A query over backend SQL; `synchronized_tables` still apply for auto-flush.
    pub fn create_native_query(&self, sql: impl Into<String>) -> Query {
        Query::native(sql)
    }

    pub fn create_criteria_query(&self, criteria: Criteria) -> Query {
        Query::criteria(criteria)
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn begin(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.prepare(cx).await);
        self.transaction.begin(cx, &self.conn).await
    }

    /// Flush (unless the flush mode is manual) and commit.
    ///
    /// A transaction marked for rollback is rolled back instead and the
    /// commit fails. Whenever the transaction ends rolled back, the
    /// persistence context is cleared.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.prepare_cleanup(cx).await);
        self.commit_inner(cx).await
    }

    async fn commit_inner(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if !self.transaction.is_active() {
            return Outcome::Err(Error::transaction(
                tessera_core::TransactionErrorKind::NotActive,
                "no transaction is active",
            ));
        }
        if self.failed {
            let _ = self.transaction.mark_rollback_only();
        }
        if !self.transaction.is_marked_for_rollback()
            && self.config.flush_mode != tessera_query::FlushMode::Manual
        {
            if let Outcome::Err(e) = self.flush_inner(cx).await {
                let _ = self.rollback_inner(cx).await;
                return Outcome::Err(e);
            }
        }
        let outcome = self.transaction.commit(cx, &self.conn).await;
        if self.transaction.status() == TransactionStatus::RolledBack {
            self.discard_state();
        }
        outcome
    }

    /// Roll back, discard pending writes and clear the persistence context.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.prepare_cleanup(cx).await);
        if !self.transaction.is_active() {
            return Outcome::Err(Error::transaction(
                tessera_core::TransactionErrorKind::NotActive,
                "no transaction is active",
            ));
        }
        self.rollback_inner(cx).await
    }

    /// Roll back without checking for cancellation; cleanup must run even
    /// when the caller has been cancelled.
    async fn rollback_inner(&mut self, cx: &Cx) -> Outcome<(), Error> {
        self.conn.abort_batch();
        let outcome = if self.transaction.is_active() {
            self.transaction.rollback(cx, &self.conn).await
        } else {
            Outcome::Ok(())
        };
        self.discard_state();
        outcome
    }

    fn discard_state(&mut self) {
        self.queue.clear();
        self.context.clear();
        self.failed = false;
    }

    /// Forbid the current transaction from committing.
    #[allow(clippy::result_large_err)]
    pub fn mark_rollback_only(&self) -> Result<()> {
        self.check_thread()?;
        self.transaction.mark_rollback_only()
    }

    /// Run `work` in a transaction.
    ///
    /// The transaction always ends before this returns: it commits when
    /// `work` succeeds, and rolls back when `work` fails, is cancelled,
    /// panics, or marks the transaction for rollback (in which case the
    /// value of `work` is still returned). If this future is dropped while
    /// `work` is running, after-completion callbacks run immediately with
    /// [`TransactionStatus::RolledBack`] and the ROLLBACK is sent at the
    /// start of the session's next operation.
    ///
    /// ```ignore
    /// let id = session
    ///     .with_transaction(&cx, |s, cx| {
    ///         Box::pin(async move {
    ///             s.persist(cx, &author).await?;
    ///             Outcome::Ok(author.id())
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_transaction<T, F>(&mut self, cx: &Cx, work: F) -> Outcome<T, Error>
    where
        F: for<'s> FnOnce(&'s mut Session<C>, &'s Cx) -> BoxFuture<'s, Outcome<T, Error>>,
    {
        try_outcome!(self.begin(cx).await);
        let guard = self.transaction.guard();

        let outcome = work(self, cx).await;
        let result = match outcome {
            Outcome::Ok(value) => {
                if self.transaction.is_marked_for_rollback() {
                    tracing::debug!("Work marked the transaction for rollback");
                    match self.rollback_inner(cx).await {
                        Outcome::Ok(()) => Outcome::Ok(value),
                        Outcome::Err(e) => Outcome::Err(e),
                        Outcome::Cancelled(r) => Outcome::Cancelled(r),
                        Outcome::Panicked(p) => Outcome::Panicked(p),
                    }
                } else if let Some(reason) = cx.cancel_reason() {
                    let _ = self.rollback_inner(cx).await;
                    Outcome::Cancelled(reason)
                } else {
                    match self.commit_inner(cx).await {
                        Outcome::Ok(()) => Outcome::Ok(value),
                        Outcome::Err(e) => Outcome::Err(e),
                        Outcome::Cancelled(r) => Outcome::Cancelled(r),
                        Outcome::Panicked(p) => Outcome::Panicked(p),
                    }
                }
            }
            Outcome::Err(e) => {
                let _ = self.rollback_inner(cx).await;
                Outcome::Err(e)
            }
            Outcome::Cancelled(reason) => {
                let _ = self.rollback_inner(cx).await;
                Outcome::Cancelled(reason)
            }
            Outcome::Panicked(payload) => {
                let _ = self.rollback_inner(cx).await;
                Outcome::Panicked(payload)
            }
        };
        guard.disarm();
        result
    }

    /// Run before-commit work for an ambient transaction manager: flush
    /// (unless manual), then the registered before-commit callbacks.
    pub async fn before_completion(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.prepare(cx).await);
        if self.config.flush_mode != tessera_query::FlushMode::Manual {
            if let Outcome::Err(e) = self.flush_inner(cx).await {
                let _ = self.transaction.mark_rollback_only();
                return Outcome::Err(e);
            }
        }
        match self.transaction.before_completion() {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Receive the outcome decided by an ambient transaction manager.
    #[allow(clippy::result_large_err)]
    pub fn after_completion(&mut self, status: TransactionStatus) -> Result<()> {
        self.check_thread()?;
        self.transaction.after_completion(status);
        if status != TransactionStatus::Committed {
            self.discard_state();
        }
        Ok(())
    }

    /// Close the session: roll back an active transaction, drop pending
    /// writes, clear the context and close the connection.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn close(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.prepare_cleanup(cx).await);
        if self.transaction.is_active() {
            let _ = self.rollback_inner(cx).await;
        }
        self.discard_state();
        self.closed = true;
        self.conn.close(cx).await
    }
}
