//! Statement batching on top of a [`Connection`].
//!
//! [`BatchingConnection`] collects consecutive statements with identical SQL
//! text and submits them in one round trip once `batch_size` of them are
//! waiting, or when a statement with different text arrives, or when the
//! caller asks for the batch to be executed. Relative order of all statements
//! is preserved.
//!
//! Any other use of the connection (a query, a plain execute, a commit)
//! executes the pending batch first, so callers never observe a statement
//! running ahead of writes that were submitted before it.

use asupersync::{Cx, Outcome};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tessera_core::{Connection, Dialect, Error, Result, Row, StaleStateError, Value, try_outcome};

/// A statement waiting in a batch, already in native placeholder syntax.
#[derive(Debug, Clone)]
pub struct BatchedStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Rows the statement must affect; `None` skips the check.
    pub expected_rows: Option<u64>,
    /// Entity and identifier reported when the row check fails.
    pub entity: &'static str,
    pub id: Value,
}

impl BatchedStatement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            expected_rows: None,
            entity: "",
            id: Value::Null,
        }
    }

    /// Require exactly `rows` affected rows, reporting `entity#id` otherwise.
    pub fn expect_rows(mut self, rows: u64, entity: &'static str, id: Value) -> Self {
        self.expected_rows = Some(rows);
        self.entity = entity;
        self.id = id;
        self
    }

    #[allow(clippy::result_large_err)]
    fn check(&self, actual: u64) -> Result<()> {
        match self.expected_rows {
            Some(expected) if expected != actual => Err(Error::StaleState(StaleStateError {
                entity: self.entity,
                id: self.id.clone(),
                sql: self.sql.clone(),
                expected_rows: expected,
                actual_rows: actual,
            })),
            _ => Ok(()),
        }
    }
}

/// Connection decorator that coalesces identical statements into batches.
#[derive(Debug)]
pub struct BatchingConnection<C> {
    inner: C,
    batch_size: usize,
    pending: Mutex<Vec<BatchedStatement>>,
    statements: AtomicU64,
    batches: AtomicU64,
}

impl<C: Connection> BatchingConnection<C> {
    /// Wrap `inner`; a `batch_size` of 1 or less executes every statement directly.
    pub fn new(inner: C, batch_size: usize) -> Self {
        Self {
            inner,
            batch_size,
            pending: Mutex::new(Vec::new()),
            statements: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        }
    }

    /// Change the batch size. Statements already waiting stay queued.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn set_batch_size(&mut self, batch_size: usize) {
        self.batch_size = batch_size;
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }

    /// Statements executed so far, counting each statement of a batch.
    pub fn statement_count(&self) -> u64 {
        self.statements.load(Ordering::Relaxed)
    }

    /// Batches submitted so far.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<BatchedStatement>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Submit a statement, batching it with its predecessors when possible.
    pub async fn add_to_batch(&self, cx: &Cx, statement: BatchedStatement) -> Outcome<(), Error> {
        if self.batch_size <= 1 {
            return self.execute_single(cx, statement).await;
        }

        let boundary = self
            .lock_pending()
            .first()
            .is_some_and(|first| first.sql != statement.sql);
        if boundary {
            try_outcome!(self.execute_batch(cx).await);
        }

        let full = {
            let mut pending = self.lock_pending();
            pending.push(statement);
            pending.len() >= self.batch_size
        };
        if full {
            return self.execute_batch(cx).await;
        }
        Outcome::Ok(())
    }

    async fn execute_single(&self, cx: &Cx, statement: BatchedStatement) -> Outcome<(), Error> {
        tracing::trace!(sql = %statement.sql, "Executing statement");
        let rows = try_outcome!(self.inner.execute(cx, &statement.sql, &statement.params).await);
        self.statements.fetch_add(1, Ordering::Relaxed);
        match statement.check(rows) {
            Ok(()) => Outcome::Ok(()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Submit every waiting statement in one round trip.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn execute_batch(&self, cx: &Cx) -> Outcome<(), Error> {
        let batch = std::mem::take(&mut *self.lock_pending());
        if batch.is_empty() {
            return Outcome::Ok(());
        }
        if let Some(reason) = cx.cancel_reason() {
            return Outcome::Cancelled(reason);
        }

        let statements: Vec<(String, Vec<Value>)> = batch
            .iter()
            .map(|s| (s.sql.clone(), s.params.clone()))
            .collect();
        tracing::debug!(
            batch_size = batch.len(),
            sql = %batch[0].sql,
            "Executing batch"
        );

        let counts = match self.inner.batch(cx, &statements).await {
            Outcome::Ok(counts) => counts,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.statements
            .fetch_add(batch.len() as u64, Ordering::Relaxed);

        if counts.len() != batch.len() {
            return Outcome::Err(Error::Custom(format!(
                "batch of {} statements returned {} row counts",
                batch.len(),
                counts.len()
            )));
        }
        for (statement, actual) in batch.iter().zip(counts) {
            if let Err(e) = statement.check(actual) {
                return Outcome::Err(e);
            }
        }
        Outcome::Ok(())
    }

    /// Discard waiting statements without executing them.
    pub fn abort_batch(&self) -> usize {
        let discarded = std::mem::take(&mut *self.lock_pending()).len();
        if discarded > 0 {
            tracing::debug!(discarded, "Aborted pending batch");
        }
        discarded
    }
}

impl<C: Connection> Connection for BatchingConnection<C> {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        async move {
            try_outcome!(self.execute_batch(cx).await);
            self.inner.query(cx, sql, params).await
        }
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        async move {
            try_outcome!(self.execute_batch(cx).await);
            let rows = try_outcome!(self.inner.execute(cx, sql, params).await);
            self.statements.fetch_add(1, Ordering::Relaxed);
            Outcome::Ok(rows)
        }
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        async move {
            try_outcome!(self.execute_batch(cx).await);
            let id = try_outcome!(self.inner.insert(cx, sql, params).await);
            self.statements.fetch_add(1, Ordering::Relaxed);
            Outcome::Ok(id)
        }
    }

    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        async move {
            try_outcome!(self.execute_batch(cx).await);
            let counts = try_outcome!(self.inner.batch(cx, statements).await);
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.statements
                .fetch_add(statements.len() as u64, Ordering::Relaxed);
            Outcome::Ok(counts)
        }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            try_outcome!(self.execute_batch(cx).await);
            self.inner.begin(cx).await
        }
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            try_outcome!(self.execute_batch(cx).await);
            self.inner.commit(cx).await
        }
    }

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.abort_batch();
        self.inner.rollback(cx)
    }

    fn close(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.abort_batch();
        self.inner.close(cx)
    }
}
