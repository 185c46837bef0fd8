//! Connections acquired on first use.
//!
//! A session joined to an ambient transaction often should not hold a
//! physical connection until it actually talks to the database; the ambient
//! manager hands one out when asked. [`LazyConnection`] asks a
//! [`ConnectionSupplier`] on the first statement and keeps the connection
//! for the rest of its life.

use asupersync::{Cx, Outcome};
use std::sync::OnceLock;
use tessera_core::{Connection, Dialect, Error, Row, Value, try_outcome};

/// Hands out the connection of an ambient transaction.
pub trait ConnectionSupplier: Send + Sync {
    type Connection: Connection;

    /// Dialect of the connections this supplier hands out.
    fn dialect(&self) -> Dialect {
        Dialect::default()
    }

    /// Acquire the connection. Called at most once per [`LazyConnection`]
    /// unless a previous attempt failed.
    fn acquire(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send;
}

/// A [`Connection`] that acquires its physical connection on first use.
pub struct LazyConnection<S: ConnectionSupplier> {
    supplier: S,
    dialect: Dialect,
    conn: OnceLock<S::Connection>,
}

impl<S: ConnectionSupplier> std::fmt::Debug for LazyConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyConnection")
            .field("dialect", &self.dialect)
            .field("acquired", &self.is_acquired())
            .finish_non_exhaustive()
    }
}

impl<S: ConnectionSupplier> LazyConnection<S> {
    pub fn new(supplier: S) -> Self {
        let dialect = supplier.dialect();
        Self {
            supplier,
            dialect,
            conn: OnceLock::new(),
        }
    }

    pub fn supplier(&self) -> &S {
        &self.supplier
    }

    pub fn is_acquired(&self) -> bool {
        self.conn.get().is_some()
    }

    /// The physical connection, if one has been acquired.
    pub fn get(&self) -> Option<&S::Connection> {
        self.conn.get()
    }

    async fn connection(&self, cx: &Cx) -> Outcome<&S::Connection, Error> {
        if let Some(conn) = self.conn.get() {
            return Outcome::Ok(conn);
        }
        let conn = try_outcome!(self.supplier.acquire(cx).await);
        tracing::debug!(dialect = ?self.dialect, "Acquired connection from supplier");
        Outcome::Ok(self.conn.get_or_init(|| conn))
    }
}

impl<S: ConnectionSupplier> Connection for LazyConnection<S> {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        async move {
            let conn = try_outcome!(self.connection(cx).await);
            conn.query(cx, sql, params).await
        }
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        async move {
            let conn = try_outcome!(self.connection(cx).await);
            conn.execute(cx, sql, params).await
        }
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        async move {
            let conn = try_outcome!(self.connection(cx).await);
            conn.insert(cx, sql, params).await
        }
    }

    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        async move {
            let conn = try_outcome!(self.connection(cx).await);
            conn.batch(cx, statements).await
        }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let conn = try_outcome!(self.connection(cx).await);
            conn.begin(cx).await
        }
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let conn = try_outcome!(self.connection(cx).await);
            conn.commit(cx).await
        }
    }

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let conn = try_outcome!(self.connection(cx).await);
            conn.rollback(cx).await
        }
    }

    /// Closes the physical connection if one was ever acquired.
    fn close(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            match self.conn.get() {
                Some(conn) => conn.close(cx).await,
                None => Outcome::Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockConnection, expect_err, tag, unwrap_outcome};
    use crate::{SessionFactory, TransactionStatus};
    use asupersync::runtime::RuntimeBuilder;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tessera_core::error::{ConnectionError, ConnectionErrorKind};

    #[derive(Clone)]
    struct Ambient {
        conn: MockConnection,
        acquired: Arc<AtomicUsize>,
        available: bool,
    }

    impl Ambient {
        fn new(conn: &MockConnection) -> Self {
            Self {
                conn: conn.clone(),
                acquired: Arc::new(AtomicUsize::new(0)),
                available: true,
            }
        }
    }

    impl ConnectionSupplier for Ambient {
        type Connection = MockConnection;

        fn dialect(&self) -> Dialect {
            self.conn.dialect()
        }

        fn acquire(&self, _cx: &Cx) -> impl Future<Output = Outcome<MockConnection, Error>> + Send {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            let result = if self.available {
                Outcome::Ok(self.conn.clone())
            } else {
                Outcome::Err(Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: "no ambient transaction".to_string(),
                    source: None,
                }))
            };
            async move { result }
        }
    }

    fn runtime() -> asupersync::runtime::Runtime {
        RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime")
    }

    #[test]
    fn connection_is_acquired_on_first_statement() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let ambient = Ambient::new(&conn);
        let acquired = Arc::clone(&ambient.acquired);
        let mut session = SessionFactory::default().open_in_external_transaction_with(ambient);

        rt.block_on(async {
            unwrap_outcome(session.begin(&cx).await);
            unwrap_outcome(session.persist(&cx, &tag(1, "a")).await);
            assert_eq!(acquired.load(Ordering::SeqCst), 0);
            assert!(!session.connection().is_acquired());

            unwrap_outcome(session.before_completion(&cx).await);
            assert_eq!(acquired.load(Ordering::SeqCst), 1);

            unwrap_outcome(session.persist(&cx, &tag(2, "b")).await);
            unwrap_outcome(session.flush(&cx).await);
            session.after_completion(TransactionStatus::Committed).unwrap();
        });

        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(conn.statements().len(), 2);
        assert!(conn.control().is_empty());
    }

    #[test]
    fn closing_an_unused_session_acquires_nothing() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let ambient = Ambient::new(&conn);
        let acquired = Arc::clone(&ambient.acquired);
        let mut session = SessionFactory::default().open_in_external_transaction_with(ambient);

        rt.block_on(async {
            unwrap_outcome(session.close(&cx).await);
        });
        assert_eq!(acquired.load(Ordering::SeqCst), 0);
        assert!(!conn.is_closed());
    }

    #[test]
    fn supplier_failure_fails_the_statement() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let ambient = Ambient {
            available: false,
            ..Ambient::new(&conn)
        };
        let lazy = LazyConnection::new(ambient);

        rt.block_on(async {
            let err = expect_err(lazy.execute(&cx, "DELETE FROM tags", &[]).await);
            assert!(matches!(err, Error::Connection(_)));
        });
        assert!(!lazy.is_acquired());
        assert!(conn.statements().is_empty());
    }
}
