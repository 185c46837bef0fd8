//! Tessera - an asynchronous unit-of-work persistence engine.
//!
//! Tessera lets a caller load, change and query entities backed by a
//! relational store without ever blocking the calling task:
//!
//! - An identity map per [`Session`]: one instance per row
//! - Dirty checking against load-time snapshots
//! - Cascading persist, merge, remove, refresh and lock
//! - Dependency-ordered, batched flushes
//! - Optimistic versioning and pessimistic row locks
//! - Auto-flush before queries that read pending writes
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::prelude::*;
//!
//! async fn rename(cx: &Cx, conn: impl Connection) -> Outcome<(), Error> {
//!     let factory = SessionFactory::new(SessionConfig::default().with_batch_size(50))?;
//!     let mut session = factory.open(conn);
//!
//!     session
//!         .with_transaction(cx, |session, cx| {
//!             Box::pin(async move {
//!                 let Some(book) = session.find::<Book>(cx, 7_i64).await? else {
//!                     return Outcome::Ok(());
//!                 };
//!                 book.write().title = "Second Edition".into();
//!                 Outcome::Ok(())
//!             })
//!         })
//!         .await
//! }
//! ```
//!
//! Entities implement [`Entity`] by hand: column metadata, identifier
//! access, row conversion and, for associations, the slots that hold
//! [`Association`] and [`Collection`] values.

pub use tessera_core::{
    AnyEntityRef, Association, AssociationInfo, AssociationKind, AssociationSlot,
    AssociationTarget, Budget, Cascade, CascadeAction, Collection, CollectionSlot, Connection, Cx,
    Dialect, Entity, EntityKey, EntityMetadata, EntityNotFoundError, EntityRef, Error,
    FieldInfo, FieldValues, FromValue, IdStrategy, LinkTableInfo, LockMode, ManagedEntity,
    Outcome, Result, Row, StaleStateError, ThreadAffinityError, TransactionErrorKind,
    ValidationError, ValidationErrorKind, Value, try_outcome, try_result,
};

pub use tessera_query::{
    BoundStatement, Comparison, Criteria, FlushMode, OrderDirection, Query, Restriction,
};

pub use tessera_session::{
    BatchedStatement, BatchingConnection, BoxFuture, Callback, ConnectionSupplier,
    EntityListener, EntityStatus, EventKind, EventPipeline, LazyConnection, PersistenceContext,
    SequenceGenerator, SequenceRegistry, Session, SessionConfig, SessionFactory,
    SessionStatistics, Stage, StatelessSession, TransactionStatus,
};

/// The types most programs need.
pub mod prelude {
    pub use crate::{
        // asupersync
        Budget,
        Cx,
        Outcome,
        // Mapping
        Association,
        AssociationInfo,
        Cascade,
        Collection,
        Entity,
        EntityRef,
        FieldInfo,
        FieldValues,
        IdStrategy,
        LinkTableInfo,
        // Connection and values
        Connection,
        Dialect,
        Error,
        LockMode,
        Result,
        Row,
        Value,
        // Queries
        Criteria,
        FlushMode,
        Query,
        Restriction,
        // Sessions
        EntityListener,
        EventPipeline,
        Session,
        SessionConfig,
        SessionFactory,
        StatelessSession,
        // Macros
        try_outcome,
        try_result,
    };
}
