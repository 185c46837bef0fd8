//! Query definitions and parameter binding for Tessera.
//!
//! `tessera-query` is the **query definition layer**. It turns what a caller
//! asks for into a statement the session can execute:
//!
//! - **Query**: native statement text or a structured `Criteria`, plus
//!   bindings, pagination, lock mode and flush mode.
//! - **Binding**: positional and named parameters, with list parameters
//!   expanded into one placeholder per element.
//! - **Intermediate form**: every statement is rendered with bare `?`
//!   markers and rewritten into native syntax by the connection's `Dialect`.
//! - **Table extraction**: the tables a native statement reads or modifies,
//!   used for auto-flush and bulk-operation cleanup.
//!
//! Execution lives in `tessera-session`; nothing here touches a connection.

pub mod bind;
pub mod cache;
pub mod criteria;
pub mod params;
pub mod query;
pub mod tables;

pub use bind::{BoundStatement, expand};
pub use cache::{StatementCache, cache_key};
pub use criteria::{Comparison, Criteria, OrderDirection, Restriction};
pub use params::{Binding, Parameters};
pub use query::{FlushMode, Query, QuerySource};
pub use tables::{modified_table, referenced_tables};
