//! Core types and traits for Tessera.
//!
//! This crate provides the foundational abstractions shared by the query and
//! session layers:
//!
//! - `Entity` trait, identity keys and shared entity handles
//! - `Association` / `Collection` lazy association holders
//! - `Connection` trait for the async database connection
//! - `Dialect` placeholder rewriting
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome};

pub mod association;
pub mod connection;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod field;
pub mod lock;
pub mod row;
pub mod value;

pub use association::{
    Association, AssociationInfo, AssociationKind, AssociationSlot, AssociationTarget, Cascade,
    CascadeAction, Collection, CollectionSlot, LinkTableInfo,
};
pub use connection::Connection;
pub use dialect::{Dialect, ParameterToken, scan_parameters};
pub use entity::{
    AnyEntityRef, Entity, EntityKey, EntityMetadata, EntityRef, FieldValues, IdStrategy,
    ManagedEntity,
};
pub use error::{
    EntityNotFoundError, Error, Result, StaleStateError, ThreadAffinityError, TransactionErrorKind,
    ValidationError, ValidationErrorKind,
};
pub use field::FieldInfo;
pub use lock::LockMode;
pub use row::{FromValue, Row};
pub use value::Value;

/// Unwrap an `Outcome`, returning early from the enclosing async fn on
/// `Err`, `Cancelled` or `Panicked`.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(err) => return $crate::Outcome::Err(err),
            $crate::Outcome::Cancelled(reason) => return $crate::Outcome::Cancelled(reason),
            $crate::Outcome::Panicked(payload) => return $crate::Outcome::Panicked(payload),
        }
    };
}

/// Unwrap a `Result<T, Error>` inside a function returning `Outcome`.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(err) => return $crate::Outcome::Err(err),
        }
    };
}
