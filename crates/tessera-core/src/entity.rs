//! Entity trait, identity keys and shared entity handles.
//!
//! An entity is a plain struct implementing [`Entity`]. A session hands out
//! [`EntityRef<E>`] handles: cloning a handle never copies the entity, so two
//! handles to the same managed row are reference-identical
//! ([`EntityRef::ptr_eq`]). Inside the engine handles are type-erased as
//! [`AnyEntityRef`], which exposes the operations the unit of work needs
//! without knowing the concrete type.

use crate::Result;
use crate::association::{AssociationInfo, AssociationSlot, AssociationTarget, CollectionSlot};
use crate::error::{Error, TypeError};
use crate::field::FieldInfo;
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Column values of one entity, in column order.
pub type FieldValues = Vec<(&'static str, Value)>;

/// Identity of a persistent entity: entity name plus identifier value.
///
/// Unique within a persistence context and immutable once created.
#[derive(Debug, Clone, Hash)]
pub struct EntityKey {
    entity: &'static str,
    id: Value,
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id.same_id(&other.id)
    }
}

impl Eq for EntityKey {}

impl EntityKey {
    pub fn new(entity: &'static str, id: impl Into<Value>) -> Self {
        Self {
            entity,
            id: id.into().normalized_id(),
        }
    }

    /// Key for entity type `E`.
    pub fn of<E: Entity>(id: impl Into<Value>) -> Self {
        Self::new(E::ENTITY_NAME, id)
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn id(&self) -> &Value {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// How identifiers are produced for new entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdStrategy {
    /// The caller sets the identifier before `persist`.
    Assigned,
    /// The backend generates the key during INSERT, so the insert runs at persist time.
    Identity,
    /// Identifiers come from a database sequence, `allocation_size` per round trip.
    Sequence {
        name: &'static str,
        allocation_size: u32,
    },
}

/// Static mapping metadata of one entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityMetadata {
    pub name: &'static str,
    pub table: &'static str,
    pub id_column: &'static str,
    pub version_column: Option<&'static str>,
    pub fields: &'static [FieldInfo],
    pub associations: &'static [AssociationInfo],
    pub id_strategy: IdStrategy,
    instantiate: fn(&Row) -> Result<AnyEntityRef>,
}

fn instantiate<E: Entity>(row: &Row) -> Result<AnyEntityRef> {
    Ok(EntityRef::new(E::from_row(row)?).erase())
}

impl EntityMetadata {
    pub fn of<E: Entity>() -> Self {
        Self {
            name: E::ENTITY_NAME,
            table: E::TABLE_NAME,
            id_column: E::ID_COLUMN,
            version_column: E::VERSION_COLUMN,
            fields: E::fields(),
            associations: E::associations(),
            id_strategy: E::id_strategy(),
            instantiate: instantiate::<E>,
        }
    }

    /// Build a new, unmanaged instance of this entity type from a row.
    #[allow(clippy::result_large_err)]
    pub fn instantiate(&self, row: &Row) -> Result<AnyEntityRef> {
        (self.instantiate)(row)
    }

    pub fn association(&self, name: &str) -> Option<&'static AssociationInfo> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn is_versioned(&self) -> bool {
        self.version_column.is_some()
    }

    /// Columns written by INSERT.
    pub fn insert_columns(&self) -> impl Iterator<Item = &'static str> {
        let identity = matches!(self.id_strategy, IdStrategy::Identity);
        let id_column = self.id_column;
        self.fields
            .iter()
            .filter(move |f| f.insertable && !(identity && f.column == id_column))
            .map(|f| f.column)
    }

    /// Columns written by UPDATE (never the identifier or the version).
    pub fn update_columns(&self) -> impl Iterator<Item = &'static str> {
        let id_column = self.id_column;
        let version_column = self.version_column;
        self.fields
            .iter()
            .filter(move |f| {
                f.updatable && f.column != id_column && Some(f.column) != version_column
            })
            .map(|f| f.column)
    }

    /// All mapped columns, in declaration order.
    pub fn columns(&self) -> impl Iterator<Item = &'static str> {
        self.fields.iter().map(|f| f.column)
    }
}

/// A struct mapped to a table.
///
/// Association and collection fields are exposed through slots, in the order
/// their metadata appears in [`Entity::associations`] (to-one slots for
/// many-to-one entries, collection slots for many-to-many entries).
///
/// # Example
///
/// ```ignore
/// #[derive(Clone)]
/// struct Author { id: Option<i64>, name: String }
///
/// impl Entity for Author {
///     const ENTITY_NAME: &'static str = "Author";
///     const TABLE_NAME: &'static str = "authors";
///
///     fn fields() -> &'static [FieldInfo] {
///         const FIELDS: &[FieldInfo] = &[
///             FieldInfo::new("id", "id").primary_key(),
///             FieldInfo::new("name", "name"),
///         ];
///         FIELDS
///     }
///     // id/set_id/values/from_row ...
/// }
/// ```
pub trait Entity: Clone + Send + Sync + 'static {
    const ENTITY_NAME: &'static str;
    const TABLE_NAME: &'static str;
    const ID_COLUMN: &'static str = "id";
    const VERSION_COLUMN: Option<&'static str> = None;

    fn fields() -> &'static [FieldInfo];

    fn associations() -> &'static [AssociationInfo] {
        &[]
    }

    fn id_strategy() -> IdStrategy {
        IdStrategy::Assigned
    }

    /// The identifier, or `None` while unassigned.
    fn id(&self) -> Option<Value>;

    #[allow(clippy::result_large_err)]
    fn set_id(&mut self, id: Value) -> Result<()>;

    /// Current column values, including identifier, version and foreign keys.
    fn values(&self) -> FieldValues;

    #[allow(clippy::result_large_err)]
    fn from_row(row: &Row) -> Result<Self>;

    /// Overwrite in-memory state from a freshly read row.
    #[allow(clippy::result_large_err)]
    fn apply_row(&mut self, row: &Row) -> Result<()> {
        *self = Self::from_row(row)?;
        Ok(())
    }

    fn version(&self) -> Option<i64> {
        None
    }

    fn set_version(&mut self, _version: i64) {}

    fn association_slots(&self) -> Vec<&dyn AssociationSlot> {
        Vec::new()
    }

    fn association_slots_mut(&mut self) -> Vec<&mut dyn AssociationSlot> {
        Vec::new()
    }

    fn collection_slots(&self) -> Vec<&dyn CollectionSlot> {
        Vec::new()
    }

    fn collection_slots_mut(&mut self) -> Vec<&mut dyn CollectionSlot> {
        Vec::new()
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Shared handle to an entity instance.
pub struct EntityRef<E: Entity> {
    inner: Arc<RwLock<E>>,
}

impl<E: Entity> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity + fmt::Debug> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityRef").field(&*self.read()).finish()
    }
}

impl<E: Entity> EntityRef<E> {
    pub fn new(entity: E) -> Self {
        Self {
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the entity with exclusive access.
    pub fn update<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        f(&mut self.write())
    }

    pub fn id(&self) -> Option<Value> {
        self.read().id()
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id().map(EntityKey::of::<E>)
    }

    /// Do both handles point at the same instance?
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn erase(&self) -> AnyEntityRef {
        AnyEntityRef {
            inner: Arc::clone(&self.inner) as Arc<dyn ManagedEntity>,
        }
    }

    /// Copy of the current state, detached from this handle.
    pub fn snapshot(&self) -> E {
        self.read().clone()
    }
}

/// Operations the unit of work performs on an entity without knowing its type.
pub trait ManagedEntity: Send + Sync {
    fn metadata(&self) -> EntityMetadata;
    fn id(&self) -> Option<Value>;
    #[allow(clippy::result_large_err)]
    fn set_id(&self, id: Value) -> Result<()>;
    fn values(&self) -> FieldValues;
    #[allow(clippy::result_large_err)]
    fn apply_row(&self, row: &Row) -> Result<()>;
    fn version(&self) -> Option<i64>;
    fn set_version(&self, version: i64);
    /// Many-to-one targets, paired with their metadata.
    fn associations(&self) -> Vec<(&'static AssociationInfo, AssociationTarget)>;
    #[allow(clippy::result_large_err)]
    fn set_association(&self, name: &str, target: AssociationTarget) -> Result<()>;
    /// Many-to-many collections, paired with their metadata.
    fn collections(&self) -> Vec<(&'static AssociationInfo, Option<Vec<AnyEntityRef>>)>;
    #[allow(clippy::result_large_err)]
    fn set_collection(&self, name: &str, elements: Vec<AnyEntityRef>) -> Result<()>;
    fn invalidate_collection(&self, name: &str);
    /// Overwrite this instance's state with another instance of the same type.
    #[allow(clippy::result_large_err)]
    fn copy_state_from(&self, other: &AnyEntityRef) -> Result<()>;
    /// A new, unshared instance with the same state.
    fn duplicate(&self) -> AnyEntityRef;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

fn to_one<E: Entity>() -> impl Iterator<Item = &'static AssociationInfo> {
    E::associations().iter().filter(|a| !a.is_collection())
}

fn to_many<E: Entity>() -> impl Iterator<Item = &'static AssociationInfo> {
    E::associations().iter().filter(|a| a.is_collection())
}

fn unknown_association<E: Entity>(name: &str) -> Error {
    Error::Custom(format!("{} has no association named '{name}'", E::ENTITY_NAME))
}

impl<E: Entity> ManagedEntity for RwLock<E> {
    fn metadata(&self) -> EntityMetadata {
        EntityMetadata::of::<E>()
    }

    fn id(&self) -> Option<Value> {
        self.read().unwrap_or_else(PoisonError::into_inner).id()
    }

    fn set_id(&self, id: Value) -> Result<()> {
        self.write().unwrap_or_else(PoisonError::into_inner).set_id(id)
    }

    fn values(&self) -> FieldValues {
        self.read().unwrap_or_else(PoisonError::into_inner).values()
    }

    fn apply_row(&self, row: &Row) -> Result<()> {
        self.write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply_row(row)
    }

    fn version(&self) -> Option<i64> {
        self.read().unwrap_or_else(PoisonError::into_inner).version()
    }

    fn set_version(&self, version: i64) {
        self.write()
            .unwrap_or_else(PoisonError::into_inner)
            .set_version(version);
    }

    fn associations(&self) -> Vec<(&'static AssociationInfo, AssociationTarget)> {
        let guard = self.read().unwrap_or_else(PoisonError::into_inner);
        to_one::<E>()
            .zip(guard.association_slots())
            .map(|(info, slot)| (info, slot.target()))
            .collect()
    }

    fn set_association(&self, name: &str, target: AssociationTarget) -> Result<()> {
        let mut guard = self.write().unwrap_or_else(PoisonError::into_inner);
        let slot = to_one::<E>()
            .zip(guard.association_slots_mut())
            .find(|(info, _)| info.name == name)
            .map(|(_, slot)| slot)
            .ok_or_else(|| unknown_association::<E>(name))?;
        slot.assign(target)
    }

    fn collections(&self) -> Vec<(&'static AssociationInfo, Option<Vec<AnyEntityRef>>)> {
        let guard = self.read().unwrap_or_else(PoisonError::into_inner);
        to_many::<E>()
            .zip(guard.collection_slots())
            .map(|(info, slot)| (info, slot.elements()))
            .collect()
    }

    fn set_collection(&self, name: &str, elements: Vec<AnyEntityRef>) -> Result<()> {
        let mut guard = self.write().unwrap_or_else(PoisonError::into_inner);
        let slot = to_many::<E>()
            .zip(guard.collection_slots_mut())
            .find(|(info, _)| info.name == name)
            .map(|(_, slot)| slot)
            .ok_or_else(|| unknown_association::<E>(name))?;
        slot.initialize(elements)
    }

    fn invalidate_collection(&self, name: &str) {
        let mut guard = self.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, slot)) = to_many::<E>()
            .zip(guard.collection_slots_mut())
            .find(|(info, _)| info.name == name)
        {
            slot.invalidate();
        }
    }

    fn copy_state_from(&self, other: &AnyEntityRef) -> Result<()> {
        let source = other.downcast::<E>().ok_or_else(|| {
            Error::Type(TypeError {
                expected: E::ENTITY_NAME,
                actual: other.entity_name().to_string(),
                column: None,
                rust_type: Some(std::any::type_name::<E>()),
            })
        })?;
        let state = source.snapshot();
        *self.write().unwrap_or_else(PoisonError::into_inner) = state;
        Ok(())
    }

    fn duplicate(&self) -> AnyEntityRef {
        let state = self.read().unwrap_or_else(PoisonError::into_inner).clone();
        EntityRef::new(state).erase()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Type-erased entity handle.
#[derive(Clone)]
pub struct AnyEntityRef {
    inner: Arc<dyn ManagedEntity>,
}

impl fmt::Debug for AnyEntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyEntityRef")
            .field("entity", &self.entity_name())
            .field("id", &self.inner.id())
            .finish()
    }
}

impl std::ops::Deref for AnyEntityRef {
    type Target = dyn ManagedEntity;

    fn deref(&self) -> &Self::Target {
        &*self.inner
    }
}

impl AnyEntityRef {
    pub fn entity_name(&self) -> &'static str {
        self.inner.metadata().name
    }

    pub fn key(&self) -> Option<EntityKey> {
        let name = self.entity_name();
        self.inner.id().map(|id| EntityKey::new(name, id))
    }

    /// Do both handles point at the same instance?
    pub fn ptr_eq(&self, other: &AnyEntityRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&other.inner))
    }

    /// Is this the instance behind `typed`?
    pub fn is<E: Entity>(&self, typed: &EntityRef<E>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.inner), Arc::as_ptr(&typed.inner))
    }

    pub fn downcast<E: Entity>(&self) -> Option<EntityRef<E>> {
        Arc::clone(&self.inner)
            .into_any()
            .downcast::<RwLock<E>>()
            .ok()
            .map(|inner| EntityRef { inner })
    }

    /// Address used to track instances by identity in visited sets.
    pub fn address(&self) -> usize {
        Arc::as_ptr(&self.inner).cast::<()>() as usize
    }
}

impl<E: Entity> From<&EntityRef<E>> for AnyEntityRef {
    fn from(value: &EntityRef<E>) -> Self {
        value.erase()
    }
}
