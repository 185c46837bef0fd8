//! Association metadata and lazy association holders.
//!
//! A to-one association is an explicit tagged union rather than a proxy:
//! [`Association::Unresolved`] carries only the target's [`EntityKey`], and
//! the session's `resolve()` turns it into [`Association::Resolved`].
//! Many-to-many associations use [`Collection`], which is either
//! uninitialized or holds its element handles.

use crate::Result;
use crate::entity::{AnyEntityRef, Entity, EntityKey, EntityMetadata, EntityRef};
use crate::error::{Error, TypeError, ValidationErrorKind};
use crate::value::Value;
use std::fmt;

/// Entity operations that can cascade along an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeAction {
    Persist,
    Remove,
    Merge,
    Refresh,
    Lock,
    Detach,
}

/// Set of operations cascaded along one association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cascade {
    pub persist: bool,
    pub remove: bool,
    pub merge: bool,
    pub refresh: bool,
    pub lock: bool,
    pub detach: bool,
}

impl Cascade {
    pub const NONE: Cascade = Cascade {
        persist: false,
        remove: false,
        merge: false,
        refresh: false,
        lock: false,
        detach: false,
    };

    pub const ALL: Cascade = Cascade {
        persist: true,
        remove: true,
        merge: true,
        refresh: true,
        lock: true,
        detach: true,
    };

    /// Persist and merge only; the usual choice for a many-to-one parent.
    pub const PERSIST_MERGE: Cascade = Cascade {
        persist: true,
        remove: false,
        merge: true,
        refresh: false,
        lock: false,
        detach: false,
    };

    pub const fn applies_to(self, action: CascadeAction) -> bool {
        match action {
            CascadeAction::Persist => self.persist,
            CascadeAction::Remove => self.remove,
            CascadeAction::Merge => self.merge,
            CascadeAction::Refresh => self.refresh,
            CascadeAction::Lock => self.lock,
            CascadeAction::Detach => self.detach,
        }
    }
}

/// The type of association between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// Many owners reference one target through a foreign key column.
    ManyToOne,
    /// Owners and targets are linked through a link table.
    ManyToMany,
}

/// Information about a link table for many-to-many associations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"book_tags"`).
    pub table_name: &'static str,
    /// Column pointing to the owning entity (e.g., `"book_id"`).
    pub owner_column: &'static str,
    /// Column pointing to the element entity (e.g., `"tag_id"`).
    pub element_column: &'static str,
}

impl LinkTableInfo {
    pub const fn new(
        table_name: &'static str,
        owner_column: &'static str,
        element_column: &'static str,
    ) -> Self {
        Self {
            table_name,
            owner_column,
            element_column,
        }
    }
}

/// Metadata about one association of an entity.
#[derive(Debug, Clone, Copy)]
pub struct AssociationInfo {
    /// Name of the association field.
    pub name: &'static str,
    /// Entity name of the target.
    pub target_entity: &'static str,
    /// Table of the target.
    pub target_table: &'static str,
    pub kind: AssociationKind,
    /// Foreign key column on the owner (many-to-one).
    pub fk_column: Option<&'static str>,
    /// Link table (many-to-many).
    pub link_table: Option<LinkTableInfo>,
    pub cascade: Cascade,
    target: fn() -> EntityMetadata,
}

impl AssociationInfo {
    pub const fn many_to_one<T: Entity>(name: &'static str, fk_column: &'static str) -> Self {
        Self {
            name,
            target_entity: T::ENTITY_NAME,
            target_table: T::TABLE_NAME,
            kind: AssociationKind::ManyToOne,
            fk_column: Some(fk_column),
            link_table: None,
            cascade: Cascade::NONE,
            target: EntityMetadata::of::<T>,
        }
    }

    pub const fn many_to_many<T: Entity>(name: &'static str, link_table: LinkTableInfo) -> Self {
        Self {
            name,
            target_entity: T::ENTITY_NAME,
            target_table: T::TABLE_NAME,
            kind: AssociationKind::ManyToMany,
            fk_column: None,
            link_table: Some(link_table),
            cascade: Cascade::NONE,
            target: EntityMetadata::of::<T>,
        }
    }

    pub const fn cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    pub const fn is_collection(&self) -> bool {
        matches!(self.kind, AssociationKind::ManyToMany)
    }

    pub const fn cascades(&self, action: CascadeAction) -> bool {
        self.cascade.applies_to(action)
    }

    /// Mapping metadata of the target entity type.
    pub fn target_metadata(&self) -> EntityMetadata {
        (self.target)()
    }
}

// ============================================================================
// To-one associations
// ============================================================================

/// Type-erased view of a to-one association.
#[derive(Debug, Clone)]
pub enum AssociationTarget {
    Empty,
    Unresolved(EntityKey),
    Resolved(AnyEntityRef),
}

impl AssociationTarget {
    /// Key of the target, if it has an identifier.
    pub fn key(&self) -> Option<EntityKey> {
        match self {
            AssociationTarget::Empty => None,
            AssociationTarget::Unresolved(key) => Some(key.clone()),
            AssociationTarget::Resolved(target) => target.key(),
        }
    }

    pub fn resolved(&self) -> Option<&AnyEntityRef> {
        match self {
            AssociationTarget::Resolved(target) => Some(target),
            _ => None,
        }
    }
}

/// A many-to-one reference to another entity.
pub enum Association<T: Entity> {
    /// No target (NULL foreign key).
    Empty,
    /// The target's key is known but the target has not been loaded.
    Unresolved(EntityKey),
    /// The target instance is in memory.
    Resolved(EntityRef<T>),
}

impl<T: Entity> Association<T> {
    pub fn empty() -> Self {
        Association::Empty
    }

    /// Reference a target by identifier without loading it.
    pub fn unresolved(id: impl Into<Value>) -> Self {
        Association::Unresolved(EntityKey::of::<T>(id))
    }

    /// Build from a foreign key column value; NULL becomes [`Association::Empty`].
    pub fn from_fk(value: impl Into<Value>) -> Self {
        match value.into() {
            Value::Null => Association::Empty,
            id => Association::unresolved(id),
        }
    }

    pub fn resolved(target: &EntityRef<T>) -> Self {
        Association::Resolved(target.clone())
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Association::Resolved(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Association::Empty)
    }

    pub fn get(&self) -> Option<&EntityRef<T>> {
        match self {
            Association::Resolved(target) => Some(target),
            _ => None,
        }
    }

    pub fn key(&self) -> Option<EntityKey> {
        match self {
            Association::Empty => None,
            Association::Unresolved(key) => Some(key.clone()),
            Association::Resolved(target) => target.key(),
        }
    }

    /// Value written to the foreign key column.
    pub fn fk_value(&self) -> Value {
        self.key().map_or(Value::Null, |key| key.id().clone())
    }
}

impl<T: Entity> Clone for Association<T> {
    fn clone(&self) -> Self {
        match self {
            Association::Empty => Association::Empty,
            Association::Unresolved(key) => Association::Unresolved(key.clone()),
            Association::Resolved(target) => Association::Resolved(target.clone()),
        }
    }
}

impl<T: Entity> Default for Association<T> {
    fn default() -> Self {
        Association::Empty
    }
}

impl<T: Entity> fmt::Debug for Association<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Association::Empty => write!(f, "Empty"),
            Association::Unresolved(key) => write!(f, "Unresolved({key})"),
            Association::Resolved(target) => match target.key() {
                Some(key) => write!(f, "Resolved({key})"),
                None => write!(f, "Resolved({}#<new>)", T::ENTITY_NAME),
            },
        }
    }
}

/// Object-safe access to a to-one association field.
pub trait AssociationSlot: Send + Sync {
    fn target(&self) -> AssociationTarget;
    #[allow(clippy::result_large_err)]
    fn assign(&mut self, target: AssociationTarget) -> Result<()>;
}

impl<T: Entity> AssociationSlot for Association<T> {
    fn target(&self) -> AssociationTarget {
        match self {
            Association::Empty => AssociationTarget::Empty,
            Association::Unresolved(key) => AssociationTarget::Unresolved(key.clone()),
            Association::Resolved(target) => AssociationTarget::Resolved(target.erase()),
        }
    }

    fn assign(&mut self, target: AssociationTarget) -> Result<()> {
        *self = match target {
            AssociationTarget::Empty => Association::Empty,
            AssociationTarget::Unresolved(key) => Association::Unresolved(key),
            AssociationTarget::Resolved(any) => {
                Association::Resolved(downcast_target::<T>(&any)?)
            }
        };
        Ok(())
    }
}

fn downcast_target<T: Entity>(any: &AnyEntityRef) -> Result<EntityRef<T>> {
    any.downcast::<T>().ok_or_else(|| {
        Error::Type(TypeError {
            expected: T::ENTITY_NAME,
            actual: any.entity_name().to_string(),
            column: None,
            rust_type: Some(std::any::type_name::<T>()),
        })
    })
}

// ============================================================================
// Collections
// ============================================================================

/// A many-to-many collection of entities.
///
/// Collections of newly constructed owners start initialized and empty;
/// collections of loaded owners start uninitialized until fetched.
pub struct Collection<T: Entity> {
    elements: Option<Vec<EntityRef<T>>>,
}

impl<T: Entity> Collection<T> {
    /// An initialized, empty collection.
    pub fn new() -> Self {
        Self {
            elements: Some(Vec::new()),
        }
    }

    pub fn uninitialized() -> Self {
        Self { elements: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.elements.is_some()
    }

    /// Elements, or `None` if the collection was never fetched.
    pub fn get(&self) -> Option<&[EntityRef<T>]> {
        self.elements.as_deref()
    }

    pub fn len(&self) -> usize {
        self.elements.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef<T>> {
        self.elements.iter().flatten()
    }

    /// Add an element. Adding the same instance twice is a no-op.
    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, element: &EntityRef<T>) -> Result<()> {
        let elements = self.elements.as_mut().ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::InvalidState,
                "cannot modify an uninitialized collection; fetch it first",
            )
        })?;
        if !elements.iter().any(|e| e.ptr_eq(element)) {
            elements.push(element.clone());
        }
        Ok(())
    }

    /// Remove an element by instance identity. Returns whether it was present.
    #[allow(clippy::result_large_err)]
    pub fn remove(&mut self, element: &EntityRef<T>) -> Result<bool> {
        let elements = self.elements.as_mut().ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::InvalidState,
                "cannot modify an uninitialized collection; fetch it first",
            )
        })?;
        let before = elements.len();
        elements.retain(|e| !e.ptr_eq(element));
        Ok(elements.len() != before)
    }
}

impl<T: Entity> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            elements: self.elements.clone(),
        }
    }
}

impl<T: Entity> Default for Collection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.elements {
            None => write!(f, "Collection(<uninitialized>)"),
            Some(elements) => f
                .debug_list()
                .entries(elements.iter().map(|e| e.key()))
                .finish(),
        }
    }
}

/// Object-safe access to a collection field.
pub trait CollectionSlot: Send + Sync {
    fn elements(&self) -> Option<Vec<AnyEntityRef>>;
    #[allow(clippy::result_large_err)]
    fn initialize(&mut self, elements: Vec<AnyEntityRef>) -> Result<()>;
    fn invalidate(&mut self);
}

impl<T: Entity> CollectionSlot for Collection<T> {
    fn elements(&self) -> Option<Vec<AnyEntityRef>> {
        self.elements
            .as_ref()
            .map(|elements| elements.iter().map(EntityRef::erase).collect())
    }

    fn initialize(&mut self, elements: Vec<AnyEntityRef>) -> Result<()> {
        let typed = elements
            .iter()
            .map(downcast_target::<T>)
            .collect::<Result<Vec<_>>>()?;
        self.elements = Some(typed);
        Ok(())
    }

    fn invalidate(&mut self) {
        self.elements = None;
    }
}
