//! Event dispatch for session operations.
//!
//! Each mutating operation is an event kind with a fixed, ordered list of
//! stages. The session runs the stages of an event strictly in sequence,
//! awaiting each one before starting the next, so later stages can rely on
//! the effects of earlier ones (associated entities are persisted before the
//! owner's insert is queued, for example).
//!
//! Entity listeners are attached per entity name when the session factory is
//! built and are invoked from the callback stages.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tessera_core::{AnyEntityRef, Entity, Result};

/// Operations dispatched through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Persist,
    Remove,
    Merge,
    Refresh,
    Lock,
    Flush,
    Load,
}

/// One step of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Reject the operation if the entity's lifecycle state forbids it.
    CheckState,
    /// Invoke the `pre_*` entity listeners.
    PreCallback,
    /// Assign an identifier, possibly with a round trip.
    GenerateId,
    /// Cascade along to-one associations (targets before the entity).
    CascadeToParents,
    /// Register the entity in the context and queue or execute its write.
    Register,
    /// Cascade along collections (elements after the entity).
    CascadeToChildren,
    /// Invoke the `post_*` entity listeners.
    PostCallback,
    /// Find or load the managed copy of a detached instance.
    ResolveManaged,
    /// Copy state between instances.
    CopyState,
    /// Re-read state from the database.
    Reload,
    /// Apply a lock mode.
    ApplyLock,
    /// Look the identifier up in the persistence context.
    IdentityLookup,
    /// Read the row from the database.
    Fetch,
    /// Persist entities reachable from managed ones.
    CascadeOnFlush,
    /// Compare managed entities with their snapshots.
    DirtyCheck,
    /// Compare collections with their snapshots.
    CollectionDiff,
    /// Execute the ordered actions.
    Execute,
    /// Bring snapshots, versions and collections up to date.
    PostProcess,
}

const PERSIST: &[Stage] = &[
    Stage::CheckState,
    Stage::PreCallback,
    Stage::GenerateId,
    Stage::CascadeToParents,
    Stage::Register,
    Stage::CascadeToChildren,
    Stage::PostCallback,
];

const REMOVE: &[Stage] = &[
    Stage::CheckState,
    Stage::PreCallback,
    Stage::CascadeToChildren,
    Stage::Register,
    Stage::CascadeToParents,
];

const MERGE: &[Stage] = &[
    Stage::ResolveManaged,
    Stage::CopyState,
    Stage::CascadeToParents,
    Stage::CascadeToChildren,
];

const REFRESH: &[Stage] = &[
    Stage::CheckState,
    Stage::Reload,
    Stage::CascadeToParents,
    Stage::CascadeToChildren,
    Stage::PostCallback,
];

const LOCK: &[Stage] = &[
    Stage::CheckState,
    Stage::ApplyLock,
    Stage::CascadeToParents,
    Stage::CascadeToChildren,
];

const FLUSH: &[Stage] = &[
    Stage::CascadeOnFlush,
    Stage::DirtyCheck,
    Stage::CollectionDiff,
    Stage::Execute,
    Stage::PostProcess,
];

const LOAD: &[Stage] = &[
    Stage::IdentityLookup,
    Stage::Fetch,
    Stage::Register,
    Stage::PostCallback,
];

/// Entity lifecycle callbacks.
///
/// `pre_*` callbacks may veto the operation by returning an error. Post
/// callbacks for writes run after the statement has executed, which for
/// queued actions means after the flush that executed them.
pub trait EntityListener: Send + Sync {
    #[allow(clippy::result_large_err)]
    fn pre_persist(&self, _entity: &AnyEntityRef) -> Result<()> {
        Ok(())
    }

    fn post_persist(&self, _entity: &AnyEntityRef) {}

    #[allow(clippy::result_large_err)]
    fn pre_remove(&self, _entity: &AnyEntityRef) -> Result<()> {
        Ok(())
    }

    fn post_remove(&self, _entity: &AnyEntityRef) {}

    #[allow(clippy::result_large_err)]
    fn pre_update(&self, _entity: &AnyEntityRef) -> Result<()> {
        Ok(())
    }

    fn post_update(&self, _entity: &AnyEntityRef) {}

    fn post_load(&self, _entity: &AnyEntityRef) {}
}

/// Which listener method to invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callback {
    PrePersist,
    PostPersist,
    PreRemove,
    PostRemove,
    PreUpdate,
    PostUpdate,
    PostLoad,
}

/// Stage table plus the listeners registered per entity name.
#[derive(Default, Clone)]
pub struct EventPipeline {
    listeners: HashMap<&'static str, Vec<Arc<dyn EntityListener>>>,
    global: Vec<Arc<dyn EntityListener>>,
}

impl fmt::Debug for EventPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<(&str, usize)> =
            self.listeners.iter().map(|(k, v)| (*k, v.len())).collect();
        counts.sort_unstable();
        f.debug_struct("EventPipeline")
            .field("listeners", &counts)
            .field("global", &self.global.len())
            .finish()
    }
}

impl EventPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// The ordered stages of `kind`.
    pub fn stages(&self, kind: EventKind) -> &'static [Stage] {
        match kind {
            EventKind::Persist => PERSIST,
            EventKind::Remove => REMOVE,
            EventKind::Merge => MERGE,
            EventKind::Refresh => REFRESH,
            EventKind::Lock => LOCK,
            EventKind::Flush => FLUSH,
            EventKind::Load => LOAD,
        }
    }

    /// Attach a listener to entity type `E`.
    pub fn register<E: Entity>(&mut self, listener: Arc<dyn EntityListener>) {
        self.listeners
            .entry(E::ENTITY_NAME)
            .or_default()
            .push(listener);
    }

    /// Attach a listener invoked for every entity type.
    pub fn register_global(&mut self, listener: Arc<dyn EntityListener>) {
        self.global.push(listener);
    }

    pub fn with_listener<E: Entity>(mut self, listener: Arc<dyn EntityListener>) -> Self {
        self.register::<E>(listener);
        self
    }

    pub fn has_listeners(&self) -> bool {
        !self.global.is_empty() || self.listeners.values().any(|v| !v.is_empty())
    }

    /// Invoke `callback` on every listener for `entity`: global listeners
    /// first, then the entity's own, each in registration order. The first
    /// error from a `pre_*` callback stops the dispatch.
    #[allow(clippy::result_large_err)]
    pub fn fire(&self, callback: Callback, entity: &AnyEntityRef) -> Result<()> {
        let own = self
            .listeners
            .get(entity.entity_name())
            .map_or(&[][..], Vec::as_slice);
        for listener in self.global.iter().chain(own) {
            match callback {
                Callback::PrePersist => listener.pre_persist(entity)?,
                Callback::PostPersist => listener.post_persist(entity),
                Callback::PreRemove => listener.pre_remove(entity)?,
                Callback::PostRemove => listener.post_remove(entity),
                Callback::PreUpdate => listener.pre_update(entity)?,
                Callback::PostUpdate => listener.post_update(entity),
                Callback::PostLoad => listener.post_load(entity),
            }
        }
        Ok(())
    }
}
