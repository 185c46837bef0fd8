//! Persistence context: the identity map of one session.
//!
//! Every entity instance a session manages has exactly one [`EntityEntry`],
//! keyed by its [`EntityKey`]. The entry holds the state last read from or
//! written to the database, which flush compares against the instance's
//! current values to find changes.
//!
//! The context also tracks many-to-many collections (with the element keys
//! they held at load or flush time), references handed out by
//! `get_reference` that have not been loaded yet, and two depth counters:
//! one for nested loads and one for cascades in progress.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{
    AnyEntityRef, AssociationInfo, EntityKey, Error, FieldValues, LockMode, Result, Value,
    ValidationErrorKind,
};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies the persistence context an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

impl ContextId {
    fn next() -> Self {
        Self(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Lifecycle status of a managed entity.
///
/// Transient and detached instances have no entry at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    Managed,
    /// Managed, but never dirty-checked or updated.
    ReadOnly,
    /// Scheduled for deletion at the next flush.
    Removed,
}

/// Bookkeeping for one managed instance.
#[derive(Debug)]
pub struct EntityEntry {
    key: EntityKey,
    status: EntityStatus,
    loaded_state: Option<FieldValues>,
    version: Option<i64>,
    instance: AnyEntityRef,
    exists_in_database: bool,
    lock_mode: LockMode,
    context: ContextId,
}

impl EntityEntry {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn status(&self) -> EntityStatus {
        self.status
    }

    /// State as of the last load or flush; `None` until the row is inserted.
    pub fn loaded_state(&self) -> Option<&FieldValues> {
        self.loaded_state.as_ref()
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn instance(&self) -> &AnyEntityRef {
        &self.instance
    }

    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// The context this entry is registered in.
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn is_read_only(&self) -> bool {
        self.status == EntityStatus::ReadOnly
    }

    pub fn is_removed(&self) -> bool {
        self.status == EntityStatus::Removed
    }

    pub(crate) fn set_status(&mut self, status: EntityStatus) {
        self.status = status;
    }

    pub(crate) fn set_lock_mode(&mut self, mode: LockMode) {
        self.lock_mode = mode;
    }

    /// Record that `state` is now what the database holds.
    pub(crate) fn synchronized(&mut self, state: FieldValues, version: Option<i64>) {
        self.loaded_state = Some(state);
        self.version = version;
        self.exists_in_database = true;
    }

    /// Columns whose current value differs from the loaded state.
    pub fn dirty_columns(&self, current: &FieldValues) -> Vec<&'static str> {
        let Some(loaded) = &self.loaded_state else {
            return Vec::new();
        };
        current
            .iter()
            .filter(|(column, value)| value_of(loaded, column) != value)
            .map(|(column, _)| *column)
            .collect()
    }
}

/// Value of `column` in `state`, or NULL if absent.
pub fn value_of<'a>(state: &'a FieldValues, column: &str) -> &'a Value {
    const NULL: &Value = &Value::Null;
    state
        .iter()
        .find(|(c, _)| *c == column)
        .map_or(NULL, |(_, v)| v)
}

/// Identity of a collection: owner key plus association name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    pub role: &'static str,
    pub owner: EntityKey,
}

impl CollectionKey {
    pub fn new(role: &'static str, owner: EntityKey) -> Self {
        Self { role, owner }
    }
}

/// A tracked many-to-many collection.
#[derive(Debug)]
pub struct CollectionEntry {
    info: &'static AssociationInfo,
    owner: AnyEntityRef,
    snapshot: Option<Vec<EntityKey>>,
}

impl CollectionEntry {
    pub fn info(&self) -> &'static AssociationInfo {
        self.info
    }

    pub fn owner(&self) -> &AnyEntityRef {
        &self.owner
    }

    /// Element keys the link table held at load or flush time.
    pub fn snapshot(&self) -> Option<&[EntityKey]> {
        self.snapshot.as_deref()
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Vec<EntityKey>) {
        self.snapshot = Some(snapshot);
    }
}

/// The identity map and associated bookkeeping of one session.
#[derive(Debug)]
pub struct PersistenceContext {
    id: ContextId,
    entries: HashMap<EntityKey, EntityEntry>,
    collections: HashMap<CollectionKey, CollectionEntry>,
    proxies: HashSet<EntityKey>,
    pending_loads: HashSet<CollectionKey>,
    default_read_only: bool,
    cascade_depth: usize,
    load_depth: usize,
}

impl Default for PersistenceContext {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PersistenceContext {
    pub fn new(default_read_only: bool) -> Self {
        Self {
            id: ContextId::next(),
            entries: HashMap::new(),
            collections: HashMap::new(),
            proxies: HashSet::new(),
            pending_loads: HashSet::new(),
            default_read_only,
            cascade_depth: 0,
            load_depth: 0,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    // ------------------------------------------------------------------
    // Identity map
    // ------------------------------------------------------------------

    /// The managed instance for `key`, including removed ones.
    pub fn get(&self, key: &EntityKey) -> Option<&AnyEntityRef> {
        self.entries.get(key).map(|e| &e.instance)
    }

    pub fn entry(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key)
    }

    pub(crate) fn entry_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entries.get_mut(key)
    }

    /// Entry of this exact instance, if it is the one registered under its key.
    pub fn entry_of(&self, instance: &AnyEntityRef) -> Option<&EntityEntry> {
        let key = instance.key()?;
        self.entries
            .get(&key)
            .filter(|entry| entry.instance.ptr_eq(instance))
    }

    /// Register `instance` under `key`.
    ///
    /// `loaded_state` is the state read from the database, or `None` for a
    /// new instance whose INSERT is still pending. A key can be registered
    /// only once; use [`PersistenceContext::refresh`] to replace the state of
    /// an existing entry.
    #[allow(clippy::result_large_err)]
    pub fn put(
        &mut self,
        key: EntityKey,
        instance: AnyEntityRef,
        loaded_state: Option<FieldValues>,
    ) -> Result<&mut EntityEntry> {
        if self.entries.contains_key(&key) {
            return Err(Error::validation(
                ValidationErrorKind::NonUniqueObject,
                format!("an instance of {key} is already associated with this session"),
            ));
        }
        self.proxies.remove(&key);
        let version = instance.version();
        let entry = EntityEntry {
            key: key.clone(),
            status: EntityStatus::Managed,
            exists_in_database: loaded_state.is_some(),
            loaded_state,
            version,
            instance,
            lock_mode: LockMode::None,
            context: self.id,
        };
        Ok(self.entries.entry(key).or_insert(entry))
    }

    /// Replace the loaded state of an existing entry after a refresh.
    #[allow(clippy::result_large_err)]
    pub fn refresh(&mut self, key: &EntityKey, state: FieldValues, version: Option<i64>) -> Result<()> {
        let entry = self.entries.get_mut(key).ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::Detached,
                format!("{key} is not managed by this session"),
            )
        })?;
        entry.synchronized(state, version);
        Ok(())
    }

    /// Drop the entry for `key` and every collection it owns.
    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityEntry> {
        self.collections.retain(|ck, _| &ck.owner != key);
        self.proxies.remove(key);
        self.entries.remove(key)
    }

    /// Is this exact instance managed and not scheduled for removal?
    pub fn contains(&self, instance: &AnyEntityRef) -> bool {
        self.entry_of(instance).is_some_and(|e| !e.is_removed())
    }

    pub fn snapshot_of(&self, key: &EntityKey) -> Option<&FieldValues> {
        self.entries.get(key).and_then(|e| e.loaded_state.as_ref())
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.entries.keys().cloned().collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &EntityEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // ------------------------------------------------------------------
    // Read-only mode
    // ------------------------------------------------------------------

    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    /// Switch an entry between read-only and modifiable.
    ///
    /// Making an entry modifiable takes its current state as the new
    /// snapshot, so changes made while it was read-only are never written.
    #[allow(clippy::result_large_err)]
    pub fn set_read_only(&mut self, key: &EntityKey, read_only: bool) -> Result<()> {
        let entry = self.entries.get_mut(key).ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::Detached,
                format!("{key} is not managed by this session"),
            )
        })?;
        match (entry.status, read_only) {
            (EntityStatus::Removed, _) => Err(Error::validation(
                ValidationErrorKind::RemovedEntity,
                format!("{key} is scheduled for removal"),
            )),
            (EntityStatus::Managed, true) => {
                entry.status = EntityStatus::ReadOnly;
                Ok(())
            }
            (EntityStatus::ReadOnly, false) => {
                entry.status = EntityStatus::Managed;
                if entry.exists_in_database {
                    entry.loaded_state = Some(entry.instance.values());
                    entry.version = entry.instance.version();
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Load and cascade depth
    // ------------------------------------------------------------------

    /// Enter a (possibly nested) load.
    pub fn before_load(&mut self) {
        self.load_depth += 1;
    }

    /// Leave a load entered with [`PersistenceContext::before_load`].
    pub fn after_load(&mut self) {
        self.load_depth = self.load_depth.saturating_sub(1);
    }

    pub fn is_loading(&self) -> bool {
        self.load_depth > 0
    }

    pub fn load_depth(&self) -> usize {
        self.load_depth
    }

    pub fn enter_cascade(&mut self) {
        self.cascade_depth += 1;
    }

    pub fn exit_cascade(&mut self) {
        self.cascade_depth = self.cascade_depth.saturating_sub(1);
    }

    pub fn is_cascading(&self) -> bool {
        self.cascade_depth > 0
    }

    /// Reset both depth counters; returns whether any was non-zero.
    ///
    /// A counter is left raised only when an operation's future was dropped
    /// before it finished.
    pub(crate) fn reset_depths(&mut self) -> bool {
        let raised = self.cascade_depth > 0 || self.load_depth > 0;
        self.cascade_depth = 0;
        self.load_depth = 0;
        raised
    }

    // ------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------

    /// Record a reference handed out without loading its row.
    pub fn add_proxy(&mut self, key: EntityKey) {
        if !self.entries.contains_key(&key) {
            self.proxies.insert(key);
        }
    }

    pub fn remove_proxy(&mut self, key: &EntityKey) -> bool {
        self.proxies.remove(key)
    }

    pub fn has_proxy(&self, key: &EntityKey) -> bool {
        self.proxies.contains(key)
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    /// Track a collection; `snapshot` is `None` when its link rows were never read.
    pub fn add_collection(
        &mut self,
        key: CollectionKey,
        info: &'static AssociationInfo,
        owner: AnyEntityRef,
        snapshot: Option<Vec<EntityKey>>,
    ) {
        self.collections.insert(
            key,
            CollectionEntry {
                info,
                owner,
                snapshot,
            },
        );
    }

    pub fn collection(&self, key: &CollectionKey) -> Option<&CollectionEntry> {
        self.collections.get(key)
    }

    pub(crate) fn collection_mut(&mut self, key: &CollectionKey) -> Option<&mut CollectionEntry> {
        self.collections.get_mut(key)
    }

    pub fn remove_collection(&mut self, key: &CollectionKey) -> Option<CollectionEntry> {
        self.collections.remove(key)
    }

    pub fn collections(&self) -> impl Iterator<Item = (&CollectionKey, &CollectionEntry)> {
        self.collections.iter()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Drop every collection whose owner, element or link table is in
    /// `tables`, and mark it uninitialized on its owner. Returns how many
    /// were invalidated.
    pub fn invalidate_collections(&mut self, tables: &[String]) -> usize {
        let touches = |table: &str| tables.iter().any(|t| t == table);
        let stale: Vec<CollectionKey> = self
            .collections
            .iter()
            .filter(|(_, c)| {
                touches(c.owner.metadata().table)
                    || touches(c.info.target_table)
                    || c.info.link_table.is_some_and(|l| touches(l.table_name))
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            if let Some(entry) = self.collections.remove(key) {
                entry.owner.invalidate_collection(key.role);
            }
        }
        stale.len()
    }

    /// Register a collection fetch that is about to start.
    pub fn begin_collection_load(&mut self, key: CollectionKey) {
        self.pending_loads.insert(key);
    }

    /// Complete a collection fetch. Returns `false` when the registration
    /// was cancelled by [`PersistenceContext::clear`] in the meantime, in
    /// which case the fetched elements must be discarded.
    pub fn finish_collection_load(&mut self, key: &CollectionKey) -> bool {
        self.pending_loads.remove(key)
    }

    pub fn pending_load_count(&self) -> usize {
        self.pending_loads.len()
    }

    /// Detach everything and cancel pending collection loads.
    pub fn clear(&mut self) {
        if !self.pending_loads.is_empty() {
            tracing::debug!(
                cancelled = self.pending_loads.len(),
                "Clearing context with collection loads in flight"
            );
        }
        self.entries.clear();
        self.collections.clear();
        self.proxies.clear();
        self.pending_loads.clear();
        self.cascade_depth = 0;
        self.load_depth = 0;
    }
}
