//! Lifecycle operations: persist, remove, merge, refresh, lock, and loads by
//! identifier.
//!
//! Each operation walks the stage list the pipeline defines for its event
//! kind, awaiting one stage before starting the next. Cascades recurse
//! through boxed futures and carry a visited set keyed by instance address,
//! so cyclic object graphs terminate.

use crate::action_queue::{DeleteAction, EntityAction, InsertAction};
use crate::batching::BatchedStatement;
use crate::context::{CollectionKey, EntityEntry, EntityStatus};
use crate::id_generator::{AssignedGenerator, IdGenerator};
use crate::persister::CollectionPersister;
use crate::pipeline::{Callback, EventKind, Stage};
use crate::{BoxFuture, InstanceState, Session};
use asupersync::{Cx, Outcome};
use std::collections::{HashMap, HashSet};
use tessera_core::{
    AnyEntityRef, Association, AssociationInfo, AssociationTarget, CascadeAction, Connection,
    Entity, EntityKey, EntityMetadata, EntityNotFoundError, EntityRef, Error, IdStrategy,
    LockMode, Result, StaleStateError, Value, ValidationErrorKind, try_outcome, try_result,
};

/// To-one targets and collection elements reached by `action`.
fn cascade_targets(
    instance: &AnyEntityRef,
    action: CascadeAction,
) -> (Vec<AnyEntityRef>, Vec<AnyEntityRef>) {
    let parents = instance
        .associations()
        .into_iter()
        .filter(|(info, _)| info.cascades(action))
        .filter_map(|(_, target)| target.resolved().cloned())
        .collect();
    let children = instance
        .collections()
        .into_iter()
        .filter(|(info, _)| info.cascades(action))
        .flat_map(|(_, elements)| elements.unwrap_or_default())
        .collect();
    (parents, children)
}

#[allow(clippy::result_large_err)]
fn identifier_key(instance: &AnyEntityRef) -> Result<EntityKey> {
    instance.key().ok_or_else(|| {
        Error::validation(
            ValidationErrorKind::InvalidIdentifier,
            format!("{} instance has no identifier", instance.entity_name()),
        )
    })
}

fn not_managed(instance: &AnyEntityRef) -> Error {
    Error::validation(
        ValidationErrorKind::Detached,
        format!(
            "{} instance is not managed by this session",
            instance.entity_name()
        ),
    )
}

fn not_found(entity: &'static str, id: &Value) -> Error {
    Error::EntityNotFound(EntityNotFoundError {
        entity,
        id: id.clone(),
    })
}

fn stale(entity: &'static str, id: &Value, sql: String) -> Error {
    Error::StaleState(StaleStateError {
        entity,
        id: id.clone(),
        sql,
        expected_rows: 1,
        actual_rows: 0,
    })
}

impl<C: Connection> Session<C> {
    fn detached_error(&self, instance: &AnyEntityRef) -> Error {
        match instance.key() {
            Some(key) if self.context.get(&key).is_some() => Error::validation(
                ValidationErrorKind::NonUniqueObject,
                format!("a different instance of {key} is already associated with this session"),
            ),
            Some(key) => Error::validation(
                ValidationErrorKind::Detached,
                format!("{key} is detached; merge it instead"),
            ),
            None => not_managed(instance),
        }
    }

    /// Materialize `row` inside a load bracket and fire `post_load` for a new instance.
    #[allow(clippy::result_large_err)]
    fn load_row(
        &mut self,
        meta: &EntityMetadata,
        row: &tessera_core::Row,
        read_only: bool,
    ) -> Result<AnyEntityRef> {
        self.context.before_load();
        let materialized = self.materialize(meta, row, read_only);
        self.context.after_load();
        let (instance, created) = materialized?;
        if created {
            self.pipeline.fire(Callback::PostLoad, &instance)?;
        }
        Ok(instance)
    }

    // ========================================================================
    // Persist
    // ========================================================================

    /// Make a transient instance managed.
    ///
    /// The INSERT waits in the action queue until the next flush, except for
    /// entities whose key the database generates: those are inserted right
    /// away to obtain the key. Persisting a managed instance only cascades.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = E::ENTITY_NAME))]
    pub async fn persist<E: Entity>(&mut self, cx: &Cx, entity: &EntityRef<E>) -> Outcome<(), Error> {
        try_outcome!(self.prepare(cx).await);
        let mut visited = HashSet::new();
        self.persist_any(cx, entity.erase(), &mut visited).await
    }

    pub(crate) fn persist_any<'a>(
        &'a mut self,
        cx: &'a Cx,
        instance: AnyEntityRef,
        visited: &'a mut HashSet<usize>,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            if !visited.insert(instance.address()) {
                return Outcome::Ok(());
            }
            let identity = instance.metadata().id_strategy == IdStrategy::Identity;
            let mut cascade_only = false;

            for stage in self.pipeline.stages(EventKind::Persist) {
                match stage {
                    Stage::CheckState => match self.instance_state(&instance) {
                        InstanceState::Transient => {}
                        InstanceState::Managed => cascade_only = true,
                        InstanceState::Removed => {
                            return Outcome::Err(Error::validation(
                                ValidationErrorKind::RemovedEntity,
                                format!(
                                    "{} instance is scheduled for removal",
                                    instance.entity_name()
                                ),
                            ));
                        }
                        InstanceState::Detached => {
                            return Outcome::Err(self.detached_error(&instance));
                        }
                    },
                    Stage::PreCallback if !cascade_only => {
                        try_result!(self.pipeline.fire(Callback::PrePersist, &instance));
                    }
                    Stage::GenerateId if !cascade_only => {
                        try_outcome!(self.generate_id(cx, &instance).await);
                    }
                    Stage::CascadeToParents | Stage::CascadeToChildren => {
                        let (parents, children) = cascade_targets(&instance, CascadeAction::Persist);
                        let targets = if *stage == Stage::CascadeToParents {
                            parents
                        } else {
                            children
                        };
                        self.context.enter_cascade();
                        let mut outcome = Outcome::Ok(());
                        for target in targets {
                            outcome = self.persist_any(cx, target, visited).await;
                            if !matches!(outcome, Outcome::Ok(())) {
                                break;
                            }
                        }
                        self.context.exit_cascade();
                        try_outcome!(outcome);
                    }
                    Stage::Register if !cascade_only => {
                        try_outcome!(self.register_new(cx, &instance).await);
                    }
                    Stage::PostCallback if !cascade_only && identity => {
                        try_result!(self.pipeline.fire(Callback::PostPersist, &instance));
                    }
                    _ => {}
                }
            }
            Outcome::Ok(())
        })
    }

    async fn generate_id(&mut self, cx: &Cx, instance: &AnyEntityRef) -> Outcome<(), Error> {
        match instance.metadata().id_strategy {
            IdStrategy::Assigned => {
                try_outcome!(
                    AssignedGenerator
                        .generate(cx, &self.conn, self.dialect, instance)
                        .await
                );
            }
            IdStrategy::Sequence {
                name,
                allocation_size,
            } => {
                let generator = self.sequences.generator(name, allocation_size);
                let id = try_outcome!(generator.generate(cx, &self.conn, self.dialect, instance).await);
                tracing::trace!(entity = instance.entity_name(), id = %id, "Generated identifier");
                try_result!(instance.set_id(id));
            }
            IdStrategy::Identity => {}
        }
        Outcome::Ok(())
    }

    async fn register_new(&mut self, cx: &Cx, instance: &AnyEntityRef) -> Outcome<(), Error> {
        let meta = instance.metadata();
        if meta.id_strategy != IdStrategy::Identity {
            let key = try_result!(identifier_key(instance));
            try_result!(self.context.put(key.clone(), instance.clone(), None));
            self.queue.add_insert(InsertAction {
                key: key.clone(),
                instance: instance.clone(),
            });
            self.track_new_collections(&key, instance);
            return Outcome::Ok(());
        }

        // Rows this one references must exist before it is inserted.
        let pending: Vec<EntityKey> = instance
            .associations()
            .into_iter()
            .filter_map(|(_, target)| target.key())
            .filter(|key| self.queue.has_pending_insert(key))
            .collect();
        for key in pending {
            try_outcome!(self.insert_now(cx, key).await);
        }

        let statement = self.persister(meta).insert(&instance.values());
        let sql = try_result!(self.native(&statement));
        tracing::debug!(entity = meta.name, "Inserting to obtain generated key");
        let id = try_outcome!(self.conn.insert(cx, &sql, &statement.params).await);
        try_result!(instance.set_id(Value::BigInt(id)));
        let key = try_result!(identifier_key(instance));
        try_result!(self.context.put(key.clone(), instance.clone(), Some(instance.values())));
        self.track_new_collections(&key, instance);
        Outcome::Ok(())
    }

    /// Execute a queued insert ahead of the flush.
    fn insert_now<'a>(&'a mut self, cx: &'a Cx, key: EntityKey) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            let Some(action) = self.queue.inserts().iter().find(|a| a.key == key).cloned() else {
                return Outcome::Ok(());
            };
            self.queue.remove_insert(&key);

            let pending: Vec<EntityKey> = action
                .instance
                .associations()
                .into_iter()
                .filter_map(|(_, target)| target.key())
                .filter(|k| self.queue.has_pending_insert(k))
                .collect();
            for reference in pending {
                try_outcome!(self.insert_now(cx, reference).await);
            }

            let state = action.instance.values();
            let statement = self.persister(action.instance.metadata()).insert(&state);
            let sql = try_result!(self.native(&statement));
            let batched = BatchedStatement::new(sql, statement.params)
                .expect_rows(1, key.entity(), key.id().clone());
            try_outcome!(self.conn.add_to_batch(cx, batched).await);
            try_outcome!(self.conn.execute_batch(cx).await);

            if let Some(entry) = self.context.entry_mut(&key) {
                entry.synchronized(state, action.instance.version());
            }
            try_result!(self.pipeline.fire(Callback::PostPersist, &action.instance));
            Outcome::Ok(())
        })
    }

    /// Track initialized collections of a new owner with an empty snapshot,
    /// so the first flush inserts every link row.
    fn track_new_collections(&mut self, key: &EntityKey, instance: &AnyEntityRef) {
        for (info, elements) in instance.collections() {
            if elements.is_some() {
                self.context.add_collection(
                    CollectionKey::new(info.name, key.clone()),
                    info,
                    instance.clone(),
                    Some(Vec::new()),
                );
            }
        }
    }

    // ========================================================================
    // Remove
    // ========================================================================

    /// Schedule a managed instance for deletion at the next flush.
    ///
    /// Removing a transient instance, or one already removed, succeeds and
    /// does nothing. Removing an instance whose INSERT is still queued drops
    /// the insert instead.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = E::ENTITY_NAME))]
    pub async fn remove<E: Entity>(&mut self, cx: &Cx, entity: &EntityRef<E>) -> Outcome<(), Error> {
        try_outcome!(self.prepare(cx).await);
        let mut visited = HashSet::new();
        self.remove_any(cx, entity.erase(), &mut visited).await
    }

    fn remove_any<'a>(
        &'a mut self,
        cx: &'a Cx,
        instance: AnyEntityRef,
        visited: &'a mut HashSet<usize>,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            if !visited.insert(instance.address()) {
                return Outcome::Ok(());
            }
            for stage in self.pipeline.stages(EventKind::Remove) {
                match stage {
                    Stage::CheckState => match self.instance_state(&instance) {
                        InstanceState::Managed => {}
                        InstanceState::Transient | InstanceState::Removed => {
                            tracing::debug!(
                                entity = instance.entity_name(),
                                "Instance is not persistent; nothing to remove"
                            );
                            return Outcome::Ok(());
                        }
                        InstanceState::Detached => {
                            return Outcome::Err(self.detached_error(&instance));
                        }
                    },
                    Stage::PreCallback => {
                        try_result!(self.pipeline.fire(Callback::PreRemove, &instance));
                    }
                    Stage::CascadeToChildren => {
                        for (info, elements) in instance.collections() {
                            if info.cascades(CascadeAction::Remove) && elements.is_none() {
                                try_outcome!(self.fetch_any(cx, &instance, info).await);
                            }
                        }
                        let (_, children) = cascade_targets(&instance, CascadeAction::Remove);
                        try_outcome!(self.remove_all(cx, children, visited).await);
                    }
                    Stage::Register => try_result!(self.schedule_delete(&instance)),
                    Stage::CascadeToParents => {
                        let (parents, _) = cascade_targets(&instance, CascadeAction::Remove);
                        try_outcome!(self.remove_all(cx, parents, visited).await);
                    }
                    _ => {}
                }
            }
            Outcome::Ok(())
        })
    }

    async fn remove_all(
        &mut self,
        cx: &Cx,
        targets: Vec<AnyEntityRef>,
        visited: &mut HashSet<usize>,
    ) -> Outcome<(), Error> {
        self.context.enter_cascade();
        let mut outcome = Outcome::Ok(());
        for target in targets {
            outcome = self.remove_any(cx, target, visited).await;
            if !matches!(outcome, Outcome::Ok(())) {
                break;
            }
        }
        self.context.exit_cascade();
        outcome
    }

    #[allow(clippy::result_large_err)]
    fn schedule_delete(&mut self, instance: &AnyEntityRef) -> Result<()> {
        let key = identifier_key(instance)?;
        if self.queue.remove_insert(&key) {
            tracing::debug!(entity = %key, "Dropping queued insert of removed instance");
            self.queue.discard(&key);
            self.context.remove(&key);
            return Ok(());
        }
        let entry = self
            .context
            .entry_mut(&key)
            .ok_or_else(|| not_managed(instance))?;
        let version = entry.version();
        entry.set_status(EntityStatus::Removed);

        for (info, _) in instance.collections() {
            self.queue.add_collection_action(EntityAction::CollectionRemove {
                owner: key.clone(),
                info,
            });
        }
        let references = instance
            .associations()
            .into_iter()
            .filter_map(|(_, target)| target.key())
            .collect();
        self.queue.add_delete(DeleteAction {
            key,
            instance: instance.clone(),
            version,
            references,
        });
        Ok(())
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Copy the state of a detached or transient instance onto the managed
    /// instance with the same identity and return the managed one.
    ///
    /// The managed instance is loaded first when the session does not hold
    /// it yet; an instance with no row behind it is persisted as a new copy.
    /// The argument itself never becomes managed.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = E::ENTITY_NAME))]
    pub async fn merge<E: Entity>(
        &mut self,
        cx: &Cx,
        entity: &EntityRef<E>,
    ) -> Outcome<EntityRef<E>, Error> {
        try_outcome!(self.prepare(cx).await);
        let mut visited = HashMap::new();
        let managed = try_outcome!(self.merge_any(cx, entity.erase(), &mut visited).await);
        Outcome::Ok(try_result!(Self::downcast::<E>(&managed)))
    }

    fn merge_any<'a>(
        &'a mut self,
        cx: &'a Cx,
        instance: AnyEntityRef,
        visited: &'a mut HashMap<usize, AnyEntityRef>,
    ) -> BoxFuture<'a, Outcome<AnyEntityRef, Error>> {
        Box::pin(async move {
            if let Some(managed) = visited.get(&instance.address()) {
                return Outcome::Ok(managed.clone());
            }
            let mut managed = instance.clone();
            let mut is_new = false;

            for stage in self.pipeline.stages(EventKind::Merge) {
                match stage {
                    Stage::ResolveManaged => {
                        (managed, is_new) = try_outcome!(self.resolve_managed(cx, &instance).await);
                        visited.insert(instance.address(), managed.clone());
                    }
                    Stage::CopyState if !is_new && !managed.ptr_eq(&instance) => {
                        let kept = managed.collections();
                        try_result!(managed.copy_state_from(&instance));
                        // An unfetched collection on the copy leaves the managed one alone.
                        for ((info, old), (_, new)) in kept.into_iter().zip(instance.collections()) {
                            if let (Some(old), None) = (old, new) {
                                try_result!(managed.set_collection(info.name, old));
                            }
                        }
                    }
                    Stage::CascadeToParents => {
                        for (info, target) in managed.associations() {
                            let AssociationTarget::Resolved(target) = target else {
                                continue;
                            };
                            let replacement = if info.cascades(CascadeAction::Merge) {
                                self.context.enter_cascade();
                                let outcome = self.merge_any(cx, target.clone(), visited).await;
                                self.context.exit_cascade();
                                try_outcome!(outcome)
                            } else {
                                match self.managed_counterpart(&target, visited) {
                                    Some(counterpart) => counterpart,
                                    None => continue,
                                }
                            };
                            if !replacement.ptr_eq(&target) {
                                try_result!(managed.set_association(
                                    info.name,
                                    AssociationTarget::Resolved(replacement)
                                ));
                            }
                        }
                    }
                    Stage::CascadeToChildren => {
                        for (info, elements) in managed.collections() {
                            let Some(elements) = elements else {
                                continue;
                            };
                            let mut replaced = Vec::with_capacity(elements.len());
                            let mut changed = false;
                            for element in elements {
                                let replacement = if info.cascades(CascadeAction::Merge) {
                                    self.context.enter_cascade();
                                    let outcome = self.merge_any(cx, element.clone(), visited).await;
                                    self.context.exit_cascade();
                                    try_outcome!(outcome)
                                } else {
                                    self.managed_counterpart(&element, visited)
                                        .unwrap_or_else(|| element.clone())
                                };
                                changed |= !replacement.ptr_eq(&element);
                                replaced.push(replacement);
                            }
                            if changed {
                                try_result!(managed.set_collection(info.name, replaced));
                            }
                        }
                    }
                    _ => {}
                }
            }

            if is_new {
                let mut persisted = HashSet::new();
                try_outcome!(self.persist_any(cx, managed.clone(), &mut persisted).await);
            }
            Outcome::Ok(managed)
        })
    }

    fn managed_counterpart(
        &self,
        instance: &AnyEntityRef,
        visited: &HashMap<usize, AnyEntityRef>,
    ) -> Option<AnyEntityRef> {
        if let Some(merged) = visited.get(&instance.address()) {
            return Some(merged.clone());
        }
        instance.key().and_then(|key| self.context.get(&key).cloned())
    }

    /// The managed instance `instance` merges into, and whether it is a new copy.
    async fn resolve_managed(
        &mut self,
        cx: &Cx,
        instance: &AnyEntityRef,
    ) -> Outcome<(AnyEntityRef, bool), Error> {
        match self.instance_state(instance) {
            InstanceState::Managed => return Outcome::Ok((instance.clone(), false)),
            InstanceState::Removed => {
                return Outcome::Err(Error::validation(
                    ValidationErrorKind::RemovedEntity,
                    format!("{} instance is scheduled for removal", instance.entity_name()),
                ));
            }
            InstanceState::Transient | InstanceState::Detached => {}
        }
        let meta = instance.metadata();
        let Some(key) = instance.key() else {
            return Outcome::Ok((instance.duplicate(), true));
        };

        let managed = if let Some(entry) = self.context.entry(&key) {
            if entry.is_removed() {
                return Outcome::Err(Error::validation(
                    ValidationErrorKind::RemovedEntity,
                    format!("{key} is scheduled for removal"),
                ));
            }
            entry.instance().clone()
        } else {
            let statement = self.persister(meta).select_by_id(key.id(), LockMode::None);
            let rows = try_outcome!(self.select(cx, &statement).await);
            match rows.first() {
                Some(row) => try_result!(self.load_row(&meta, row, false)),
                None if meta.id_strategy == IdStrategy::Assigned => {
                    return Outcome::Ok((instance.duplicate(), true));
                }
                None => return Outcome::Err(not_found(meta.name, key.id())),
            }
        };

        if meta.is_versioned() && instance.version() != managed.version() {
            tracing::debug!(entity = %key, "Merged instance carries a stale version");
            return Outcome::Err(stale(meta.name, key.id(), String::new()));
        }
        Outcome::Ok((managed, false))
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    /// Re-read a managed instance's state from the database, discarding
    /// in-memory changes.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = E::ENTITY_NAME))]
    pub async fn refresh<E: Entity>(&mut self, cx: &Cx, entity: &EntityRef<E>) -> Outcome<(), Error> {
        try_outcome!(self.prepare(cx).await);
        let mut visited = HashSet::new();
        self.refresh_any(cx, entity.erase(), &mut visited).await
    }

    fn refresh_any<'a>(
        &'a mut self,
        cx: &'a Cx,
        instance: AnyEntityRef,
        visited: &'a mut HashSet<usize>,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            if !visited.insert(instance.address()) {
                return Outcome::Ok(());
            }
            // Captured before the reload replaces associations with keys.
            let (parents, children) = cascade_targets(&instance, CascadeAction::Refresh);

            for stage in self.pipeline.stages(EventKind::Refresh) {
                match stage {
                    Stage::CheckState => try_result!(self.check_persistent(&instance)),
                    Stage::Reload => try_outcome!(self.reload(cx, &instance, LockMode::None).await),
                    Stage::CascadeToParents | Stage::CascadeToChildren => {
                        let targets = if *stage == Stage::CascadeToParents {
                            &parents
                        } else {
                            &children
                        };
                        self.context.enter_cascade();
                        let mut outcome = Outcome::Ok(());
                        for target in targets {
                            if !self.context.contains(target) {
                                continue;
                            }
                            outcome = self.refresh_any(cx, target.clone(), visited).await;
                            if !matches!(outcome, Outcome::Ok(())) {
                                break;
                            }
                        }
                        self.context.exit_cascade();
                        try_outcome!(outcome);
                    }
                    Stage::PostCallback => {
                        try_result!(self.pipeline.fire(Callback::PostLoad, &instance));
                    }
                    _ => {}
                }
            }
            Outcome::Ok(())
        })
    }

    /// Fails unless the instance is managed, not removed, and has a row.
    #[allow(clippy::result_large_err)]
    fn check_persistent(&self, instance: &AnyEntityRef) -> Result<()> {
        let entry = self
            .context
            .entry_of(instance)
            .ok_or_else(|| not_managed(instance))?;
        if entry.is_removed() {
            return Err(Error::validation(
                ValidationErrorKind::RemovedEntity,
                format!("{} is scheduled for removal", entry.key()),
            ));
        }
        if !entry.exists_in_database() {
            return Err(Error::validation(
                ValidationErrorKind::InvalidState,
                format!("{} has not been flushed yet", entry.key()),
            ));
        }
        Ok(())
    }

    async fn reload(&mut self, cx: &Cx, instance: &AnyEntityRef, mode: LockMode) -> Outcome<(), Error> {
        let meta = instance.metadata();
        let key = try_result!(identifier_key(instance));
        let statement = self.persister(meta).select_by_id(key.id(), mode);
        let rows = try_outcome!(self.select(cx, &statement).await);
        let Some(row) = rows.first() else {
            return Outcome::Err(not_found(meta.name, key.id()));
        };
        try_result!(instance.apply_row(row));
        for (info, _) in instance.collections() {
            self.context
                .remove_collection(&CollectionKey::new(info.name, key.clone()));
        }
        self.link_associations(instance);
        try_result!(self.context.refresh(&key, instance.values(), instance.version()));
        tracing::debug!(entity = %key, "Refreshed");
        Outcome::Ok(())
    }

    // ========================================================================
    // Lock
    // ========================================================================

    /// Apply `mode` to a managed instance.
    ///
    /// `Read` and `Optimistic` verify the version against the database now;
    /// `OptimisticForceIncrement` makes the next flush bump the version even
    /// when nothing else changed; the pessimistic modes re-select the row
    /// with a row-lock clause.
    #[tracing::instrument(level = "debug", skip(self, cx, entity), fields(entity = E::ENTITY_NAME))]
    pub async fn lock<E: Entity>(
        &mut self,
        cx: &Cx,
        entity: &EntityRef<E>,
        mode: LockMode,
    ) -> Outcome<(), Error> {
        try_outcome!(self.prepare(cx).await);
        let mut visited = HashSet::new();
        self.lock_any(cx, entity.erase(), mode, &mut visited).await
    }

    fn lock_any<'a>(
        &'a mut self,
        cx: &'a Cx,
        instance: AnyEntityRef,
        mode: LockMode,
        visited: &'a mut HashSet<usize>,
    ) -> BoxFuture<'a, Outcome<(), Error>> {
        Box::pin(async move {
            if !visited.insert(instance.address()) {
                return Outcome::Ok(());
            }
            for stage in self.pipeline.stages(EventKind::Lock) {
                match stage {
                    Stage::CheckState => try_result!(self.check_persistent(&instance)),
                    Stage::ApplyLock => try_outcome!(self.apply_lock(cx, &instance, mode).await),
                    Stage::CascadeToParents | Stage::CascadeToChildren => {
                        let (parents, children) = cascade_targets(&instance, CascadeAction::Lock);
                        let targets = if *stage == Stage::CascadeToParents {
                            parents
                        } else {
                            children
                        };
                        for target in targets {
                            if self.context.contains(&target) {
                                try_outcome!(self.lock_any(cx, target, mode, visited).await);
                            }
                        }
                    }
                    _ => {}
                }
            }
            Outcome::Ok(())
        })
    }

    async fn apply_lock(&mut self, cx: &Cx, instance: &AnyEntityRef, mode: LockMode) -> Outcome<(), Error> {
        let meta = instance.metadata();
        let key = try_result!(identifier_key(instance));
        if matches!(mode, LockMode::Optimistic | LockMode::OptimisticForceIncrement)
            && !meta.is_versioned()
        {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::InvalidState,
                format!("{mode:?} needs a version column; {} has none", meta.name),
            ));
        }
        let expected = self.context.entry(&key).and_then(EntityEntry::version);

        match mode {
            LockMode::None | LockMode::OptimisticForceIncrement => {}
            LockMode::Read | LockMode::Optimistic => {
                let Some(statement) = self.persister(meta).version_select(key.id()) else {
                    return Outcome::Ok(());
                };
                let rows = try_outcome!(self.select(cx, &statement).await);
                let Some(row) = rows.first() else {
                    return Outcome::Err(not_found(meta.name, key.id()));
                };
                let found: i64 = try_result!(row.get_as(0));
                if expected != Some(found) {
                    return Outcome::Err(stale(meta.name, key.id(), statement.sql));
                }
            }
            LockMode::PessimisticRead | LockMode::PessimisticWrite => {
                let statement = self.persister(meta).select_by_id(key.id(), mode);
                let rows = try_outcome!(self.select(cx, &statement).await);
                let Some(row) = rows.first() else {
                    return Outcome::Err(not_found(meta.name, key.id()));
                };
                if let Some(column) = meta.version_column {
                    let found: i64 = try_result!(row.get_named(column));
                    if expected != Some(found) {
                        return Outcome::Err(stale(meta.name, key.id(), statement.sql));
                    }
                }
            }
        }

        if let Some(entry) = self.context.entry_mut(&key) {
            if mode.strength() > entry.lock_mode().strength() {
                entry.set_lock_mode(mode);
            }
        }
        Outcome::Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Load `E#id`, returning the managed instance when the session already
    /// holds it. A missing row is `None`, not an error.
    pub async fn find<E: Entity>(
        &mut self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityRef<E>>, Error> {
        self.find_with_lock(cx, id, LockMode::None).await
    }

    /// [`Session::find`] that also applies `mode` to the result.
    #[tracing::instrument(level = "debug", skip(self, cx, id), fields(entity = E::ENTITY_NAME))]
    pub async fn find_with_lock<E: Entity>(
        &mut self,
        cx: &Cx,
        id: impl Into<Value>,
        mode: LockMode,
    ) -> Outcome<Option<EntityRef<E>>, Error> {
        try_outcome!(self.prepare(cx).await);
        let key = EntityKey::of::<E>(id);
        let meta = EntityMetadata::of::<E>();
        let mut row = None;
        let mut loaded = None;

        for stage in self.pipeline.stages(EventKind::Load) {
            match stage {
                Stage::IdentityLookup => {
                    let Some(entry) = self.context.entry(&key) else {
                        continue;
                    };
                    if entry.is_removed() {
                        return Outcome::Ok(None);
                    }
                    let existing = entry.instance().clone();
                    if mode != LockMode::None && entry.exists_in_database() {
                        try_outcome!(self.apply_lock(cx, &existing, mode).await);
                    }
                    return Outcome::Ok(Some(try_result!(Self::downcast::<E>(&existing))));
                }
                Stage::Fetch => {
                    let statement = self.persister(meta).select_by_id(key.id(), mode);
                    let rows = try_outcome!(self.select(cx, &statement).await);
                    match rows.into_iter().next() {
                        Some(first) => row = Some(first),
                        None => {
                            tracing::debug!(entity = %key, "No row");
                            return Outcome::Ok(None);
                        }
                    }
                }
                Stage::Register => {
                    let Some(row) = row.as_ref() else {
                        continue;
                    };
                    self.context.before_load();
                    let materialized = self.materialize(&meta, row, false);
                    self.context.after_load();
                    let (instance, created) = try_result!(materialized);
                    if mode != LockMode::None {
                        if let Some(entry) = self.context.entry_mut(&key) {
                            entry.set_lock_mode(mode);
                        }
                    }
                    loaded = Some((instance, created));
                }
                Stage::PostCallback => {
                    if let Some((instance, true)) = &loaded {
                        try_result!(self.pipeline.fire(Callback::PostLoad, instance));
                    }
                }
                _ => {}
            }
        }

        match loaded {
            Some((instance, _)) => Outcome::Ok(Some(try_result!(Self::downcast::<E>(&instance)))),
            None => Outcome::Ok(None),
        }
    }

    /// Load the target of an association.
    ///
    /// An unresolved association whose row no longer exists fails with
    /// [`Error::EntityNotFound`].
    #[tracing::instrument(level = "debug", skip(self, cx, association), fields(entity = E::ENTITY_NAME))]
    pub async fn resolve<E: Entity>(
        &mut self,
        cx: &Cx,
        association: &Association<E>,
    ) -> Outcome<Option<EntityRef<E>>, Error> {
        try_outcome!(self.prepare(cx).await);
        let key = match association {
            Association::Empty => return Outcome::Ok(None),
            Association::Resolved(target) => return Outcome::Ok(Some(target.clone())),
            Association::Unresolved(key) => key.clone(),
        };
        if let Some(existing) = self.context.get(&key) {
            return Outcome::Ok(Some(try_result!(Self::downcast::<E>(existing))));
        }

        let meta = EntityMetadata::of::<E>();
        let statement = self.persister(meta).select_by_id(key.id(), LockMode::None);
        let rows = try_outcome!(self.select(cx, &statement).await);
        let Some(row) = rows.first() else {
            tracing::warn!(entity = %key, "Referenced row no longer exists");
            return Outcome::Err(not_found(E::ENTITY_NAME, key.id()));
        };
        let instance = try_result!(self.load_row(&meta, row, false));
        Outcome::Ok(Some(try_result!(Self::downcast::<E>(&instance))))
    }

    /// Initialize the collection `role` of a managed owner from its link
    /// table. Returns the number of elements.
    #[tracing::instrument(level = "debug", skip(self, cx, owner), fields(entity = E::ENTITY_NAME))]
    pub async fn fetch<E: Entity>(
        &mut self,
        cx: &Cx,
        owner: &EntityRef<E>,
        role: &str,
    ) -> Outcome<usize, Error> {
        try_outcome!(self.prepare(cx).await);
        let Some(info) = EntityMetadata::of::<E>()
            .association(role)
            .filter(|info| info.is_collection())
        else {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::InvalidState,
                format!("{} has no collection named '{role}'", E::ENTITY_NAME),
            ));
        };
        let owner = owner.erase();
        if self.context.entry_of(&owner).is_none() {
            return Outcome::Err(not_managed(&owner));
        }
        self.fetch_any(cx, &owner, info).await
    }

    pub(crate) async fn fetch_any(
        &mut self,
        cx: &Cx,
        owner: &AnyEntityRef,
        info: &'static AssociationInfo,
    ) -> Outcome<usize, Error> {
        let key = try_result!(identifier_key(owner));
        let persister = try_result!(CollectionPersister::new(info, self.dialect));
        let statement = persister.select_elements(key.id());
        let collection = CollectionKey::new(info.name, key.clone());

        self.context.begin_collection_load(collection.clone());
        let rows = match self.select(cx, &statement).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => {
                self.context.finish_collection_load(&collection);
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                self.context.finish_collection_load(&collection);
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                self.context.finish_collection_load(&collection);
                return Outcome::Panicked(p);
            }
        };

        let target = info.target_metadata();
        let mut elements = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.load_row(&target, row, false) {
                Ok(element) => elements.push(element),
                Err(e) => {
                    self.context.finish_collection_load(&collection);
                    return Outcome::Err(e);
                }
            }
        }
        if !self.context.finish_collection_load(&collection) {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::InvalidState,
                format!("load of {key}.{} was cancelled", info.name),
            ));
        }

        let keys = elements.iter().filter_map(AnyEntityRef::key).collect();
        let count = elements.len();
        try_result!(owner.set_collection(info.name, elements));
        self.context.add_collection(collection, info, owner.clone(), Some(keys));
        tracing::debug!(owner = %key, role = info.name, count, "Fetched collection");
        Outcome::Ok(count)
    }
}
