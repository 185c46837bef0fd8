//! Flush: synchronize pending changes with the database.
//!
//! A flush cascades persist to reachable instances, dirty-checks every
//! modifiable entry against its loaded snapshot, diffs tracked collections,
//! orders the resulting actions and executes them through the batching
//! connection. Entries are only updated once every statement succeeded; a
//! failed flush discards the queue, marks an active transaction
//! rollback-only and leaves the session refusing work until its state is
//! discarded by a rollback, `clear` or `close`.

use crate::action_queue::{EntityAction, UpdateAction};
use crate::batching::BatchedStatement;
use crate::context::{CollectionKey, EntityStatus};
use crate::persister::CollectionPersister;
use crate::pipeline::{Callback, EventKind, Stage};
use crate::Session;
use asupersync::{Cx, Outcome};
use std::collections::HashSet;
use tessera_core::{
    AnyEntityRef, AssociationInfo, Connection, EntityKey, Error, LockMode, Result,
    ValidationErrorKind, try_outcome, try_result,
};

/// What a flush did, applied to the context once every statement succeeded.
#[derive(Default)]
struct Executed {
    inserted: Vec<AnyEntityRef>,
    updated: Vec<AnyEntityRef>,
    deleted: Vec<(EntityKey, AnyEntityRef)>,
}

impl<C: Connection> Session<C> {
    /// Execute every pending write and synchronize the persistence context.
    ///
    /// Fails with [`ValidationErrorKind::ReentrantFlush`] when called from a
    /// listener while a cascade or another flush is running.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_outcome!(self.prepare(cx).await);
        self.flush_inner(cx).await
    }

    pub(crate) async fn flush_inner(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.flushing || self.context.is_cascading() {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::ReentrantFlush,
                "flush requested while a cascade or flush is in progress",
            ));
        }
        self.flushing = true;
        let outcome = self.run_flush(cx).await;
        self.flushing = false;

        if !matches!(outcome, Outcome::Ok(())) {
            let discarded = self.conn.abort_batch();
            self.queue.clear();
            self.failed = true;
            if self.transaction.is_active() {
                let _ = self.transaction.mark_rollback_only();
            }
            tracing::warn!(
                discarded,
                entities = self.context.len(),
                "Flush failed; pending writes discarded, session needs a rollback or clear"
            );
        }
        outcome
    }

    async fn run_flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let mut executed = Executed::default();
        for stage in self.pipeline.stages(EventKind::Flush) {
            match stage {
                Stage::CascadeOnFlush => try_outcome!(self.cascade_on_flush(cx).await),
                Stage::DirtyCheck => try_result!(self.schedule_updates()),
                Stage::CollectionDiff => try_result!(self.schedule_collection_changes()),
                Stage::Execute => executed = try_outcome!(self.execute_actions(cx).await),
                Stage::PostProcess => {
                    try_result!(self.post_flush(std::mem::take(&mut executed)));
                }
                _ => {}
            }
        }
        Outcome::Ok(())
    }

    async fn cascade_on_flush(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let managed: Vec<AnyEntityRef> = self
            .context
            .entries()
            .filter(|e| e.status() == EntityStatus::Managed)
            .map(|e| e.instance().clone())
            .collect();
        let mut visited = HashSet::new();
        for instance in managed {
            try_outcome!(self.persist_any(cx, instance, &mut visited).await);
        }
        Outcome::Ok(())
    }

    /// Instance reachable from a managed row that is not itself managed.
    #[allow(clippy::result_large_err)]
    fn check_references(&self, instance: &AnyEntityRef) -> Result<()> {
        for (info, target) in instance.associations() {
            let Some(target) = target.resolved() else {
                continue;
            };
            let known = self.context.contains(target);
            if !known {
                return Err(Error::validation(
                    ValidationErrorKind::TransientReference,
                    format!(
                        "{}.{} references an unsaved {} instance",
                        instance.entity_name(),
                        info.name,
                        target.entity_name()
                    ),
                ));
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn schedule_updates(&mut self) -> Result<()> {
        for insert in self.queue.inserts() {
            self.check_references(&insert.instance)?;
        }
        let mut updates = Vec::new();
        for entry in self.context.entries() {
            if entry.status() != EntityStatus::Managed || !entry.exists_in_database() {
                continue;
            }
            let instance = entry.instance();
            let current = instance.values();
            let mut columns = entry.dirty_columns(&current);
            let meta = instance.metadata();
            columns.retain(|c| meta.update_columns().any(|u| u == *c));
            let force = entry.lock_mode() == LockMode::OptimisticForceIncrement;
            if columns.is_empty() && !force {
                continue;
            }
            self.check_references(instance)?;
            if !columns.is_empty() && !self.config.dynamic_update {
                columns = meta.update_columns().collect();
            }
            updates.push((entry.key().clone(), instance.clone(), columns, entry.version()));
        }

        for (key, instance, columns, previous_version) in updates {
            if !columns.is_empty() {
                self.pipeline.fire(Callback::PreUpdate, &instance)?;
            }
            let next_version = previous_version.map(|v| v + 1);
            tracing::trace!(entity = %key, columns = ?columns, "Scheduling update");
            self.queue.add_update(UpdateAction {
                key,
                instance,
                columns,
                previous_version,
                next_version,
            });
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn schedule_collection_changes(&mut self) -> Result<()> {
        let mut actions = Vec::new();
        for entry in self.context.entries() {
            if entry.status() != EntityStatus::Managed {
                continue;
            }
            let owner = entry.key();
            for (info, elements) in entry.instance().collections() {
                let Some(elements) = elements else {
                    continue;
                };
                if info.link_table.is_none() {
                    continue;
                }
                let mut current = Vec::with_capacity(elements.len());
                for element in &elements {
                    if !self.context.contains(element) {
                        return Err(Error::validation(
                            ValidationErrorKind::TransientReference,
                            format!(
                                "{owner}.{} contains an unsaved {} instance",
                                info.name,
                                element.entity_name()
                            ),
                        ));
                    }
                    if let Some(key) = element.key() {
                        current.push(key);
                    }
                }

                let tracked = self
                    .context
                    .collection(&CollectionKey::new(info.name, owner.clone()))
                    .and_then(|c| c.snapshot());
                match tracked {
                    Some(snapshot) => {
                        let (inserts, deletes) = diff(snapshot, &current);
                        if !inserts.is_empty() || !deletes.is_empty() {
                            actions.push(EntityAction::CollectionUpdate {
                                owner: owner.clone(),
                                info,
                                inserts,
                                deletes,
                            });
                        }
                    }
                    None => {
                        // A replaced collection: its old link rows are unknown.
                        if entry.exists_in_database() {
                            actions.push(EntityAction::CollectionRemove {
                                owner: owner.clone(),
                                info,
                            });
                        }
                        actions.push(EntityAction::CollectionRecreate {
                            owner: owner.clone(),
                            info,
                            elements: current,
                        });
                    }
                }
            }
        }
        for action in actions {
            self.queue.add_collection_action(action);
        }
        Ok(())
    }

    async fn execute_actions(&mut self, cx: &Cx) -> Outcome<Executed, Error> {
        let plan = try_result!(self.queue.plan(self.config.order_inserts));
        let mut executed = Executed::default();
        tracing::debug!(actions = plan.len(), "Executing flush");

        for action in plan {
            match action {
                EntityAction::Insert(insert) => {
                    let state = insert.instance.values();
                    let statement = self.persister(insert.instance.metadata()).insert(&state);
                    try_outcome!(self.submit(cx, statement, Some(&insert.key)).await);
                    executed.inserted.push(insert.instance);
                }
                EntityAction::Update(update) => {
                    let state = update.instance.values();
                    let statement = try_result!(self.persister(update.instance.metadata()).update(
                        &state,
                        &update.columns,
                        update.previous_version,
                        update.next_version,
                    ));
                    try_outcome!(self.submit(cx, statement, Some(&update.key)).await);
                    executed.updated.push(update.instance);
                }
                EntityAction::Delete(delete) => {
                    let statement = self
                        .persister(delete.instance.metadata())
                        .delete(delete.key.id(), delete.version);
                    try_outcome!(self.submit(cx, statement, Some(&delete.key)).await);
                    executed.deleted.push((delete.key, delete.instance));
                }
                EntityAction::CollectionRemove { owner, info } => {
                    let persister = try_result!(CollectionPersister::new(info, self.dialect));
                    try_outcome!(self.submit(cx, persister.delete_all(owner.id()), None).await);
                }
                EntityAction::CollectionRecreate {
                    owner,
                    info,
                    elements,
                } => {
                    try_outcome!(self.write_links(cx, &owner, info, &elements, &[]).await);
                }
                EntityAction::CollectionUpdate {
                    owner,
                    info,
                    inserts,
                    deletes,
                } => {
                    try_outcome!(self.write_links(cx, &owner, info, &inserts, &deletes).await);
                }
            }
        }
        try_outcome!(self.conn.execute_batch(cx).await);
        Outcome::Ok(executed)
    }

    async fn write_links(
        &mut self,
        cx: &Cx,
        owner: &EntityKey,
        info: &'static AssociationInfo,
        inserts: &[EntityKey],
        deletes: &[EntityKey],
    ) -> Outcome<(), Error> {
        let persister = try_result!(CollectionPersister::new(info, self.dialect));
        for element in deletes {
            let statement = persister.delete_row(owner.id(), element.id());
            try_outcome!(self.submit(cx, statement, Some(owner)).await);
        }
        for element in inserts {
            let statement = persister.insert_row(owner.id(), element.id());
            try_outcome!(self.submit(cx, statement, Some(owner)).await);
        }
        Outcome::Ok(())
    }

    /// Queue one statement on the batching connection. With `expect`, the
    /// statement must affect exactly one row.
    async fn submit(
        &mut self,
        cx: &Cx,
        statement: tessera_query::BoundStatement,
        expect: Option<&EntityKey>,
    ) -> Outcome<(), Error> {
        let sql = try_result!(self.native(&statement));
        let mut batched = BatchedStatement::new(sql, statement.params);
        if let Some(key) = expect {
            batched = batched.expect_rows(1, key.entity(), key.id().clone());
        }
        self.conn.add_to_batch(cx, batched).await
    }

    #[allow(clippy::result_large_err)]
    fn post_flush(&mut self, executed: Executed) -> Result<()> {
        for instance in executed.inserted.iter().chain(&executed.updated) {
            let Some(key) = instance.key() else {
                continue;
            };
            if let Some(entry) = self.context.entry_mut(&key) {
                let next = entry.version().map(|v| v + 1);
                let version = if executed.updated.iter().any(|u| u.ptr_eq(instance)) {
                    if let Some(next) = next {
                        instance.set_version(next);
                    }
                    next
                } else {
                    instance.version()
                };
                entry.synchronized(instance.values(), version);
                if entry.lock_mode() == LockMode::OptimisticForceIncrement {
                    entry.set_lock_mode(LockMode::Optimistic);
                }
            }
        }
        for (key, _) in &executed.deleted {
            self.context.remove(key);
        }

        let owners: Vec<(EntityKey, AnyEntityRef)> = self
            .context
            .entries()
            .filter(|e| e.status() == EntityStatus::Managed)
            .map(|e| (e.key().clone(), e.instance().clone()))
            .collect();
        for (key, owner) in owners {
            for (info, elements) in owner.collections() {
                let Some(elements) = elements else {
                    continue;
                };
                let snapshot = elements.iter().filter_map(AnyEntityRef::key).collect();
                let collection = CollectionKey::new(info.name, key.clone());
                match self.context.collection_mut(&collection) {
                    Some(tracked) => tracked.set_snapshot(snapshot),
                    None => self
                        .context
                        .add_collection(collection, info, owner.clone(), Some(snapshot)),
                }
            }
        }

        for instance in &executed.inserted {
            self.pipeline.fire(Callback::PostPersist, instance)?;
        }
        for instance in &executed.updated {
            self.pipeline.fire(Callback::PostUpdate, instance)?;
        }
        for (_, instance) in &executed.deleted {
            self.pipeline.fire(Callback::PostRemove, instance)?;
        }

        self.queue.clear();
        self.counters.flushes += 1;
        tracing::debug!(
            inserted = executed.inserted.len(),
            updated = executed.updated.len(),
            deleted = executed.deleted.len(),
            "Flush complete"
        );
        Ok(())
    }

    /// Tables a flush would write to right now.
    pub(crate) fn pending_tables(&self) -> HashSet<&'static str> {
        let mut tables = self.queue.tables();
        for entry in self.context.entries() {
            if entry.status() != EntityStatus::Managed {
                continue;
            }
            let instance = entry.instance();
            let meta = instance.metadata();
            if entry.exists_in_database() {
                let current = instance.values();
                let dirty = entry
                    .dirty_columns(&current)
                    .into_iter()
                    .any(|c| meta.update_columns().any(|u| u == c));
                if dirty || entry.lock_mode() == LockMode::OptimisticForceIncrement {
                    tables.insert(meta.table);
                }
            }
            for (info, elements) in instance.collections() {
                let (Some(elements), Some(link)) = (elements, info.link_table) else {
                    continue;
                };
                let current: Vec<EntityKey> = elements.iter().filter_map(AnyEntityRef::key).collect();
                let tracked = self
                    .context
                    .collection(&CollectionKey::new(info.name, entry.key().clone()))
                    .and_then(|c| c.snapshot());
                let changed = match tracked {
                    Some(snapshot) => {
                        let (inserts, deletes) = diff(snapshot, &current);
                        !inserts.is_empty() || !deletes.is_empty()
                    }
                    None => true,
                };
                if changed {
                    tables.insert(link.table_name);
                }
            }
        }
        tables
    }
}

/// Elements to link and to unlink, in collection order.
fn diff(snapshot: &[EntityKey], current: &[EntityKey]) -> (Vec<EntityKey>, Vec<EntityKey>) {
    let before: HashSet<&EntityKey> = snapshot.iter().collect();
    let after: HashSet<&EntityKey> = current.iter().collect();
    let inserts = current
        .iter()
        .filter(|k| !before.contains(k))
        .cloned()
        .collect();
    let deletes = snapshot
        .iter()
        .filter(|k| !after.contains(k))
        .cloned()
        .collect();
    (inserts, deletes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        Book, MockConnection, author, book, book_row, expect_err, tag, tag_row, unwrap_outcome,
    };
    use crate::{SessionConfig, SessionFactory};
    use asupersync::runtime::RuntimeBuilder;
    use tessera_core::Value;

    fn runtime() -> asupersync::runtime::Runtime {
        RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime")
    }

    fn key(entity: &'static str, id: i64) -> EntityKey {
        EntityKey::new(entity, id)
    }

    #[test]
    fn diff_keeps_collection_order() {
        let before = vec![key("Tag", 1), key("Tag", 2)];
        let after = vec![key("Tag", 3), key("Tag", 1), key("Tag", 4)];
        let (inserts, deletes) = diff(&before, &after);
        assert_eq!(inserts, vec![key("Tag", 3), key("Tag", 4)]);
        assert_eq!(deletes, vec![key("Tag", 2)]);
    }

    #[test]
    fn dirty_entity_is_updated_with_version_check() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(1, "T", 4, None)]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let b = unwrap_outcome(session.find::<Book>(&cx, 1_i64).await).unwrap();
            unwrap_outcome(session.flush(&cx).await);
            assert!(conn.statements().is_empty());

            b.write().title = "New".into();
            unwrap_outcome(session.flush(&cx).await);
            assert_eq!(b.read().version, 5);
            assert!(!session.is_dirty().unwrap());
            unwrap_outcome(session.flush(&cx).await);
        });

        let statements = conn.statements();
        assert_eq!(statements.len(), 1);
        assert_eq!(
            statements[0].0,
            "UPDATE \"books\" SET \"title\" = $1, \"author_id\" = $2, \"version\" = $3 \
             WHERE \"id\" = $4 AND \"version\" = $5"
        );
        assert_eq!(
            statements[0].1,
            vec![
                Value::from("New"),
                Value::Null,
                Value::BigInt(5),
                Value::BigInt(1),
                Value::BigInt(4)
            ]
        );
    }

    #[test]
    fn dynamic_update_writes_changed_columns_only() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(1, "T", 0, None)]);
        let factory =
            SessionFactory::new(SessionConfig::default().with_dynamic_update(true)).unwrap();
        let mut session = factory.open(conn.clone());

        rt.block_on(async {
            let b = unwrap_outcome(session.find::<Book>(&cx, 1_i64).await).unwrap();
            b.write().title = "New".into();
            unwrap_outcome(session.flush(&cx).await);
        });
        assert_eq!(
            conn.statement_sql(),
            vec!["UPDATE \"books\" SET \"title\" = $1, \"version\" = $2 WHERE \"id\" = $3 AND \"version\" = $4"]
        );
    }

    #[test]
    fn concurrent_change_is_stale_state() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(1, "T", 0, None)]);
        conn.affect("UPDATE \"books\"", 0);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            unwrap_outcome(session.begin(&cx).await);
            let b = unwrap_outcome(session.find::<Book>(&cx, 1_i64).await).unwrap();
            b.write().title = "New".into();
            let err = expect_err(session.flush(&cx).await);
            assert!(err.is_stale_state());
            assert!(session.action_queue().is_empty());
            assert!(session.transaction().is_marked_for_rollback());
            assert_eq!(b.read().version, 0);
        });
    }

    #[test]
    fn force_increment_bumps_version_without_changes() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(1, "T", 2, None)]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let b = unwrap_outcome(session.find::<Book>(&cx, 1_i64).await).unwrap();
            unwrap_outcome(session.lock(&cx, &b, LockMode::OptimisticForceIncrement).await);
            assert!(session.is_dirty().unwrap());
            unwrap_outcome(session.flush(&cx).await);
            assert_eq!(b.read().version, 3);
            assert!(!session.is_dirty().unwrap());
        });
        assert_eq!(
            conn.statement_sql(),
            vec!["UPDATE \"books\" SET \"version\" = $1 WHERE \"id\" = $2 AND \"version\" = $3"]
        );
    }

    #[test]
    fn collection_changes_become_link_rows() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(1, "T", 0, None)]);
        conn.respond("FROM \"tags\"", vec![tag_row(1, "a"), tag_row(2, "b")]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let b = unwrap_outcome(session.find::<Book>(&cx, 1_i64).await).unwrap();
            unwrap_outcome(session.fetch(&cx, &b, "tags").await);
            let first = b.read().tags.iter().next().cloned().unwrap();
            let added = tag(3, "c");
            unwrap_outcome(session.persist(&cx, &added).await);
            b.write().tags.remove(&first).unwrap();
            b.write().tags.add(&added).unwrap();
            assert!(session.is_dirty().unwrap());
            unwrap_outcome(session.flush(&cx).await);
            assert!(!session.is_dirty().unwrap());
        });

        let statements = conn.statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].0.starts_with("INSERT INTO \"tags\""));
        assert_eq!(
            statements[1].0,
            "DELETE FROM \"book_tags\" WHERE \"book_id\" = $1 AND \"tag_id\" = $2"
        );
        assert_eq!(statements[1].1, vec![Value::BigInt(1), Value::BigInt(1)]);
        assert_eq!(
            statements[2].0,
            "INSERT INTO \"book_tags\" (\"book_id\", \"tag_id\") VALUES ($1, $2)"
        );
        assert_eq!(statements[2].1, vec![Value::BigInt(1), Value::BigInt(3)]);
    }

    #[test]
    fn unsaved_reference_is_rejected() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = Session::new(conn);
        let b = book(Some(1), "T", None);

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &b).await);
            unwrap_outcome(session.flush(&cx).await);
        });

        // Checked without the flush cascade, which would persist them.
        b.write().tags.add(&tag(9, "loose")).unwrap();
        let err = session.schedule_collection_changes().unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::TransientReference));

        b.write().author = tessera_core::Association::resolved(&author(None, "Nobody"));
        let err = session.check_references(&b.erase()).unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::TransientReference));
    }

    #[test]
    fn cascade_on_flush_persists_new_associations() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(1, "T", 0, None)]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let b = unwrap_outcome(session.find::<Book>(&cx, 1_i64).await).unwrap();
            let a = author(None, "New author");
            b.write().author = tessera_core::Association::resolved(&a);
            unwrap_outcome(session.flush(&cx).await);
            assert!(session.contains(&a).unwrap());
        });

        let statements = conn.statements();
        assert!(statements[0].0.starts_with("INSERT INTO \"authors\""));
        assert!(statements[1].0.starts_with("UPDATE \"books\""));
        assert_eq!(statements[1].1[1], Value::BigInt(1));
    }

    #[test]
    fn batched_inserts_share_round_trips() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let factory = SessionFactory::new(SessionConfig::default().with_batch_size(2)).unwrap();
        let mut session = factory.open(conn.clone());

        rt.block_on(async {
            for id in 1..=5 {
                unwrap_outcome(session.persist(&cx, &tag(id, "t")).await);
            }
            unwrap_outcome(session.flush(&cx).await);
        });
        assert_eq!(conn.batches(), vec![2, 2, 1]);
        assert_eq!(session.statistics().statements, 5);
        assert_eq!(session.statistics().batches, 3);
    }

    #[test]
    fn failed_flush_blocks_the_session_until_cleared() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.fail_at(2);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let first = tag(1, "a");
            let second = tag(2, "b");
            unwrap_outcome(session.persist(&cx, &first).await);
            unwrap_outcome(session.persist(&cx, &second).await);
            let err = expect_err(session.flush(&cx).await);
            assert!(matches!(err, Error::Query(_)));
            assert!(session.action_queue().is_empty());
            assert!(session.has_failed());

            // A retry must not report the discarded inserts as written.
            let retry = expect_err(session.flush(&cx).await);
            assert_eq!(retry.validation_kind(), Some(ValidationErrorKind::InvalidState));
            expect_err(session.persist(&cx, &tag(3, "c")).await);
            assert!(session.contains(&second).is_err());
            assert!(session.is_dirty().is_err());
            assert_eq!(conn.statements().len(), 2);

            session.clear().unwrap();
            assert!(!session.has_failed());
            assert!(!session.contains(&second).unwrap());
            unwrap_outcome(session.persist(&cx, &second).await);
            unwrap_outcome(session.flush(&cx).await);
        });
        assert_eq!(conn.statements().len(), 3);
        assert_eq!(session.statistics().flushes, 1);
    }
}
