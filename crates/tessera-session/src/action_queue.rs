//! Deferred write actions and their flush ordering.
//!
//! Actions are executed in five groups: inserts, updates, collection
//! removals, collection updates and recreations, deletes. Inside the insert
//! group an action whose row references another row still waiting to be
//! inserted is deferred to a later sub-pass; inside the delete group an
//! action whose row is still referenced by another pending delete is
//! deferred the same way.

use std::collections::HashSet;
use tessera_core::{
    AnyEntityRef, AssociationInfo, EntityKey, Error, Result, ValidationErrorKind,
};

/// Insert of a new row. Column values are read when the action executes.
#[derive(Debug, Clone)]
pub struct InsertAction {
    pub key: EntityKey,
    pub instance: AnyEntityRef,
}

impl InsertAction {
    /// Keys of the rows this insert's foreign keys point at, excluding itself.
    fn references(&self) -> impl Iterator<Item = EntityKey> + '_ {
        self.instance
            .associations()
            .into_iter()
            .filter_map(|(_, target)| target.key())
            .filter(move |key| key != &self.key)
    }
}

/// Update of a dirty row.
#[derive(Debug, Clone)]
pub struct UpdateAction {
    pub key: EntityKey,
    pub instance: AnyEntityRef,
    /// Columns to write; empty for a version-only increment.
    pub columns: Vec<&'static str>,
    pub previous_version: Option<i64>,
    pub next_version: Option<i64>,
}

/// Delete of a removed row.
#[derive(Debug, Clone)]
pub struct DeleteAction {
    pub key: EntityKey,
    pub instance: AnyEntityRef,
    pub version: Option<i64>,
    /// Rows this row referenced when it was removed.
    pub references: Vec<EntityKey>,
}

/// A pending write.
#[derive(Debug, Clone)]
pub enum EntityAction {
    Insert(InsertAction),
    Update(UpdateAction),
    Delete(DeleteAction),
    /// Delete every link row of the owner.
    CollectionRemove {
        owner: EntityKey,
        info: &'static AssociationInfo,
    },
    /// Insert every link row of a new collection.
    CollectionRecreate {
        owner: EntityKey,
        info: &'static AssociationInfo,
        elements: Vec<EntityKey>,
    },
    /// Apply the difference between the snapshot and the current elements.
    CollectionUpdate {
        owner: EntityKey,
        info: &'static AssociationInfo,
        inserts: Vec<EntityKey>,
        deletes: Vec<EntityKey>,
    },
}

impl EntityAction {
    /// Table the action writes to.
    pub fn table(&self) -> &'static str {
        match self {
            EntityAction::Insert(a) => a.instance.metadata().table,
            EntityAction::Update(a) => a.instance.metadata().table,
            EntityAction::Delete(a) => a.instance.metadata().table,
            EntityAction::CollectionRemove { info, .. }
            | EntityAction::CollectionRecreate { info, .. }
            | EntityAction::CollectionUpdate { info, .. } => {
                info.link_table.map_or(info.target_table, |l| l.table_name)
            }
        }
    }

    /// Key of the entity (or collection owner) the action belongs to.
    pub fn key(&self) -> &EntityKey {
        match self {
            EntityAction::Insert(a) => &a.key,
            EntityAction::Update(a) => &a.key,
            EntityAction::Delete(a) => &a.key,
            EntityAction::CollectionRemove { owner, .. }
            | EntityAction::CollectionRecreate { owner, .. }
            | EntityAction::CollectionUpdate { owner, .. } => owner,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EntityAction::Insert(_) => "insert",
            EntityAction::Update(_) => "update",
            EntityAction::Delete(_) => "delete",
            EntityAction::CollectionRemove { .. } => "collection_remove",
            EntityAction::CollectionRecreate { .. } => "collection_recreate",
            EntityAction::CollectionUpdate { .. } => "collection_update",
        }
    }
}

/// Pending writes of one session, grouped by kind.
#[derive(Debug, Default)]
pub struct ActionQueue {
    inserts: Vec<InsertAction>,
    updates: Vec<UpdateAction>,
    collection_removals: Vec<EntityAction>,
    collection_updates: Vec<EntityAction>,
    deletions: Vec<DeleteAction>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_insert(&mut self, action: InsertAction) {
        self.inserts.push(action);
    }

    pub fn add_update(&mut self, action: UpdateAction) {
        self.updates.push(action);
    }

    pub fn add_delete(&mut self, action: DeleteAction) {
        self.deletions.push(action);
    }

    /// Queue a collection action; entity actions go through the typed adders.
    pub fn add_collection_action(&mut self, action: EntityAction) {
        match action {
            EntityAction::CollectionRemove { .. } => self.collection_removals.push(action),
            EntityAction::CollectionRecreate { .. } | EntityAction::CollectionUpdate { .. } => {
                self.collection_updates.push(action);
            }
            EntityAction::Insert(a) => self.add_insert(a),
            EntityAction::Update(a) => self.add_update(a),
            EntityAction::Delete(a) => self.add_delete(a),
        }
    }

    pub fn has_pending_insert(&self, key: &EntityKey) -> bool {
        self.inserts.iter().any(|a| &a.key == key)
    }

    pub fn has_pending_delete(&self, key: &EntityKey) -> bool {
        self.deletions.iter().any(|a| &a.key == key)
    }

    /// Drop the queued insert of `key`. Returns whether one was queued.
    pub fn remove_insert(&mut self, key: &EntityKey) -> bool {
        let before = self.inserts.len();
        self.inserts.retain(|a| &a.key != key);
        self.inserts.len() != before
    }

    /// Drop every action that belongs to `key`.
    pub fn discard(&mut self, key: &EntityKey) {
        self.inserts.retain(|a| &a.key != key);
        self.updates.retain(|a| &a.key != key);
        self.deletions.retain(|a| &a.key != key);
        self.collection_removals.retain(|a| a.key() != key);
        self.collection_updates.retain(|a| a.key() != key);
    }

    /// Queued inserts, in persist order.
    pub fn inserts(&self) -> &[InsertAction] {
        &self.inserts
    }

    /// Tables written by any queued action.
    pub fn tables(&self) -> HashSet<&'static str> {
        let mut tables: HashSet<&'static str> = HashSet::new();
        tables.extend(self.inserts.iter().map(|a| a.instance.metadata().table));
        tables.extend(self.updates.iter().map(|a| a.instance.metadata().table));
        tables.extend(self.deletions.iter().map(|a| a.instance.metadata().table));
        tables.extend(
            self.collection_removals
                .iter()
                .chain(&self.collection_updates)
                .map(EntityAction::table),
        );
        tables
    }

    /// Does any queued action write one of `tables`?
    pub fn touches_any(&self, tables: &[String]) -> bool {
        let written = self.tables();
        tables.iter().any(|t| written.contains(t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.inserts.len()
            + self.updates.len()
            + self.collection_removals.len()
            + self.collection_updates.len()
            + self.deletions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.inserts.clear();
        self.updates.clear();
        self.collection_removals.clear();
        self.collection_updates.clear();
        self.deletions.clear();
    }

    /// Order every queued action for execution.
    ///
    /// With `order_inserts`, the inserts of each sub-pass are grouped by
    /// table, keeping the order in which tables first appear. A sub-pass
    /// that cannot make progress means the rows reference each other in a
    /// cycle, which is reported as [`ValidationErrorKind::InvalidState`].
    #[allow(clippy::result_large_err)]
    pub fn plan(&self, order_inserts: bool) -> Result<Vec<EntityAction>> {
        let mut plan = Vec::with_capacity(self.len());

        let mut pending: Vec<&InsertAction> = self.inserts.iter().collect();
        while !pending.is_empty() {
            let waiting: HashSet<&EntityKey> = pending.iter().copied().map(|a| &a.key).collect();
            let (mut ready, deferred): (Vec<&InsertAction>, Vec<&InsertAction>) = pending
                .into_iter()
                .partition(|a| !a.references().any(|k| waiting.contains(&k)));
            if ready.is_empty() {
                return Err(cycle_error("insert", &deferred.iter().map(|a| &a.key).collect::<Vec<_>>()));
            }
            if order_inserts {
                group_by_table(&mut ready);
            }
            plan.extend(ready.into_iter().cloned().map(EntityAction::Insert));
            pending = deferred;
        }

        plan.extend(self.updates.iter().cloned().map(EntityAction::Update));
        plan.extend(self.collection_removals.iter().cloned());
        plan.extend(self.collection_updates.iter().cloned());

        let mut pending: Vec<&DeleteAction> = self.deletions.iter().collect();
        while !pending.is_empty() {
            let referenced: Vec<(&EntityKey, &EntityKey)> = pending
                .iter()
                .copied()
                .flat_map(|a| a.references.iter().map(move |r| (&a.key, r)))
                .collect();
            let (ready, deferred): (Vec<&DeleteAction>, Vec<&DeleteAction>) =
                pending.into_iter().partition(|a| {
                    !referenced
                        .iter()
                        .any(|(from, to)| *to == &a.key && *from != &a.key)
                });
            if ready.is_empty() {
                return Err(cycle_error("delete", &deferred.iter().map(|a| &a.key).collect::<Vec<_>>()));
            }
            plan.extend(ready.into_iter().cloned().map(EntityAction::Delete));
            pending = deferred;
        }

        tracing::debug!(actions = plan.len(), "Planned flush");
        Ok(plan)
    }
}

/// Stable grouping by table, in order of first appearance.
fn group_by_table(actions: &mut [&InsertAction]) {
    let mut tables: Vec<&'static str> = Vec::new();
    for action in actions.iter() {
        let table = action.instance.metadata().table;
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    actions.sort_by_key(|a| {
        let table = a.instance.metadata().table;
        tables.iter().position(|t| *t == table)
    });
}

fn cycle_error(kind: &str, keys: &[&EntityKey]) -> Error {
    let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
    Error::validation(
        ValidationErrorKind::InvalidState,
        format!(
            "cannot order {kind} actions: rows reference each other in a cycle ({})",
            keys.join(", ")
        ),
    )
}
