//! Query execution: auto-flush, statement rendering and row materialization.

use crate::Session;
use crate::context::CollectionKey;
use crate::pipeline::Callback;
use asupersync::{Cx, Outcome};
use std::collections::HashMap;
use tessera_core::{
    AnyEntityRef, AssociationInfo, Connection, Entity, EntityMetadata, EntityRef, Error, FromValue,
    LockMode, Row, ValidationErrorKind, try_outcome, try_result,
};
use tessera_query::{FlushMode, Query};

/// Owners in first-appearance order with the elements fetched for each.
struct FetchedOwners {
    owners: Vec<AnyEntityRef>,
    elements: HashMap<usize, Vec<AnyEntityRef>>,
}

impl<C: Connection> Session<C> {
    /// Flush first when the query reads a table with pending writes.
    async fn auto_flush(&mut self, cx: &Cx, query: &Query) -> Outcome<(), Error> {
        let mode = query.flush_mode().unwrap_or(self.config.flush_mode);
        if mode != FlushMode::Auto {
            return Outcome::Ok(());
        }
        let pending = self.pending_tables();
        if pending.is_empty() {
            return Outcome::Ok(());
        }
        let spaces = try_result!(query.query_spaces());
        let overlaps = match &spaces {
            None => true,
            Some(spaces) => spaces
                .iter()
                .any(|s| pending.iter().any(|p| p.eq_ignore_ascii_case(s))),
        };
        if overlaps {
            tracing::debug!(spaces = ?spaces, "Auto-flushing before query");
            try_outcome!(self.flush_inner(cx).await);
        }
        Outcome::Ok(())
    }

    async fn run_select(&mut self, cx: &Cx, query: &Query, paginate: bool) -> Outcome<Vec<Row>, Error> {
        let mut statement = try_result!(query.statement(self.dialect));
        if paginate {
            if let Some(clause) = self
                .dialect
                .limit_clause(query.max_results(), query.first_result())
            {
                statement.push_clause(&clause);
            }
        }
        if let Some(clause) = self.dialect.lock_clause(query.lock_mode()) {
            statement.push_clause(clause);
        }
        self.select(cx, &statement).await
    }

    /// Rows of a query, after auto-flush.
    pub async fn rows(&mut self, cx: &Cx, query: &Query) -> Outcome<Vec<Row>, Error> {
        try_outcome!(self.prepare(cx).await);
        try_outcome!(self.auto_flush(cx, query).await);
        self.run_select(cx, query, true).await
    }

    /// Apply `mapper` to every row; a transformer for results that are not entities.
    pub async fn map_rows<T, F>(&mut self, cx: &Cx, query: &Query, mut mapper: F) -> Outcome<Vec<T>, Error>
    where
        F: FnMut(&Row) -> tessera_core::Result<T>,
    {
        let rows = try_outcome!(self.rows(cx, query).await);
        let mut mapped = Vec::with_capacity(rows.len());
        for row in &rows {
            mapped.push(try_result!(mapper(row)));
        }
        Outcome::Ok(mapped)
    }

    /// The first column of every row.
    pub async fn scalars<T: FromValue>(&mut self, cx: &Cx, query: &Query) -> Outcome<Vec<T>, Error> {
        self.map_rows(cx, query, |row| row.get_as::<T>(0)).await
    }

    /// Entities of type `E`, resolved through the identity map.
    ///
    /// A row whose key is already managed yields the managed instance as
    /// it is in memory. With [`Query::fetches_collection`], rows repeat their
    /// owner once per element; owners are de-duplicated before
    /// `first_result` and `max_results` are applied, which then happens in
    /// memory (or fails, depending on configuration).
    #[tracing::instrument(level = "debug", skip(self, cx, query), fields(entity = E::ENTITY_NAME))]
    pub async fn list<E: Entity>(&mut self, cx: &Cx, query: &Query) -> Outcome<Vec<EntityRef<E>>, Error> {
        try_outcome!(self.prepare(cx).await);
        let meta = EntityMetadata::of::<E>();
        let read_only = query.read_only().unwrap_or(false);

        let fetched = match query.fetched_collection() {
            Some(role) => {
                let Some(info) = meta.association(role).filter(|info| info.is_collection()) else {
                    return Outcome::Err(Error::validation(
                        ValidationErrorKind::InvalidState,
                        format!("{} has no collection named '{role}'", meta.name),
                    ));
                };
                if query.is_paginated() && self.config.fail_on_pagination_over_collection_fetch {
                    return Outcome::Err(Error::validation(
                        ValidationErrorKind::PaginationOverCollectionFetch,
                        format!(
                            "first/max results with a fetch of {}.{role}; pagination would split owners",
                            meta.name
                        ),
                    ));
                }
                Some(info)
            }
            None => None,
        };

        try_outcome!(self.auto_flush(cx, query).await);
        let rows = try_outcome!(self.run_select(cx, query, fetched.is_none()).await);

        self.context.before_load();
        let loaded = match fetched {
            Some(info) => self.materialize_with_collection(&meta, info, &rows, read_only),
            None => self.materialize_rows(&meta, &rows, read_only),
        };
        self.context.after_load();
        let (mut instances, created) = try_result!(loaded);

        for instance in &created {
            try_result!(self.pipeline.fire(Callback::PostLoad, instance));
        }
        if query.lock_mode() != LockMode::None {
            for instance in &instances {
                if let Some(key) = instance.key() {
                    if let Some(entry) = self.context.entry_mut(&key) {
                        entry.set_lock_mode(query.lock_mode());
                    }
                }
            }
        }

        if fetched.is_some() && query.is_paginated() {
            tracing::warn!(
                owners = instances.len(),
                "Applying pagination in memory over a collection fetch"
            );
            let first = query.first_result().unwrap_or(0);
            let max = query.max_results().unwrap_or(usize::MAX);
            instances = instances.into_iter().skip(first).take(max).collect();
        }

        let mut results = Vec::with_capacity(instances.len());
        for instance in &instances {
            results.push(try_result!(Self::downcast::<E>(instance)));
        }
        Outcome::Ok(results)
    }

    /// One instance per row. Also returns the instances new to the context.
    #[allow(clippy::result_large_err)]
    fn materialize_rows(
        &mut self,
        meta: &EntityMetadata,
        rows: &[Row],
        read_only: bool,
    ) -> tessera_core::Result<(Vec<AnyEntityRef>, Vec<AnyEntityRef>)> {
        let mut instances = Vec::with_capacity(rows.len());
        let mut created = Vec::new();
        for row in rows {
            let (instance, new) = self.materialize(meta, row, read_only)?;
            if new {
                created.push(instance.clone());
            }
            instances.push(instance);
        }
        Ok((instances, created))
    }

    /// Distinct owners, each with collection `info` filled from the
    /// `"{role}.column"` columns of its rows.
    #[allow(clippy::result_large_err)]
    fn materialize_with_collection(
        &mut self,
        meta: &EntityMetadata,
        info: &'static AssociationInfo,
        rows: &[Row],
        read_only: bool,
    ) -> tessera_core::Result<(Vec<AnyEntityRef>, Vec<AnyEntityRef>)> {
        let target = info.target_metadata();
        let mut fetched = FetchedOwners {
            owners: Vec::new(),
            elements: HashMap::new(),
        };
        let mut created = Vec::new();

        for row in rows {
            let (owner, new) = self.materialize(meta, row, read_only)?;
            if new {
                created.push(owner.clone());
            }
            let elements = fetched.elements.entry(owner.address()).or_insert_with(|| {
                fetched.owners.push(owner.clone());
                Vec::new()
            });
            let Some(element_row) = row.project(info.name) else {
                continue;
            };
            let (element, new) = self.materialize(&target, &element_row, read_only)?;
            if new {
                created.push(element.clone());
            }
            if !elements.iter().any(|e| e.ptr_eq(&element)) {
                elements.push(element);
            }
        }

        for owner in &fetched.owners {
            let already = owner
                .collections()
                .into_iter()
                .any(|(i, elements)| i.name == info.name && elements.is_some());
            // An owner that was already in memory keeps its collection.
            if already {
                continue;
            }
            let elements = fetched.elements.remove(&owner.address()).unwrap_or_default();
            let keys = elements.iter().filter_map(AnyEntityRef::key).collect();
            owner.set_collection(info.name, elements)?;
            if let Some(key) = owner.key() {
                self.context
                    .add_collection(CollectionKey::new(info.name, key), info, owner.clone(), Some(keys));
            }
        }
        Ok((fetched.owners, created))
    }

    /// The first result, or `None` when there is none.
    pub async fn single_result<E: Entity>(
        &mut self,
        cx: &Cx,
        query: &Query,
    ) -> Outcome<Option<EntityRef<E>>, Error> {
        let results = try_outcome!(self.list::<E>(cx, query).await);
        Outcome::Ok(results.into_iter().next())
    }

    /// The only result, or `None`; more than one distinct instance is an error.
    pub async fn unique_result<E: Entity>(
        &mut self,
        cx: &Cx,
        query: &Query,
    ) -> Outcome<Option<EntityRef<E>>, Error> {
        let mut results = try_outcome!(self.list::<E>(cx, query).await);
        results.dedup_by(|a, b| a.ptr_eq(b));
        if results.len() > 1 {
            return Outcome::Err(Error::validation(
                ValidationErrorKind::NonUniqueResult,
                format!("query returned {} {} instances", results.len(), E::ENTITY_NAME),
            ));
        }
        Outcome::Ok(results.into_iter().next())
    }

    /// Execute a bulk INSERT, UPDATE or DELETE and return the affected rows.
    ///
    /// Collections that may hold rows of the modified table are marked
    /// uninitialized afterwards, since their snapshots no longer match.
    #[tracing::instrument(level = "debug", skip(self, cx, query))]
    pub async fn execute_update(&mut self, cx: &Cx, query: &Query) -> Outcome<u64, Error> {
        try_outcome!(self.prepare(cx).await);
        try_outcome!(self.auto_flush(cx, query).await);
        let statement = try_result!(query.statement(self.dialect));
        let sql = try_result!(self.native(&statement));
        tracing::trace!(sql = %sql, "Executing bulk statement");
        let affected = try_outcome!(self.conn.execute(cx, &sql, &statement.params).await);

        if let Some(table) = try_result!(query.modified_table()) {
            let invalidated = self.context.invalidate_collections(std::slice::from_ref(&table));
            tracing::debug!(table = %table, affected, invalidated, "Bulk statement executed");
            self.counters.record_bulk_table(&table);
        }
        Outcome::Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        Book, MockConnection, Tag, book_row, expect_err, tag, tag_row, unwrap_outcome,
    };
    use crate::{SessionConfig, SessionFactory};
    use asupersync::runtime::RuntimeBuilder;
    use tessera_core::Value;
    use tessera_query::{Criteria, Restriction};

    fn runtime() -> asupersync::runtime::Runtime {
        RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime")
    }

    fn fetch_row(book: i64, title: &str, tag: Option<(i64, &str)>) -> Row {
        Row::from_pairs([
            ("id", Value::BigInt(book)),
            ("title", Value::from(title)),
            ("version", Value::BigInt(0)),
            ("author_id", Value::Null),
            ("tags.id", Value::from(tag.map(|t| t.0))),
            ("tags.label", Value::from(tag.map(|t| t.1))),
        ])
    }

    #[test]
    fn list_returns_managed_instances_untouched() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(1, "T", 0, None)]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let first = unwrap_outcome(session.find::<Book>(&cx, 1_i64).await).unwrap();
            first.write().title = "unsaved edit".into();

            conn.respond("FROM books", vec![book_row(1, "T", 0, None), book_row(2, "U", 0, None)]);
            let query = session
                .create_query("SELECT * FROM books WHERE id IN (:ids)")
                .set_parameter_list("ids", [1_i64, 2])
                .set_flush_mode(FlushMode::Manual);
            let books = unwrap_outcome(session.list::<Book>(&cx, &query).await);
            assert_eq!(books.len(), 2);
            assert!(books[0].ptr_eq(&first));
            assert_eq!(books[0].read().title, "unsaved edit");
            assert_eq!(session.context().len(), 2);
        });

        let (sql, params) = conn.queries().pop().unwrap();
        assert_eq!(sql, "SELECT * FROM books WHERE id IN ($1, $2)");
        assert_eq!(params, vec![Value::BigInt(1), Value::BigInt(2)]);
    }

    #[test]
    fn auto_flush_only_for_overlapping_tables() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            unwrap_outcome(session.persist(&cx, &tag(1, "a")).await);

            let other = session.create_query("SELECT * FROM authors");
            unwrap_outcome(session.rows(&cx, &other).await);
            assert!(conn.statements().is_empty());

            let unknown = session.create_query("SELECT 1");
            unwrap_outcome(session.rows(&cx, &unknown).await);
            assert_eq!(conn.statements().len(), 1);

            unwrap_outcome(session.persist(&cx, &tag(2, "b")).await);
            let tags = session.create_criteria_query(Criteria::for_entity::<Tag>());
            unwrap_outcome(session.list::<Tag>(&cx, &tags).await);
            assert_eq!(conn.statements().len(), 2);

            unwrap_outcome(session.persist(&cx, &tag(3, "c")).await);
            let synced = session
                .create_native_query("SELECT count(*) FROM tag_view")
                .add_synchronized_table("TAGS");
            unwrap_outcome(session.rows(&cx, &synced).await);
            assert_eq!(conn.statements().len(), 3);
        });
    }

    #[test]
    fn commit_flush_mode_defers_writes() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let factory = SessionFactory::new(
            SessionConfig::default().with_flush_mode(FlushMode::Commit),
        )
        .unwrap();
        let mut session = factory.open(conn.clone());

        rt.block_on(async {
            unwrap_outcome(session.begin(&cx).await);
            unwrap_outcome(session.persist(&cx, &tag(1, "a")).await);
            let query = session.create_query("SELECT * FROM tags");
            unwrap_outcome(session.rows(&cx, &query).await);
            assert!(conn.statements().is_empty());
            unwrap_outcome(session.commit(&cx).await);
        });
        assert_eq!(conn.statements().len(), 1);
    }

    #[test]
    fn criteria_query_with_lock_and_pagination() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(3, "T", 0, None)]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let query = session
                .create_criteria_query(
                    Criteria::for_entity::<Book>().filter(Restriction::eq("title", "T")),
                )
                .set_max_results(5)
                .set_first_result(10)
                .set_lock_mode(LockMode::PessimisticWrite);
            let found = unwrap_outcome(session.single_result::<Book>(&cx, &query).await).unwrap();
            let entry = session.context().entry_of(&found.erase()).unwrap();
            assert_eq!(entry.lock_mode(), LockMode::PessimisticWrite);
        });

        let sql = &conn.queries()[0].0;
        assert!(sql.ends_with("LIMIT 5 OFFSET 10 FOR UPDATE"), "{sql}");
    }

    #[test]
    fn scalars_map_rows_and_unique_result() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM books", vec![book_row(1, "T", 0, None), book_row(2, "U", 0, None)]);
        conn.respond("count(*)", vec![Row::from_pairs([("n", Value::BigInt(7))])]);
        let mut session = Session::new(conn);

        rt.block_on(async {
            let count = session.create_query("SELECT count(*) FROM books");
            assert_eq!(unwrap_outcome(session.scalars::<i64>(&cx, &count).await), vec![7]);

            let titles = session.create_query("SELECT * FROM books");
            let titles = unwrap_outcome(
                session
                    .map_rows(&cx, &titles, |row| row.get_named::<String>("title"))
                    .await,
            );
            assert_eq!(titles, vec!["T", "U"]);

            let all = session.create_query("SELECT * FROM books");
            let err = expect_err(session.unique_result::<Book>(&cx, &all).await);
            assert_eq!(err.validation_kind(), Some(ValidationErrorKind::NonUniqueResult));
        });
    }

    #[test]
    fn wrong_parameter_count_is_rejected_before_execution() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let query = session.create_query("SELECT * FROM books WHERE id = ? AND title = ?").bind(1_i64);
            let err = expect_err(session.rows(&cx, &query).await);
            assert!(err.is_validation());
        });
        assert!(conn.queries().is_empty());
    }

    #[test]
    fn collection_fetch_deduplicates_owners() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond(
            "JOIN",
            vec![
                fetch_row(1, "T", Some((10, "a"))),
                fetch_row(1, "T", Some((11, "b"))),
                fetch_row(2, "U", None),
            ],
        );
        let mut session = Session::new(conn);

        rt.block_on(async {
            let query = session
                .create_query("SELECT b.*, t.id AS \"tags.id\" FROM books b LEFT JOIN book_tags bt ON 1 = 1 LEFT JOIN tags t ON 1 = 1")
                .fetches_collection("tags");
            let books = unwrap_outcome(session.list::<Book>(&cx, &query).await);
            assert_eq!(books.len(), 2);
            assert_eq!(books[0].read().tags.len(), 2);
            assert!(books[1].read().tags.is_initialized());
            assert!(books[1].read().tags.is_empty());
            assert_eq!(session.statistics().collection_count, 2);
            assert!(!session.is_dirty().unwrap());
        });
    }

    #[test]
    fn pagination_over_collection_fetch() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond(
            "JOIN",
            vec![
                fetch_row(1, "T", Some((10, "a"))),
                fetch_row(1, "T", Some((11, "b"))),
                fetch_row(2, "U", Some((10, "a"))),
            ],
        );
        let query = Query::native("SELECT * FROM books b JOIN tags t ON 1 = 1")
            .fetches_collection("tags")
            .set_max_results(1)
            .set_first_result(1);

        let mut strict = Session::new(conn.clone());
        rt.block_on(async {
            let err = expect_err(strict.list::<Book>(&cx, &query).await);
            assert_eq!(
                err.validation_kind(),
                Some(ValidationErrorKind::PaginationOverCollectionFetch)
            );
        });

        let factory = SessionFactory::new(
            SessionConfig::default().with_fail_on_pagination_over_collection_fetch(false),
        )
        .unwrap();
        let mut lenient = factory.open(conn.clone());
        rt.block_on(async {
            let books = unwrap_outcome(lenient.list::<Book>(&cx, &query).await);
            assert_eq!(books.len(), 1);
            assert_eq!(books[0].read().id, Some(2));
        });
        assert!(!conn.queries().last().unwrap().0.contains("LIMIT"));
    }

    #[test]
    fn bulk_update_invalidates_collections() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM \"books\"", vec![book_row(1, "T", 0, None)]);
        conn.respond("FROM \"tags\"", vec![tag_row(1, "a")]);
        conn.affect("UPDATE tags", 4);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let b = unwrap_outcome(session.find::<Book>(&cx, 1_i64).await).unwrap();
            unwrap_outcome(session.fetch(&cx, &b, "tags").await);
            assert!(b.read().tags.is_initialized());

            let bulk = session
                .create_query("UPDATE tags SET label = :label")
                .set_parameter("label", "x");
            assert_eq!(unwrap_outcome(session.execute_update(&cx, &bulk).await), 4);
            assert!(!b.read().tags.is_initialized());
            assert_eq!(session.statistics().collection_count, 0);
            assert_eq!(session.statistics().bulk_affected_tables, vec!["tags"]);
        });
    }

    #[test]
    fn read_only_query_results_are_not_dirty_checked() {
        let rt = runtime();
        let cx = Cx::for_testing();
        let conn = MockConnection::new();
        conn.respond("FROM books", vec![book_row(5, "T", 0, None)]);
        let mut session = Session::new(conn.clone());

        rt.block_on(async {
            let query = session.create_query("SELECT * FROM books").set_read_only(true);
            let books = unwrap_outcome(session.list::<Book>(&cx, &query).await);
            books[0].write().title = "changed".into();
            assert!(!session.is_dirty().unwrap());
            unwrap_outcome(session.flush(&cx).await);
        });
        assert!(conn.statements().is_empty());
    }
}
