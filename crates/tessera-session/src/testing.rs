//! Test entities and a recording mock connection.

use asupersync::{Cx, Outcome};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use tessera_core::error::{QueryError, QueryErrorKind};
use tessera_core::{
    Association, AssociationInfo, AssociationSlot, Cascade, Collection, CollectionSlot,
    Connection, Dialect, Entity, EntityRef, Error, FieldInfo, FieldValues, IdStrategy,
    LinkTableInfo, Result, Row, Value,
};

pub(crate) fn unwrap_outcome<T: Debug>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
    }
}

pub(crate) fn expect_err<T: Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => std::panic::panic_any(format!("expected an error, got: {other:?}")),
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Author {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Author {
    const ENTITY_NAME: &'static str = "Author";
    const TABLE_NAME: &'static str = "authors";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id").primary_key(),
            FieldInfo::new("name", "name"),
        ];
        FIELDS
    }

    fn id_strategy() -> IdStrategy {
        IdStrategy::Identity
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) -> Result<()> {
        self.id = Some(i64::try_from(id)?);
        Ok(())
    }

    fn values(&self) -> FieldValues {
        vec![("id", self.id.into()), ("name", self.name.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Tag {
    pub id: Option<i64>,
    pub label: String,
}

impl Entity for Tag {
    const ENTITY_NAME: &'static str = "Tag";
    const TABLE_NAME: &'static str = "tags";

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id").primary_key(),
            FieldInfo::new("label", "label"),
        ];
        FIELDS
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) -> Result<()> {
        self.id = Some(i64::try_from(id)?);
        Ok(())
    }

    fn values(&self) -> FieldValues {
        vec![("id", self.id.into()), ("label", self.label.clone().into())]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            label: row.get_named("label")?,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Book {
    pub id: Option<i64>,
    pub title: String,
    pub version: i64,
    pub author: Association<Author>,
    pub tags: Collection<Tag>,
}

impl Book {
    pub fn tags_info() -> &'static AssociationInfo {
        &Self::associations()[1]
    }
}

impl Entity for Book {
    const ENTITY_NAME: &'static str = "Book";
    const TABLE_NAME: &'static str = "books";
    const VERSION_COLUMN: Option<&'static str> = Some("version");

    fn fields() -> &'static [FieldInfo] {
        const FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id").primary_key(),
            FieldInfo::new("title", "title"),
            FieldInfo::new("version", "version").version(),
            FieldInfo::new("author", "author_id")
                .nullable(true)
                .foreign_key("authors.id"),
        ];
        FIELDS
    }

    fn associations() -> &'static [AssociationInfo] {
        const ASSOCIATIONS: &[AssociationInfo] = &[
            AssociationInfo::many_to_one::<Author>("author", "author_id")
                .cascade(Cascade::PERSIST_MERGE),
            AssociationInfo::many_to_many::<Tag>(
                "tags",
                LinkTableInfo::new("book_tags", "book_id", "tag_id"),
            )
            .cascade(Cascade::PERSIST_MERGE),
        ];
        ASSOCIATIONS
    }

    fn id(&self) -> Option<Value> {
        self.id.map(Value::BigInt)
    }

    fn set_id(&mut self, id: Value) -> Result<()> {
        self.id = Some(i64::try_from(id)?);
        Ok(())
    }

    fn values(&self) -> FieldValues {
        vec![
            ("id", self.id.into()),
            ("title", self.title.clone().into()),
            ("version", self.version.into()),
            ("author_id", self.author.fk_value()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            title: row.get_named("title")?,
            version: row.get_named("version")?,
            author: Association::from_fk(row.get_by_name("author_id").cloned()),
            tags: Collection::uninitialized(),
        })
    }

    fn version(&self) -> Option<i64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: i64) {
        self.version = version;
    }

    fn association_slots(&self) -> Vec<&dyn AssociationSlot> {
        vec![&self.author]
    }

    fn association_slots_mut(&mut self) -> Vec<&mut dyn AssociationSlot> {
        vec![&mut self.author]
    }

    fn collection_slots(&self) -> Vec<&dyn CollectionSlot> {
        vec![&self.tags]
    }

    fn collection_slots_mut(&mut self) -> Vec<&mut dyn CollectionSlot> {
        vec![&mut self.tags]
    }
}

pub(crate) fn author(id: Option<i64>, name: &str) -> EntityRef<Author> {
    EntityRef::new(Author {
        id,
        name: name.to_string(),
    })
}

pub(crate) fn tag(id: i64, label: &str) -> EntityRef<Tag> {
    EntityRef::new(Tag {
        id: Some(id),
        label: label.to_string(),
    })
}

pub(crate) fn book(id: Option<i64>, title: &str, author: Option<&EntityRef<Author>>) -> EntityRef<Book> {
    EntityRef::new(Book {
        id,
        title: title.to_string(),
        version: 0,
        author: author.map_or(Association::Empty, Association::resolved),
        tags: Collection::new(),
    })
}

pub(crate) fn author_row(id: i64, name: &str) -> Row {
    Row::from_pairs([("id", Value::BigInt(id)), ("name", Value::from(name))])
}

pub(crate) fn tag_row(id: i64, label: &str) -> Row {
    Row::from_pairs([("id", Value::BigInt(id)), ("label", Value::from(label))])
}

pub(crate) fn book_row(id: i64, title: &str, version: i64, author_id: Option<i64>) -> Row {
    Row::from_pairs([
        ("id", Value::BigInt(id)),
        ("title", Value::from(title)),
        ("version", Value::BigInt(version)),
        ("author_id", Value::from(author_id)),
    ])
}

// ============================================================================
// Mock connection
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct MockState {
    queries: Vec<(String, Vec<Value>)>,
    statements: Vec<(String, Vec<Value>)>,
    control: Vec<String>,
    batches: Vec<usize>,
    responses: Vec<(String, Vec<Row>)>,
    affected: Vec<(String, u64)>,
    fail_at: Option<usize>,
    fail_commit: bool,
    next_key: i64,
    closed: bool,
}

impl MockState {
    fn write(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.statements.push((sql.to_string(), params.to_vec()));
        if self.fail_at == Some(self.statements.len()) {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                sql: Some(sql.to_string()),
                sqlstate: Some("23505".to_string()),
                message: "scripted failure".to_string(),
                source: None,
            }));
        }
        Ok(self
            .affected
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map_or(1, |(_, rows)| *rows))
    }
}

/// Records every statement; clones share state.
#[derive(Debug, Clone)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
    dialect: Dialect,
}

impl MockConnection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_key: 1,
                ..MockState::default()
            })),
            dialect: Dialect::Postgres,
        }
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Return `rows` for queries whose SQL contains `pattern`.
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(0, (pattern.to_string(), rows));
    }

    /// Report `rows` affected for statements whose SQL contains `pattern`.
    pub fn affect(&self, pattern: &str, rows: u64) {
        self.state
            .lock()
            .unwrap()
            .affected
            .insert(0, (pattern.to_string(), rows));
    }

    /// Fail the `n`th write statement (1-based).
    pub fn fail_at(&self, n: usize) {
        self.state.lock().unwrap().fail_at = Some(n);
    }

    /// Make the next COMMIT fail.
    pub fn fail_commit(&self) {
        self.state.lock().unwrap().fail_commit = true;
    }

    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().unwrap().queries.clone()
    }

    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn statement_sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|(sql, _)| sql).collect()
    }

    pub fn control(&self) -> Vec<String> {
        self.state.lock().unwrap().control.clone()
    }

    pub fn batches(&self) -> Vec<usize> {
        self.state.lock().unwrap().batches.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn record_control(&self, what: &str) {
        self.state.lock().unwrap().control.push(what.to_string());
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let state = Arc::clone(&self.state);
        let sql = sql.to_string();
        let params = params.to_vec();
        async move {
            let mut guard = state.lock().unwrap();
            let rows = guard
                .responses
                .iter()
                .find(|(pattern, _)| sql.contains(pattern.as_str()))
                .map(|(_, rows)| rows.clone())
                .unwrap_or_default();
            guard.queries.push((sql, params));
            Outcome::Ok(rows)
        }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.state.lock().unwrap().write(sql, params);
        async move {
            match result {
                Ok(rows) => Outcome::Ok(rows),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn insert(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let result = {
            let mut guard = self.state.lock().unwrap();
            guard.write(sql, params).map(|_| {
                let key = guard.next_key;
                guard.next_key += 1;
                key
            })
        };
        async move {
            match result {
                Ok(key) => Outcome::Ok(key),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn batch(
        &self,
        _cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        let result = {
            let mut guard = self.state.lock().unwrap();
            guard.batches.push(statements.len());
            statements
                .iter()
                .map(|(sql, params)| guard.write(sql, params))
                .collect::<Result<Vec<u64>>>()
        };
        async move {
            match result {
                Ok(counts) => Outcome::Ok(counts),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.record_control("BEGIN");
        async { Outcome::Ok(()) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.record_control("COMMIT");
        let failed = std::mem::take(&mut self.state.lock().unwrap().fail_commit);
        async move {
            if failed {
                return Outcome::Err(Error::Custom("commit failed".to_string()));
            }
            Outcome::Ok(())
        }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.record_control("ROLLBACK");
        async { Outcome::Ok(()) }
    }

    fn close(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state.lock().unwrap().closed = true;
        async { Outcome::Ok(()) }
    }
}
