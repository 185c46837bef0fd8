//! SQL rendering for entity rows and link rows.
//!
//! The persister turns mapping metadata plus a state snapshot into
//! statements in the intermediate `?` form. It never touches a connection;
//! the session decides whether a statement is executed directly or batched.

use crate::context::value_of;
use tessera_core::{
    AssociationInfo, Dialect, EntityMetadata, Error, FieldValues, LinkTableInfo, LockMode,
    Result, Value, ValidationErrorKind,
};
use tessera_query::BoundStatement;

/// Renders the statements of one entity type.
#[derive(Debug, Clone, Copy)]
pub struct EntityPersister {
    meta: EntityMetadata,
    dialect: Dialect,
}

impl EntityPersister {
    pub fn new(meta: EntityMetadata, dialect: Dialect) -> Self {
        Self { meta, dialect }
    }

    pub fn metadata(&self) -> &EntityMetadata {
        &self.meta
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn table(&self) -> String {
        self.quote(self.meta.table)
    }

    fn column_list(&self) -> String {
        self.meta
            .columns()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// `INSERT INTO t (..) VALUES (..)` with the insertable columns of `state`.
    pub fn insert(&self, state: &FieldValues) -> BoundStatement {
        let columns: Vec<&'static str> = self.meta.insert_columns().collect();
        let names: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
        let marks = vec!["?"; columns.len()].join(", ");
        let params = columns
            .iter()
            .map(|c| value_of(state, c).clone())
            .collect();
        BoundStatement::new(
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.table(),
                names.join(", "),
                marks
            ),
            params,
        )
    }

    /// `UPDATE t SET .. WHERE id = ?`, with a version check when versioned.
    ///
    /// With no columns the statement only moves the version forward.
    #[allow(clippy::result_large_err)]
    pub fn update(
        &self,
        state: &FieldValues,
        columns: &[&'static str],
        previous_version: Option<i64>,
        next_version: Option<i64>,
    ) -> Result<BoundStatement> {
        let id = self.identifier(state)?;
        let mut sets = Vec::with_capacity(columns.len() + 1);
        let mut params = Vec::with_capacity(columns.len() + 2);
        for column in columns {
            sets.push(format!("{} = ?", self.quote(column)));
            params.push(value_of(state, column).clone());
        }
        if let (Some(version_column), Some(next)) = (self.meta.version_column, next_version) {
            sets.push(format!("{} = ?", self.quote(version_column)));
            params.push(Value::BigInt(next));
        }
        if sets.is_empty() {
            return Err(Error::validation(
                ValidationErrorKind::InvalidState,
                format!("nothing to update for {}", self.meta.name),
            ));
        }
        params.push(id);
        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.table(),
            sets.join(", "),
            self.quote(self.meta.id_column)
        );
        self.push_version_check(&mut sql, &mut params, previous_version);
        Ok(BoundStatement::new(sql, params))
    }

    /// `DELETE FROM t WHERE id = ?`, with a version check when versioned.
    pub fn delete(&self, id: &Value, version: Option<i64>) -> BoundStatement {
        let mut sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            self.table(),
            self.quote(self.meta.id_column)
        );
        let mut params = vec![id.clone()];
        self.push_version_check(&mut sql, &mut params, version);
        BoundStatement::new(sql, params)
    }

    fn push_version_check(&self, sql: &mut String, params: &mut Vec<Value>, version: Option<i64>) {
        if let (Some(column), Some(version)) = (self.meta.version_column, version) {
            sql.push_str(&format!(" AND {} = ?", self.quote(column)));
            params.push(Value::BigInt(version));
        }
    }

    /// Load one row by identifier, locking it when the dialect supports `mode`.
    pub fn select_by_id(&self, id: &Value, mode: LockMode) -> BoundStatement {
        let mut statement = BoundStatement::new(
            format!(
                "SELECT {} FROM {} WHERE {} = ?",
                self.column_list(),
                self.table(),
                self.quote(self.meta.id_column)
            ),
            vec![id.clone()],
        );
        if let Some(clause) = self.dialect.lock_clause(mode) {
            statement.push_clause(clause);
        }
        statement
    }

    /// Read the current version of one row.
    pub fn version_select(&self, id: &Value) -> Option<BoundStatement> {
        let column = self.meta.version_column?;
        Some(BoundStatement::new(
            format!(
                "SELECT {} FROM {} WHERE {} = ?",
                self.quote(column),
                self.table(),
                self.quote(self.meta.id_column)
            ),
            vec![id.clone()],
        ))
    }

    #[allow(clippy::result_large_err)]
    fn identifier(&self, state: &FieldValues) -> Result<Value> {
        match value_of(state, self.meta.id_column) {
            Value::Null => Err(Error::validation(
                ValidationErrorKind::InvalidIdentifier,
                format!("{} has no identifier", self.meta.name),
            )),
            id => Ok(id.clone()),
        }
    }
}

/// Renders link-table statements of a many-to-many association.
#[derive(Debug, Clone, Copy)]
pub struct CollectionPersister {
    info: &'static AssociationInfo,
    link: LinkTableInfo,
    dialect: Dialect,
}

impl CollectionPersister {
    #[allow(clippy::result_large_err)]
    pub fn new(info: &'static AssociationInfo, dialect: Dialect) -> Result<Self> {
        let link = info.link_table.ok_or_else(|| {
            Error::validation(
                ValidationErrorKind::InvalidState,
                format!("association '{}' has no link table", info.name),
            )
        })?;
        Ok(Self {
            info,
            link,
            dialect,
        })
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    pub fn table(&self) -> &'static str {
        self.link.table_name
    }

    pub fn insert_row(&self, owner: &Value, element: &Value) -> BoundStatement {
        BoundStatement::new(
            format!(
                "INSERT INTO {} ({}, {}) VALUES (?, ?)",
                self.quote(self.link.table_name),
                self.quote(self.link.owner_column),
                self.quote(self.link.element_column)
            ),
            vec![owner.clone(), element.clone()],
        )
    }

    pub fn delete_row(&self, owner: &Value, element: &Value) -> BoundStatement {
        BoundStatement::new(
            format!(
                "DELETE FROM {} WHERE {} = ? AND {} = ?",
                self.quote(self.link.table_name),
                self.quote(self.link.owner_column),
                self.quote(self.link.element_column)
            ),
            vec![owner.clone(), element.clone()],
        )
    }

    pub fn delete_all(&self, owner: &Value) -> BoundStatement {
        BoundStatement::new(
            format!(
                "DELETE FROM {} WHERE {} = ?",
                self.quote(self.link.table_name),
                self.quote(self.link.owner_column)
            ),
            vec![owner.clone()],
        )
    }

    /// Select the element rows linked to `owner`.
    pub fn select_elements(&self, owner: &Value) -> BoundStatement {
        let target = self.info.target_metadata();
        let columns = target
            .columns()
            .map(|c| format!("e.{}", self.quote(c)))
            .collect::<Vec<_>>()
            .join(", ");
        BoundStatement::new(
            format!(
                "SELECT {columns} FROM {} e INNER JOIN {} l ON e.{} = l.{} WHERE l.{} = ?",
                self.quote(target.table),
                self.quote(self.link.table_name),
                self.quote(target.id_column),
                self.quote(self.link.element_column),
                self.quote(self.link.owner_column)
            ),
            vec![owner.clone()],
        )
    }
}
