//! Field and column definitions.

/// Metadata about an entity field/column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldInfo {
    /// Rust field name
    pub name: &'static str,
    /// Database column name (may differ from field name)
    pub column: &'static str,
    /// Whether this is the identifier column
    pub primary_key: bool,
    /// Whether this column holds the optimistic-lock version
    pub version: bool,
    /// Whether this field is nullable
    pub nullable: bool,
    /// Whether the column is written by INSERT
    pub insertable: bool,
    /// Whether the column is written by UPDATE
    pub updatable: bool,
    /// Foreign key reference (table.column)
    pub foreign_key: Option<&'static str>,
}

impl FieldInfo {
    /// Create a new field info with minimal required data.
    pub const fn new(name: &'static str, column: &'static str) -> Self {
        Self {
            name,
            column,
            primary_key: false,
            version: false,
            nullable: false,
            insertable: true,
            updatable: true,
            foreign_key: None,
        }
    }

    /// Mark as the identifier column. Identifiers are never updated.
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.updatable = false;
        self
    }

    /// Mark as the version column.
    pub const fn version(mut self) -> Self {
        self.version = true;
        self
    }

    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    pub const fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    pub const fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    /// Set the foreign key reference, e.g. `"authors.id"`.
    pub const fn foreign_key(mut self, reference: &'static str) -> Self {
        self.foreign_key = Some(reference);
        self
    }

    /// Table part of the foreign key reference.
    pub fn referenced_table(&self) -> Option<&'static str> {
        let reference = self.foreign_key?;
        Some(reference.split_once('.').map_or(reference, |(table, _)| table))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_flags() {
        let id = FieldInfo::new("id", "id").primary_key();
        assert!(id.primary_key);
        assert!(!id.updatable);

        let fk = FieldInfo::new("author", "author_id").foreign_key("authors.id");
        assert_eq!(fk.referenced_table(), Some("authors"));
        assert!(fk.insertable && fk.updatable);
    }
}
