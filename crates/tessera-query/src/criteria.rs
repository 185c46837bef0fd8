//! Structured criteria queries over one entity.
//!
//! A [`Criteria`] selects every mapped column of an entity's table and
//! filters it with [`Restriction`]s. It renders straight to the intermediate
//! positional form, so values are bound as it is built and no named
//! parameters are involved.

use crate::bind::BoundStatement;
use tessera_core::{Dialect, Entity, Value};

/// Comparison operator of a [`Restriction::Compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub const fn as_str(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "<>",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }
}

/// A predicate on the columns of the criteria's table.
#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    Compare {
        column: String,
        op: Comparison,
        value: Value,
    },
    Like {
        column: String,
        pattern: String,
    },
    InList {
        column: String,
        values: Vec<Value>,
    },
    IsNull(String),
    IsNotNull(String),
    And(Vec<Restriction>),
    Or(Vec<Restriction>),
    Not(Box<Restriction>),
}

impl Restriction {
    fn compare(column: impl Into<String>, op: Comparison, value: impl Into<Value>) -> Self {
        Restriction::Compare {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Comparison::Eq, value)
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Comparison::Ne, value)
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Comparison::Lt, value)
    }

    pub fn le(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Comparison::Le, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Comparison::Gt, value)
    }

    pub fn ge(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(column, Comparison::Ge, value)
    }

    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Restriction::Like {
            column: column.into(),
            pattern: pattern.into(),
        }
    }

    pub fn in_list<V: Into<Value>>(
        column: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Restriction::InList {
            column: column.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Restriction::IsNull(column.into())
    }

    pub fn is_not_null(column: impl Into<String>) -> Self {
        Restriction::IsNotNull(column.into())
    }

    /// Both restrictions must hold.
    pub fn and(self, other: Restriction) -> Self {
        match self {
            Restriction::And(mut parts) => {
                parts.push(other);
                Restriction::And(parts)
            }
            first => Restriction::And(vec![first, other]),
        }
    }

    /// Either restriction may hold.
    pub fn or(self, other: Restriction) -> Self {
        match self {
            Restriction::Or(mut parts) => {
                parts.push(other);
                Restriction::Or(parts)
            }
            first => Restriction::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Restriction::Not(Box::new(self))
    }

    /// Append this predicate to `sql`, pushing its values onto `params`.
    pub fn build(&self, dialect: Dialect, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Restriction::Compare { column, op, value } => {
                sql.push_str(&dialect.quote_identifier(column));
                sql.push(' ');
                sql.push_str(op.as_str());
                sql.push_str(" ?");
                params.push(value.clone());
            }
            Restriction::Like { column, pattern } => {
                sql.push_str(&dialect.quote_identifier(column));
                sql.push_str(" LIKE ?");
                params.push(Value::Text(pattern.clone()));
            }
            // No value matches an empty IN list.
            Restriction::InList { values, .. } if values.is_empty() => sql.push_str("1 = 0"),
            Restriction::InList { column, values } => {
                sql.push_str(&dialect.quote_identifier(column));
                sql.push_str(" IN (");
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push('?');
                    params.push(value.clone());
                }
                sql.push(')');
            }
            Restriction::IsNull(column) => {
                sql.push_str(&dialect.quote_identifier(column));
                sql.push_str(" IS NULL");
            }
            Restriction::IsNotNull(column) => {
                sql.push_str(&dialect.quote_identifier(column));
                sql.push_str(" IS NOT NULL");
            }
            Restriction::And(parts) => build_group(parts, " AND ", "1 = 1", dialect, sql, params),
            Restriction::Or(parts) => build_group(parts, " OR ", "1 = 0", dialect, sql, params),
            Restriction::Not(inner) => {
                sql.push_str("NOT (");
                inner.build(dialect, sql, params);
                sql.push(')');
            }
        }
    }
}

fn build_group(
    parts: &[Restriction],
    separator: &str,
    empty: &str,
    dialect: Dialect,
    sql: &mut String,
    params: &mut Vec<Value>,
) {
    if parts.is_empty() {
        sql.push_str(empty);
        return;
    }
    sql.push('(');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            sql.push_str(separator);
        }
        part.build(dialect, sql, params);
    }
    sql.push(')');
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// A SELECT over one entity's table.
#[derive(Debug, Clone, PartialEq)]
pub struct Criteria {
    entity: &'static str,
    table: &'static str,
    columns: Vec<&'static str>,
    restrictions: Vec<Restriction>,
    order: Vec<(String, OrderDirection)>,
}

impl Criteria {
    /// Select all mapped columns of `E`.
    pub fn for_entity<E: Entity>() -> Self {
        Self {
            entity: E::ENTITY_NAME,
            table: E::TABLE_NAME,
            columns: E::fields().iter().map(|f| f.column).collect(),
            restrictions: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Add a restriction; all restrictions are combined with AND.
    pub fn filter(mut self, restriction: Restriction) -> Self {
        self.restrictions.push(restriction);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, direction: OrderDirection) -> Self {
        self.order.push((column.into(), direction));
        self
    }

    pub fn order_asc(self, column: impl Into<String>) -> Self {
        self.order_by(column, OrderDirection::Asc)
    }

    pub fn order_desc(self, column: impl Into<String>) -> Self {
        self.order_by(column, OrderDirection::Desc)
    }

    pub fn entity_name(&self) -> &'static str {
        self.entity
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// Render into the intermediate positional form.
    pub fn to_statement(&self, dialect: Dialect) -> BoundStatement {
        let columns = self
            .columns
            .iter()
            .map(|c| dialect.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {} FROM {}",
            columns,
            dialect.quote_identifier(self.table)
        );
        let mut params = Vec::new();

        if !self.restrictions.is_empty() {
            sql.push_str(" WHERE ");
            for (i, restriction) in self.restrictions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" AND ");
                }
                restriction.build(dialect, &mut sql, &mut params);
            }
        }

        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|(column, direction)| {
                    let dir = match direction {
                        OrderDirection::Asc => "ASC",
                        OrderDirection::Desc => "DESC",
                    };
                    format!("{} {}", dialect.quote_identifier(column), dir)
                })
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }

        BoundStatement::new(sql, params)
    }
}
