//! Expansion of bound parameters into the intermediate positional form.
//!
//! The intermediate form uses one bare `?` per value, so that
//! [`Dialect::rewrite_placeholders`] can turn it into native syntax without
//! knowing where the values came from. List bindings expand into one `?` per
//! element because the wire protocols have no array binding for arbitrary
//! parameter counts.

use crate::params::{Binding, Parameters};
use std::collections::BTreeSet;
use tessera_core::{
    Dialect, Error, ParameterToken, Result, Value, ValidationErrorKind, scan_parameters,
};

/// A statement in intermediate form together with its values.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl BoundStatement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// The statement in the backend's native placeholder syntax.
    pub fn native_sql(&self, dialect: Dialect) -> Result<String> {
        dialect.rewrite_placeholders(&self.sql, self.params.len())
    }

    /// Append a clause (LIMIT, FOR UPDATE, ...) separated by a space.
    pub fn push_clause(&mut self, clause: &str) {
        self.sql.push(' ');
        self.sql.push_str(clause);
    }
}

fn render(binding: &Binding, out: &mut String, params: &mut Vec<Value>) {
    match binding {
        Binding::Single(value) => {
            out.push('?');
            params.push(value.clone());
        }
        Binding::List(values) if values.is_empty() => out.push_str("NULL"),
        Binding::List(values) => {
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push('?');
                params.push(value.clone());
            }
        }
    }
}

/// Expand `sql` with `parameters` into a [`BoundStatement`].
///
/// Every marker must have a binding and every binding must be used:
/// positional mismatches are [`ValidationErrorKind::ParameterCount`] errors,
/// unknown or unused names are [`ValidationErrorKind::UnknownParameter`].
pub fn expand(sql: &str, parameters: &Parameters) -> Result<BoundStatement> {
    let tokens = scan_parameters(sql)?;
    let mut out = String::with_capacity(sql.len());
    let mut params = Vec::new();
    let mut used = BTreeSet::new();
    let mut position = 0;
    let mut last = 0;

    for (range, token) in tokens {
        out.push_str(&sql[last..range.start]);
        last = range.end;
        match token {
            ParameterToken::Positional => {
                let binding = parameters.positional().get(position).ok_or_else(|| {
                    Error::validation(
                        ValidationErrorKind::ParameterCount,
                        format!(
                            "statement has more positional markers than the {} bound value(s)",
                            parameters.positional().len()
                        ),
                    )
                })?;
                position += 1;
                render(binding, &mut out, &mut params);
            }
            ParameterToken::Named(name) => {
                let binding = parameters.named(name).ok_or_else(|| {
                    Error::validation(
                        ValidationErrorKind::UnknownParameter,
                        format!("no value bound for parameter ':{name}'"),
                    )
                })?;
                used.insert(name);
                render(binding, &mut out, &mut params);
            }
        }
    }
    out.push_str(&sql[last..]);

    if position != parameters.positional().len() {
        return Err(Error::validation(
            ValidationErrorKind::ParameterCount,
            format!(
                "statement has {position} positional marker(s) but {} value(s) were bound",
                parameters.positional().len()
            ),
        ));
    }
    if let Some(unused) = parameters.names().find(|name| !used.contains(name)) {
        return Err(Error::validation(
            ValidationErrorKind::UnknownParameter,
            format!("parameter ':{unused}' is not used by the statement"),
        ));
    }

    tracing::trace!(sql = %out, params = params.len(), "Expanded statement");
    Ok(BoundStatement::new(out, params))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(pairs: &[(&str, Binding)]) -> Parameters {
        let mut params = Parameters::new();
        for (name, binding) in pairs {
            params.set(*name, binding.clone());
        }
        params
    }

    #[test]
    fn expands_list_parameters() {
        let params = named(&[
            (
                "ids",
                Binding::List(vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(3)]),
            ),
            ("name", Binding::Single(Value::Text("a".into()))),
        ]);
        let bound = expand(
            "SELECT * FROM books WHERE id IN (:ids) AND title = :name",
            &params,
        )
        .unwrap();
        assert_eq!(
            bound.sql,
            "SELECT * FROM books WHERE id IN (?, ?, ?) AND title = ?"
        );
        assert_eq!(bound.params.len(), 4);
        assert_eq!(
            bound.native_sql(Dialect::Postgres).unwrap(),
            "SELECT * FROM books WHERE id IN ($1, $2, $3) AND title = $4"
        );
    }

    #[test]
    fn empty_list_renders_null() {
        let params = named(&[("ids", Binding::List(Vec::new()))]);
        let bound = expand("SELECT * FROM books WHERE id IN (:ids)", &params).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM books WHERE id IN (NULL)");
        assert!(bound.params.is_empty());
    }

    #[test]
    fn repeated_name_binds_twice() {
        let params = named(&[("v", Binding::Single(Value::BigInt(5)))]);
        let bound = expand("SELECT * FROM t WHERE a = :v OR b = :v", &params).unwrap();
        assert_eq!(bound.params, vec![Value::BigInt(5), Value::BigInt(5)]);
    }

    #[test]
    fn positional_count_mismatch() {
        let mut params = Parameters::new();
        params.push(Binding::Single(Value::BigInt(1)));
        let err = expand("SELECT * FROM t WHERE a = ? AND b = ?", &params).unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::ParameterCount));

        params.push(Binding::Single(Value::BigInt(2)));
        params.push(Binding::Single(Value::BigInt(3)));
        let err = expand("SELECT * FROM t WHERE a = ? AND b = ?", &params).unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::ParameterCount));
    }

    #[test]
    fn missing_and_unused_names() {
        let err = expand("SELECT * FROM t WHERE a = :a", &Parameters::new()).unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::UnknownParameter));

        let params = named(&[("b", Binding::Single(Value::Null))]);
        let err = expand("SELECT * FROM t", &params).unwrap_err();
        assert_eq!(err.validation_kind(), Some(ValidationErrorKind::UnknownParameter));
    }

    #[test]
    fn markers_in_literals_are_left_alone() {
        let params = named(&[("x", Binding::Single(Value::BigInt(1)))]);
        let bound = expand("SELECT ':x', a::text FROM t WHERE a = :x", &params).unwrap();
        assert_eq!(bound.sql, "SELECT ':x', a::text FROM t WHERE a = ?");
    }
}
