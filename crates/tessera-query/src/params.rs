//! Parameter bindings attached to a query.

use std::collections::BTreeMap;
use tessera_core::Value;

/// A value bound to one parameter marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// A single value, rendered as one placeholder.
    Single(Value),
    /// A list of values, rendered as one placeholder per element (`IN (:ids)`).
    List(Vec<Value>),
}

impl Binding {
    /// Number of placeholders this binding expands to (an empty list renders as `NULL`).
    pub fn placeholder_count(&self) -> usize {
        match self {
            Binding::Single(_) => 1,
            Binding::List(values) => values.len(),
        }
    }
}

impl From<Value> for Binding {
    fn from(value: Value) -> Self {
        Binding::Single(value)
    }
}

/// Positional and named bindings of a query.
///
/// Positional bindings fill bare `?` markers in order of appearance; named
/// bindings fill `:name` markers, and one name may appear several times.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    positional: Vec<Binding>,
    named: BTreeMap<String, Binding>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional binding.
    pub fn push(&mut self, binding: Binding) {
        self.positional.push(binding);
    }

    /// Set a named binding, replacing any earlier value for the same name.
    pub fn set(&mut self, name: impl Into<String>, binding: Binding) {
        self.named.insert(name.into(), binding);
    }

    pub fn positional(&self) -> &[Binding] {
        &self.positional
    }

    pub fn named(&self, name: &str) -> Option<&Binding> {
        self.named.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }

    pub fn clear(&mut self) {
        self.positional.clear();
        self.named.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_binding_is_replaced() {
        let mut params = Parameters::new();
        params.set("id", Binding::Single(Value::BigInt(1)));
        params.set("id", Binding::Single(Value::BigInt(2)));
        assert_eq!(params.named("id"), Some(&Binding::Single(Value::BigInt(2))));
        assert_eq!(params.names().collect::<Vec<_>>(), vec!["id"]);
    }

    #[test]
    fn clear_removes_everything() {
        let mut params = Parameters::new();
        params.push(Value::Bool(true).into());
        params.set("ids", Binding::List(vec![Value::BigInt(1), Value::BigInt(2)]));
        assert!(!params.is_empty());
        assert_eq!(params.named("ids").map(Binding::placeholder_count), Some(2));
        params.clear();
        assert!(params.is_empty());
    }
}
