//! Named parameter bindings for compiled queries.

use std::collections::BTreeMap;

use super::value::Value;

/// A set of named values substituted for `$name` references at run time.
///
/// A query takes ownership of the set when it is assigned, so the bindings
/// a running evaluation sees are an immutable snapshot; editing a caller's
/// copy afterwards has no effect on the query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Parameters {
    values: BTreeMap<String, Value>,
}

impl Parameters {
    /// An empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an arbitrary value.
    pub fn set_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Binds a string.
    pub fn set_string(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_value(name, Value::String(value.into()))
    }

    /// Binds an integer.
    pub fn set_int(self, name: impl Into<String>, value: i64) -> Self {
        self.set_value(name, value)
    }

    /// Binds a float.
    pub fn set_float(self, name: impl Into<String>, value: f64) -> Self {
        self.set_value(name, value)
    }

    /// Binds a boolean.
    pub fn set_boolean(self, name: impl Into<String>, value: bool) -> Self {
        self.set_value(name, value)
    }

    /// Looks up a bound value.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Encodes the bindings as the JSON object handed to the engine.
    pub(crate) fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bindings_encode_as_plain_json() {
        let params = Parameters::new()
            .set_string("name", "Bob")
            .set_int("min_age", 30);
        assert_eq!(params.to_json(), json!({"min_age": 30, "name": "Bob"}));
    }

    #[test]
    fn assigned_snapshot_is_isolated() {
        let params = Parameters::new().set_int("n", 1);
        let snapshot = params.clone();
        let params = params.set_int("n", 2);
        assert_eq!(snapshot.value("n"), Some(&Value::Int(1)));
        assert_eq!(params.value("n"), Some(&Value::Int(2)));
    }
}
