use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A value inside an AMQP field table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Str(String),
    Table(FieldTable),
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<FieldTable> for FieldValue {
    fn from(value: FieldTable) -> Self {
        Self::Table(value)
    }
}

/// Ordered argument table (`x-*` arguments, client/server properties).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldTable(BTreeMap<String, FieldValue>);

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(FieldValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key) {
            Some(FieldValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_table(&self, key: &str) -> Option<&FieldTable> {
        match self.0.get(key) {
            Some(FieldValue::Table(t)) => Some(t),
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, FieldValue)> for FieldTable {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_table_accessors() {
        let caps = FieldTable::new()
            .with("publisher_confirms", true)
            .with("connection.blocked", true);
        let props = FieldTable::new()
            .with("product", "warren")
            .with("capabilities", caps);

        assert_eq!(props.get_str("product"), Some("warren"));
        assert_eq!(
            props
                .get_table("capabilities")
                .and_then(|c| c.get_bool("connection.blocked")),
            Some(true)
        );
        assert_eq!(props.get_bool("product"), None);
        assert_eq!(props.len(), 2);
    }

    #[test]
    fn test_field_table_deserializes_from_toml() {
        let table: FieldTable = toml::from_str(
            r#"
            x-max-length = 10
            x-queue-type = "quorum"
            "#,
        )
        .unwrap();

        assert_eq!(table.get("x-max-length"), Some(&FieldValue::Int(10)));
        assert_eq!(table.get_str("x-queue-type"), Some("quorum"));
    }
}
