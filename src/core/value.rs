//! Attribute values carried by event data

use serde::Serialize;
use std::collections::BTreeMap;

/// Named attributes of an event data record, kept sorted by name so that
/// encoding and hashing are deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    /// Explicitly absent value, e.g. a JSON `null`
    Null,
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    List(Vec<AttributeValue>),
    Container(Attributes),
    /// Value of a kind this build does not know, preserved verbatim.
    Opaque { kind: u8, bytes: Vec<u8> },
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Case-insensitive substring match over the textual form of the value.
    /// Lists and containers match when any member matches.
    pub fn contains_text(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.contains_lowercase(&needle)
    }

    fn contains_lowercase(&self, needle: &str) -> bool {
        match self {
            AttributeValue::String(s) => s.to_lowercase().contains(needle),
            AttributeValue::Integer(v) => v.to_string().contains(needle),
            AttributeValue::Float(v) => v.to_string().contains(needle),
            AttributeValue::Boolean(v) => v.to_string().contains(needle),
            AttributeValue::List(items) => items.iter().any(|v| v.contains_lowercase(needle)),
            AttributeValue::Container(map) => map.values().any(|v| v.contains_lowercase(needle)),
            AttributeValue::Null | AttributeValue::Opaque { .. } => false,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::String(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Integer(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Boolean(v)
    }
}

impl From<Vec<AttributeValue>> for AttributeValue {
    fn from(v: Vec<AttributeValue>) -> Self {
        AttributeValue::List(v)
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value;
        match v {
            Value::Null => AttributeValue::Null,
            Value::Bool(b) => AttributeValue::Boolean(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => AttributeValue::Integer(i),
                None => AttributeValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => AttributeValue::String(s),
            Value::Array(items) => {
                AttributeValue::List(items.into_iter().map(AttributeValue::from).collect())
            }
            Value::Object(map) => AttributeValue::Container(
                map.into_iter()
                    .map(|(k, v)| (k, AttributeValue::from(v)))
                    .collect(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_text_is_case_insensitive() {
        let v = AttributeValue::from("C:\\Windows\\System32\\EVIL.exe");
        assert!(v.contains_text("evil"));
        assert!(!v.contains_text("benign"));
    }

    #[test]
    fn test_contains_text_descends_into_collections() {
        let mut inner = Attributes::new();
        inner.insert("key".into(), AttributeValue::from("RunOnce"));
        let v = AttributeValue::List(vec![
            AttributeValue::Integer(42),
            AttributeValue::Container(inner),
        ]);
        assert!(v.contains_text("runonce"));
        assert!(v.contains_text("42"));
    }

    #[test]
    fn test_from_json() {
        let v = AttributeValue::from(serde_json::json!({"a": [1, 2.5, true], "b": "x"}));
        let AttributeValue::Container(map) = v else {
            panic!("expected container");
        };
        assert_eq!(
            map["a"],
            AttributeValue::List(vec![
                AttributeValue::Integer(1),
                AttributeValue::Float(2.5),
                AttributeValue::Boolean(true),
            ])
        );
        assert_eq!(map["b"].as_str(), Some("x"));
    }

    #[test]
    fn test_json_null_stays_null() {
        let v = AttributeValue::from(serde_json::json!({"gone": null, "empty": []}));
        let AttributeValue::Container(map) = &v else {
            panic!("expected container");
        };
        assert_eq!(map["gone"], AttributeValue::Null);
        assert_eq!(map["empty"], AttributeValue::List(Vec::new()));
        assert!(!map["gone"].contains_text("null"));
        assert_eq!(
            serde_json::to_value(&v).unwrap(),
            serde_json::json!({"empty": [], "gone": null})
        );
    }
}
