use std::collections::BTreeMap;
use serde::{Deserialize, Serialize};

use crate::error::CubeError;

/// Reserved key carrying the document identifier
pub const ID_KEY: &str = "_id";

/// Reserved key carrying the derived revision token
pub const REV_KEY: &str = "_rev";

/// A tagged field value inside a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view used for cross-type comparisons (integer vs float)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Integer(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// An open-shaped document: ordered field map with two reserved keys (`_id`, `_rev`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a document from a JSON object
    pub fn from_json(json: serde_json::Value) -> Result<Self, CubeError> {
        match Value::from(json) {
            Value::Map(fields) => Ok(Self { fields }),
            other => Err(CubeError::InvalidArgs(format!(
                "document must be a JSON object, got {:?}",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Builder-style field setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID_KEY).and_then(Value::as_str)
    }

    pub fn rev(&self) -> Option<&str> {
        self.fields.get(REV_KEY).and_then(Value::as_str)
    }

    /// The user-visible fields, without `_id` and `_rev`
    pub fn body(&self) -> Document {
        let fields = self
            .fields
            .iter()
            .filter(|(k, _)| k.as_str() != ID_KEY && k.as_str() != REV_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Document { fields }
    }

    /// Attach the reserved identity and revision keys
    pub fn with_identity(mut self, doc_id: &str, rev: &str) -> Document {
        self.fields.insert(ID_KEY.to_string(), Value::String(doc_id.to_string()));
        self.fields.insert(REV_KEY.to_string(), Value::String(rev.to_string()));
        self
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl From<BTreeMap<String, Value>> for Document {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json_object() {
        let doc = Document::from_json(json!({"a": "b", "n": 3, "f": 1.5, "l": [true, null]})).unwrap();
        assert_eq!(doc.get("a"), Some(&Value::String("b".to_string())));
        assert_eq!(doc.get("n"), Some(&Value::Integer(3)));
        assert_eq!(doc.get("f"), Some(&Value::Float(1.5)));
        assert_eq!(
            doc.get("l"),
            Some(&Value::List(vec![Value::Bool(true), Value::Null]))
        );
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(Document::from_json(json!([1, 2])).is_err());
    }

    #[test]
    fn test_body_strips_reserved_keys() {
        let doc = Document::new()
            .with("a", "b")
            .with_identity("doc-1", "1-abc");
        assert_eq!(doc.id(), Some("doc-1"));
        assert_eq!(doc.rev(), Some("1-abc"));
        let body = doc.body();
        assert_eq!(body.len(), 1);
        assert!(body.id().is_none());
    }

    #[test]
    fn test_json_roundtrip_through_serde() {
        let doc = Document::from_json(json!({"nested": {"x": 1}, "s": "t"})).unwrap();
        let bytes = serde_json::to_vec(&doc).unwrap();
        let parsed: Document = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(doc, parsed);
    }
}
