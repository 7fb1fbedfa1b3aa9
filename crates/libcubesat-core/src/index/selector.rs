//! Selector queries over documents
//!
//! Selectors are JSON objects in the familiar document-store shape:
//! `{"team": "Mushroom"}`, `{"age": {"$gte": 18, "$lt": 65}}`,
//! `{"$or": [{"a": 1}, {"b": {"$exists": true}}]}`. Field names may use
//! dotted paths into nested maps.

use std::cmp::Ordering;

use regex::Regex;

use crate::error::CubeError;
use crate::types::value::{Document, Value};

/// A parsed selector
#[derive(Debug, Clone)]
pub enum Selector {
    /// Matches every document
    All,
    And(Vec<Selector>),
    Or(Vec<Selector>),
    Field { path: Vec<String>, condition: Condition },
}

/// A test applied to one field
#[derive(Debug, Clone)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Regex(Regex),
}

/// Parameters for a `find`
#[derive(Debug, Clone)]
pub struct FindQuery {
    pub selector: Selector,
    /// Project the result onto these fields (plus `_id` and `_rev`)
    pub fields: Option<Vec<String>>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindQuery {
    pub fn new(selector: Selector) -> Self {
        Self {
            selector,
            fields: None,
            skip: 0,
            limit: None,
        }
    }

    /// Parse the selector from JSON
    pub fn from_json(selector: &serde_json::Value) -> Result<Self, CubeError> {
        Ok(Self::new(Selector::parse(selector)?))
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = Some(fields);
        self
    }

    /// Run over documents already in id order
    pub fn run<I>(&self, docs: I) -> Vec<Document>
    where
        I: IntoIterator<Item = Document>,
    {
        let matched = docs
            .into_iter()
            .filter(|doc| self.selector.matches(doc))
            .skip(self.skip);
        let matched: Vec<Document> = match self.limit {
            Some(limit) => matched.take(limit).collect(),
            None => matched.collect(),
        };
        match &self.fields {
            Some(fields) => matched.into_iter().map(|d| project(d, fields)).collect(),
            None => matched,
        }
    }
}

fn project(doc: Document, fields: &[String]) -> Document {
    let mut out = Document::new();
    for (key, value) in doc.into_fields() {
        if key.starts_with('_') || fields.iter().any(|f| *f == key) {
            out.insert(key, value);
        }
    }
    out
}

impl Selector {
    /// Parse a JSON selector object
    pub fn parse(json: &serde_json::Value) -> Result<Self, CubeError> {
        let object = json
            .as_object()
            .ok_or_else(|| CubeError::InvalidArgs(format!("selector must be an object: {}", json)))?;

        let mut clauses = Vec::with_capacity(object.len());
        for (key, value) in object {
            clauses.push(match key.as_str() {
                "$and" => Selector::And(parse_list(key, value)?),
                "$or" => Selector::Or(parse_list(key, value)?),
                op if op.starts_with('$') => {
                    return Err(CubeError::InvalidArgs(format!(
                        "unknown top-level operator '{}'",
                        op
                    )))
                }
                field => parse_field(field, value)?,
            });
        }

        Ok(match clauses.len() {
            0 => Selector::All,
            1 => clauses.remove(0),
            _ => Selector::And(clauses),
        })
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Selector::All => true,
            Selector::And(all) => all.iter().all(|s| s.matches(doc)),
            Selector::Or(any) => any.iter().any(|s| s.matches(doc)),
            Selector::Field { path, condition } => condition.matches(lookup(doc, path)),
        }
    }
}

fn parse_list(op: &str, json: &serde_json::Value) -> Result<Vec<Selector>, CubeError> {
    json.as_array()
        .ok_or_else(|| CubeError::InvalidArgs(format!("{} expects an array", op)))?
        .iter()
        .map(Selector::parse)
        .collect()
}

fn parse_field(field: &str, json: &serde_json::Value) -> Result<Selector, CubeError> {
    let path: Vec<String> = field.split('.').map(str::to_string).collect();

    let operators = match json.as_object() {
        Some(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => map,
        _ => {
            return Ok(Selector::Field {
                path,
                condition: Condition::Eq(Value::from(json.clone())),
            })
        }
    };

    let mut conditions = Vec::with_capacity(operators.len());
    for (op, arg) in operators {
        let condition = match op.as_str() {
            "$eq" => Condition::Eq(Value::from(arg.clone())),
            "$ne" => Condition::Ne(Value::from(arg.clone())),
            "$gt" => Condition::Gt(Value::from(arg.clone())),
            "$gte" => Condition::Gte(Value::from(arg.clone())),
            "$lt" => Condition::Lt(Value::from(arg.clone())),
            "$lte" => Condition::Lte(Value::from(arg.clone())),
            "$in" => Condition::In(parse_values(op, arg)?),
            "$nin" => Condition::Nin(parse_values(op, arg)?),
            "$exists" => Condition::Exists(
                arg.as_bool()
                    .ok_or_else(|| CubeError::InvalidArgs("$exists expects a boolean".to_string()))?,
            ),
            "$regex" => {
                let pattern = arg
                    .as_str()
                    .ok_or_else(|| CubeError::InvalidArgs("$regex expects a string".to_string()))?;
                let re = Regex::new(pattern)
                    .map_err(|e| CubeError::InvalidArgs(format!("bad $regex '{}': {}", pattern, e)))?;
                Condition::Regex(re)
            }
            other => {
                return Err(CubeError::InvalidArgs(format!(
                    "unknown operator '{}' on field '{}'",
                    other, field
                )))
            }
        };
        conditions.push(Selector::Field {
            path: path.clone(),
            condition,
        });
    }

    Ok(if conditions.len() == 1 {
        conditions.remove(0)
    } else {
        Selector::And(conditions)
    })
}

fn parse_values(op: &str, json: &serde_json::Value) -> Result<Vec<Value>, CubeError> {
    Ok(json
        .as_array()
        .ok_or_else(|| CubeError::InvalidArgs(format!("{} expects an array", op)))?
        .iter()
        .cloned()
        .map(Value::from)
        .collect())
}

fn lookup<'a>(doc: &'a Document, path: &[String]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut current = doc.get(first)?;
    for segment in rest {
        match current {
            Value::Map(map) => current = map.get(segment)?,
            _ => return None,
        }
    }
    Some(current)
}

impl Condition {
    pub fn matches(&self, field: Option<&Value>) -> bool {
        match (self, field) {
            (Condition::Exists(expected), f) => f.is_some() == *expected,
            (Condition::Ne(v), None) => !v.is_null(),
            (Condition::Nin(_), None) => true,
            (_, None) => false,
            (Condition::Eq(v), Some(f)) => collate(f, v) == Ordering::Equal,
            (Condition::Ne(v), Some(f)) => collate(f, v) != Ordering::Equal,
            (Condition::Gt(v), Some(f)) => comparable(f, v) && collate(f, v) == Ordering::Greater,
            (Condition::Gte(v), Some(f)) => comparable(f, v) && collate(f, v) != Ordering::Less,
            (Condition::Lt(v), Some(f)) => comparable(f, v) && collate(f, v) == Ordering::Less,
            (Condition::Lte(v), Some(f)) => comparable(f, v) && collate(f, v) != Ordering::Greater,
            (Condition::In(vs), Some(f)) => vs.iter().any(|v| collate(f, v) == Ordering::Equal),
            (Condition::Nin(vs), Some(f)) => vs.iter().all(|v| collate(f, v) != Ordering::Equal),
            (Condition::Regex(re), Some(Value::String(s))) => re.is_match(s),
            (Condition::Regex(_), Some(_)) => false,
        }
    }
}

/// Range operators only compare values of the same kind
fn comparable(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Integer(_) | Value::Float(_) => 2,
        Value::String(_) => 3,
        Value::List(_) => 4,
        Value::Map(_) => 5,
    }
}

/// Total ordering over values: null < booleans < numbers < strings < lists < maps
pub fn collate(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::List(xs), Value::List(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = collate(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Map(xs), Value::Map(ys)) => {
            for ((kx, vx), (ky, vy)) in xs.iter().zip(ys) {
                let ord = kx.cmp(ky).then_with(|| collate(vx, vy));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.total_cmp(&y),
            _ => Ordering::Equal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(json: serde_json::Value) -> Document {
        Document::from_json(json).unwrap()
    }

    fn matches(selector: serde_json::Value, document: serde_json::Value) -> bool {
        Selector::parse(&selector).unwrap().matches(&doc(document))
    }

    #[test]
    fn test_implicit_and_explicit_equality() {
        assert!(matches(json!({"team": "Mushroom"}), json!({"team": "Mushroom"})));
        assert!(matches(json!({"team": {"$eq": "Mushroom"}}), json!({"team": "Mushroom"})));
        assert!(!matches(json!({"team": "Mushroom"}), json!({"team": "Star"})));
        assert!(!matches(json!({"team": "Mushroom"}), json!({})));
    }

    #[test]
    fn test_numeric_equality_across_int_and_float() {
        assert!(matches(json!({"n": 1}), json!({"n": 1.0})));
    }

    #[test]
    fn test_range_operators() {
        let d = json!({"age": 30});
        assert!(matches(json!({"age": {"$gt": 18}}), d.clone()));
        assert!(matches(json!({"age": {"$gte": 30, "$lt": 31}}), d.clone()));
        assert!(!matches(json!({"age": {"$lte": 29}}), d.clone()));
        // no cross-type range matches
        assert!(!matches(json!({"age": {"$gt": "a"}}), d));
    }

    #[test]
    fn test_membership_and_existence() {
        let d = json!({"color": "red"});
        assert!(matches(json!({"color": {"$in": ["red", "blue"]}}), d.clone()));
        assert!(!matches(json!({"color": {"$nin": ["red"]}}), d.clone()));
        assert!(matches(json!({"size": {"$nin": ["xl"]}}), d.clone()));
        assert!(matches(json!({"color": {"$exists": true}}), d.clone()));
        assert!(matches(json!({"size": {"$exists": false}}), d.clone()));
        assert!(matches(json!({"size": {"$ne": "xl"}}), d));
    }

    #[test]
    fn test_regex_and_nested_paths() {
        let d = json!({"name": "Toad", "stats": {"speed": 4}});
        assert!(matches(json!({"name": {"$regex": "^To"}}), d.clone()));
        assert!(!matches(json!({"stats": {"$regex": "4"}}), d.clone()));
        assert!(matches(json!({"stats.speed": {"$gt": 3}}), d.clone()));
        assert!(!matches(json!({"stats.weight": 1}), d));
    }

    #[test]
    fn test_boolean_combinators() {
        let d = json!({"a": 1, "b": 2});
        assert!(matches(json!({"$or": [{"a": 5}, {"b": 2}]}), d.clone()));
        assert!(!matches(json!({"$and": [{"a": 1}, {"b": 3}]}), d.clone()));
        assert!(matches(json!({"a": 1, "b": 2}), d.clone()));
        assert!(matches(json!({}), d));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Selector::parse(&json!([1])).is_err());
        assert!(Selector::parse(&json!({"a": {"$nope": 1}})).is_err());
        assert!(Selector::parse(&json!({"$or": {"a": 1}})).is_err());
        assert!(Selector::parse(&json!({"a": {"$regex": "("}})).is_err());
        assert!(Selector::parse(&json!({"$where": "x"})).is_err());
    }

    #[test]
    fn test_find_query_limit_and_fields() {
        let docs = vec![
            doc(json!({"_id": "1", "team": "M", "x": 1})),
            doc(json!({"_id": "2", "team": "M", "x": 2})),
            doc(json!({"_id": "3", "team": "S", "x": 3})),
        ];
        let query = FindQuery::from_json(&json!({"team": "M"}))
            .unwrap()
            .with_limit(1)
            .with_fields(vec!["team".to_string()]);
        let found = query.run(docs);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id(), Some("1"));
        assert!(found[0].get("x").is_none());
    }

    #[test]
    fn test_collation_order() {
        let values = [
            Value::Null,
            Value::Bool(false),
            Value::Integer(2),
            Value::Float(2.5),
            Value::from("a"),
            Value::List(vec![]),
        ];
        for pair in values.windows(2) {
            assert_eq!(collate(&pair[0], &pair[1]), Ordering::Less);
        }
    }
}
