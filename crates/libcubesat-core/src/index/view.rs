//! Map/reduce views
//!
//! A map function receives each live document and an [`Emitter`] and may emit
//! any number of `(key, value)` rows. Rows are sorted by key collation, then
//! by document id. An optional reduce step folds all emitted values into one.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CubeError;
use crate::index::selector::collate;
use crate::types::ids::DocId;
use crate::types::value::{Document, Value};

/// Map callback
pub type MapFn = Arc<dyn Fn(&Document, &mut Emitter) + Send + Sync>;

/// Custom reduce callback over all emitted values
pub type ReduceFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Collects rows emitted by a map function for one document
#[derive(Debug, Default)]
pub struct Emitter {
    rows: Vec<(Value, Value)>,
}

impl Emitter {
    pub fn emit(&mut self, key: impl Into<Value>, value: impl Into<Value>) {
        self.rows.push((key.into(), value.into()));
    }

    fn take(&mut self) -> Vec<(Value, Value)> {
        std::mem::take(&mut self.rows)
    }
}

/// Built-in and custom reducers
#[derive(Clone)]
pub enum Reduce {
    /// Number of emitted rows (`_count`)
    Count,
    /// Sum of numeric values (`_sum`); non-numeric values are skipped
    Sum,
    Custom(ReduceFn),
}

impl Reduce {
    /// Resolve a built-in reducer by its conventional name
    pub fn builtin(name: &str) -> Result<Self, CubeError> {
        match name {
            "_count" => Ok(Reduce::Count),
            "_sum" => Ok(Reduce::Sum),
            other => Err(CubeError::InvalidArgs(format!("unknown reducer '{}'", other))),
        }
    }

    pub fn apply(&self, values: &[Value]) -> Value {
        match self {
            Reduce::Count => Value::Integer(values.len() as i64),
            Reduce::Sum => {
                let all_integers = values
                    .iter()
                    .all(|v| matches!(v, Value::Integer(_)) || v.as_f64().is_none());
                let float_sum = || Value::Float(values.iter().filter_map(Value::as_f64).sum());
                if !all_integers {
                    return float_sum();
                }
                // integer sums that overflow i64 are reported as floats
                values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Integer(i) => Some(*i),
                        _ => None,
                    })
                    .try_fold(0i64, i64::checked_add)
                    .map(Value::Integer)
                    .unwrap_or_else(float_sum)
            }
            Reduce::Custom(f) => f(values),
        }
    }
}

impl fmt::Debug for Reduce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduce::Count => write!(f, "Count"),
            Reduce::Sum => write!(f, "Sum"),
            Reduce::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// A map function with an optional reducer
#[derive(Clone)]
pub struct View {
    pub map: MapFn,
    pub reduce: Option<Reduce>,
}

impl View {
    pub fn new<F>(map: F) -> Self
    where
        F: Fn(&Document, &mut Emitter) + Send + Sync + 'static,
    {
        Self {
            map: Arc::new(map),
            reduce: None,
        }
    }

    pub fn with_reduce(mut self, reduce: Reduce) -> Self {
        self.reduce = Some(reduce);
        self
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("map", &"Fn(..)")
            .field("reduce", &self.reduce)
            .finish()
    }
}

/// Which view a query runs
#[derive(Debug, Clone)]
pub enum ViewSource<'a> {
    Inline(&'a View),
    /// A view registered on the index, e.g. `"teams/mushroom"`
    Named(&'a str),
}

/// Options for a view query
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Attach the emitting document to each row (map-only results)
    pub include_docs: bool,
    /// Run the view's reducer if it has one
    pub reduce: bool,
    /// Only return rows whose key equals one of these
    pub key: Option<Value>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            include_docs: false,
            reduce: true,
            key: None,
        }
    }
}

/// One result row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    /// Emitting document; `None` for reduced rows
    pub id: Option<DocId>,
    pub key: Value,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

/// Result of a view query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewResult {
    /// Rows emitted before reduction
    pub total_rows: usize,
    pub rows: Vec<ViewRow>,
}

/// Run a view over live documents
pub fn run_view<I>(view: &View, docs: I, options: &QueryOptions) -> ViewResult
where
    I: IntoIterator<Item = Document>,
{
    let mut emitter = Emitter::default();
    let mut rows = Vec::new();

    for doc in docs {
        (view.map)(&doc, &mut emitter);
        let emitted = emitter.take();
        if emitted.is_empty() {
            continue;
        }
        let id = doc.id().map(str::to_string);
        for (key, value) in emitted {
            if let Some(wanted) = &options.key {
                if collate(&key, wanted) != std::cmp::Ordering::Equal {
                    continue;
                }
            }
            rows.push(ViewRow {
                id: id.clone(),
                key,
                value,
                doc: options.include_docs.then(|| doc.clone()),
            });
        }
    }

    rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
    let total_rows = rows.len();

    match (&view.reduce, options.reduce) {
        (Some(reduce), true) => {
            let values: Vec<Value> = rows.into_iter().map(|r| r.value).collect();
            ViewResult {
                total_rows,
                rows: vec![ViewRow {
                    id: None,
                    key: Value::Null,
                    value: reduce.apply(&values),
                    doc: None,
                }],
            }
        }
        _ => ViewResult { total_rows, rows },
    }
}
