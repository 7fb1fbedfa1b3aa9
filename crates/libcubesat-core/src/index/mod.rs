//! Queryable document index maintained from materialized views
//!
//! The index is a cache: it only ever holds what replay of the log produced,
//! and can be rebuilt from the log at any time via [`DocumentIndex::sync_from`].

pub mod memory;
pub mod selector;
pub mod view;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::CubeError;
use crate::projection::MaterializedView;
use crate::types::ids::DocId;
use crate::types::value::Document;

pub use memory::MemoryIndex;
pub use selector::{collate, Condition, FindQuery, Selector};
pub use view::{
    run_view, Emitter, MapFn, QueryOptions, Reduce, ReduceFn, View, ViewResult, ViewRow,
    ViewSource,
};

/// Options for listing every document
#[derive(Debug, Clone)]
pub struct AllDocsOptions {
    /// Attach the document body to each row
    pub include_docs: bool,
    /// Only these ids, in this order; unknown ids are skipped
    pub keys: Option<Vec<DocId>>,
}

impl Default for AllDocsOptions {
    fn default() -> Self {
        Self {
            include_docs: true,
            keys: None,
        }
    }
}

impl AllDocsOptions {
    pub fn keys(keys: Vec<DocId>) -> Self {
        Self {
            keys: Some(keys),
            ..Default::default()
        }
    }

    pub fn without_docs(mut self) -> Self {
        self.include_docs = false;
        self
    }
}

/// Revision of a listed document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowValue {
    pub rev: String,
}

/// One row of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllDocsRow {
    pub id: DocId,
    pub key: DocId,
    pub value: RowValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

impl AllDocsRow {
    /// Build a row from a document carrying `_id` and `_rev`
    pub fn from_document(doc: Document, include_doc: bool) -> Result<Self, CubeError> {
        let id = doc
            .id()
            .ok_or_else(|| CubeError::Internal("indexed document without _id".to_string()))?
            .to_string();
        let rev = doc.rev().unwrap_or_default().to_string();
        Ok(Self {
            key: id.clone(),
            id,
            value: RowValue { rev },
            doc: include_doc.then_some(doc),
        })
    }
}

/// Build listing rows from documents in id order
pub fn list_rows(
    docs: &BTreeMap<DocId, Document>,
    options: &AllDocsOptions,
) -> Result<Vec<AllDocsRow>, CubeError> {
    match &options.keys {
        Some(keys) => keys
            .iter()
            .filter_map(|k| docs.get(k))
            .map(|d| AllDocsRow::from_document(d.clone(), options.include_docs))
            .collect(),
        None => docs
            .values()
            .map(|d| AllDocsRow::from_document(d.clone(), options.include_docs))
            .collect(),
    }
}

/// A document store answering lookups, listings, selector and view queries
///
/// Documents handed to `put` carry their `_id` and `_rev`.
pub trait DocumentIndex: Send + Sync {
    /// Fetch one live document
    fn get(&self, doc_id: &str) -> Result<Document, CubeError>;

    /// Insert or replace a document
    fn put(&self, doc: Document) -> Result<(), CubeError>;

    /// Remove a document; removing an absent one is not an error
    fn delete(&self, doc: &Document) -> Result<(), CubeError>;

    fn list_all(&self, options: &AllDocsOptions) -> Result<Vec<AllDocsRow>, CubeError>;

    fn find(&self, query: &FindQuery) -> Result<Vec<Document>, CubeError>;

    fn query(&self, source: ViewSource<'_>, options: &QueryOptions) -> Result<ViewResult, CubeError>;

    /// Store a view under a name for later `ViewSource::Named` queries
    fn register_view(&self, name: &str, view: View) -> Result<(), CubeError>;

    /// Bring the index in line with a materialized view
    ///
    /// Only documents whose revision differs are rewritten; documents that
    /// are tombstoned or absent from the view are removed.
    fn sync_from(&self, view: &MaterializedView) -> Result<(), CubeError> {
        let current: BTreeMap<DocId, String> = self
            .list_all(&AllDocsOptions::default().without_docs())?
            .into_iter()
            .map(|row| (row.id, row.value.rev))
            .collect();

        let mut written = 0usize;
        let mut removed = 0usize;
        for state in view.states() {
            match state.to_document() {
                Some(doc) => {
                    let rev = state.revision.to_string();
                    if current.get(&state.doc_id) != Some(&rev) {
                        self.put(doc)?;
                        written += 1;
                    }
                }
                None if current.contains_key(&state.doc_id) => {
                    self.delete(&Document::new().with_identity(&state.doc_id, ""))?;
                    removed += 1;
                }
                None => {}
            }
        }
        for doc_id in current.keys() {
            if view.state(doc_id).is_none() {
                self.delete(&Document::new().with_identity(doc_id, ""))?;
                removed += 1;
            }
        }

        debug!(written, removed, "index synced");
        Ok(())
    }
}

/// The id a document is indexed under
pub(crate) fn require_id(doc: &Document) -> Result<DocId, CubeError> {
    doc.id()
        .map(str::to_string)
        .ok_or_else(|| CubeError::InvalidArgs("document is missing _id".to_string()))
}
