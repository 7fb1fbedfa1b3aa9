use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::CubeError;
use crate::index::{
    list_rows, require_id, run_view, AllDocsOptions, AllDocsRow, DocumentIndex, FindQuery,
    QueryOptions, View, ViewResult, ViewSource,
};
use crate::types::ids::DocId;
use crate::types::value::Document;

/// Document index held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryIndex {
    docs: RwLock<BTreeMap<DocId, Document>>,
    views: RwLock<HashMap<String, View>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.read_docs().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_docs(&self) -> Result<RwLockReadGuard<'_, BTreeMap<DocId, Document>>, CubeError> {
        self.docs
            .read()
            .map_err(|_| CubeError::Internal("index lock poisoned".to_string()))
    }

    fn write_docs(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<DocId, Document>>, CubeError> {
        self.docs
            .write()
            .map_err(|_| CubeError::Internal("index lock poisoned".to_string()))
    }
}

impl DocumentIndex for MemoryIndex {
    fn get(&self, doc_id: &str) -> Result<Document, CubeError> {
        self.read_docs()?
            .get(doc_id)
            .cloned()
            .ok_or_else(|| CubeError::doc_not_found(doc_id))
    }

    fn put(&self, doc: Document) -> Result<(), CubeError> {
        let id = require_id(&doc)?;
        self.write_docs()?.insert(id, doc);
        Ok(())
    }

    fn delete(&self, doc: &Document) -> Result<(), CubeError> {
        let id = require_id(doc)?;
        self.write_docs()?.remove(&id);
        Ok(())
    }

    fn list_all(&self, options: &AllDocsOptions) -> Result<Vec<AllDocsRow>, CubeError> {
        let docs = self.read_docs()?;
        list_rows(&docs, options)
    }

    fn find(&self, query: &FindQuery) -> Result<Vec<Document>, CubeError> {
        let docs = self.read_docs()?;
        Ok(query.run(docs.values().cloned()))
    }

    fn query(&self, source: ViewSource<'_>, options: &QueryOptions) -> Result<ViewResult, CubeError> {
        let named;
        let view = match source {
            ViewSource::Inline(view) => view,
            ViewSource::Named(name) => {
                named = self
                    .views
                    .read()
                    .map_err(|_| CubeError::Internal("view registry lock poisoned".to_string()))?
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CubeError::NotFound(format!("view '{}' not found", name)))?;
                &named
            }
        };
        let docs = self.read_docs()?;
        Ok(run_view(view, docs.values().cloned(), options))
    }

    fn register_view(&self, name: &str, view: View) -> Result<(), CubeError> {
        if name.is_empty() {
            return Err(CubeError::InvalidArgs("view name must not be empty".to_string()));
        }
        self.views
            .write()
            .map_err(|_| CubeError::Internal("view registry lock poisoned".to_string()))?
            .insert(name.to_string(), view);
        Ok(())
    }
}
