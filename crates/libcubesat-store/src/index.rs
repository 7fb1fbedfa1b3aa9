use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;

use libcubesat_core::index::{list_rows, run_view};
use libcubesat_core::{
    AllDocsOptions, AllDocsRow, CubeError, DocId, Document, DocumentIndex, FindQuery,
    QueryOptions, View, ViewResult, ViewSource,
};

use crate::error::StoreError;

/// Document index persisted in sled
///
/// Documents are stored as JSON under their id, so iteration order matches
/// id order. Views hold closures and live only in memory; register them
/// again after reopening.
pub struct SledIndex {
    db: sled::Db,
    docs: sled::Tree,
    views: RwLock<HashMap<String, View>>,
}

impl std::fmt::Debug for SledIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledIndex")
            .field("docs", &self.docs.len())
            .finish()
    }
}

impl SledIndex {
    /// Open or create an index at the given path
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let docs = db.open_tree("docs")?;
        Ok(Self {
            db,
            docs,
            views: RwLock::new(HashMap::new()),
        })
    }

    /// Number of indexed documents
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, doc_id: &str) -> Result<Option<Document>, StoreError> {
        match self.docs.get(doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_all(&self) -> Result<BTreeMap<DocId, Document>, StoreError> {
        let mut docs = BTreeMap::new();
        for result in self.docs.iter() {
            let (key, value) = result?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|_| StoreError::Corrupt("document key is not UTF-8".to_string()))?;
            docs.insert(id, serde_json::from_slice(&value)?);
        }
        Ok(docs)
    }

    fn load_keys(&self, keys: &[DocId]) -> Result<BTreeMap<DocId, Document>, StoreError> {
        let mut docs = BTreeMap::new();
        for key in keys {
            if let Some(doc) = self.load(key)? {
                docs.insert(key.clone(), doc);
            }
        }
        Ok(docs)
    }

    fn resolve_view(&self, source: ViewSource<'_>) -> Result<View, CubeError> {
        match source {
            ViewSource::Inline(view) => Ok(view.clone()),
            ViewSource::Named(name) => self
                .views
                .read()
                .map_err(|_| CubeError::Internal("view registry lock poisoned".to_string()))?
                .get(name)
                .cloned()
                .ok_or_else(|| CubeError::NotFound(format!("view '{}' not found", name))),
        }
    }
}

fn doc_key(doc: &Document) -> Result<DocId, CubeError> {
    doc.id()
        .map(str::to_string)
        .ok_or_else(|| CubeError::InvalidArgs("document is missing _id".to_string()))
}

impl DocumentIndex for SledIndex {
    fn get(&self, doc_id: &str) -> Result<Document, CubeError> {
        self.load(doc_id)?
            .ok_or_else(|| CubeError::doc_not_found(doc_id))
    }

    fn put(&self, doc: Document) -> Result<(), CubeError> {
        let id = doc_key(&doc)?;
        let json = serde_json::to_vec(&doc)?;
        self.docs.insert(id.as_bytes(), json).map_err(StoreError::from)?;
        Ok(())
    }

    fn delete(&self, doc: &Document) -> Result<(), CubeError> {
        let id = doc_key(doc)?;
        self.docs.remove(id.as_bytes()).map_err(StoreError::from)?;
        Ok(())
    }

    fn list_all(&self, options: &AllDocsOptions) -> Result<Vec<AllDocsRow>, CubeError> {
        let docs = match &options.keys {
            Some(keys) => self.load_keys(keys)?,
            None => self.load_all()?,
        };
        list_rows(&docs, options)
    }

    fn find(&self, query: &FindQuery) -> Result<Vec<Document>, CubeError> {
        Ok(query.run(self.load_all()?.into_values()))
    }

    fn query(&self, source: ViewSource<'_>, options: &QueryOptions) -> Result<ViewResult, CubeError> {
        let view = self.resolve_view(source)?;
        Ok(run_view(&view, self.load_all()?.into_values(), options))
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

#[cfg(test)]
mod tests {
    use super::*;
    use libcubesat_core::{Operation, OperationLog, Projector, Reduce, Value};
    use tempfile::tempdir;

    fn indexed(id: &str, team: &str) -> Document {
        Document::new().with("team", team).with_identity(id, "1-0011223344556677")
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let index = SledIndex::open(dir.path()).unwrap();

        index.put(indexed("a", "Mushroom")).unwrap();
        let doc = index.get("a").unwrap();
        assert_eq!(doc.get("team"), Some(&Value::from("Mushroom")));

        index.delete(&doc).unwrap();
        assert!(matches!(index.get("a"), Err(CubeError::NotFound(_))));
    }

    #[test]
    fn test_documents_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let index = SledIndex::open(dir.path()).unwrap();
            index.put(indexed("a", "Mushroom")).unwrap();
            index.flush().unwrap();
        }
        let index = SledIndex::open(dir.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("a").unwrap().id(), Some("a"));
    }

    #[test]
    fn test_listing_in_id_order() {
        let dir = tempdir().unwrap();
        let index = SledIndex::open(dir.path()).unwrap();
        for id in ["c", "a", "b"] {
            index.put(indexed(id, "Koopa")).unwrap();
        }

        let rows = index.list_all(&AllDocsOptions::default()).unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let keyed = index
            .list_all(&AllDocsOptions::keys(vec!["b".into(), "missing".into()]).without_docs())
            .unwrap();
        assert_eq!(keyed.len(), 1);
        assert!(keyed[0].doc.is_none());
    }

    #[test]
    fn test_find_and_query() {
        let dir = tempdir().unwrap();
        let index = SledIndex::open(dir.path()).unwrap();
        index.put(indexed("mario", "Mushroom")).unwrap();
        index.put(indexed("luigi", "Mushroom")).unwrap();
        index.put(indexed("bowser", "Koopa")).unwrap();

        let query = FindQuery::from_json(&serde_json::json!({"team": "Mushroom"})).unwrap();
        assert_eq!(index.find(&query).unwrap().len(), 2);

        let by_team = View::new(|doc, emit| {
            if let Some(team) = doc.get("team") {
                emit.emit(team.clone(), 1i64);
            }
        })
        .with_reduce(Reduce::Sum);
        index.register_view("teams", by_team).unwrap();
        let result = index
            .query(ViewSource::Named("teams"), &QueryOptions::default())
            .unwrap();
        assert_eq!(result.total_rows, 3);
        assert_eq!(result.rows[0].value, Value::Integer(3));
    }

    #[test]
    fn test_sync_from_replay() {
        let dir = tempdir().unwrap();
        let index = SledIndex::open(dir.path()).unwrap();

        let log = OperationLog::new([4u8; 16]);
        log.append(Operation::Put, "a", Some(Document::new().with("k", "v"))).unwrap();
        log.append(Operation::Put, "b", Some(Document::new().with("k", "v"))).unwrap();
        log.append(Operation::Del, "a", None).unwrap();

        let view = Projector::materialize_log(&log).unwrap();
        index.sync_from(&view).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.get("b").unwrap(), view.get("b").unwrap());
    }
}
