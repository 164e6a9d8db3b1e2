use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde_json::Value;

use crate::error_handling::types::StorageError;
use crate::storage::storage_trait::DocumentStore;
use crate::storage::types::{apply_query, Document, FindQuery};

/// In-memory document store.
///
/// Used by tests and by ephemeral runs that do not need persistence across
/// restarts. Per-collection `BTreeMap`s keep documents in id order, matching
/// the temporal order of the SQLite backend.
#[derive(Default)]
pub struct MemoryStorage {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for MemoryStorage {
    fn insert(&self, collection: &str, id: &str, body: Value) -> Result<(), StorageError> {
        let mut collections = self.collections.lock().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StorageError::WriteFailed(format!(
                "duplicate id {} in {}",
                id, collection
            )));
        }
        docs.insert(id.to_string(), body);
        Ok(())
    }

    fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>, StorageError> {
        let collections = self.collections.lock().unwrap();
        let docs = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, body)| Document {
                        id: id.clone(),
                        body: body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(apply_query(docs, query))
    }

    fn update(&self, collection: &str, id: &str, patch: Value) -> Result<bool, StorageError> {
        let mut collections = self.collections.lock().unwrap();
        let body = match collections.get_mut(collection).and_then(|docs| docs.get_mut(id)) {
            Some(body) => body,
            None => return Ok(false),
        };
        if let (Value::Object(target), Value::Object(fields)) = (body, patch) {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        Ok(true)
    }
}
