//! Document store interface.
//!
//! The core persists finalized connections, messages, sessions, rules,
//! services and statistics through this trait and nothing else; any backend
//! able to insert, query and patch JSON documents by `(collection, id)` can
//! stand in. Temporal ordering comes from the time-prefixed [`RowId`]
//! layout rather than from backend-specific clocks.
//!
//! [`RowId`]: crate::storage::types::RowId

use crate::error_handling::types::StorageError;
use crate::storage::types::{Document, FindQuery};
use serde_json::Value;

pub trait DocumentStore: Send + Sync {
    /// Insert a new document. Fails if `(collection, id)` already exists.
    fn insert(&self, collection: &str, id: &str, body: Value) -> Result<(), StorageError>;

    /// Return documents matching the query, honoring filter, id bounds,
    /// sort, skip and limit.
    fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>, StorageError>;

    /// Shallow-merge `patch`'s top-level fields into an existing document.
    /// Returns false when the document does not exist.
    fn update(&self, collection: &str, id: &str, patch: Value) -> Result<bool, StorageError>;

    /// Fetch a single document by id.
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StorageError> {
        Ok(self.find(collection, &FindQuery::by_id(id))?.into_iter().next())
    }
}
