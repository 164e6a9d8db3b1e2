use std::path::Path;

use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, DbBackend,
    EntityTrait, QueryFilter, QueryOrder, Set, Statement,
};
use serde_json::Value;

use crate::error_handling::types::StorageError;
use crate::storage::db_entities as documents;
use crate::storage::storage_trait::DocumentStore;
use crate::storage::types::{apply_query, Document, FindQuery};

/// SQLite-backed document store.
///
/// Documents are rows in a single `documents` table with the body stored as
/// JSON text. Query shaping (filter, sort, pagination) happens in process
/// after the per-collection fetch; collections stay small enough for a CTF
/// workload that this keeps the backend trivially portable.
pub struct DatabaseStorage {
    rt: tokio::runtime::Runtime,
    conn: DatabaseConnection,
}

impl DatabaseStorage {
    pub fn new_file<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
        }
        // DSN understood by the sqlx driver; creates the file when missing
        let dsn = format!("sqlite://{}?mode=rwc", path_ref.to_string_lossy());
        let conn = rt.block_on(async {
            let conn = Database::connect(dsn)
                .await
                .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;
            conn.execute(Statement::from_string(
                DbBackend::Sqlite,
                r#"
                CREATE TABLE IF NOT EXISTS documents (
                    collection TEXT NOT NULL,
                    id TEXT NOT NULL,
                    json TEXT NOT NULL,
                    PRIMARY KEY (collection, id)
                );
            "#
                .to_string(),
            ))
            .await
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
            Ok::<_, StorageError>(conn)
        })?;
        Ok(Self { rt, conn })
    }

    fn fetch_collection(&self, collection: &str) -> Result<Vec<Document>, StorageError> {
        self.rt.block_on(async {
            let rows = documents::Entity::find()
                .filter(documents::Column::Collection.eq(collection))
                .order_by_asc(documents::Column::Id)
                .all(&self.conn)
                .await
                .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            rows.into_iter()
                .map(|row| {
                    let body: Value = serde_json::from_str(&row.json)?;
                    Ok(Document { id: row.id, body })
                })
                .collect()
        })
    }
}

impl DocumentStore for DatabaseStorage {
    fn insert(&self, collection: &str, id: &str, body: Value) -> Result<(), StorageError> {
        let json = serde_json::to_string(&body)?;
        self.rt.block_on(async {
            let model = documents::ActiveModel {
                collection: Set(collection.to_string()),
                id: Set(id.to_string()),
                json: Set(json),
            };
            // exec avoids fetching the inserted row back (no RETURNING on
            // older SQLite)
            documents::Entity::insert(model)
                .exec(&self.conn)
                .await
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
            Ok(())
        })
    }

    fn find(&self, collection: &str, query: &FindQuery) -> Result<Vec<Document>, StorageError> {
        Ok(apply_query(self.fetch_collection(collection)?, query))
    }

    fn update(&self, collection: &str, id: &str, patch: Value) -> Result<bool, StorageError> {
        self.rt.block_on(async {
            let existing = documents::Entity::find_by_id((collection.to_string(), id.to_string()))
                .one(&self.conn)
                .await
                .map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            let row = match existing {
                Some(row) => row,
                None => return Ok(false),
            };
            let mut body: Value = serde_json::from_str(&row.json)?;
            if let (Value::Object(target), Value::Object(fields)) = (&mut body, patch) {
                for (key, value) in fields {
                    target.insert(key, value);
                }
            }
            let mut model: documents::ActiveModel = row.into();
            model.json = Set(serde_json::to_string(&body)?);
            model
                .update(&self.conn)
                .await
                .map_err(|e| StorageError::WriteFailed(e.to_string()))?;
            Ok(true)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn temp_store() -> DatabaseStorage {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.sqlite3");
        // keep the TempDir alive for the test duration
        Box::leak(Box::new(dir));
        DatabaseStorage::new_file(path).unwrap()
    }

    #[test]
    fn test_insert_find_roundtrip() {
        let store = temp_store();
        store
            .insert("connections", "00a", json!({"port": 80, "marked": false}))
            .unwrap();
        store
            .insert("connections", "00b", json!({"port": 443, "marked": false}))
            .unwrap();

        let all = store.find("connections", &FindQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "00a");

        let filtered = store
            .find(
                "connections",
                &FindQuery::default().with_eq("port", json!(443)),
            )
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, "00b");

        // collections are isolated
        assert!(store.find("rules", &FindQuery::default()).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let store = temp_store();
        store.insert("rules", "001", json!({"name": "a"})).unwrap();
        assert!(store.insert("rules", "001", json!({"name": "b"})).is_err());
    }

    #[test]
    fn test_update_merges_top_level_fields() {
        let store = temp_store();
        store
            .insert("connections", "00a", json!({"port": 80, "marked": false}))
            .unwrap();
        let patched = store
            .update("connections", "00a", json!({"marked": true}))
            .unwrap();
        assert!(patched);

        let doc = store.get("connections", "00a").unwrap().unwrap();
        assert_eq!(doc.body["marked"], json!(true));
        assert_eq!(doc.body["port"], json!(80));

        assert!(!store
            .update("connections", "zzz", json!({"marked": true}))
            .unwrap());
    }
}
