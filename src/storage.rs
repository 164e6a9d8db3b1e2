pub mod database_storage;
pub mod db_entities;
pub mod memory_storage;
pub mod storage_trait;
pub mod types;

pub use database_storage::DatabaseStorage;
pub use memory_storage::MemoryStorage;
pub use storage_trait::DocumentStore;
pub use types::{collections, Document, FindQuery, RowId};
