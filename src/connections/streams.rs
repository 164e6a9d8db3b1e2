//! Message retrieval and export formatting for one connection.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::connections::types::{MessageFormat, StoredMessage};
use crate::error_handling::types::StorageError;
use crate::storage::types::{collections, FindQuery, RowId};
use crate::storage::DocumentStore;

/// One message rendered for a query response.
#[derive(Debug, Clone, Serialize)]
pub struct MessageView {
    pub index: u64,
    pub from_client: bool,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub content: String,
}

pub struct StreamsController {
    store: Arc<dyn DocumentStore>,
}

impl StreamsController {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    fn load_messages(&self, connection_id: RowId) -> Result<Vec<StoredMessage>, StorageError> {
        let docs = self.store.find(
            collections::MESSAGES,
            &FindQuery::default().with_eq("connection_id", json!(connection_id.to_hex())),
        )?;
        let mut messages: Vec<StoredMessage> = docs
            .iter()
            .filter_map(|doc| doc.parse::<StoredMessage>().ok())
            .collect();
        messages.sort_by_key(|message| message.index);
        Ok(messages)
    }

    fn connection_exists(&self, connection_id: RowId) -> Result<bool, StorageError> {
        Ok(self
            .store
            .get(collections::CONNECTIONS, &connection_id.to_hex())?
            .is_some())
    }

    /// Messages of a connection rendered in `format`, in emission order.
    /// Returns `None` when the connection does not exist.
    pub fn get_messages(
        &self,
        connection_id: RowId,
        format: MessageFormat,
    ) -> Result<Option<Vec<MessageView>>, StorageError> {
        if !self.connection_exists(connection_id)? {
            return Ok(None);
        }
        let views = self
            .load_messages(connection_id)?
            .iter()
            .map(|message| MessageView {
                index: message.index,
                from_client: message.from_client,
                timestamp: message.timestamp,
                content: format.render(&message.payload_bytes()),
            })
            .collect();
        Ok(Some(views))
    }

    /// All message payloads of a connection as one downloadable blob.
    ///
    /// `Raw` concatenates the bytes untouched; `Hex` and `Base64` encode the
    /// concatenation; `Json` produces an array of per-message objects.
    pub fn download_messages(
        &self,
        connection_id: RowId,
        format: MessageFormat,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        if !self.connection_exists(connection_id)? {
            return Ok(None);
        }
        let messages = self.load_messages(connection_id)?;
        let blob = match format {
            MessageFormat::Json => {
                let entries: Vec<serde_json::Value> = messages
                    .iter()
                    .map(|message| {
                        json!({
                            "index": message.index,
                            "from_client": message.from_client,
                            "timestamp": message.timestamp,
                            "payload": message.payload,
                        })
                    })
                    .collect();
                serde_json::to_vec(&entries)?
            }
            _ => {
                let mut all = Vec::new();
                for message in &messages {
                    all.extend_from_slice(&message.payload_bytes());
                }
                match format {
                    MessageFormat::Raw => all,
                    _ => format.render(&all).into_bytes(),
                }
            }
        };
        Ok(Some(blob))
    }
}
