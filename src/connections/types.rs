use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::flow::types::{CloseReason, Endpoint, FlowKey};
use crate::storage::types::RowId;

/// A finalized TCP conversation.
///
/// Written to the store exactly once, when the flow closes; afterwards only
/// the user flags (`hidden`, `marked`, `comment`) may change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: RowId,
    pub client: Endpoint,
    pub server: Endpoint,
    pub started_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub client_messages: u64,
    pub server_messages: u64,
    pub matched_rules: Vec<Uuid>,
    pub hidden: bool,
    pub marked: bool,
    pub comment: String,
    /// Server port; keys into the service registry
    pub service_port: u16,
    pub close_reason: CloseReason,
    /// Import sessions whose packets contributed to this connection
    pub processed_by: Vec<RowId>,
    /// Rule-set version the matches were computed under
    pub rule_set_version: u64,
}

impl Connection {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.client, self.server)
    }

    pub fn duration_ms(&self) -> u64 {
        self.closed_at
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.client_bytes + self.server_bytes
    }
}

/// One stored message: a maximal run of same-direction bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub connection_id: RowId,
    pub index: u64,
    pub from_client: bool,
    pub timestamp: DateTime<Utc>,
    /// Payload bytes, base64-encoded for JSON storage
    pub payload: String,
}

impl StoredMessage {
    pub fn new(
        connection_id: RowId,
        index: u64,
        from_client: bool,
        timestamp: DateTime<Utc>,
        payload: &[u8],
    ) -> Self {
        Self {
            connection_id,
            index,
            from_client,
            timestamp,
            payload: BASE64.encode(payload),
        }
    }

    /// Document id; sorts messages of a connection by index.
    pub fn doc_id(&self) -> String {
        format!("{}-{:06}", self.connection_id, self.index)
    }

    pub fn payload_bytes(&self) -> Vec<u8> {
        BASE64.decode(&self.payload).unwrap_or_default()
    }
}

/// Query filter for connection listings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionsFilter {
    pub service_port: Option<u16>,
    pub matched_rule: Option<Uuid>,
    pub hidden: Option<bool>,
    pub marked: Option<bool>,
    /// Only connections with id at or after this one
    pub from: Option<RowId>,
    /// Only connections with id up to this one
    pub to: Option<RowId>,
    pub limit: Option<u64>,
}

/// Rendering of message payloads for queries and downloads.
///
/// `Printable` is query-only: raw bytes with non-printable characters
/// escaped as `\xNN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageFormat {
    #[default]
    Printable,
    Raw,
    Hex,
    Base64,
    Json,
}

impl MessageFormat {
    pub fn render(&self, payload: &[u8]) -> String {
        match self {
            MessageFormat::Printable => escape_non_printable(payload),
            MessageFormat::Raw => String::from_utf8_lossy(payload).into_owned(),
            MessageFormat::Hex => payload.iter().map(|byte| format!("{:02x}", byte)).collect(),
            MessageFormat::Base64 => BASE64.encode(payload),
            MessageFormat::Json => serde_json::to_string(&escape_non_printable(payload))
                .unwrap_or_else(|_| "\"\"".to_string()),
        }
    }
}

/// Keep graphic ASCII plus common whitespace; escape the rest as `\xNN`.
pub fn escape_non_printable(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len());
    for &byte in payload {
        match byte {
            b'\n' | b'\r' | b'\t' | 0x20..=0x7e => out.push(byte as char),
            _ => out.push_str(&format!("\\x{:02x}", byte)),
        }
    }
    out
}
