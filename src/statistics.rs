//! Per-minute traffic rollups.
//!
//! Every finalized connection lands in a minute bucket keyed by a
//! zero-counter [`RowId`] so that bucket ids sort temporally like every
//! other collection. Counters are kept per service port plus one map of
//! matched-rule hits. Totals aggregate buckets server-side.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::connections::types::Connection;
use crate::error_handling::types::StorageError;
use crate::storage::types::{collections, FindQuery, RowId};
use crate::storage::DocumentStore;

const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StatisticsFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Restrict to these service ports; empty keeps all
    pub ports: Vec<u16>,
}

/// One minute bucket. Maps are keyed by decimal service port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticsBucket {
    pub minute: DateTime<Utc>,
    pub connections_per_service: serde_json::Map<String, serde_json::Value>,
    pub client_bytes_per_service: serde_json::Map<String, serde_json::Value>,
    pub server_bytes_per_service: serde_json::Map<String, serde_json::Value>,
    pub duration_ms_per_service: serde_json::Map<String, serde_json::Value>,
    pub matched_rules: serde_json::Map<String, serde_json::Value>,
}

pub struct StatisticsController {
    store: Arc<dyn DocumentStore>,
    // the store has no atomic increment; serialize read-modify-write cycles
    write_lock: Mutex<()>,
}

impl StatisticsController {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    fn bucket_id(at: DateTime<Utc>) -> RowId {
        let millis = at.timestamp_millis().max(0) as u64;
        RowId::new(millis - millis % MINUTE_MS, 0)
    }

    /// Fold one finalized connection into its minute bucket.
    pub fn register_connection(&self, connection: &Connection) {
        let _guard = self.write_lock.lock().unwrap();
        let id = Self::bucket_id(connection.closed_at);
        let mut bucket = match self.store.get(collections::STATISTICS, &id.to_hex()) {
            Ok(Some(doc)) => doc.parse::<StatisticsBucket>().unwrap_or_default(),
            Ok(None) => StatisticsBucket::default(),
            Err(err) => {
                warn!("statistics read failed: {}", err);
                return;
            }
        };
        bucket.minute = id.timestamp();

        let port = connection.service_port.to_string();
        bump(&mut bucket.connections_per_service, &port, 1);
        bump(
            &mut bucket.client_bytes_per_service,
            &port,
            connection.client_bytes,
        );
        bump(
            &mut bucket.server_bytes_per_service,
            &port,
            connection.server_bytes,
        );
        bump(
            &mut bucket.duration_ms_per_service,
            &port,
            connection.duration_ms(),
        );
        for rule_id in &connection.matched_rules {
            bump(&mut bucket.matched_rules, &rule_id.to_string(), 1);
        }

        let body = match serde_json::to_value(&bucket) {
            Ok(body) => body,
            Err(err) => {
                warn!("statistics serialization failed: {}", err);
                return;
            }
        };
        let result = match self.store.update(collections::STATISTICS, &id.to_hex(), body.clone()) {
            Ok(true) => Ok(()),
            Ok(false) => self.store.insert(collections::STATISTICS, &id.to_hex(), body),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!("statistics write failed: {}", err);
        }
    }

    /// Minute buckets inside the filter window, oldest first.
    pub fn get_statistics(
        &self,
        filter: &StatisticsFilter,
    ) -> Result<Vec<StatisticsBucket>, StorageError> {
        let query = FindQuery {
            min_id: filter.from.map(|at| Self::bucket_id(at).to_hex()),
            max_id: filter.to.map(|at| Self::bucket_id(at).to_hex()),
            ..Default::default()
        };
        let mut buckets: Vec<StatisticsBucket> = self
            .store
            .find(collections::STATISTICS, &query)?
            .iter()
            .filter_map(|doc| doc.parse::<StatisticsBucket>().ok())
            .collect();
        if !filter.ports.is_empty() {
            let keep: Vec<String> = filter.ports.iter().map(|port| port.to_string()).collect();
            for bucket in &mut buckets {
                for map in [
                    &mut bucket.connections_per_service,
                    &mut bucket.client_bytes_per_service,
                    &mut bucket.server_bytes_per_service,
                    &mut bucket.duration_ms_per_service,
                ] {
                    map.retain(|port, _| keep.contains(port));
                }
            }
        }
        Ok(buckets)
    }

    /// Aggregate the filtered buckets into one totals document.
    pub fn get_total_statistics(
        &self,
        filter: &StatisticsFilter,
    ) -> Result<serde_json::Value, StorageError> {
        let buckets = self.get_statistics(filter)?;
        let mut connections = serde_json::Map::new();
        let mut client_bytes = serde_json::Map::new();
        let mut server_bytes = serde_json::Map::new();
        let mut rules = serde_json::Map::new();
        for bucket in &buckets {
            merge_into(&mut connections, &bucket.connections_per_service);
            merge_into(&mut client_bytes, &bucket.client_bytes_per_service);
            merge_into(&mut server_bytes, &bucket.server_bytes_per_service);
            merge_into(&mut rules, &bucket.matched_rules);
        }
        Ok(json!({
            "buckets": buckets.len(),
            "connections_per_service": connections,
            "client_bytes_per_service": client_bytes,
            "server_bytes_per_service": server_bytes,
            "matched_rules": rules,
        }))
    }
}

fn bump(map: &mut serde_json::Map<String, serde_json::Value>, key: &str, amount: u64) {
    let current = map.get(key).and_then(|value| value.as_u64()).unwrap_or(0);
    map.insert(key.to_string(), json!(current + amount));
}

fn merge_into(
    target: &mut serde_json::Map<String, serde_json::Value>,
    source: &serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in source {
        bump(target, key, value.as_u64().unwrap_or(0));
    }
}
