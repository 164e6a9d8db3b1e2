//! Connection queries and user-flag mutations.

use std::sync::Arc;

use log::debug;
use serde_json::json;

use crate::connections::types::{Connection, ConnectionsFilter};
use crate::error_handling::types::StorageError;
use crate::notifications::NotificationBus;
use crate::storage::types::{collections, FindQuery, RowId};
use crate::storage::DocumentStore;

pub struct ConnectionsController {
    store: Arc<dyn DocumentStore>,
    notifications: NotificationBus,
}

impl ConnectionsController {
    pub fn new(store: Arc<dyn DocumentStore>, notifications: NotificationBus) -> Self {
        Self {
            store,
            notifications,
        }
    }

    /// List connections, newest first.
    pub fn get_connections(
        &self,
        filter: &ConnectionsFilter,
    ) -> Result<Vec<Connection>, StorageError> {
        let mut query = FindQuery {
            sort_desc: true,
            limit: filter.limit.or(Some(200)),
            ..Default::default()
        };
        if let Some(port) = filter.service_port {
            query = query.with_eq("service_port", json!(port));
        }
        if let Some(hidden) = filter.hidden {
            query = query.with_eq("hidden", json!(hidden));
        }
        if let Some(marked) = filter.marked {
            query = query.with_eq("marked", json!(marked));
        }
        if let Some(from) = filter.from {
            query.min_id = Some(from.to_hex());
        }
        if let Some(to) = filter.to {
            query.max_id = Some(to.to_hex());
        }

        let docs = self.store.find(collections::CONNECTIONS, &query)?;
        let mut connections: Vec<Connection> = docs
            .iter()
            .filter_map(|doc| doc.parse::<Connection>().ok())
            .collect();
        if let Some(rule_id) = filter.matched_rule {
            connections.retain(|conn| conn.matched_rules.contains(&rule_id));
        }
        Ok(connections)
    }

    pub fn get_connection(&self, id: RowId) -> Result<Option<Connection>, StorageError> {
        Ok(self
            .store
            .get(collections::CONNECTIONS, &id.to_hex())?
            .and_then(|doc| doc.parse::<Connection>().ok()))
    }

    pub fn set_hidden(&self, id: RowId, hidden: bool) -> Result<bool, StorageError> {
        self.patch_flag(id, "hidden", json!(hidden), if hidden { "hide" } else { "show" })
    }

    pub fn set_marked(&self, id: RowId, marked: bool) -> Result<bool, StorageError> {
        self.patch_flag(id, "marked", json!(marked), if marked { "mark" } else { "unmark" })
    }

    pub fn set_comment(&self, id: RowId, comment: &str) -> Result<bool, StorageError> {
        self.patch_flag(id, "comment", json!(comment), "comment")
    }

    fn patch_flag(
        &self,
        id: RowId,
        field: &str,
        value: serde_json::Value,
        action: &str,
    ) -> Result<bool, StorageError> {
        let mut patch = serde_json::Map::new();
        patch.insert(field.to_string(), value);
        let updated = self.store.update(
            collections::CONNECTIONS,
            &id.to_hex(),
            serde_json::Value::Object(patch),
        )?;
        if updated {
            debug!("connection {}: {}", id, action);
            self.notifications.publish(
                "connections.action",
                json!({"connection_id": id.to_hex(), "action": action}),
            );
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::types::Connection;
    use crate::flow::types::{CloseReason, Endpoint};
    use crate::storage::MemoryStorage;
    use chrono::Utc;

    fn sample_connection(id: RowId, port: u16) -> Connection {
        Connection {
            id,
            client: Endpoint::new("10.0.0.1".parse().unwrap(), 50000),
            server: Endpoint::new("10.0.0.2".parse().unwrap(), port),
            started_at: Utc::now(),
            closed_at: Utc::now(),
            client_bytes: 1,
            server_bytes: 1,
            client_messages: 1,
            server_messages: 1,
            matched_rules: vec![],
            hidden: false,
            marked: false,
            comment: String::new(),
            service_port: port,
            close_reason: CloseReason::Fin,
            processed_by: vec![],
            rule_set_version: 1,
        }
    }

    fn controller_with(connections: &[Connection]) -> ConnectionsController {
        let store = Arc::new(MemoryStorage::new());
        for conn in connections {
            store
                .insert(
                    collections::CONNECTIONS,
                    &conn.id.to_hex(),
                    serde_json::to_value(conn).unwrap(),
                )
                .unwrap();
        }
        ConnectionsController::new(store, NotificationBus::new())
    }

    #[test]
    fn test_get_connections_filters_by_port_newest_first() {
        let controller = controller_with(&[
            sample_connection(RowId::new(1000, 0), 80),
            sample_connection(RowId::new(2000, 0), 443),
            sample_connection(RowId::new(3000, 0), 80),
        ]);
        let all = controller
            .get_connections(&ConnectionsFilter::default())
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, RowId::new(3000, 0));

        let http = controller
            .get_connections(&ConnectionsFilter {
                service_port: Some(80),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(http.len(), 2);
    }

    #[test]
    fn test_flag_mutations_persist() {
        let id = RowId::new(1000, 0);
        let controller = controller_with(&[sample_connection(id, 80)]);

        assert!(controller.set_marked(id, true).unwrap());
        assert!(controller.set_comment(id, "suspicious").unwrap());
        assert!(controller.set_hidden(id, true).unwrap());

        let conn = controller.get_connection(id).unwrap().unwrap();
        assert!(conn.marked && conn.hidden);
        assert_eq!(conn.comment, "suspicious");

        assert!(!controller.set_marked(RowId::new(9, 9), true).unwrap());
    }
}
