//! Service registry: descriptive `port → {name, color, notes}` mappings.
//!
//! Services drive UI grouping and statistics labels; nothing in the
//! pipeline depends on them. Deletion is a tombstone because the document
//! store deliberately has no delete operation.

use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error_handling::types::StorageError;
use crate::notifications::NotificationBus;
use crate::storage::types::{collections, FindQuery};
use crate::storage::DocumentStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub port: u16,
    pub name: String,
    pub color: String,
    pub notes: String,
}

impl Default for Service {
    fn default() -> Self {
        Self {
            port: 0,
            name: String::new(),
            color: "#dddddd".to_string(),
            notes: String::new(),
        }
    }
}

pub struct ServicesController {
    store: Arc<dyn DocumentStore>,
    notifications: NotificationBus,
}

impl ServicesController {
    pub fn new(store: Arc<dyn DocumentStore>, notifications: NotificationBus) -> Self {
        Self {
            store,
            notifications,
        }
    }

    pub fn get_services(&self) -> Result<Vec<Service>, StorageError> {
        let docs = self.store.find(collections::SERVICES, &FindQuery::default())?;
        Ok(docs
            .iter()
            .filter(|doc| doc.body.get("deleted") != Some(&json!(true)))
            .filter_map(|doc| doc.parse::<Service>().ok())
            .collect())
    }

    pub fn get_service(&self, port: u16) -> Result<Option<Service>, StorageError> {
        Ok(self.get_services()?.into_iter().find(|s| s.port == port))
    }

    /// Create or replace the descriptor for a port.
    pub fn set_service(&self, service: Service) -> Result<(), StorageError> {
        let id = service.port.to_string();
        let mut body = serde_json::to_value(&service)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("deleted".to_string(), json!(false));
        }
        if !self.store.update(collections::SERVICES, &id, body.clone())? {
            self.store.insert(collections::SERVICES, &id, body)?;
        }
        info!("service {} set to '{}'", service.port, service.name);
        self.notifications
            .publish("services.edit", json!({"port": service.port}));
        Ok(())
    }

    /// Remove the descriptor; the port reverts to unnamed.
    pub fn delete_service(&self, port: u16) -> Result<bool, StorageError> {
        let removed =
            self.store
                .update(collections::SERVICES, &port.to_string(), json!({"deleted": true}))?;
        if removed {
            self.notifications
                .publish("services.edit", json!({"port": port}));
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn controller() -> ServicesController {
        ServicesController::new(Arc::new(MemoryStorage::new()), NotificationBus::new())
    }

    #[test]
    fn test_set_get_update_delete_cycle() {
        let controller = controller();
        controller
            .set_service(Service {
                port: 1337,
                name: "leet".to_string(),
                ..Default::default()
            })
            .unwrap();
        controller
            .set_service(Service {
                port: 80,
                name: "web".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(controller.get_services().unwrap().len(), 2);

        // in-place rename
        controller
            .set_service(Service {
                port: 1337,
                name: "pwnable".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            controller.get_service(1337).unwrap().unwrap().name,
            "pwnable"
        );

        assert!(controller.delete_service(1337).unwrap());
        assert!(controller.get_service(1337).unwrap().is_none());
        assert_eq!(controller.get_services().unwrap().len(), 1);

        // deleting the unknown is not an error
        assert!(!controller.delete_service(9999).unwrap());

        // a deleted port can be redefined
        controller
            .set_service(Service {
                port: 1337,
                name: "back".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert!(controller.get_service(1337).unwrap().is_some());
    }
}
