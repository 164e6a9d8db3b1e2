//! Rule CRUD with a compile gate and snapshot publication.
//!
//! Every mutation recompiles the whole rule set before anything is stored:
//! a rule that breaks compilation is rejected and the published index stays
//! untouched. Successful compiles bump the version and swap the new
//! snapshot in; workers scanning against the previous snapshot finish
//! unaffected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use log::info;
use serde_json::json;
use uuid::Uuid;

use crate::error_handling::types::{RuleError, StorageError};
use crate::notifications::NotificationBus;
use crate::rules::pattern_index::PatternIndex;
use crate::rules::types::Rule;
use crate::storage::types::{collections, FindQuery};
use crate::storage::DocumentStore;

pub struct RulesManager {
    store: Arc<dyn DocumentStore>,
    notifications: NotificationBus,
    rules: Mutex<Vec<Rule>>,
    index: Arc<ArcSwap<PatternIndex>>,
    version: AtomicU64,
}

impl RulesManager {
    /// Load persisted rules and compile the initial index. A broken stored
    /// rule aborts startup; rules are the operator's primary configuration
    /// and silently dropping one would corrupt match results.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        notifications: NotificationBus,
    ) -> Result<Self, RuleError> {
        let rules = Self::load_rules(store.as_ref()).unwrap_or_default();
        let index = PatternIndex::compile(rules.clone(), 1)?;
        info!("loaded {} rules, compiled index v1", rules.len());
        Ok(Self {
            store,
            notifications,
            rules: Mutex::new(rules),
            index: Arc::new(ArcSwap::from_pointee(index)),
            version: AtomicU64::new(1),
        })
    }

    fn load_rules(store: &dyn DocumentStore) -> Result<Vec<Rule>, StorageError> {
        let docs = store.find(collections::RULES, &FindQuery::default())?;
        Ok(docs
            .iter()
            .filter_map(|doc| doc.parse::<Rule>().ok())
            .collect())
    }

    /// Shared handle the pipeline workers load snapshots from.
    pub fn index_handle(&self) -> Arc<ArcSwap<PatternIndex>> {
        self.index.clone()
    }

    /// Current compiled snapshot.
    pub fn index(&self) -> Arc<PatternIndex> {
        self.index.load_full()
    }

    pub fn get_rules(&self) -> Vec<Rule> {
        self.rules.lock().unwrap().clone()
    }

    pub fn get_rule(&self, id: Uuid) -> Option<Rule> {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|rule| rule.id == id)
            .cloned()
    }

    /// Validate, compile and publish a new rule. Returns the assigned id.
    pub fn add_rule(&self, mut rule: Rule) -> Result<Uuid, RuleError> {
        let mut rules = self.rules.lock().unwrap();
        if rules.iter().any(|existing| existing.name == rule.name) {
            return Err(RuleError::DuplicateName(rule.name));
        }
        if rule.id.is_nil() {
            rule.id = Uuid::new_v4();
        }
        let id = rule.id;

        let mut candidate = rules.clone();
        candidate.push(rule.clone());
        self.publish(candidate.clone())?;

        if let Ok(body) = serde_json::to_value(&rule) {
            let _ = self.store.insert(collections::RULES, &id.to_string(), body);
        }
        *rules = candidate;
        info!("rule '{}' added ({})", rule.name, id);
        self.notifications.publish("rules.new", json!({"id": id}));
        Ok(id)
    }

    /// Replace a rule in place, keeping its id. Same compile gate as
    /// `add_rule`; old connections keep the matches computed under prior
    /// versions.
    pub fn update_rule(&self, id: Uuid, mut rule: Rule) -> Result<bool, RuleError> {
        let mut rules = self.rules.lock().unwrap();
        let position = match rules.iter().position(|existing| existing.id == id) {
            Some(position) => position,
            None => return Ok(false),
        };
        if rules
            .iter()
            .any(|existing| existing.id != id && existing.name == rule.name)
        {
            return Err(RuleError::DuplicateName(rule.name));
        }
        rule.id = id;
        rule.created_at = rules[position].created_at;

        let mut candidate = rules.clone();
        candidate[position] = rule.clone();
        self.publish(candidate.clone())?;

        if let Ok(body) = serde_json::to_value(&rule) {
            let _ = self.store.update(collections::RULES, &id.to_string(), body);
        }
        *rules = candidate;
        info!("rule '{}' updated ({})", rule.name, id);
        self.notifications.publish("rules.edit", json!({"id": id}));
        Ok(true)
    }

    fn publish(&self, rules: Vec<Rule>) -> Result<(), RuleError> {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let compiled = PatternIndex::compile(rules, version)?;
        self.index.store(Arc::new(compiled));
        Ok(())
    }
}
