//! Full-text and regex search over finalized connections.
//!
//! A search walks the stored messages grouped per connection and evaluates
//! the (validated) options against each connection's combined payloads.
//! Results are cached as `performed_searches` documents so the UI can
//! revisit them without re-running the scan.

use std::collections::HashMap;
use std::time::Instant;

use log::info;
use regex::bytes::RegexBuilder;
use std::sync::Arc;

use crate::connections::types::StoredMessage;
use crate::error_handling::types::SearchError;
use crate::search::types::{PerformedSearch, SearchOptions};
use crate::storage::types::{collections, FindQuery, RowId};
use crate::storage::DocumentStore;

const SEARCH_HISTORY_LIMIT: u64 = 50;
const DEFAULT_RESULT_LIMIT: u64 = 200;

pub struct SearchController {
    store: Arc<dyn DocumentStore>,
}

impl SearchController {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Run a search and cache its result set.
    pub fn perform_search(&self, options: SearchOptions) -> Result<PerformedSearch, SearchError> {
        options.validate()?;
        let started = Instant::now();
        let started_at = chrono::Utc::now();

        let matcher = Matcher::compile(&options)?;
        let limit = options.limit.unwrap_or(DEFAULT_RESULT_LIMIT);

        // group payloads per connection, in message order
        let docs = self
            .store
            .find(collections::MESSAGES, &FindQuery::default())?;
        let mut payload_per_connection: HashMap<RowId, Vec<u8>> = HashMap::new();
        for doc in &docs {
            if let Ok(message) = doc.parse::<StoredMessage>() {
                payload_per_connection
                    .entry(message.connection_id)
                    .or_default()
                    .extend_from_slice(&message.payload_bytes());
            }
        }

        let mut connection_ids: Vec<RowId> = payload_per_connection
            .iter()
            .filter(|(_, payload)| matcher.matches(payload))
            .map(|(id, _)| *id)
            .collect();
        connection_ids.sort();
        connection_ids.truncate(limit as usize);

        let performed = PerformedSearch {
            id: RowId::generate(),
            options,
            connection_ids,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let body = serde_json::to_value(&performed)
            .map_err(crate::error_handling::types::StorageError::from)?;
        self.store
            .insert(collections::SEARCHES, &performed.id.to_hex(), body)?;
        info!(
            "search {} matched {} connections in {} ms",
            performed.id,
            performed.connection_ids.len(),
            performed.duration_ms
        );
        Ok(performed)
    }

    /// Past searches, newest first.
    pub fn get_performed_searches(&self) -> Result<Vec<PerformedSearch>, SearchError> {
        let query = FindQuery {
            sort_desc: true,
            limit: Some(SEARCH_HISTORY_LIMIT),
            ..Default::default()
        };
        Ok(self
            .store
            .find(collections::SEARCHES, &query)?
            .iter()
            .filter_map(|doc| doc.parse::<PerformedSearch>().ok())
            .collect())
    }
}

/// Compiled form of one search's predicates.
enum Matcher {
    Text {
        terms: Vec<String>,
        excluded: Vec<String>,
    },
    Phrase(String),
    Regex(regex::bytes::Regex),
    NotRegex(regex::bytes::Regex),
}

impl Matcher {
    fn compile(options: &SearchOptions) -> Result<Self, SearchError> {
        if !options.text_search.is_zero() {
            if !options.text_search.exact_phrase.is_empty() {
                return Ok(Matcher::Phrase(
                    options.text_search.exact_phrase.to_lowercase(),
                ));
            }
            return Ok(Matcher::Text {
                terms: lowered(&options.text_search.terms),
                excluded: lowered(&options.text_search.excluded_terms),
            });
        }
        let (expression, negated) = if !options.regex_search.pattern.is_empty() {
            (&options.regex_search.pattern, false)
        } else {
            (&options.regex_search.not_pattern, true)
        };
        let regex = RegexBuilder::new(expression)
            .unicode(false)
            .build()
            .map_err(|err| SearchError::InvalidOptions(err.to_string()))?;
        Ok(if negated {
            Matcher::NotRegex(regex)
        } else {
            Matcher::Regex(regex)
        })
    }

    fn matches(&self, payload: &[u8]) -> bool {
        match self {
            Matcher::Phrase(phrase) => {
                String::from_utf8_lossy(payload).to_lowercase().contains(phrase)
            }
            Matcher::Text { terms, excluded } => {
                let haystack = String::from_utf8_lossy(payload).to_lowercase();
                terms.iter().all(|term| haystack.contains(term))
                    && !excluded.iter().any(|term| haystack.contains(term))
            }
            Matcher::Regex(regex) => regex.is_match(payload),
            Matcher::NotRegex(regex) => !regex.is_match(payload),
        }
    }
}

fn lowered(terms: &[String]) -> Vec<String> {
    terms.iter().map(|term| term.to_lowercase()).collect()
}
