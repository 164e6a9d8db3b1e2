//! Search option types and their validation.
//!
//! A search is either textual (term set or exact phrase) or regex (match or
//! negated match), never both, and within each category exactly one subform
//! must be present. Anything else is rejected before any data is touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_handling::types::SearchError;
use crate::storage::types::RowId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextSearch {
    pub terms: Vec<String>,
    pub excluded_terms: Vec<String>,
    pub exact_phrase: String,
}

impl TextSearch {
    pub fn is_zero(&self) -> bool {
        self.terms.is_empty() && self.excluded_terms.is_empty() && self.exact_phrase.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegexSearch {
    pub pattern: String,
    pub not_pattern: String,
}

impl RegexSearch {
    pub fn is_zero(&self) -> bool {
        self.pattern.is_empty() && self.not_pattern.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    pub text_search: TextSearch,
    pub regex_search: RegexSearch,
    /// Cap on returned connection ids
    pub limit: Option<u64>,
}

impl SearchOptions {
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.text_search.is_zero() == self.regex_search.is_zero() {
            return Err(SearchError::InvalidOptions(
                "specify either 'text_search' or 'regex_search'".to_string(),
            ));
        }
        if !self.text_search.is_zero() {
            if self.text_search.terms.is_empty() == self.text_search.exact_phrase.is_empty() {
                return Err(SearchError::InvalidOptions(
                    "specify either 'terms' or 'exact_phrase'".to_string(),
                ));
            }
            if self.text_search.terms.is_empty() && !self.text_search.excluded_terms.is_empty() {
                return Err(SearchError::InvalidOptions(
                    "'excluded_terms' must be specified only with 'terms'".to_string(),
                ));
            }
        }
        if !self.regex_search.is_zero()
            && self.regex_search.pattern.is_empty() == self.regex_search.not_pattern.is_empty()
        {
            return Err(SearchError::InvalidOptions(
                "specify either 'pattern' or 'not_pattern'".to_string(),
            ));
        }
        Ok(())
    }
}

/// A completed search, cached with its result set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformedSearch {
    pub id: RowId,
    pub options: SearchOptions,
    pub connection_ids: Vec<RowId>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}
