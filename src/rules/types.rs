use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which side of a connection a pattern may match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatternOrigin {
    Client,
    Server,
    #[default]
    Both,
}

impl PatternOrigin {
    /// Whether bytes sent by the client (`from_client`) count for this
    /// origin.
    pub fn accepts(&self, from_client: bool) -> bool {
        match self {
            PatternOrigin::Client => from_client,
            PatternOrigin::Server => !from_client,
            PatternOrigin::Both => true,
        }
    }
}

/// One payload pattern inside a rule.
///
/// `regex` holds either a regular expression or, when `is_literal` is set,
/// raw bytes matched verbatim after escaping. A connection satisfies the
/// pattern when its occurrence count lands inside
/// `[min_occurrences, max_occurrences]`, counting only matches from sides
/// compatible with `origin`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pattern {
    pub regex: String,
    pub is_literal: bool,
    pub case_sensitive: bool,
    pub min_occurrences: u64,
    /// Unbounded when absent
    pub max_occurrences: Option<u64>,
    pub origin: PatternOrigin,
}

impl Default for Pattern {
    fn default() -> Self {
        Self {
            regex: String::new(),
            is_literal: false,
            case_sensitive: true,
            min_occurrences: 1,
            max_occurrences: None,
            origin: PatternOrigin::Both,
        }
    }
}

impl Pattern {
    pub fn occurrences_in_bounds(&self, count: u64) -> bool {
        count >= self.min_occurrences && self.max_occurrences.map_or(true, |max| count <= max)
    }
}

/// Connection-level constraints evaluated once the connection is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuleFilter {
    pub min_bytes: Option<u64>,
    pub max_bytes: Option<u64>,
    pub min_duration_ms: Option<u64>,
    pub max_duration_ms: Option<u64>,
    /// Allowed server ports; empty allows every service
    pub services: Vec<u16>,
    /// Restricts both the byte accounting and `Both`-origin patterns to one
    /// side when not `Both`
    pub direction: PatternOrigin,
}

/// A detection rule: a named set of patterns plus connection constraints.
///
/// Rules are never deleted; updates replace the stored document in place and
/// bump the compiled rule-set version. Connections keep the rule ids they
/// matched under the version current at their finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub notes: String,
    pub patterns: Vec<Pattern>,
    pub filter: RuleFilter,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Default for Rule {
    fn default() -> Self {
        Self {
            id: Uuid::nil(),
            name: String::new(),
            color: "#dddddd".to_string(),
            notes: String::new(),
            patterns: Vec::new(),
            filter: RuleFilter::default(),
            enabled: true,
            created_at: Utc::now(),
        }
    }
}
