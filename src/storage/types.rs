//! Types shared by document store backends.
//!
//! Documents are schemaless JSON bodies addressed by `(collection, id)`.
//! Ids are [`RowId`]s: 48 bits of unix milliseconds followed by 48 bits of
//! counter, rendered as 24 hex characters, so lexicographic id order is
//! temporal order.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Well-known collection names used by the core.
pub mod collections {
    pub const CONNECTIONS: &str = "connections";
    pub const MESSAGES: &str = "messages";
    pub const RULES: &str = "rules";
    pub const SERVICES: &str = "services";
    pub const SESSIONS: &str = "import_sessions";
    pub const STATISTICS: &str = "statistics";
    pub const SEARCHES: &str = "searches";
}

const LOW_48: u64 = (1 << 48) - 1;

static ROW_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Monotonic 96-bit document id: unix-millis prefix plus counter suffix.
///
/// Ids generated within one process are strictly increasing; ids sort
/// temporally by construction, with the counter breaking ties inside the
/// same millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId {
    millis: u64,
    counter: u64,
}

impl RowId {
    pub fn new(millis: u64, counter: u64) -> Self {
        Self {
            millis: millis & LOW_48,
            counter: counter & LOW_48,
        }
    }

    /// Generate an id from the current wall clock and the process-wide
    /// counter.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let counter = ROW_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self::new(millis, counter)
    }

    /// Build an id whose time prefix is `at` with a zero counter; useful as a
    /// range bound for temporal queries.
    pub fn time_bound(at: DateTime<Utc>) -> Self {
        Self::new(at.timestamp_millis().max(0) as u64, 0)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis as i64)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn to_hex(&self) -> String {
        format!("{:012x}{:012x}", self.millis, self.counter)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 24 {
            return None;
        }
        let millis = u64::from_str_radix(&hex[..12], 16).ok()?;
        let counter = u64::from_str_radix(&hex[12..], 16).ok()?;
        Some(Self { millis, counter })
    }
}

impl std::fmt::Display for RowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for RowId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RowId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        RowId::from_hex(&hex).ok_or_else(|| D::Error::custom("malformed row id"))
    }
}

/// A stored document: its id plus the JSON body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub body: Value,
}

impl Document {
    /// Deserialize the body into a typed record.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.body.clone())
    }
}

/// Query shape understood by every store backend.
///
/// `filter` matches top-level body fields for equality; id bounds express
/// temporal ranges thanks to the time-prefixed id layout. Default order is
/// ascending by id.
#[derive(Debug, Clone, Default)]
pub struct FindQuery {
    pub filter: Map<String, Value>,
    pub min_id: Option<String>,
    pub max_id: Option<String>,
    pub sort_field: Option<String>,
    pub sort_desc: bool,
    pub skip: u64,
    pub limit: Option<u64>,
}

impl FindQuery {
    pub fn by_id(id: &str) -> Self {
        Self {
            min_id: Some(id.to_string()),
            max_id: Some(id.to_string()),
            limit: Some(1),
            ..Default::default()
        }
    }

    pub fn with_eq(mut self, field: &str, value: Value) -> Self {
        self.filter.insert(field.to_string(), value);
        self
    }
}

/// Whether `body` satisfies the equality filter.
pub(crate) fn matches_filter(body: &Value, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, expected)| body.get(field) == Some(expected))
}

/// Order documents according to the query's sort settings.
pub(crate) fn sort_documents(docs: &mut [Document], query: &FindQuery) {
    match &query.sort_field {
        None => docs.sort_by(|a, b| a.id.cmp(&b.id)),
        Some(field) => docs.sort_by(|a, b| {
            let av = a.body.get(field);
            let bv = b.body.get(field);
            compare_values(av, bv).then_with(|| a.id.cmp(&b.id))
        }),
    }
    if query.sort_desc {
        docs.reverse();
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

/// Apply id bounds, filter, sort, skip and limit to a raw document list.
pub(crate) fn apply_query(mut docs: Vec<Document>, query: &FindQuery) -> Vec<Document> {
    docs.retain(|doc| {
        if let Some(min) = &query.min_id {
            if doc.id.as_str() < min.as_str() {
                return false;
            }
        }
        if let Some(max) = &query.max_id {
            if doc.id.as_str() > max.as_str() {
                return false;
            }
        }
        matches_filter(&doc.body, &query.filter)
    });
    sort_documents(&mut docs, query);
    let skip = query.skip as usize;
    if skip > 0 {
        docs.drain(..skip.min(docs.len()));
    }
    if let Some(limit) = query.limit {
        docs.truncate(limit as usize);
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_id_ordering_and_hex() {
        let a = RowId::new(1000, 1);
        let b = RowId::new(1000, 2);
        let c = RowId::new(2000, 0);
        assert!(a < b && b < c);
        assert_eq!(a.to_hex().len(), 24);
        assert_eq!(RowId::from_hex(&a.to_hex()), Some(a));
        // hex order follows id order
        assert!(a.to_hex() < b.to_hex() && b.to_hex() < c.to_hex());
    }

    #[test]
    fn test_row_id_masks_to_48_bits() {
        let id = RowId::new(u64::MAX, u64::MAX);
        assert_eq!(id.to_hex(), "ffffffffffffffffffffffff");
        assert_eq!(RowId::from_hex("zz"), None);
    }

    #[test]
    fn test_generate_is_monotonic() {
        let a = RowId::generate();
        let b = RowId::generate();
        assert!(a < b);
    }

    #[test]
    fn test_apply_query_filters_sorts_and_pages() {
        let docs: Vec<Document> = (0..5)
            .map(|i| Document {
                id: format!("{:024x}", i),
                body: json!({"port": if i % 2 == 0 { 80 } else { 443 }, "n": i}),
            })
            .collect();

        let query = FindQuery::default().with_eq("port", json!(80));
        let hits = apply_query(docs.clone(), &query);
        assert_eq!(hits.len(), 3);

        let query = FindQuery {
            sort_field: Some("n".to_string()),
            sort_desc: true,
            skip: 1,
            limit: Some(2),
            ..Default::default()
        };
        let page = apply_query(docs, &query);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].body["n"], json!(3));
        assert_eq!(page[1].body["n"], json!(2));
    }
}
