//! Turns reassembled segments into connections, messages and rule matches.
//!
//! The builder owns the open-connection table of one pipeline worker. Bytes
//! append to per-side buffers and to the current message, which breaks on
//! every direction flip; pattern scanning runs incrementally on append with
//! an overlap window so matches spanning segment boundaries are found.
//! Rule decisions happen once, at finalization, against the rule-set
//! snapshot current at that moment, and the finished record is persisted
//! exactly once.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::{error, info, trace};
use serde_json::json;
use uuid::Uuid;

use crate::connections::types::{Connection, StoredMessage};
use crate::flow::types::{CloseReason, FlowKey, Segment, Side};
use crate::notifications::NotificationBus;
use crate::rules::pattern_index::PatternIndex;
use crate::rules::types::PatternOrigin;
use crate::statistics::StatisticsController;
use crate::storage::types::{collections, RowId};
use crate::storage::DocumentStore;

struct PendingMessage {
    side: Side,
    timestamp: DateTime<Utc>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct SideData {
    buffer: Vec<u8>,
    scanned_to: usize,
    /// Distinct match start offsets per (rule, pattern)
    matches: HashMap<(Uuid, usize), BTreeSet<u64>>,
}

impl SideData {
    fn match_count(&self, rule_id: Uuid, pattern_index: usize) -> u64 {
        self.matches
            .get(&(rule_id, pattern_index))
            .map(|offsets| offsets.len() as u64)
            .unwrap_or(0)
    }
}

struct PendingConnection {
    id: RowId,
    started_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    low: SideData,
    high: SideData,
    messages: Vec<PendingMessage>,
    processed_by: Vec<RowId>,
}

impl PendingConnection {
    fn side(&mut self, side: Side) -> &mut SideData {
        match side {
            Side::Low => &mut self.low,
            Side::High => &mut self.high,
        }
    }

    fn side_ref(&self, side: Side) -> &SideData {
        match side {
            Side::Low => &self.low,
            Side::High => &self.high,
        }
    }
}

pub struct ConnectionBuilder {
    store: Arc<dyn DocumentStore>,
    index: Arc<ArcSwap<PatternIndex>>,
    notifications: NotificationBus,
    statistics: Arc<StatisticsController>,
    id_counter: Arc<AtomicU64>,
    pending: HashMap<FlowKey, PendingConnection>,
}

impl ConnectionBuilder {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<ArcSwap<PatternIndex>>,
        notifications: NotificationBus,
        statistics: Arc<StatisticsController>,
        id_counter: Arc<AtomicU64>,
    ) -> Self {
        Self {
            store,
            index,
            notifications,
            statistics,
            id_counter,
            pending: HashMap::new(),
        }
    }

    pub fn open_connections(&self) -> usize {
        self.pending.len()
    }

    /// Append one reassembled segment to its connection, creating the
    /// connection on first contact. `session` attributes the bytes to the
    /// import session that carried them; flush-driven segments have none.
    pub fn on_segment(&mut self, segment: &Segment, session: Option<RowId>) {
        let counter = &self.id_counter;
        let pending = self
            .pending
            .entry(segment.flow_key)
            .or_insert_with(|| PendingConnection {
                id: RowId::new(
                    segment.timestamp.timestamp_millis().max(0) as u64,
                    counter.fetch_add(1, Ordering::Relaxed),
                ),
                started_at: segment.timestamp,
                last_activity: segment.timestamp,
                low: SideData::default(),
                high: SideData::default(),
                messages: Vec::new(),
                processed_by: Vec::new(),
            });
        pending.last_activity = segment.timestamp;
        if let Some(session) = session {
            if !pending.processed_by.contains(&session) {
                pending.processed_by.push(session);
            }
        }
        if segment.bytes.is_empty() {
            return;
        }

        // message boundary on direction flip; same-side bytes coalesce
        match pending.messages.last_mut() {
            Some(last) if last.side == segment.side => {
                last.payload.extend_from_slice(&segment.bytes)
            }
            _ => pending.messages.push(PendingMessage {
                side: segment.side,
                timestamp: segment.timestamp,
                payload: segment.bytes.clone(),
            }),
        }

        let index = self.index.load();
        let side = pending.side(segment.side);
        side.buffer.extend_from_slice(&segment.bytes);
        // rescan a trailing window so cross-segment matches surface; the
        // offset sets deduplicate whatever the window sees twice
        let start = side.scanned_to.saturating_sub(index.overlap_hint());
        for hit in index.scan(segment.from_client, &side.buffer[start..], start as u64) {
            side.matches
                .entry((hit.rule_id, hit.pattern_index))
                .or_default()
                .insert(hit.offset);
        }
        side.scanned_to = side.buffer.len();
    }

    /// Close the connection for `flow_key`: evaluate rules, persist the
    /// record and its messages, update statistics, publish the event.
    ///
    /// Returns the finalized record, or `None` when no connection was open
    /// for the flow.
    pub fn on_finalize(
        &mut self,
        flow_key: FlowKey,
        reason: CloseReason,
        client_side: Side,
        timestamp: DateTime<Utc>,
    ) -> Option<Connection> {
        let pending = self.pending.remove(&flow_key)?;
        let index = self.index.load_full();

        let client_bytes = pending.side_ref(client_side).buffer.len() as u64;
        let server_bytes = pending.side_ref(client_side.opposite()).buffer.len() as u64;
        let client_messages = pending
            .messages
            .iter()
            .filter(|message| message.side == client_side)
            .count() as u64;
        let server_messages = pending.messages.len() as u64 - client_messages;

        let closed_at = if timestamp > pending.last_activity {
            timestamp
        } else {
            pending.last_activity
        };
        let duration_ms = closed_at
            .signed_duration_since(pending.started_at)
            .num_milliseconds()
            .max(0) as u64;

        let matched_rules = evaluate_rules(
            &index,
            &pending,
            client_side,
            client_bytes,
            server_bytes,
            duration_ms,
            flow_key.endpoint(client_side.opposite()).port,
        );

        let connection = Connection {
            id: pending.id,
            client: flow_key.endpoint(client_side),
            server: flow_key.endpoint(client_side.opposite()),
            started_at: pending.started_at,
            closed_at,
            client_bytes,
            server_bytes,
            client_messages,
            server_messages,
            matched_rules,
            hidden: false,
            marked: false,
            comment: String::new(),
            service_port: flow_key.endpoint(client_side.opposite()).port,
            close_reason: reason,
            processed_by: pending.processed_by.clone(),
            rule_set_version: index.version(),
        };

        self.persist(&connection, &pending, client_side);
        info!(
            "connection {} finalized ({:?}): {} client / {} server bytes, {} messages, {} rules",
            connection.id,
            reason,
            client_bytes,
            server_bytes,
            pending.messages.len(),
            connection.matched_rules.len()
        );
        Some(connection)
    }

    fn persist(&self, connection: &Connection, pending: &PendingConnection, client_side: Side) {
        let body = match serde_json::to_value(connection) {
            Ok(body) => body,
            Err(err) => {
                error!("connection {} serialization failed: {}", connection.id, err);
                return;
            }
        };
        if let Err(err) =
            self.store
                .insert(collections::CONNECTIONS, &connection.id.to_hex(), body)
        {
            error!("connection {} persist failed: {}", connection.id, err);
            return;
        }
        for (message_index, message) in pending.messages.iter().enumerate() {
            let stored = StoredMessage::new(
                connection.id,
                message_index as u64,
                message.side == client_side,
                message.timestamp,
                &message.payload,
            );
            match serde_json::to_value(&stored) {
                Ok(body) => {
                    if let Err(err) =
                        self.store.insert(collections::MESSAGES, &stored.doc_id(), body)
                    {
                        error!("message {} persist failed: {}", stored.doc_id(), err);
                    }
                }
                Err(err) => error!("message serialization failed: {}", err),
            }
        }
        self.statistics.register_connection(connection);
        self.notifications.publish(
            "connections.new",
            json!({
                "id": connection.id.to_hex(),
                "service_port": connection.service_port,
                "matched_rules": connection.matched_rules,
            }),
        );
        trace!("connection {} persisted", connection.id);
    }
}

fn evaluate_rules(
    index: &PatternIndex,
    pending: &PendingConnection,
    client_side: Side,
    client_bytes: u64,
    server_bytes: u64,
    duration_ms: u64,
    server_port: u16,
) -> Vec<Uuid> {
    let mut matched = Vec::new();
    for rule in index.rules().iter().filter(|rule| rule.enabled) {
        let measured_bytes = match rule.filter.direction {
            PatternOrigin::Client => client_bytes,
            PatternOrigin::Server => server_bytes,
            PatternOrigin::Both => client_bytes + server_bytes,
        };
        if rule
            .filter
            .min_bytes
            .is_some_and(|min| measured_bytes < min)
            || rule.filter.max_bytes.is_some_and(|max| measured_bytes > max)
        {
            continue;
        }
        if rule
            .filter
            .min_duration_ms
            .is_some_and(|min| duration_ms < min)
            || rule
                .filter
                .max_duration_ms
                .is_some_and(|max| duration_ms > max)
        {
            continue;
        }
        if !rule.filter.services.is_empty() && !rule.filter.services.contains(&server_port) {
            continue;
        }
        let all_patterns_hold = rule.patterns.iter().enumerate().all(|(pattern_index, pattern)| {
            // scans already discarded matches from excluded origins, so the
            // per-side counts can simply be summed
            let count = pending.side_ref(client_side).match_count(rule.id, pattern_index)
                + pending
                    .side_ref(client_side.opposite())
                    .match_count(rule.id, pattern_index);
            pattern.occurrences_in_bounds(count)
        });
        if all_patterns_hold {
            matched.push(rule.id);
        }
    }
    matched
}
