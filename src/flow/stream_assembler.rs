//! Per-flow TCP reassembly.
//!
//! Each side of a flow keeps the next expected sequence number and a buffer
//! of out-of-order segments. In-order bytes are emitted immediately and
//! drain whatever buffered data they make contiguous; retransmissions are
//! dropped (whole or partially, emitting only the unseen tail); gaps larger
//! than `max_gap_bytes` are skipped so a lossy capture cannot pin memory.
//!
//! Sequence arithmetic is wrapping. Offsets reported on emitted segments
//! are per-side stream offsets and strictly increase, which downstream
//! pattern scanning relies on.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, trace, warn};

use crate::flow::types::{CloseReason, FlowKey, Segment, SegmentFlags, Side, TcpPacket};

/// Out-of-order segments farther than this ahead of the expected sequence
/// number are treated as corrupt and dropped.
const MAX_SEQ_LOOKAHEAD: i64 = 1 << 30;

#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Buffered out-of-order bytes per side before the gap is skipped
    pub max_gap_bytes: usize,
    /// Emitted bytes per flow before it is force-finalized
    pub max_flow_bytes: usize,
    /// Open flows before the oldest idle one is evicted
    pub max_flows: usize,
    /// Quiet time after which `tick` finalizes a flow
    pub idle_timeout: Duration,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            max_gap_bytes: 4 * 1024 * 1024,
            max_flow_bytes: 64 * 1024 * 1024,
            max_flows: 65536,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Output of pushing one packet (or ticking the flow table).
#[derive(Debug)]
pub enum AssemblerEvent {
    Segment(Segment),
    /// An unfillable gap was dropped on one side of a flow
    GapSkipped { flow_key: FlowKey, bytes: u64 },
    /// The flow is done; the builder must finalize its connection
    Closed {
        flow_key: FlowKey,
        reason: CloseReason,
        client_side: Side,
        timestamp: DateTime<Utc>,
    },
}

struct BufferedSegment {
    bytes: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct SideState {
    /// Next expected sequence number; set by SYN or first observed data
    expected_seq: Option<u32>,
    /// Reference point for buffered-segment offsets
    base_seq: u32,
    /// Out-of-order data keyed by offset relative to `base_seq`
    buffered: BTreeMap<u32, BufferedSegment>,
    buffered_bytes: usize,
    /// Absolute per-side stream offset of the next emitted byte
    emitted: u64,
    syn_seq: Option<u32>,
    fin_seen: bool,
    first_seen: Option<DateTime<Utc>>,
}

impl SideState {
    fn rel(&self, seq: u32) -> u32 {
        seq.wrapping_sub(self.base_seq)
    }
}

struct FlowState {
    key: FlowKey,
    low: SideState,
    high: SideState,
    client_side: Side,
    /// Set when the client was identified by an initial SYN
    client_from_syn: bool,
    first_packet_at: DateTime<Utc>,
    first_packet_port: u16,
    any_emitted: bool,
    last_activity: DateTime<Utc>,
}

impl FlowState {
    fn new(key: FlowKey, packet: &TcpPacket, side: Side) -> Self {
        let client_side = if packet.syn && packet.ack {
            // mid-capture SYN-ACK: the sender is the server
            side.opposite()
        } else {
            side
        };
        Self {
            key,
            low: SideState::default(),
            high: SideState::default(),
            client_side,
            client_from_syn: packet.syn && !packet.ack,
            first_packet_at: packet.timestamp,
            first_packet_port: packet.src.port,
            any_emitted: false,
            last_activity: packet.timestamp,
        }
    }

    fn side(&mut self, side: Side) -> &mut SideState {
        match side {
            Side::Low => &mut self.low,
            Side::High => &mut self.high,
        }
    }

    fn side_ref(&self, side: Side) -> &SideState {
        match side {
            Side::Low => &self.low,
            Side::High => &self.high,
        }
    }

    fn total_emitted(&self) -> u64 {
        self.low.emitted + self.high.emitted
    }
}

/// Reassembles the TCP flows of one pipeline worker.
pub struct StreamAssembler {
    config: AssemblerConfig,
    flows: HashMap<FlowKey, FlowState>,
    /// Flows finalized for oversize; ignored until the next SYN
    cooldown: HashMap<FlowKey, DateTime<Utc>>,
}

impl StreamAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self {
            config,
            flows: HashMap::new(),
            cooldown: HashMap::new(),
        }
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Feed one packet; returns segments that became contiguous plus any
    /// lifecycle events.
    pub fn push(&mut self, packet: &TcpPacket) -> Vec<AssemblerEvent> {
        let (key, side) = packet.flow();
        let mut events = Vec::new();

        if self.cooldown.contains_key(&key) {
            if packet.syn && !packet.ack {
                self.cooldown.remove(&key);
            } else {
                return events;
            }
        }

        // A fresh SYN on an established flow finalizes the old connection
        // and starts a new one; a retransmitted SYN is ignored.
        if packet.syn && !packet.ack {
            if let Some(flow) = self.flows.get(&key) {
                let retransmission = flow.side_ref(side).syn_seq == Some(packet.seq);
                if !retransmission {
                    self.close_flow(&key, CloseReason::NewSyn, packet.timestamp, &mut events);
                }
            }
        }

        if !self.flows.contains_key(&key) && self.flows.len() >= self.config.max_flows {
            self.evict_oldest_idle(&mut events);
        }

        let flow = self
            .flows
            .entry(key)
            .or_insert_with(|| FlowState::new(key, packet, side));
        flow.last_activity = packet.timestamp;

        // Mid-stream client re-resolution: an opposite-side packet sharing
        // the first packet's timestamp wins the client role on a smaller
        // source port. Only possible before anything was emitted.
        if !flow.client_from_syn
            && !flow.any_emitted
            && side != flow.client_side
            && flow.side_ref(side).first_seen.is_none()
            && packet.timestamp == flow.first_packet_at
            && packet.src.port < flow.first_packet_port
        {
            flow.client_side = side;
        }

        let mut data_seq = packet.seq;
        if packet.syn {
            let isn = packet.seq;
            data_seq = isn.wrapping_add(1);
            flow.client_from_syn = true;
            flow.client_side = if packet.ack { side.opposite() } else { side };
            if flow.side_ref(side).syn_seq != Some(isn) {
                let from_client = side == flow.client_side;
                let state = flow.side(side);
                state.syn_seq = Some(isn);
                state.expected_seq = Some(data_seq);
                state.base_seq = data_seq;
                let offset = state.emitted;
                // zero-length segment so the connection record exists from
                // the handshake even when no payload ever flows
                events.push(AssemblerEvent::Segment(Segment {
                    flow_key: key,
                    side,
                    from_client,
                    offset,
                    bytes: Vec::new(),
                    timestamp: packet.timestamp,
                    flags: SegmentFlags {
                        syn: true,
                        fin: false,
                        rst: false,
                    },
                }));
            }
        }

        if flow.side_ref(side).first_seen.is_none() {
            flow.side(side).first_seen = Some(packet.timestamp);
        }
        let from_client = side == flow.client_side;

        if !packet.payload.is_empty() {
            self.push_payload(key, side, from_client, data_seq, packet, &mut events);
        }

        if packet.rst {
            let flow = self.flows.get_mut(&key).expect("flow exists");
            flow.side(side).fin_seen = true;
            self.close_flow(&key, CloseReason::Reset, packet.timestamp, &mut events);
            return events;
        }

        if packet.fin {
            let flow = self.flows.get_mut(&key).expect("flow exists");
            flow.side(side).fin_seen = true;
            if flow.low.fin_seen && flow.high.fin_seen {
                self.close_flow(&key, CloseReason::Fin, packet.timestamp, &mut events);
                return events;
            }
        }

        if let Some(flow) = self.flows.get(&key) {
            if flow.total_emitted() >= self.config.max_flow_bytes as u64 {
                debug!("flow {} exceeded byte limit, finalizing", key);
                self.close_flow(&key, CloseReason::Oversize, packet.timestamp, &mut events);
                self.cooldown.insert(key, packet.timestamp);
            }
        }

        events
    }

    fn push_payload(
        &mut self,
        key: FlowKey,
        side: Side,
        from_client: bool,
        seq: u32,
        packet: &TcpPacket,
        events: &mut Vec<AssemblerEvent>,
    ) {
        let flow = self.flows.get_mut(&key).expect("flow exists");
        let state = flow.side(side);
        let payload = &packet.payload;

        let expected = match state.expected_seq {
            Some(expected) => expected,
            None => {
                // mid-stream capture: accept the stream from here
                state.expected_seq = Some(seq);
                state.base_seq = seq;
                seq
            }
        };

        let diff = seq.wrapping_sub(expected) as i32 as i64;
        if diff == 0 {
            Self::emit(state, key, side, from_client, payload.clone(), packet.timestamp, events);
            flow.any_emitted = true;
        } else if diff < 0 {
            let overlap = (-diff) as usize;
            if overlap >= payload.len() {
                // pure retransmission
                trace!("flow {} side {:?}: dropping retransmission", key, side);
            } else {
                Self::emit(
                    state,
                    key,
                    side,
                    from_client,
                    payload[overlap..].to_vec(),
                    packet.timestamp,
                    events,
                );
                flow.any_emitted = true;
            }
        } else if diff > MAX_SEQ_LOOKAHEAD {
            warn!("flow {} side {:?}: sequence jump too large, dropping", key, side);
        } else {
            let rel = state.rel(seq);
            let keep = match state.buffered.get(&rel) {
                Some(existing) => existing.bytes.len() < payload.len(),
                None => true,
            };
            if keep {
                if let Some(existing) = state.buffered.insert(
                    rel,
                    BufferedSegment {
                        bytes: payload.clone(),
                        timestamp: packet.timestamp,
                    },
                ) {
                    state.buffered_bytes -= existing.bytes.len();
                }
                state.buffered_bytes += payload.len();
            }

            if state.buffered_bytes > self.config.max_gap_bytes {
                let expected_rel = state.rel(expected);
                let first_rel = *state.buffered.keys().next().expect("buffer non-empty");
                let skipped = first_rel.wrapping_sub(expected_rel) as u64;
                debug!(
                    "flow {} side {:?}: skipping {}-byte gap under buffer pressure",
                    key, side, skipped
                );
                state.emitted += skipped;
                state.expected_seq = Some(state.base_seq.wrapping_add(first_rel));
                events.push(AssemblerEvent::GapSkipped {
                    flow_key: key,
                    bytes: skipped,
                });
                Self::drain_contiguous(state, key, side, from_client, events);
                flow.any_emitted = true;
            }
        }

        let state = flow.side(side);
        Self::drain_contiguous(state, key, side, from_client, events);
    }

    /// Emit an in-order chunk and advance the expected sequence number.
    fn emit(
        state: &mut SideState,
        key: FlowKey,
        side: Side,
        from_client: bool,
        bytes: Vec<u8>,
        timestamp: DateTime<Utc>,
        events: &mut Vec<AssemblerEvent>,
    ) {
        if bytes.is_empty() {
            return;
        }
        let len = bytes.len();
        events.push(AssemblerEvent::Segment(Segment {
            flow_key: key,
            side,
            from_client,
            offset: state.emitted,
            bytes,
            timestamp,
            flags: SegmentFlags::default(),
        }));
        state.emitted += len as u64;
        state.expected_seq = Some(
            state
                .expected_seq
                .expect("expected set before emit")
                .wrapping_add(len as u32),
        );
    }

    /// Emit buffered segments that the current expected sequence number
    /// makes contiguous, trimming already-seen prefixes.
    fn drain_contiguous(
        state: &mut SideState,
        key: FlowKey,
        side: Side,
        from_client: bool,
        events: &mut Vec<AssemblerEvent>,
    ) {
        loop {
            let expected = match state.expected_seq {
                Some(expected) => expected,
                None => return,
            };
            let expected_rel = state.rel(expected);
            let (&rel, _) = match state.buffered.first_key_value() {
                Some(entry) => entry,
                None => return,
            };
            if rel > expected_rel {
                return;
            }
            let buffered = state.buffered.remove(&rel).expect("entry exists");
            state.buffered_bytes -= buffered.bytes.len();
            let overlap = (expected_rel - rel) as usize;
            if overlap >= buffered.bytes.len() {
                continue; // fully stale
            }
            Self::emit(
                state,
                key,
                side,
                from_client,
                buffered.bytes[overlap..].to_vec(),
                buffered.timestamp,
                events,
            );
        }
    }

    /// Emit everything still buffered for `flow_key` regardless of gaps and
    /// release the flow, reporting `reason` to the builder.
    fn close_flow(
        &mut self,
        flow_key: &FlowKey,
        reason: CloseReason,
        timestamp: DateTime<Utc>,
        events: &mut Vec<AssemblerEvent>,
    ) {
        let mut flow = match self.flows.remove(flow_key) {
            Some(flow) => flow,
            None => return,
        };
        let client_side = flow.client_side;
        for side in [Side::Low, Side::High] {
            let from_client = side == client_side;
            let state = flow.side(side);
            Self::drain_contiguous(state, *flow_key, side, from_client, events);
            // remaining buffers sit past gaps; emit them in offset order,
            // jumping the stream offset over each hole
            let leftovers: Vec<(u32, BufferedSegment)> =
                std::mem::take(&mut state.buffered).into_iter().collect();
            for (rel, buffered) in leftovers {
                if state.expected_seq.is_none() {
                    state.expected_seq = Some(state.base_seq.wrapping_add(rel));
                }
                let expected_rel = state.rel(state.expected_seq.unwrap());
                if rel > expected_rel {
                    state.emitted += (rel - expected_rel) as u64;
                    state.expected_seq = Some(state.base_seq.wrapping_add(rel));
                }
                let expected_rel = state.rel(state.expected_seq.unwrap());
                let overlap = (expected_rel - rel) as usize;
                if overlap >= buffered.bytes.len() {
                    continue;
                }
                Self::emit(
                    state,
                    *flow_key,
                    side,
                    from_client,
                    buffered.bytes[overlap..].to_vec(),
                    buffered.timestamp,
                    events,
                );
            }
            state.buffered_bytes = 0;
        }
        trace!("flow {} closed: {:?}", flow_key, reason);
        events.push(AssemblerEvent::Closed {
            flow_key: *flow_key,
            reason,
            client_side,
            timestamp,
        });
    }

    /// Force-finalize one flow (timeout or session end).
    pub fn flush(&mut self, flow_key: &FlowKey, reason: CloseReason) -> Vec<AssemblerEvent> {
        let mut events = Vec::new();
        let timestamp = self
            .flows
            .get(flow_key)
            .map(|flow| flow.last_activity)
            .unwrap_or_else(Utc::now);
        self.close_flow(flow_key, reason, timestamp, &mut events);
        events
    }

    /// Force-finalize every open flow; used at session end and on cancel.
    pub fn flush_all(&mut self, reason: CloseReason) -> Vec<AssemblerEvent> {
        let keys: Vec<FlowKey> = self.flows.keys().copied().collect();
        let mut events = Vec::new();
        for key in keys {
            let timestamp = self.flows[&key].last_activity;
            self.close_flow(&key, reason, timestamp, &mut events);
        }
        self.cooldown.clear();
        events
    }

    /// Finalize flows quiet for longer than the idle timeout.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<AssemblerEvent> {
        let idle = chrono::Duration::from_std(self.config.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| now.signed_duration_since(flow.last_activity) >= idle)
            .map(|(key, _)| *key)
            .collect();
        let mut events = Vec::new();
        for key in expired {
            let timestamp = self.flows[&key].last_activity;
            self.close_flow(&key, CloseReason::IdleTimeout, timestamp, &mut events);
        }
        self.cooldown
            .retain(|_, since| now.signed_duration_since(*since) < idle);
        events
    }

    fn evict_oldest_idle(&mut self, events: &mut Vec<AssemblerEvent>) {
        if let Some((key, timestamp)) = self
            .flows
            .iter()
            .min_by_key(|(_, flow)| flow.last_activity)
            .map(|(key, flow)| (*key, flow.last_activity))
        {
            warn!("flow table full, evicting {}", key);
            self.close_flow(&key, CloseReason::Evicted, timestamp, events);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::Endpoint;
    use chrono::TimeZone;

    fn client() -> Endpoint {
        Endpoint::new("10.0.0.1".parse().unwrap(), 40000)
    }

    fn server() -> Endpoint {
        Endpoint::new("10.0.0.2".parse().unwrap(), 80)
    }

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn packet(src: Endpoint, dst: Endpoint, seq: u32, payload: &[u8], ms: i64) -> TcpPacket {
        TcpPacket {
            src,
            dst,
            seq,
            syn: false,
            ack: true,
            fin: false,
            rst: false,
            payload: payload.to_vec(),
            timestamp: at(ms),
        }
    }

    fn syn(src: Endpoint, dst: Endpoint, seq: u32, ms: i64) -> TcpPacket {
        TcpPacket {
            syn: true,
            ack: false,
            ..packet(src, dst, seq, b"", ms)
        }
    }

    fn fin(src: Endpoint, dst: Endpoint, seq: u32, ms: i64) -> TcpPacket {
        TcpPacket {
            fin: true,
            ..packet(src, dst, seq, b"", ms)
        }
    }

    fn collect_bytes(events: &[AssemblerEvent], want_client: bool) -> Vec<u8> {
        events
            .iter()
            .filter_map(|event| match event {
                AssemblerEvent::Segment(segment) if segment.from_client == want_client => {
                    Some(segment.bytes.clone())
                }
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn assembler() -> StreamAssembler {
        StreamAssembler::new(AssemblerConfig::default())
    }

    #[test]
    fn test_in_order_stream_emits_directly() {
        let mut asm = assembler();
        asm.push(&syn(client(), server(), 1000, 0));
        let events = asm.push(&packet(client(), server(), 1001, b"hello ", 1));
        assert_eq!(collect_bytes(&events, true), b"hello ");
        let events = asm.push(&packet(client(), server(), 1007, b"world", 2));
        assert_eq!(collect_bytes(&events, true), b"world");
    }

    #[test]
    fn test_out_of_order_segments_reassemble() {
        // retransmitted SYN then data [100,200), [0,100), [200,300)
        let mut asm = assembler();
        asm.push(&syn(client(), server(), 0, 0));
        asm.push(&syn(client(), server(), 0, 1)); // retransmitted SYN

        let chunk: Vec<u8> = (0u32..300).map(|i| (i % 251) as u8).collect();
        let mut all = Vec::new();
        let events = asm.push(&packet(client(), server(), 101, &chunk[100..200], 2));
        all.extend(collect_bytes(&events, true));
        let events = asm.push(&packet(client(), server(), 1, &chunk[0..100], 3));
        all.extend(collect_bytes(&events, true));
        let events = asm.push(&packet(client(), server(), 201, &chunk[200..300], 4));
        all.extend(collect_bytes(&events, true));

        assert_eq!(all, chunk);
    }

    #[test]
    fn test_pure_retransmission_dropped_and_partial_overlap_trimmed() {
        let mut asm = assembler();
        asm.push(&syn(client(), server(), 0, 0));
        let events = asm.push(&packet(client(), server(), 1, b"abcdef", 1));
        assert_eq!(collect_bytes(&events, true), b"abcdef");

        // identical bytes again: nothing new
        let events = asm.push(&packet(client(), server(), 1, b"abcdef", 2));
        assert!(collect_bytes(&events, true).is_empty());

        // overlap by 3, two new bytes
        let events = asm.push(&packet(client(), server(), 4, b"defgh", 3));
        assert_eq!(collect_bytes(&events, true), b"gh");
    }

    #[test]
    fn test_mid_stream_capture_accepts_from_first_seen() {
        let mut asm = assembler();
        let events = asm.push(&packet(client(), server(), 5000, b"data", 0));
        let segments = collect_bytes(&events, true);
        assert_eq!(segments, b"data");
    }

    #[test]
    fn test_gap_skip_under_buffer_pressure() {
        let mut asm = StreamAssembler::new(AssemblerConfig {
            max_gap_bytes: 8,
            ..Default::default()
        });
        asm.push(&syn(client(), server(), 0, 0));
        asm.push(&packet(client(), server(), 1, b"ab", 1));
        // bytes [100..110) buffered far ahead; exceeds the 8-byte allowance
        let events = asm.push(&packet(client(), server(), 101, b"0123456789", 2));
        let skipped = events
            .iter()
            .any(|event| matches!(event, AssemblerEvent::GapSkipped { bytes, .. } if *bytes == 98));
        assert!(skipped);
        assert_eq!(collect_bytes(&events, true), b"0123456789");

        // offsets jump over the hole
        let offsets: Vec<u64> = events
            .iter()
            .filter_map(|event| match event {
                AssemblerEvent::Segment(segment) => Some(segment.offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![100]);
    }

    #[test]
    fn test_fin_on_both_sides_closes_flow() {
        let mut asm = assembler();
        asm.push(&syn(client(), server(), 0, 0));
        asm.push(&packet(client(), server(), 1, b"ping", 1));
        asm.push(&packet(server(), client(), 9000, b"pong", 2));
        let events = asm.push(&fin(client(), server(), 5, 3));
        assert!(!events
            .iter()
            .any(|event| matches!(event, AssemblerEvent::Closed { .. })));
        let events = asm.push(&fin(server(), client(), 9004, 4));
        match events.last() {
            Some(AssemblerEvent::Closed { reason, .. }) => {
                assert_eq!(*reason, CloseReason::Fin)
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(asm.flow_count(), 0);
    }

    #[test]
    fn test_rst_closes_immediately() {
        let mut asm = assembler();
        asm.push(&syn(client(), server(), 0, 0));
        asm.push(&packet(client(), server(), 1, b"x", 1));
        let events = asm.push(&TcpPacket {
            rst: true,
            ..packet(server(), client(), 1, b"", 2)
        });
        assert!(matches!(
            events.last(),
            Some(AssemblerEvent::Closed {
                reason: CloseReason::Reset,
                ..
            })
        ));
    }

    #[test]
    fn test_idle_tick_flushes_quiet_flows() {
        let mut asm = StreamAssembler::new(AssemblerConfig {
            idle_timeout: Duration::from_secs(10),
            ..Default::default()
        });
        asm.push(&syn(client(), server(), 0, 0));
        asm.push(&packet(client(), server(), 1, b"x", 1));

        assert!(asm.tick(at(5_000)).is_empty());
        let events = asm.tick(at(20_000));
        assert!(matches!(
            events.last(),
            Some(AssemblerEvent::Closed {
                reason: CloseReason::IdleTimeout,
                ..
            })
        ));
        assert_eq!(asm.flow_count(), 0);
    }

    #[test]
    fn test_flush_emits_buffered_bytes_past_gaps() {
        let mut asm = assembler();
        asm.push(&syn(client(), server(), 0, 0));
        asm.push(&packet(client(), server(), 1, b"head", 1));
        // [10..14) stays buffered behind a hole at [5..10)
        asm.push(&packet(client(), server(), 10, b"tail", 2));

        let (key, _) = packet(client(), server(), 0, b"", 0).flow();
        let events = asm.flush(&key, CloseReason::SessionEnd);
        assert_eq!(collect_bytes(&events, true), b"tail");
        assert!(matches!(
            events.last(),
            Some(AssemblerEvent::Closed {
                reason: CloseReason::SessionEnd,
                ..
            })
        ));
    }

    #[test]
    fn test_syn_identifies_client_even_from_server_port_order() {
        let mut asm = assembler();
        // server speaks first in the capture via SYN-ACK
        let events = asm.push(&TcpPacket {
            syn: true,
            ack: true,
            ..packet(server(), client(), 0, b"", 0)
        });
        match events.first() {
            Some(AssemblerEvent::Segment(segment)) => assert!(!segment.from_client),
            other => panic!("expected handshake segment, got {:?}", other),
        }
        let events = asm.push(&packet(client(), server(), 1, b"req", 1));
        assert_eq!(collect_bytes(&events, true), b"req");
    }

    #[test]
    fn test_new_syn_finalizes_open_connection() {
        let mut asm = assembler();
        asm.push(&syn(client(), server(), 0, 0));
        asm.push(&packet(client(), server(), 1, b"first", 1));

        let events = asm.push(&syn(client(), server(), 77777, 2));
        assert!(matches!(
            events.first(),
            Some(AssemblerEvent::Closed {
                reason: CloseReason::NewSyn,
                ..
            })
        ));
        // the new flow is live
        let events = asm.push(&packet(client(), server(), 77778, b"second", 3));
        assert_eq!(collect_bytes(&events, true), b"second");
    }

    #[test]
    fn test_oversize_flow_finalized_until_next_syn() {
        let mut asm = StreamAssembler::new(AssemblerConfig {
            max_flow_bytes: 4,
            ..Default::default()
        });
        asm.push(&syn(client(), server(), 0, 0));
        let events = asm.push(&packet(client(), server(), 1, b"123456", 1));
        assert!(matches!(
            events.last(),
            Some(AssemblerEvent::Closed {
                reason: CloseReason::Oversize,
                ..
            })
        ));

        // non-SYN traffic on the same key is ignored during cooldown
        let events = asm.push(&packet(client(), server(), 7, b"ignored", 2));
        assert!(events.is_empty());

        // the next SYN starts a fresh flow
        let events = asm.push(&syn(client(), server(), 500, 3));
        assert!(!events.is_empty());
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut asm = assembler();
        let isn = u32::MAX - 2;
        asm.push(&syn(client(), server(), isn, 0));
        // first data byte sits at isn+1 = u32::MAX - 1
        let events = asm.push(&packet(client(), server(), isn.wrapping_add(1), b"abcd", 1));
        assert_eq!(collect_bytes(&events, true), b"abcd");
        // continues past the wrap point
        let events = asm.push(&packet(client(), server(), isn.wrapping_add(5), b"efgh", 2));
        assert_eq!(collect_bytes(&events, true), b"efgh");
    }

    #[test]
    fn test_flow_table_eviction() {
        let mut asm = StreamAssembler::new(AssemblerConfig {
            max_flows: 2,
            ..Default::default()
        });
        for i in 0..3u16 {
            let src = Endpoint::new("10.0.0.1".parse().unwrap(), 1000 + i);
            asm.push(&syn(src, server(), 0, i as i64));
        }
        assert_eq!(asm.flow_count(), 2);
    }
}
