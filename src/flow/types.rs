//! Flow identification primitives.
//!
//! A [`FlowKey`] canonicalizes the 4-tuple of a TCP conversation so both
//! directions map to the same key; a packet's [`Side`] says which canonical
//! endpoint sent it. Client/server attribution is a separate, later
//! resolution done by the assembler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// One end of a TCP conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Which canonical endpoint of a flow sent a packet: `Low` when the source
/// is the lexicographically smaller `(ip, port)` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Low,
    High,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Low => Side::High,
            Side::High => Side::Low,
        }
    }
}

/// Direction-agnostic identifier of a TCP conversation.
///
/// For any conversation exactly one key exists; both directions share it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    low: Endpoint,
    high: Endpoint,
}

impl FlowKey {
    pub fn new(a: Endpoint, b: Endpoint) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    /// Canonical key plus the side of `src`.
    pub fn from_endpoints(src: Endpoint, dst: Endpoint) -> (Self, Side) {
        let key = Self::new(src, dst);
        let side = if src == key.low { Side::Low } else { Side::High };
        (key, side)
    }

    pub fn endpoint(&self, side: Side) -> Endpoint {
        match side {
            Side::Low => self.low,
            Side::High => self.high,
        }
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

/// Parsed TCP packet as fed into the assembler.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    pub src: Endpoint,
    pub dst: Endpoint,
    pub seq: u32,
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl TcpPacket {
    pub fn flow(&self) -> (FlowKey, Side) {
        FlowKey::from_endpoints(self.src, self.dst)
    }
}

/// TCP flags observed on the packets backing a segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentFlags {
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
}

impl SegmentFlags {
    pub fn any(&self) -> bool {
        self.syn || self.fin || self.rst
    }
}

/// A contiguous byte run on one side of a flow, emitted by the assembler in
/// strictly increasing offset order per side.
#[derive(Debug, Clone)]
pub struct Segment {
    pub flow_key: FlowKey,
    pub side: Side,
    /// Whether `side` is the resolved client of this flow
    pub from_client: bool,
    /// Absolute offset of `bytes[0]` in this side's reassembled stream
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub flags: SegmentFlags,
}

/// Why a flow was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// FIN observed on both sides
    Fin,
    Reset,
    IdleTimeout,
    /// Session ended (end of file, capture stop or cancellation)
    SessionEnd,
    /// Per-flow byte limit exceeded
    Oversize,
    /// A fresh SYN arrived while the connection was still open
    NewSyn,
    /// Evicted under flow-table pressure
    Evicted,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(addr: &str, port: u16) -> Endpoint {
        Endpoint::new(addr.parse().unwrap(), port)
    }

    #[test]
    fn test_flow_key_is_direction_agnostic() {
        let a = endpoint("10.0.0.1", 40000);
        let b = endpoint("10.0.0.2", 80);
        let (key_ab, side_ab) = FlowKey::from_endpoints(a, b);
        let (key_ba, side_ba) = FlowKey::from_endpoints(b, a);
        assert_eq!(key_ab, key_ba);
        assert_ne!(side_ab, side_ba);
        assert_eq!(side_ab, side_ba.opposite());
    }

    #[test]
    fn test_flow_key_orders_by_ip_then_port() {
        let a = endpoint("10.0.0.1", 9000);
        let b = endpoint("10.0.0.1", 80);
        let (key, side) = FlowKey::from_endpoints(a, b);
        assert_eq!(key.endpoint(Side::Low), b);
        assert_eq!(side, Side::High);
    }

    #[test]
    fn test_same_ip_different_ports_distinct_sides() {
        let a = endpoint("127.0.0.1", 1);
        let b = endpoint("127.0.0.1", 2);
        let (key, _) = FlowKey::from_endpoints(a, b);
        assert_eq!(key.endpoint(Side::Low), a);
        assert_eq!(key.endpoint(Side::High), b);
    }
}
