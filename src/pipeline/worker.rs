//! One pipeline worker: a thread owning a slice of the flow table.
//!
//! All packets of a flow hash to the same worker, so reassembly and
//! connection building run without any cross-thread synchronization on the
//! hot path. Storage writes happen inline at finalization, off the
//! per-packet path.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::debug;

use crate::flow::stream_assembler::{AssemblerEvent, StreamAssembler};
use crate::flow::types::{CloseReason, TcpPacket};
use crate::flow::ConnectionBuilder;
use crate::importer::session::SessionProgress;
use crate::storage::types::RowId;

pub enum WorkerMessage {
    Packet {
        packet: TcpPacket,
        session: RowId,
        progress: Arc<SessionProgress>,
    },
    Tick(DateTime<Utc>),
    /// Finalize every open flow, then acknowledge
    FlushAll {
        reason: CloseReason,
        done: SyncSender<()>,
    },
    Shutdown,
}

pub struct Worker {
    index: usize,
    receiver: Receiver<WorkerMessage>,
    assembler: StreamAssembler,
    builder: ConnectionBuilder,
}

impl Worker {
    pub fn new(
        index: usize,
        receiver: Receiver<WorkerMessage>,
        assembler: StreamAssembler,
        builder: ConnectionBuilder,
    ) -> Self {
        Self {
            index,
            receiver,
            assembler,
            builder,
        }
    }

    pub fn run(mut self) {
        debug!("worker {} started", self.index);
        while let Ok(message) = self.receiver.recv() {
            match message {
                WorkerMessage::Packet {
                    packet,
                    session,
                    progress,
                } => {
                    let events = self.assembler.push(&packet);
                    self.apply(events, Some(session), Some(&progress));
                }
                WorkerMessage::Tick(now) => {
                    let events = self.assembler.tick(now);
                    self.apply(events, None, None);
                }
                WorkerMessage::FlushAll { reason, done } => {
                    let events = self.assembler.flush_all(reason);
                    self.apply(events, None, None);
                    let _ = done.send(());
                }
                WorkerMessage::Shutdown => break,
            }
        }
        // drain whatever is still open so nothing is lost on shutdown
        let events = self.assembler.flush_all(CloseReason::SessionEnd);
        self.apply(events, None, None);
        debug!("worker {} stopped", self.index);
    }

    fn apply(
        &mut self,
        events: Vec<AssemblerEvent>,
        session: Option<RowId>,
        progress: Option<&Arc<SessionProgress>>,
    ) {
        for event in events {
            match event {
                AssemblerEvent::Segment(segment) => {
                    self.builder.on_segment(&segment, session);
                }
                AssemblerEvent::GapSkipped { flow_key, bytes } => {
                    debug!(
                        "worker {}: flow {} lost {} bytes to a gap",
                        self.index, flow_key, bytes
                    );
                    if let Some(progress) = progress {
                        progress.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                AssemblerEvent::Closed {
                    flow_key,
                    reason,
                    client_side,
                    timestamp,
                } => {
                    self.builder
                        .on_finalize(flow_key, reason, client_side, timestamp);
                }
            }
        }
    }
}
