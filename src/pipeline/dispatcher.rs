//! Flow-hash packet dispatch over a fixed worker pool.
//!
//! `worker_index = hash(flow_key) % N` serializes every packet of a flow
//! through one worker, which removes reassembly races by construction.
//! Worker lanes are bounded; when one fills up the producer blocks, which
//! is the pipeline's backpressure. A ticker thread fans an idle-flush tick
//! out to all workers once per second.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use log::{info, warn};

use crate::flow::stream_assembler::{AssemblerConfig, StreamAssembler};
use crate::flow::types::{CloseReason, TcpPacket};
use crate::flow::ConnectionBuilder;
use crate::importer::session::SessionProgress;
use crate::notifications::NotificationBus;
use crate::pipeline::worker::{Worker, WorkerMessage};
use crate::rules::pattern_index::PatternIndex;
use crate::statistics::StatisticsController;
use crate::storage::types::RowId;
use crate::storage::DocumentStore;

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    senders: Vec<SyncSender<WorkerMessage>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl Dispatcher {
    /// Spawn `workers` threads, each owning its assembler and builder, plus
    /// the 1 s ticker.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        workers: usize,
        channel_capacity: usize,
        assembler_config: AssemblerConfig,
        store: Arc<dyn DocumentStore>,
        index: Arc<ArcSwap<PatternIndex>>,
        notifications: NotificationBus,
        statistics: Arc<StatisticsController>,
    ) -> Self {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|cores| cores.get())
                .unwrap_or(4)
        } else {
            workers
        };
        let id_counter = Arc::new(AtomicU64::new(0));
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for worker_index in 0..workers {
            let (sender, receiver) = sync_channel(channel_capacity);
            let worker = Worker::new(
                worker_index,
                receiver,
                StreamAssembler::new(assembler_config.clone()),
                ConnectionBuilder::new(
                    store.clone(),
                    index.clone(),
                    notifications.clone(),
                    statistics.clone(),
                    id_counter.clone(),
                ),
            );
            let handle = std::thread::Builder::new()
                .name(format!("pipeline-{}", worker_index))
                .spawn(move || worker.run())
                .expect("failed to spawn pipeline worker");
            senders.push(sender);
            handles.push(handle);
        }

        let running = Arc::new(AtomicBool::new(true));
        let ticker = {
            let senders = senders.clone();
            let running = running.clone();
            std::thread::Builder::new()
                .name("pipeline-tick".to_string())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        std::thread::sleep(TICK_INTERVAL);
                        let now = Utc::now();
                        for sender in &senders {
                            let _ = sender.try_send(WorkerMessage::Tick(now));
                        }
                    }
                })
                .expect("failed to spawn pipeline ticker")
        };

        info!("pipeline started with {} workers", workers);
        Self {
            senders,
            handles: Mutex::new(handles),
            ticker: Mutex::new(Some(ticker)),
            running,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Route one packet to its flow's worker. Blocks when the lane is full.
    pub fn dispatch(&self, packet: TcpPacket, session: RowId, progress: &Arc<SessionProgress>) {
        let (key, _) = packet.flow();
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let lane = (hasher.finish() % self.senders.len() as u64) as usize;
        let _ = self.senders[lane].send(WorkerMessage::Packet {
            packet,
            session,
            progress: progress.clone(),
        });
    }

    /// Finalize every open flow on every worker and wait for completion.
    /// Ordered behind previously dispatched packets per lane.
    pub fn flush_all(&self, reason: CloseReason) {
        let (done, acks) = sync_channel(self.senders.len());
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::FlushAll {
                reason,
                done: done.clone(),
            });
        }
        drop(done);
        for _ in 0..self.senders.len() {
            if acks.recv().is_err() {
                warn!("pipeline worker vanished during flush");
                break;
            }
        }
    }

    /// Stop the ticker, drain the workers and join them.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        for sender in &self.senders {
            let _ = sender.send(WorkerMessage::Shutdown);
        }
        if let Some(ticker) = self.ticker.lock().unwrap().take() {
            let _ = ticker.join();
        }
        for handle in self.handles.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
        info!("pipeline stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::Endpoint;
    use crate::storage::types::{collections, FindQuery};
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;

    fn packet(src_port: u16, dst_port: u16, seq: u32, syn: bool, payload: &[u8]) -> TcpPacket {
        TcpPacket {
            src: Endpoint::new("10.0.0.1".parse().unwrap(), src_port),
            dst: Endpoint::new("10.0.0.2".parse().unwrap(), dst_port),
            seq,
            syn,
            ack: !syn,
            fin: false,
            rst: false,
            payload: payload.to_vec(),
            timestamp: Utc.timestamp_millis_opt(1_000).unwrap(),
        }
    }

    fn start_dispatcher(store: Arc<MemoryStorage>, workers: usize) -> Dispatcher {
        let index = PatternIndex::compile(vec![], 1).unwrap();
        Dispatcher::start(
            workers,
            64,
            AssemblerConfig::default(),
            store.clone(),
            Arc::new(ArcSwap::from_pointee(index)),
            NotificationBus::new(),
            Arc::new(StatisticsController::new(store)),
        )
    }

    #[test]
    fn test_flows_serialize_through_pipeline() {
        let store = Arc::new(MemoryStorage::new());
        let dispatcher = start_dispatcher(store.clone(), 4);
        let session = RowId::new(1, 0);
        let progress = Arc::new(SessionProgress::default());

        for port in 0..8u16 {
            dispatcher.dispatch(packet(41000 + port, 80, 0, true, b""), session, &progress);
            dispatcher.dispatch(
                packet(41000 + port, 80, 1, false, b"hello"),
                session,
                &progress,
            );
        }
        dispatcher.flush_all(CloseReason::SessionEnd);

        let docs = store
            .find(collections::CONNECTIONS, &FindQuery::default())
            .unwrap();
        assert_eq!(docs.len(), 8);
        dispatcher.shutdown();
    }

    #[test]
    fn test_flush_all_is_ordered_after_packets() {
        let store = Arc::new(MemoryStorage::new());
        let dispatcher = start_dispatcher(store.clone(), 1);
        let session = RowId::new(1, 0);
        let progress = Arc::new(SessionProgress::default());

        dispatcher.dispatch(packet(41000, 80, 0, true, b""), session, &progress);
        for chunk in 0..100u32 {
            dispatcher.dispatch(
                packet(41000, 80, 1 + chunk * 4, false, b"abcd"),
                session,
                &progress,
            );
        }
        dispatcher.flush_all(CloseReason::SessionEnd);

        let docs = store
            .find(collections::CONNECTIONS, &FindQuery::default())
            .unwrap();
        assert_eq!(docs.len(), 1);
        let conn: crate::connections::types::Connection = docs[0].parse().unwrap();
        assert_eq!(conn.client_bytes, 400);
        dispatcher.shutdown();
    }
}
