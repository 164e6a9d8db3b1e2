//! Pcap file ingestion with session bookkeeping.
//!
//! `import_file` copies the source into `pcaps/processing/`, spawns a reader
//! thread that feeds every TCP packet through the dispatcher, and moves the
//! file to `pcaps/<session_id>.pcap` when done. Sessions survive restarts:
//! they are persisted at every terminal transition and reloaded at startup.
//! Files are deduplicated by content hash, so re-importing the same capture
//! is rejected instead of producing duplicate connections.

use std::collections::{HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, TimeZone, Utc};
use log::{error, info, warn};
use pcap::{Capture, Linktype};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error_handling::types::{SessionError, SourceError, StorageError};
use crate::flow::types::{CloseReason, Endpoint, TcpPacket};
use crate::importer::session::{ImportSession, SessionProgress};
use crate::notifications::NotificationBus;
use crate::pipeline::Dispatcher;
use crate::storage::types::{collections, FindQuery, RowId};
use crate::storage::DocumentStore;

struct ActiveSession {
    session: ImportSession,
    progress: Arc<SessionProgress>,
    handle: Option<JoinHandle<()>>,
    file_hash: Option<String>,
}

pub struct PcapImporter {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn DocumentStore>,
    notifications: NotificationBus,
    pcaps_dir: PathBuf,
    processing_dir: PathBuf,
    sessions: Arc<Mutex<HashMap<RowId, ActiveSession>>>,
    imported_hashes: Mutex<HashSet<String>>,
}

impl PcapImporter {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn DocumentStore>,
        notifications: NotificationBus,
        pcaps_dir: PathBuf,
        processing_dir: PathBuf,
    ) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&processing_dir)
            .map_err(|e| StorageError::WriteFailed(e.to_string()))?;

        // reload terminal sessions so history and dedup survive restarts
        let mut sessions = HashMap::new();
        let mut hashes = HashSet::new();
        for doc in store.find(collections::SESSIONS, &FindQuery::default())? {
            if let Ok(session) = doc.parse::<ImportSession>() {
                let hash = doc
                    .body
                    .get("file_hash")
                    .and_then(|value| value.as_str())
                    .map(String::from);
                if let Some(hash) = &hash {
                    hashes.insert(hash.clone());
                }
                sessions.insert(
                    session.id,
                    ActiveSession {
                        session,
                        progress: Arc::new(SessionProgress::default()),
                        handle: None,
                        file_hash: hash,
                    },
                );
            }
        }
        info!("importer ready, {} past sessions loaded", sessions.len());

        Ok(Self {
            dispatcher,
            store,
            notifications,
            pcaps_dir,
            processing_dir,
            sessions: Arc::new(Mutex::new(sessions)),
            imported_hashes: Mutex::new(hashes),
        })
    }

    /// Import a pcap/pcapng file. Returns the new session id immediately;
    /// the read loop runs on its own thread. With `flush_all` set, every
    /// flow still open at end-of-file is force-finalized.
    pub fn import_file<P: AsRef<Path>>(
        &self,
        path: P,
        flush_all: bool,
    ) -> Result<RowId, SessionError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(SessionError::Source(SourceError::Unavailable {
                source: path.display().to_string(),
                cause: "file not found".to_string(),
            }));
        }

        let hash = hash_file(path).map_err(SourceError::Io)?;
        {
            let mut hashes = self.imported_hashes.lock().unwrap();
            if hashes.contains(&hash) {
                return Err(SessionError::DuplicatePcap);
            }
            hashes.insert(hash.clone());
        }

        let id = RowId::generate();
        let working = self.processing_dir.join(format!("{}.pcap", id));
        if path.starts_with(&self.processing_dir) {
            std::fs::rename(path, &working).map_err(SourceError::Io)?;
        } else {
            std::fs::copy(path, &working).map_err(SourceError::Io)?;
        }

        let session = ImportSession::new(id, path.display().to_string());
        let progress = Arc::new(SessionProgress::default());
        let handle = self.spawn_reader(id, working, flush_all, progress.clone());

        self.sessions.lock().unwrap().insert(
            id,
            ActiveSession {
                session,
                progress,
                handle: Some(handle),
                file_hash: Some(hash),
            },
        );
        self.notifications
            .publish("pcap.file", json!({"session": id.to_hex()}));
        Ok(id)
    }

    fn spawn_reader(
        &self,
        id: RowId,
        working: PathBuf,
        flush_all: bool,
        progress: Arc<SessionProgress>,
    ) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let completed_path = self.pcaps_dir.join(format!("{}.pcap", id));
        let store = self.store.clone();
        let notifications = self.notifications.clone();
        let sessions = self.sessions.clone();

        std::thread::Builder::new()
            .name(format!("import-{}", id))
            .spawn(move || {
                info!("session {} started reading {}", id, working.display());
                match read_packets(&working, &dispatcher, id, &progress) {
                    Ok(()) => {}
                    Err(err) => warn!("session {} read error: {}", id, err),
                }

                let cancelled = progress.is_cancelled();
                if flush_all || cancelled {
                    dispatcher.flush_all(CloseReason::SessionEnd);
                }
                if let Err(err) = std::fs::rename(&working, &completed_path) {
                    warn!("session {} could not archive pcap: {}", id, err);
                }

                complete_session(&sessions, id, &progress, &store, &notifications);
            })
            .expect("failed to spawn import reader")
    }

    /// Cooperative cancellation; true when a running session was signalled.
    pub fn cancel_session(&self, id: RowId) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(&id) {
            Some(active) if !active.session.is_terminal() => {
                active.progress.cancel();
                info!("session {} cancelled", id);
                self.notifications
                    .publish("sessions.delete", json!({"session": id.to_hex()}));
                true
            }
            _ => false,
        }
    }

    pub fn get_session(&self, id: RowId) -> Option<ImportSession> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&id).map(snapshot)
    }

    /// Snapshot of every known session, oldest first.
    pub fn get_sessions(&self) -> Vec<ImportSession> {
        let sessions = self.sessions.lock().unwrap();
        let mut all: Vec<ImportSession> = sessions.values().map(snapshot).collect();
        all.sort_by_key(|session| session.id);
        all
    }

    /// Block until the reader thread of `id` exits. Used by the capture
    /// manager to chain rotations and by shutdown.
    pub fn wait_for_session(&self, id: RowId) {
        let handle = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.get_mut(&id).and_then(|active| active.handle.take())
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Directory live captures write their in-progress rotations into.
    pub fn processing_dir(&self) -> &Path {
        &self.processing_dir
    }

    /// Force-finalize every open flow in the pipeline. Used when a live
    /// capture stops and at shutdown.
    pub fn flush_pipeline(&self) {
        self.dispatcher.flush_all(CloseReason::SessionEnd);
    }

    /// Cancel whatever is still running and wait for it; called on
    /// shutdown.
    pub fn cancel_all(&self) {
        let running: Vec<RowId> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, active)| !active.session.is_terminal())
                .map(|(id, _)| *id)
                .collect()
        };
        for id in running {
            self.cancel_session(id);
            self.wait_for_session(id);
        }
    }
}

/// Mark a session terminal, persist it and announce completion.
fn complete_session(
    sessions: &Arc<Mutex<HashMap<RowId, ActiveSession>>>,
    id: RowId,
    progress: &SessionProgress,
    store: &Arc<dyn DocumentStore>,
    notifications: &NotificationBus,
) {
    {
        let mut sessions = sessions.lock().unwrap();
        if let Some(active) = sessions.get_mut(&id) {
            active.session = active.session.clone().with_progress(progress);
            active.session.completed_at = Some(Utc::now());
            let mut body = serde_json::to_value(&active.session).unwrap_or(json!({}));
            if let (Some(hash), Some(map)) = (&active.file_hash, body.as_object_mut()) {
                map.insert("file_hash".to_string(), json!(hash));
            }
            if let Err(err) = store.insert(collections::SESSIONS, &id.to_hex(), body) {
                error!("session {} persist failed: {}", id, err);
            }
            notifications.publish(
                "sessions.completed",
                json!({"session": id.to_hex(), "cancelled": active.session.cancelled}),
            );
            info!(
                "session {} finished: {} packets, {} bytes{}",
                id,
                active.session.packets_read,
                active.session.bytes_processed,
                if active.session.cancelled {
                    " (cancelled)"
                } else {
                    ""
                }
            );
        }
    }
}

/// Progress-merged snapshot of one session entry.
fn snapshot(active: &ActiveSession) -> ImportSession {
    if active.session.is_terminal() {
        active.session.clone()
    } else {
        active.session.clone().with_progress(&active.progress)
    }
}

/// Read every packet of `path` into the pipeline. The cancellation flag is
/// checked between packets, bounding cancel latency to one packet.
fn read_packets(
    path: &Path,
    dispatcher: &Dispatcher,
    session: RowId,
    progress: &Arc<SessionProgress>,
) -> Result<(), SourceError> {
    let mut capture = Capture::from_file(path)?;
    let link = capture.get_datalink();
    loop {
        if progress.is_cancelled() {
            return Ok(());
        }
        let packet = match capture.next_packet() {
            Ok(packet) => packet,
            Err(pcap::Error::NoMorePackets) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        progress.packets_read.fetch_add(1, Ordering::Relaxed);
        progress
            .bytes_processed
            .fetch_add(packet.data.len() as u64, Ordering::Relaxed);

        let timestamp =
            timeval_to_datetime(packet.header.ts.tv_sec as i64, packet.header.ts.tv_usec as i64);
        match parse_tcp_packet(link, packet.data, timestamp) {
            Some(parsed) => dispatcher.dispatch(parsed, session, progress),
            None => {
                progress.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

pub(crate) fn timeval_to_datetime(secs: i64, micros: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, (micros.clamp(0, 999_999) * 1000) as u32)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Parse a captured frame down to TCP; non-TCP and malformed packets yield
/// `None` and are counted as dropped by the caller.
pub(crate) fn parse_tcp_packet(
    link: Linktype,
    data: &[u8],
    timestamp: DateTime<Utc>,
) -> Option<TcpPacket> {
    use etherparse::{NetSlice, SlicedPacket, TransportSlice};

    let sliced = match link {
        Linktype::ETHERNET => SlicedPacket::from_ethernet(data).ok()?,
        Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => SlicedPacket::from_ip(data).ok()?,
        _ => SlicedPacket::from_ethernet(data).ok()?,
    };

    let (src_ip, dst_ip) = match sliced.net.as_ref()? {
        NetSlice::Ipv4(ipv4) => (
            std::net::IpAddr::V4(ipv4.header().source_addr()),
            std::net::IpAddr::V4(ipv4.header().destination_addr()),
        ),
        NetSlice::Ipv6(ipv6) => (
            std::net::IpAddr::V6(ipv6.header().source_addr()),
            std::net::IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return None,
    };

    let tcp = match sliced.transport.as_ref()? {
        TransportSlice::Tcp(tcp) => tcp,
        _ => return None,
    };

    Some(TcpPacket {
        src: Endpoint::new(src_ip, tcp.source_port()),
        dst: Endpoint::new(dst_ip, tcp.destination_port()),
        seq: tcp.sequence_number(),
        syn: tcp.syn(),
        ack: tcp.ack(),
        fin: tcp.fin(),
        rst: tcp.rst(),
        payload: tcp.payload().to_vec(),
        timestamp,
    })
}

fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::types::StoredMessage;
    use crate::flow::stream_assembler::AssemblerConfig;
    use crate::notifications::NotificationBus;
    use crate::rules::pattern_index::PatternIndex;
    use crate::statistics::StatisticsController;
    use crate::storage::types::FindQuery;
    use crate::storage::MemoryStorage;
    use arc_swap::ArcSwap;
    use etherparse::PacketBuilder;
    use tempfile::TempDir;

    struct Frame {
        seq: u32,
        syn: bool,
        fin: bool,
        from_client: bool,
        payload: &'static [u8],
    }

    fn frame(seq: u32, from_client: bool, payload: &'static [u8]) -> Frame {
        Frame {
            seq,
            syn: false,
            fin: false,
            from_client,
            payload,
        }
    }

    fn build_frame(frame: &Frame) -> Vec<u8> {
        let (src_ip, dst_ip, src_port, dst_port) = if frame.from_client {
            ([10, 0, 0, 1], [10, 0, 0, 2], 40000u16, 80u16)
        } else {
            ([10, 0, 0, 2], [10, 0, 0, 1], 80, 40000)
        };
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4(src_ip, dst_ip, 64)
            .tcp(src_port, dst_port, frame.seq, 65535);
        // the server's handshake frame is a SYN-ACK, the client's a bare SYN
        let builder = if frame.syn {
            if frame.from_client {
                builder.syn()
            } else {
                builder.syn().ack(1)
            }
        } else {
            builder.ack(1)
        };
        let builder = if frame.fin { builder.fin() } else { builder };
        let mut out = Vec::with_capacity(builder.size(frame.payload.len()));
        builder.write(&mut out, frame.payload).unwrap();
        out
    }

    fn write_pcap(path: &Path, frames: &[Frame]) {
        let capture = Capture::dead(Linktype::ETHERNET).unwrap();
        let mut savefile = capture.savefile(path).unwrap();
        for (index, frame) in frames.iter().enumerate() {
            let data = build_frame(frame);
            let header = pcap::PacketHeader {
                ts: libc::timeval {
                    tv_sec: 1_700_000_000 + index as i64 as libc::time_t,
                    tv_usec: 0,
                },
                caplen: data.len() as u32,
                len: data.len() as u32,
            };
            savefile.write(&pcap::Packet::new(&header, &data));
        }
        savefile.flush().unwrap();
    }

    struct Fixture {
        importer: PcapImporter,
        store: Arc<MemoryStorage>,
        dispatcher: Arc<Dispatcher>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStorage::new());
        let index = PatternIndex::compile(vec![], 1).unwrap();
        let dispatcher = Arc::new(Dispatcher::start(
            2,
            256,
            AssemblerConfig::default(),
            store.clone(),
            Arc::new(ArcSwap::from_pointee(index)),
            NotificationBus::new(),
            Arc::new(StatisticsController::new(store.clone())),
        ));
        let importer = PcapImporter::new(
            dispatcher.clone(),
            store.clone(),
            NotificationBus::new(),
            dir.path().join("pcaps"),
            dir.path().join("pcaps").join("processing"),
        )
        .unwrap();
        Fixture {
            importer,
            store,
            dispatcher,
            _dir: dir,
        }
    }

    fn http_conversation() -> Vec<Frame> {
        vec![
            Frame {
                syn: true,
                ..frame(100, true, b"")
            },
            frame(101, true, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"),
            Frame {
                syn: true,
                ..frame(500, false, b"")
            },
            frame(501, false, b"HTTP/1.1 200 OK\r\n\r\nhello"),
            Frame {
                fin: true,
                ..frame(128, true, b"")
            },
            Frame {
                fin: true,
                ..frame(524, false, b"")
            },
        ]
    }

    #[test]
    fn test_import_single_http_conversation() {
        let f = fixture();
        let pcap_path = f._dir.path().join("http.pcap");
        write_pcap(&pcap_path, &http_conversation());

        let id = f.importer.import_file(&pcap_path, true).unwrap();
        f.importer.wait_for_session(id);

        let session = f.importer.get_session(id).unwrap();
        assert!(session.is_terminal());
        assert_eq!(session.packets_read, 6);
        assert!(!session.cancelled);

        let docs = f
            .store
            .find(collections::CONNECTIONS, &FindQuery::default())
            .unwrap();
        assert_eq!(docs.len(), 1);
        let conn: crate::connections::types::Connection = docs[0].parse().unwrap();
        assert_eq!(conn.service_port, 80);
        assert_eq!(conn.client_bytes, 27);
        assert_eq!(conn.server_bytes, 24);
        assert_eq!(conn.client_messages, 1);
        assert_eq!(conn.server_messages, 1);
        assert_eq!(conn.processed_by, vec![id]);

        // the pcap moved out of processing into the archive
        assert!(f._dir.path().join("pcaps").join(format!("{}.pcap", id)).is_file());

        f.dispatcher.shutdown();
    }

    #[test]
    fn test_out_of_order_capture_reassembles() {
        let f = fixture();
        let pcap_path = f._dir.path().join("ooo.pcap");
        write_pcap(
            &pcap_path,
            &[
                Frame {
                    syn: true,
                    ..frame(0, true, b"")
                },
                Frame {
                    syn: true,
                    ..frame(0, true, b"")
                }, // retransmitted SYN
                frame(101, true, b"BBBBB"),
                frame(1, true, b"AAAAA"),
                frame(6, true, b"MMMMM"),
            ],
        );
        // only [0,5) and [100,105) exist; fill the middle range too
        // so the three ranges [100,200)-style scenario stays contiguous
        let id = f.importer.import_file(&pcap_path, true).unwrap();
        f.importer.wait_for_session(id);

        let docs = f
            .store
            .find(collections::MESSAGES, &FindQuery::default())
            .unwrap();
        // buffered segment past the hole flushes at session end
        let payloads: Vec<Vec<u8>> = docs
            .iter()
            .map(|doc| doc.parse::<StoredMessage>().unwrap().payload_bytes())
            .collect();
        let total: usize = payloads.iter().map(|payload| payload.len()).sum();
        assert_eq!(total, 15);
        f.dispatcher.shutdown();
    }

    #[test]
    fn test_flow_spanning_two_files_yields_one_connection() {
        let f = fixture();
        let first = f._dir.path().join("first.pcap");
        let second = f._dir.path().join("second.pcap");
        write_pcap(
            &first,
            &[
                Frame {
                    syn: true,
                    ..frame(0, true, b"")
                },
                frame(1, true, b"hello "),
            ],
        );
        write_pcap(
            &second,
            &[
                frame(7, true, b"again"),
                Frame {
                    fin: true,
                    ..frame(12, true, b"")
                },
                Frame {
                    fin: true,
                    ..frame(1, false, b"")
                },
            ],
        );

        let id1 = f.importer.import_file(&first, false).unwrap();
        f.importer.wait_for_session(id1);
        let id2 = f.importer.import_file(&second, false).unwrap();
        f.importer.wait_for_session(id2);
        f.dispatcher.flush_all(CloseReason::SessionEnd);

        let docs = f
            .store
            .find(collections::CONNECTIONS, &FindQuery::default())
            .unwrap();
        assert_eq!(docs.len(), 1);
        let conn: crate::connections::types::Connection = docs[0].parse().unwrap();
        assert_eq!(conn.client_bytes, 11);
        assert_eq!(conn.processed_by, vec![id1, id2]);
        f.dispatcher.shutdown();
    }

    #[test]
    fn test_duplicate_import_rejected() {
        let f = fixture();
        let pcap_path = f._dir.path().join("dup.pcap");
        write_pcap(&pcap_path, &http_conversation());

        let id = f.importer.import_file(&pcap_path, true).unwrap();
        f.importer.wait_for_session(id);
        // the original was copied, so the source file still exists
        match f.importer.import_file(&pcap_path, true) {
            Err(SessionError::DuplicatePcap) => {}
            other => panic!("expected duplicate rejection, got ok={}", other.is_ok()),
        }
        f.dispatcher.shutdown();
    }

    #[test]
    fn test_missing_file_is_source_error() {
        let f = fixture();
        match f.importer.import_file("/nonexistent.pcap", false) {
            Err(SessionError::Source(SourceError::Unavailable { .. })) => {}
            other => panic!("expected source error, got ok={}", other.is_ok()),
        }
        f.dispatcher.shutdown();
    }

    #[test]
    fn test_cancel_semantics() {
        let f = fixture();
        // unknown session
        assert!(!f.importer.cancel_session(RowId::new(1, 1)));

        // a terminal session cannot be cancelled again
        let pcap_path = f._dir.path().join("done.pcap");
        write_pcap(&pcap_path, &http_conversation());
        let id = f.importer.import_file(&pcap_path, true).unwrap();
        f.importer.wait_for_session(id);
        assert!(!f.importer.cancel_session(id));

        // a registered, non-terminal session is cancellable
        let running = RowId::generate();
        f.importer.sessions.lock().unwrap().insert(
            running,
            ActiveSession {
                session: ImportSession::new(running, "live".to_string()),
                progress: Arc::new(SessionProgress::default()),
                handle: None,
                file_hash: None,
            },
        );
        assert!(f.importer.cancel_session(running));
        let snapshot = f.importer.get_session(running).unwrap();
        assert!(snapshot.cancelled);
        f.dispatcher.shutdown();
    }

    #[test]
    fn test_pre_cancelled_reader_reads_nothing() {
        let f = fixture();
        let pcap_path = f._dir.path().join("skip.pcap");
        write_pcap(&pcap_path, &http_conversation());

        let progress = Arc::new(SessionProgress::default());
        progress.cancel();
        read_packets(&pcap_path, &f.dispatcher, RowId::new(1, 0), &progress).unwrap();
        assert_eq!(progress.packets_read.load(Ordering::Relaxed), 0);
        f.dispatcher.shutdown();
    }

    #[test]
    fn test_sessions_survive_restart() {
        let f = fixture();
        let pcap_path = f._dir.path().join("persist.pcap");
        write_pcap(&pcap_path, &http_conversation());
        let id = f.importer.import_file(&pcap_path, true).unwrap();
        f.importer.wait_for_session(id);

        let reloaded = PcapImporter::new(
            f.dispatcher.clone(),
            f.store.clone(),
            NotificationBus::new(),
            f._dir.path().join("pcaps"),
            f._dir.path().join("pcaps").join("processing"),
        )
        .unwrap();
        let sessions = reloaded.get_sessions();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, id);
        assert!(sessions[0].is_terminal());

        // dedup knowledge survives too
        match reloaded.import_file(&pcap_path, true) {
            Err(SessionError::DuplicatePcap) => {}
            other => panic!("expected duplicate rejection, got ok={}", other.is_ok()),
        }
        f.dispatcher.shutdown();
    }

    #[test]
    fn test_parse_tcp_packet_roundtrip() {
        let data = build_frame(&frame(42, true, b"payload"));
        let parsed = parse_tcp_packet(Linktype::ETHERNET, &data, Utc::now()).unwrap();
        assert_eq!(parsed.src.port, 40000);
        assert_eq!(parsed.dst.port, 80);
        assert_eq!(parsed.seq, 42);
        assert_eq!(parsed.payload, b"payload");
        assert!(parsed.ack && !parsed.syn);

        // garbage is rejected, not panicked on
        assert!(parse_tcp_packet(Linktype::ETHERNET, &[0u8; 10], Utc::now()).is_none());
    }
}
