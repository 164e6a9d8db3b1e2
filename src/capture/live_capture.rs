//! Live capture with bounded pcap rotation.
//!
//! A capture (local device or remote ssh stream) writes every packet into a
//! rotating file under `pcaps/processing/`. When the rotation window
//! closes, the file becomes an import session via the regular file-import
//! path. The pipeline's assemblers are never reset at rotation, so a flow
//! spanning rotations still finalizes as a single connection; rotation only
//! bounds files on disk and session granularity.

use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use pcap::{Activated, Capture};
use serde_json::json;

use crate::capture::remote::open_remote_capture;
use crate::configuration::types::{CaptureOptions, SshConfig};
use crate::error_handling::types::{SessionError, SourceError};
use crate::importer::PcapImporter;
use crate::notifications::NotificationBus;
use crate::storage::types::RowId;

const MIN_ROTATION_MS: u64 = 1_000;
/// Poll granularity for stop/rotation checks on local captures.
const READ_TIMEOUT_MS: i32 = 1_000;

struct ActiveCapture {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    child: Option<Arc<Mutex<Child>>>,
    source: String,
}

pub struct LiveCaptureManager {
    importer: Arc<PcapImporter>,
    notifications: NotificationBus,
    rotation_interval_ms: Arc<AtomicU64>,
    state: Mutex<Option<ActiveCapture>>,
}

impl LiveCaptureManager {
    pub fn new(
        importer: Arc<PcapImporter>,
        notifications: NotificationBus,
        rotation_interval: Duration,
    ) -> Self {
        Self {
            importer,
            notifications,
            rotation_interval_ms: Arc::new(AtomicU64::new(
                (rotation_interval.as_millis() as u64).max(MIN_ROTATION_MS),
            )),
            state: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    pub fn current_source(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|active| active.source.clone())
    }

    /// Change the rotation window; takes effect at the next rotation.
    pub fn set_rotation_interval(&self, interval: Duration) {
        let millis = (interval.as_millis() as u64).max(MIN_ROTATION_MS);
        self.rotation_interval_ms.store(millis, Ordering::Relaxed);
        info!("rotation interval set to {} ms", millis);
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_millis(self.rotation_interval_ms.load(Ordering::Relaxed))
    }

    /// Open `options.interface` and start capturing into rotating pcaps.
    pub fn start_local_capture(&self, options: &CaptureOptions) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(SessionError::CaptureAlreadyRunning);
        }

        let interface = if options.interface.is_empty() {
            pcap::Device::lookup()
                .map_err(SourceError::from)?
                .ok_or_else(|| SourceError::Unavailable {
                    source: "default device".to_string(),
                    cause: "no capture device available".to_string(),
                })?
                .name
        } else {
            options.interface.clone()
        };

        let mut capture = Capture::from_device(interface.as_str())
            .map_err(SourceError::from)?
            .snaplen(options.snaplen)
            .promisc(options.promiscuous)
            .timeout(READ_TIMEOUT_MS)
            .open()
            .map_err(SourceError::from)?;
        if !options.filter.is_empty() {
            capture
                .filter(&options.filter, true)
                .map_err(SourceError::from)?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let handle = self.spawn_rotation_loop(capture, stop.clone(), interface.clone());
        *state = Some(ActiveCapture {
            stop,
            handle,
            child: None,
            source: interface.clone(),
        });
        info!("local capture started on {}", interface);
        self.notifications
            .publish("capture.local", json!({"interface": interface}));
        Ok(())
    }

    /// Run `tcpdump -w -` on a remote host over ssh and feed the stream
    /// through the same rotation path as local captures.
    pub fn start_remote_capture(
        &self,
        ssh: &SshConfig,
        options: &CaptureOptions,
    ) -> Result<(), SessionError> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Err(SessionError::CaptureAlreadyRunning);
        }

        let (child, capture) = open_remote_capture(ssh, options)?;
        let source = format!("{}:{}", ssh.destination(), options.interface);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = self.spawn_rotation_loop(capture, stop.clone(), source.clone());
        *state = Some(ActiveCapture {
            stop,
            handle,
            child: Some(Arc::new(Mutex::new(child))),
            source: source.clone(),
        });
        info!("remote capture started from {}", source);
        self.notifications
            .publish("capture.remote", json!({"source": source}));
        Ok(())
    }

    /// Stop the running capture: the current file is imported as the last
    /// session and every open flow is flushed.
    pub fn stop_capture(&self) -> Result<(), SessionError> {
        let active = self
            .state
            .lock()
            .unwrap()
            .take()
            .ok_or(SessionError::NoCaptureRunning)?;
        active.stop.store(true, Ordering::Relaxed);
        if let Some(child) = &active.child {
            // unblocks the reader on remote captures
            let _ = child.lock().unwrap().kill();
        }
        let _ = active.handle.join();
        if let Some(child) = &active.child {
            let _ = child.lock().unwrap().wait();
        }
        info!("capture on {} stopped", active.source);
        self.notifications.publish("capture.stop", json!({}));
        Ok(())
    }

    fn spawn_rotation_loop<T: Activated + 'static>(
        &self,
        capture: Capture<T>,
        stop: Arc<AtomicBool>,
        source: String,
    ) -> JoinHandle<()> {
        let importer = self.importer.clone();
        let interval_ms = self.rotation_interval_ms.clone();
        std::thread::Builder::new()
            .name("live-capture".to_string())
            .spawn(move || rotation_loop(capture, stop, importer, interval_ms, source))
            .expect("failed to spawn capture thread")
    }
}

fn rotation_loop<T: Activated>(
    mut capture: Capture<T>,
    stop: Arc<AtomicBool>,
    importer: Arc<PcapImporter>,
    interval_ms: Arc<AtomicU64>,
    source: String,
) {
    loop {
        let window = Duration::from_millis(interval_ms.load(Ordering::Relaxed));
        let path = importer
            .processing_dir()
            .join(format!("live-{}.pcap", RowId::generate()));
        let mut savefile = match capture.savefile(&path) {
            Ok(savefile) => savefile,
            Err(err) => {
                error!("capture {}: cannot open rotation file: {}", source, err);
                break;
            }
        };

        let deadline = Instant::now() + window;
        let mut packets_written = 0u64;
        let stopping = loop {
            if stop.load(Ordering::Relaxed) {
                break true;
            }
            if Instant::now() >= deadline {
                break false;
            }
            match capture.next_packet() {
                Ok(packet) => {
                    savefile.write(&packet);
                    packets_written += 1;
                }
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(pcap::Error::NoMorePackets) => break true,
                Err(err) => {
                    warn!("capture {} read failed: {}", source, err);
                    break true;
                }
            }
        };
        let _ = savefile.flush();
        drop(savefile);

        if packets_written > 0 {
            match importer.import_file(&path, false) {
                Ok(session) => importer.wait_for_session(session),
                Err(err) => warn!("capture {}: rotation import failed: {}", source, err),
            }
        } else {
            // nothing captured in this window; no session for it
            let _ = std::fs::remove_file(&path);
        }

        if stopping {
            break;
        }
    }
    // the capture is over; whatever is still open becomes a connection now
    importer.flush_pipeline();
    info!("capture {} loop ended", source);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::stream_assembler::AssemblerConfig;
    use crate::pipeline::Dispatcher;
    use crate::rules::pattern_index::PatternIndex;
    use crate::statistics::StatisticsController;
    use crate::storage::MemoryStorage;
    use arc_swap::ArcSwap;
    use tempfile::TempDir;

    fn manager() -> (LiveCaptureManager, Arc<Dispatcher>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStorage::new());
        let index = PatternIndex::compile(vec![], 1).unwrap();
        let dispatcher = Arc::new(Dispatcher::start(
            1,
            64,
            AssemblerConfig::default(),
            store.clone(),
            Arc::new(ArcSwap::from_pointee(index)),
            NotificationBus::new(),
            Arc::new(StatisticsController::new(store.clone())),
        ));
        let importer = Arc::new(
            PcapImporter::new(
                dispatcher.clone(),
                store,
                NotificationBus::new(),
                dir.path().join("pcaps"),
                dir.path().join("pcaps").join("processing"),
            )
            .unwrap(),
        );
        (
            LiveCaptureManager::new(importer, NotificationBus::new(), Duration::from_secs(300)),
            dispatcher,
            dir,
        )
    }

    #[test]
    fn test_stop_without_capture_errors() {
        let (manager, dispatcher, _dir) = manager();
        assert!(matches!(
            manager.stop_capture(),
            Err(SessionError::NoCaptureRunning)
        ));
        dispatcher.shutdown();
    }

    #[test]
    fn test_rotation_interval_floor_and_update() {
        let (manager, dispatcher, _dir) = manager();
        assert_eq!(manager.rotation_interval(), Duration::from_secs(300));
        manager.set_rotation_interval(Duration::from_millis(10));
        assert_eq!(manager.rotation_interval(), Duration::from_millis(1000));
        manager.set_rotation_interval(Duration::from_secs(2));
        assert_eq!(manager.rotation_interval(), Duration::from_secs(2));
        dispatcher.shutdown();
    }

    #[test]
    fn test_bogus_interface_fails_cleanly() {
        let (manager, dispatcher, _dir) = manager();
        let result = manager.start_local_capture(&CaptureOptions {
            interface: "flowscope-test-does-not-exist".to_string(),
            ..Default::default()
        });
        assert!(result.is_err());
        assert!(!manager.is_running());
        dispatcher.shutdown();
    }
}
