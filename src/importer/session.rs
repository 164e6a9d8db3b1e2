use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::types::RowId;

/// Live counters of a running session, updated by the reader worker and the
/// pipeline without locking. Snapshots are point-in-time consistent enough
/// for progress reporting.
#[derive(Debug, Default)]
pub struct SessionProgress {
    pub packets_read: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub bytes_processed: AtomicU64,
    pub cancelled: AtomicBool,
}

impl SessionProgress {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// One ingestion job: a pcap file import or one live-capture rotation
/// window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSession {
    pub id: RowId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub packets_read: u64,
    pub packets_dropped: u64,
    pub bytes_processed: u64,
    /// Human-readable source descriptor (file path, interface, ssh target)
    pub source: String,
    pub cancelled: bool,
}

impl ImportSession {
    pub fn new(id: RowId, source: String) -> Self {
        Self {
            id,
            started_at: id.timestamp(),
            completed_at: None,
            packets_read: 0,
            packets_dropped: 0,
            bytes_processed: 0,
            source,
            cancelled: false,
        }
    }

    /// Merge live counters into a snapshot for callers.
    pub fn with_progress(mut self, progress: &SessionProgress) -> Self {
        self.packets_read = progress.packets_read.load(Ordering::Relaxed);
        self.packets_dropped = progress.packets_dropped.load(Ordering::Relaxed);
        self.bytes_processed = progress.bytes_processed.load(Ordering::Relaxed);
        self.cancelled = progress.is_cancelled();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_snapshot() {
        let progress = SessionProgress::default();
        progress.packets_read.store(10, Ordering::Relaxed);
        progress.bytes_processed.store(1000, Ordering::Relaxed);
        progress.cancel();

        let session = ImportSession::new(RowId::new(1000, 0), "test.pcap".to_string())
            .with_progress(&progress);
        assert_eq!(session.packets_read, 10);
        assert_eq!(session.bytes_processed, 1000);
        assert!(session.cancelled);
        assert!(!session.is_terminal());
    }
}
