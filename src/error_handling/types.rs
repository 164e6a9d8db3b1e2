//! Error types shared across the analysis pipeline.
//!
//! One enum per domain. The pipeline never panics on malformed input: parse
//! failures are counted and skipped, and only a storage failure during
//! startup is allowed to abort the process.

use uuid::Uuid;

/// Rule validation or compilation failure.
#[derive(Debug)]
pub enum RuleError {
    /// A pattern of the rule failed to compile.
    Compile {
        rule_id: Uuid,
        pattern_index: usize,
        reason: String,
    },
    /// Another rule already uses this name.
    DuplicateName(String),
    /// No rule with the requested id exists.
    NotFound(Uuid),
}

impl std::fmt::Display for RuleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleError::Compile {
                rule_id,
                pattern_index,
                reason,
            } => write!(
                f,
                "rule {} pattern #{} failed to compile: {}",
                rule_id, pattern_index, reason
            ),
            RuleError::DuplicateName(name) => write!(f, "rule name '{}' already in use", name),
            RuleError::NotFound(id) => write!(f, "rule {} not found", id),
        }
    }
}

impl std::error::Error for RuleError {}

/// Malformed search options or a failure while running a search.
#[derive(Debug)]
pub enum SearchError {
    InvalidOptions(String),
    Storage(StorageError),
}

impl std::fmt::Display for SearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchError::InvalidOptions(reason) => write!(f, "invalid search: {}", reason),
            SearchError::Storage(err) => write!(f, "search storage error: {}", err),
        }
    }
}

impl std::error::Error for SearchError {}

impl From<StorageError> for SearchError {
    fn from(err: StorageError) -> Self {
        SearchError::Storage(err)
    }
}

/// Document store failure.
#[derive(Debug)]
pub enum StorageError {
    ConnectionFailed(String),
    ReadFailed(String),
    WriteFailed(String),
    Serialization(String),
    NotFound,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::ConnectionFailed(msg) => write!(f, "store connection failed: {}", msg),
            StorageError::ReadFailed(msg) => write!(f, "store read failed: {}", msg),
            StorageError::WriteFailed(msg) => write!(f, "store write failed: {}", msg),
            StorageError::Serialization(msg) => write!(f, "document serialization failed: {}", msg),
            StorageError::NotFound => write!(f, "document not found"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Packet source failure (file, device or remote stream).
#[derive(Debug)]
pub enum SourceError {
    Unavailable { source: String, cause: String },
    Pcap(pcap::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Unavailable { source, cause } => {
                write!(f, "packet source '{}' unavailable: {}", source, cause)
            }
            SourceError::Pcap(err) => write!(f, "pcap error: {}", err),
            SourceError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<pcap::Error> for SourceError {
    fn from(err: pcap::Error) -> Self {
        SourceError::Pcap(err)
    }
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Io(err)
    }
}

/// Import or capture session lifecycle failure.
#[derive(Debug)]
pub enum SessionError {
    NotFound,
    DuplicatePcap,
    CaptureAlreadyRunning,
    NoCaptureRunning,
    Source(SourceError),
    Storage(StorageError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::NotFound => write!(f, "session not found"),
            SessionError::DuplicatePcap => write!(f, "pcap file was already imported"),
            SessionError::CaptureAlreadyRunning => write!(f, "a live capture is already running"),
            SessionError::NoCaptureRunning => write!(f, "no live capture is running"),
            SessionError::Source(err) => write!(f, "session source error: {}", err),
            SessionError::Storage(err) => write!(f, "session storage error: {}", err),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SourceError> for SessionError {
    fn from(err: SourceError) -> Self {
        SessionError::Source(err)
    }
}

impl From<StorageError> for SessionError {
    fn from(err: StorageError) -> Self {
        SessionError::Storage(err)
    }
}

/// Resource limits hit by the pipeline; triggers forced eviction rather than
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceExhausted {
    FlowTable,
    FlowBytes,
}

impl std::fmt::Display for ResourceExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceExhausted::FlowTable => write!(f, "flow table limit reached"),
            ResourceExhausted::FlowBytes => write!(f, "per-flow byte limit reached"),
        }
    }
}

/// Fatal initialization failure.
#[derive(Debug)]
pub enum ControllerError {
    Storage(StorageError),
    Rules(RuleError),
    Io(std::io::Error),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Storage(err) => write!(f, "storage initialization failed: {}", err),
            ControllerError::Rules(err) => write!(f, "rule set initialization failed: {}", err),
            ControllerError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<StorageError> for ControllerError {
    fn from(err: StorageError) -> Self {
        ControllerError::Storage(err)
    }
}

impl From<RuleError> for ControllerError {
    fn from(err: RuleError) -> Self {
        ControllerError::Rules(err)
    }
}

impl From<std::io::Error> for ControllerError {
    fn from(err: std::io::Error) -> Self {
        ControllerError::Io(err)
    }
}
