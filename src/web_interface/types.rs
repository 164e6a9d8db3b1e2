use serde::{Deserialize, Serialize};

use crate::configuration::types::{CaptureOptions, SshConfig};
use crate::connections::types::MessageFormat;

/// Error payload returned by every failing API route.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Body of `POST /api/pcap/file`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ImportRequest {
    pub file: String,
    pub flush_all: bool,
    pub delete_original_file: bool,
}

impl Default for ImportRequest {
    fn default() -> Self {
        Self {
            file: String::new(),
            flush_all: false,
            delete_original_file: false,
        }
    }
}

/// Body of `PUT /api/capture/remote`.
#[derive(Debug, Deserialize)]
pub struct RemoteCaptureRequest {
    pub ssh_config: SshConfig,
    #[serde(default)]
    pub capture_options: CaptureOptions,
}

/// Body of `PUT /api/capture/interval`.
#[derive(Debug, Deserialize)]
pub struct IntervalRequest {
    pub rotation_interval_secs: u64,
}

/// Body of `POST /api/connections/:id/comment`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct CommentRequest {
    pub comment: String,
}

/// Query string of the stream routes.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FormatQuery {
    pub format: Option<MessageFormat>,
}
