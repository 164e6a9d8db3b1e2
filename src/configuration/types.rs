use serde::{Deserialize, Serialize};

/// Options for starting a live capture on a local interface or, combined with
/// [`SshConfig`], on a remote host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Interface name as reported by interface enumeration
    pub interface: String,
    /// BPF filter applied at the source; empty captures everything
    pub filter: String,
    /// Snapshot length per packet
    pub snaplen: i32,
    /// Put the interface in promiscuous mode
    pub promiscuous: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            interface: String::new(),
            filter: String::new(),
            snaplen: 65535,
            promiscuous: true,
        }
    }
}

/// Connection parameters for remote captures tunneled over SSH.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Path to a private key; falls back to the ssh agent when empty
    pub identity_file: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            user: "root".to_string(),
            identity_file: String::new(),
        }
    }
}

impl SshConfig {
    /// Destination in `user@host` form as passed to the ssh binary.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

/// Address information of an enumerated capture interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub name: String,
    pub description: Option<String>,
    pub addresses: Vec<String>,
}
