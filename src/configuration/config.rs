use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the analysis service.
///
/// All values can be provided either as command-line flags or through the
/// corresponding environment variables. Tuning knobs for the reassembly
/// pipeline (gap limits, idle timeout, worker count) live here so that
/// deployments against large captures can adjust them without rebuilding.
#[derive(Parser, Debug, Clone)]
#[command(name = "flowscope")]
#[command(about = "Network traffic analysis service for CTF and incident response")]
pub struct Configuration {
    /// Network address the REST interface binds to
    #[arg(long, env = "BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Port of the REST interface
    #[arg(long, env = "WEB_PORT", default_value_t = 3333)]
    pub web_port: u16,

    /// Disable the REST interface (the core still runs for library use)
    #[arg(long, action = clap::ArgAction::SetTrue, env = "WEB_DISABLED")]
    pub web_disabled: bool,

    /// Directory holding the SQLite store and the reserved pcap directories
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Number of pipeline workers; each worker owns a slice of the flow table.
    /// 0 selects the number of available CPUs.
    #[arg(long, env = "WORKERS", default_value_t = 0)]
    pub workers: usize,

    /// Capacity of each dispatcher-to-worker channel. When a lane is full the
    /// producer blocks, which for live captures surfaces as kernel drops.
    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = 4096)]
    pub channel_capacity: usize,

    /// Out-of-order bytes buffered per flow side before the gap is dropped
    /// and the stream fast-forwards
    #[arg(long, env = "MAX_GAP_BYTES", default_value_t = 4 * 1024 * 1024)]
    pub max_gap_bytes: usize,

    /// Total payload bytes per connection before it is force-finalized
    #[arg(long, env = "MAX_FLOW_BYTES", default_value_t = 64 * 1024 * 1024)]
    pub max_flow_bytes: usize,

    /// Open flows in the table before the oldest idle one is evicted
    #[arg(long, env = "MAX_FLOWS", default_value_t = 65536)]
    pub max_flows: usize,

    /// Seconds of silence on both sides before a flow is force-finalized
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Seconds between live-capture pcap rotations; adjustable at runtime
    /// through the capture API
    #[arg(long, env = "ROTATION_INTERVAL_SECS", default_value_t = 300)]
    pub rotation_interval_secs: u64,
}

impl Configuration {
    /// Parse the configuration from command line and environment.
    pub fn from_args() -> Self {
        Configuration::parse()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.rotation_interval_secs)
    }

    /// Completed session pcaps live here, named `<session_id>.pcap`.
    pub fn pcaps_dir(&self) -> PathBuf {
        self.data_dir.join("pcaps")
    }

    /// Work-in-progress pcaps; moved to `pcaps/` when their session completes.
    pub fn processing_dir(&self) -> PathBuf {
        self.data_dir.join("pcaps").join("processing")
    }

    /// Per-connection pcap slices generated on demand.
    pub fn connections_dir(&self) -> PathBuf {
        self.data_dir.join("connections")
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("flowscope.sqlite3")
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::parse_from(["flowscope"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();
        assert_eq!(config.web_port, 3333);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.rotation_interval(), Duration::from_secs(300));
        assert!(config.pcaps_dir().ends_with("pcaps"));
        assert!(config.processing_dir().ends_with("pcaps/processing"));
    }

    #[test]
    fn test_cli_overrides() {
        let config = Configuration::parse_from([
            "flowscope",
            "--web-port",
            "8000",
            "--idle-timeout-secs",
            "30",
            "--workers",
            "4",
        ]);
        assert_eq!(config.web_port, 8000);
        assert_eq!(config.idle_timeout_secs, 30);
        assert_eq!(config.workers, 4);
    }
}
