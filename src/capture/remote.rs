//! Remote capture plumbing: `tcpdump -w -` streamed over an ssh child
//! process, exposed as an offline libpcap handle.

use std::os::fd::IntoRawFd;
use std::process::{Child, Command, Stdio};

use pcap::{Capture, Offline};

use crate::configuration::types::{CaptureOptions, SshConfig};
use crate::error_handling::types::SourceError;

/// Arguments for the ssh invocation running tcpdump on the remote side.
/// `-U` makes tcpdump flush per packet so rotation latency stays low.
pub(crate) fn ssh_args(ssh: &SshConfig, options: &CaptureOptions) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        ssh.port.to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    if !ssh.identity_file.is_empty() {
        args.push("-i".to_string());
        args.push(ssh.identity_file.clone());
    }
    args.push(ssh.destination());
    args.push("tcpdump".to_string());
    args.push("-U".to_string());
    args.push("-w".to_string());
    args.push("-".to_string());
    if !options.interface.is_empty() {
        args.push("-i".to_string());
        args.push(options.interface.clone());
    }
    args.push("-s".to_string());
    args.push(options.snaplen.to_string());
    if !options.filter.is_empty() {
        args.push(options.filter.clone());
    }
    args
}

/// Spawn the tunnel and wrap its stdout as a packet source.
pub(crate) fn open_remote_capture(
    ssh: &SshConfig,
    options: &CaptureOptions,
) -> Result<(Child, Capture<Offline>), SourceError> {
    let mut child = Command::new("ssh")
        .args(ssh_args(ssh, options))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|err| SourceError::Unavailable {
            source: ssh.destination(),
            cause: err.to_string(),
        })?;
    let stdout = child.stdout.take().ok_or_else(|| SourceError::Unavailable {
        source: ssh.destination(),
        cause: "ssh child has no stdout".to_string(),
    })?;
    // SAFETY: the fd is freshly taken from the child and owned by libpcap
    // from here on; nothing else reads or closes it.
    let capture = unsafe { Capture::from_raw_fd(stdout.into_raw_fd()) }.map_err(|err| {
        let _ = child.kill();
        SourceError::Unavailable {
            source: ssh.destination(),
            cause: err.to_string(),
        }
    })?;
    Ok((child, capture))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_args_shape() {
        let ssh = SshConfig {
            host: "10.1.2.3".to_string(),
            port: 2222,
            user: "cap".to_string(),
            identity_file: "/keys/id".to_string(),
        };
        let options = CaptureOptions {
            interface: "eth1".to_string(),
            filter: "tcp port 1337".to_string(),
            snaplen: 9000,
            promiscuous: true,
        };
        let args = ssh_args(&ssh, &options);
        let joined = args.join(" ");
        assert!(joined.starts_with("-p 2222 -o BatchMode=yes -i /keys/id cap@10.1.2.3"));
        assert!(joined.contains("tcpdump -U -w -"));
        assert!(joined.contains("-i eth1"));
        assert!(joined.contains("-s 9000"));
        assert!(joined.ends_with("tcp port 1337"));
    }

    #[test]
    fn test_ssh_args_defaults_omit_optional_parts() {
        let args = ssh_args(&SshConfig::default(), &CaptureOptions::default());
        let joined = args.join(" ");
        assert!(!joined.contains("-i "));
        assert!(joined.contains("-s 65535"));
    }
}
