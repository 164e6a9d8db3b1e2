//! Capture interface enumeration, local and remote.

use crate::configuration::types::{InterfaceInfo, SshConfig};
use crate::error_handling::types::SourceError;

/// Local capture-capable interfaces via libpcap.
pub fn list_interfaces() -> Result<Vec<InterfaceInfo>, SourceError> {
    let devices = pcap::Device::list()?;
    Ok(devices
        .into_iter()
        .map(|device| InterfaceInfo {
            name: device.name,
            description: device.desc,
            addresses: device
                .addresses
                .iter()
                .map(|address| address.addr.to_string())
                .collect(),
        })
        .collect())
}

/// Interfaces on a remote host, enumerated with `tcpdump --list-interfaces`
/// over ssh.
pub fn list_remote_interfaces(ssh: &SshConfig) -> Result<Vec<InterfaceInfo>, SourceError> {
    let mut command = std::process::Command::new("ssh");
    command
        .arg("-p")
        .arg(ssh.port.to_string())
        .arg("-o")
        .arg("BatchMode=yes");
    if !ssh.identity_file.is_empty() {
        command.arg("-i").arg(&ssh.identity_file);
    }
    command
        .arg(ssh.destination())
        .arg("tcpdump")
        .arg("--list-interfaces");

    let output = command.output().map_err(|err| SourceError::Unavailable {
        source: ssh.destination(),
        cause: err.to_string(),
    })?;
    if !output.status.success() {
        return Err(SourceError::Unavailable {
            source: ssh.destination(),
            cause: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(parse_tcpdump_interfaces(&String::from_utf8_lossy(
        &output.stdout,
    )))
}

/// Parse `tcpdump --list-interfaces` lines of the form
/// `1.eth0 [Up, Running]` or `2.lo (Loopback) [Up]`.
fn parse_tcpdump_interfaces(output: &str) -> Vec<InterfaceInfo> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let after_index = line.split_once('.')?.1;
            let name: String = after_index
                .chars()
                .take_while(|c| !c.is_whitespace() && *c != '(' && *c != '[')
                .collect();
            if name.is_empty() {
                return None;
            }
            let description = after_index
                .split_once('(')
                .and_then(|(_, rest)| rest.split_once(')'))
                .map(|(desc, _)| desc.to_string());
            Some(InterfaceInfo {
                name,
                description,
                addresses: Vec::new(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcpdump_listing() {
        let listing = "\
1.eth0 [Up, Running, Connected]
2.any (Pseudo-device that captures on all interfaces) [Up, Running]
3.lo [Up, Running, Loopback]
";
        let interfaces = parse_tcpdump_interfaces(listing);
        assert_eq!(interfaces.len(), 3);
        assert_eq!(interfaces[0].name, "eth0");
        assert_eq!(interfaces[1].name, "any");
        assert_eq!(
            interfaces[1].description.as_deref(),
            Some("Pseudo-device that captures on all interfaces")
        );
        assert_eq!(interfaces[2].description, None);
    }

    #[test]
    fn test_parse_ignores_garbage_lines() {
        assert!(parse_tcpdump_interfaces("no interfaces here\n\n").is_empty());
    }
}
