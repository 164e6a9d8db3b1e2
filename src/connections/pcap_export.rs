//! On-demand per-connection pcap slices.
//!
//! The packets of one connection are carved out of the archived session
//! pcaps it was processed from: a BPF filter on the connection's endpoints
//! plus a time-window check, written to `connections/<id>.pcap`.

use std::path::{Path, PathBuf};

use log::debug;
use pcap::Capture;

use crate::connections::types::Connection;
use crate::error_handling::types::SourceError;
use crate::importer::pcap_importer::timeval_to_datetime;

/// Slack around the connection's lifetime when matching packet timestamps;
/// absorbs capture-clock jitter at the window edges.
const TIME_SLACK_MS: i64 = 1_000;

pub fn export_connection_pcap(
    connection: &Connection,
    pcaps_dir: &Path,
    connections_dir: &Path,
) -> Result<PathBuf, SourceError> {
    std::fs::create_dir_all(connections_dir)?;
    let out_path = connections_dir.join(format!("{}.pcap", connection.id));

    let filter = format!(
        "tcp and host {} and port {} and host {} and port {}",
        connection.client.ip, connection.client.port, connection.server.ip, connection.server.port
    );
    let window_start = connection.started_at - chrono::Duration::milliseconds(TIME_SLACK_MS);
    let window_end = connection.closed_at + chrono::Duration::milliseconds(TIME_SLACK_MS);

    let mut savefile = None;
    let mut packets_written = 0u64;
    for session in &connection.processed_by {
        let source = pcaps_dir.join(format!("{}.pcap", session.to_hex()));
        if !source.is_file() {
            continue;
        }
        let mut capture = Capture::from_file(&source)?;
        capture.filter(&filter, true)?;
        loop {
            let packet = match capture.next_packet() {
                Ok(packet) => packet,
                Err(pcap::Error::NoMorePackets) => break,
                Err(err) => return Err(err.into()),
            };
            let timestamp = timeval_to_datetime(
                packet.header.ts.tv_sec as i64,
                packet.header.ts.tv_usec as i64,
            );
            if timestamp < window_start || timestamp > window_end {
                continue;
            }
            let header = *packet.header;
            let data = packet.data.to_vec();
            if savefile.is_none() {
                savefile = Some(capture.savefile(&out_path)?);
            }
            if let Some(savefile) = savefile.as_mut() {
                savefile.write(&pcap::Packet::new(&header, &data));
                packets_written += 1;
            }
        }
    }

    let mut savefile = savefile.ok_or_else(|| SourceError::Unavailable {
        source: connection.id.to_hex(),
        cause: "no archived packets for this connection".to_string(),
    })?;
    savefile.flush().map_err(SourceError::from)?;
    debug!(
        "connection {}: exported {} packets to {}",
        connection.id,
        packets_written,
        out_path.display()
    );
    Ok(out_path)
}
