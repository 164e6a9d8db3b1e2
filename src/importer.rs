pub mod pcap_importer;
pub mod session;

pub use pcap_importer::PcapImporter;
pub use session::{ImportSession, SessionProgress};
