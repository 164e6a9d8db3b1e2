pub mod controller;
pub mod pcap_export;
pub mod streams;
pub mod types;

pub use controller::ConnectionsController;
pub use streams::StreamsController;
pub use types::{Connection, ConnectionsFilter, MessageFormat, StoredMessage};
