pub mod connection_builder;
pub mod stream_assembler;
pub mod types;

pub use connection_builder::ConnectionBuilder;
pub use stream_assembler::StreamAssembler;
pub use types::{CloseReason, Endpoint, FlowKey, Segment, SegmentFlags, Side, TcpPacket};
