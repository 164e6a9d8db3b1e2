pub mod interfaces;
pub mod live_capture;
pub mod remote;

pub use interfaces::{list_interfaces, list_remote_interfaces};
pub use live_capture::LiveCaptureManager;
