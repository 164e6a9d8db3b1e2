pub mod dispatcher;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use worker::WorkerMessage;
