pub mod connection;
pub mod operations;
pub mod sink;

pub use operations::PostgresSink;
pub use sink::{Sink, SinkConnectError, WriteError};
