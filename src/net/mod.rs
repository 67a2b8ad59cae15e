//! TCP building blocks: acceptor, connection, server facade and the
//! application-visible callback types.

use std::sync::Arc;

use crate::buffer::Buffer;
use crate::time::Timestamp;

mod acceptor;
mod connection;
mod server;
pub(crate) mod socket;

pub use self::acceptor::Acceptor;
pub use self::connection::{TcpConnection, DEFAULT_HIGH_WATER_MARK};
pub use self::server::TcpServer;

pub(crate) use self::connection::ConnectionCallbacks;

/// Shared handle to a connection, handed to every application callback.
pub type TcpConnectionRef = Arc<TcpConnection>;

/// Observes both edges of a connection: called once when it comes up
/// (`is_connected()` true) and once when it goes down.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Called with the input buffer and the poll-return receive time whenever
/// bytes arrive. Framing above raw TCP is the application's business.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync>;

/// Called after the output buffer fully drains to the kernel.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Called with the pending byte count when queued output first crosses the
/// high-watermark threshold from below.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;
