//! Multi-threaded reactor-style TCP server framework.
//!
//! Muon runs one event loop per thread over an epoll-backed readiness
//! multiplexer. A main loop owns the listening socket; accepted
//! connections are distributed across a pool of worker loops by a
//! consistent-hash ring keyed on the peer address, so every connection is
//! driven by exactly one thread for its whole life. Applications plug in
//! through per-connection callbacks (up/down, message, write-complete,
//! high-watermark backpressure) and timed callbacks on any loop.
//!
//! # Example
//!
//! An echo server:
//!
//! ```no_run
//! use std::net::{Ipv4Addr, SocketAddrV4};
//!
//! use muon::{EventLoop, TcpServer};
//!
//! fn main() -> std::io::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!     let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 8080);
//!     let server = TcpServer::new(event_loop.clone(), &addr, "echo")?;
//!
//!     server.set_message_callback(|conn, buffer, _receive_time| {
//!         let msg = buffer.retrieve_all_as_string();
//!         conn.send(msg.as_bytes());
//!     });
//!     server.set_thread_num(3);
//!     server.start();
//!
//!     event_loop.run();
//!     Ok(())
//! }
//! ```
//!
//! # Platform support
//!
//! Linux (and Android) only: the implementation relies on `epoll`,
//! `eventfd`, `timerfd` and `sendfile`.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

#[cfg(not(any(target_os = "linux", target_os = "android")))]
compile_error!("muon requires the epoll/eventfd/timerfd family of Linux syscalls");

#[macro_use]
mod macros;

mod buffer;
mod channel;
mod event_loop;
pub mod net;
mod pool;
mod poller;
mod ring;
mod time;
mod timer;
mod waker;

pub use crate::buffer::Buffer;
pub use crate::channel::Channel;
pub use crate::event_loop::EventLoop;
pub use crate::net::{TcpConnection, TcpConnectionRef, TcpServer};
pub use crate::pool::{EventLoopPool, EventLoopThread};
pub use crate::poller::{EpollPoller, Poller};
pub use crate::ring::{ConsistentHash, RingEmpty};
pub use crate::time::Timestamp;
pub use crate::timer::TimerId;
