use std::any::Any;
use std::fmt;
use std::fs::File;
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, trace};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::socket::{self, Socket};
use crate::net::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    WriteCompleteCallback,
};
use crate::time::Timestamp;

/// Default output-buffer backpressure threshold: 64 MiB.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            1 => State::Connected,
            2 => State::Disconnecting,
            3 => State::Disconnected,
            _ => State::Connecting,
        }
    }
}

pub(crate) struct ConnectionCallbacks {
    pub(crate) connection: Option<ConnectionCallback>,
    pub(crate) message: Option<MessageCallback>,
    pub(crate) write_complete: Option<WriteCompleteCallback>,
    pub(crate) high_water_mark: Option<HighWaterMarkCallback>,
    pub(crate) high_water_mark_threshold: usize,
    pub(crate) close: Option<ConnectionCallback>,
}

/// An accepted TCP peer with its buffers and state machine.
///
/// Connections are shared (`Arc`): the server keeps one reference in its
/// name-keyed map, callbacks receive another, and the channel tether holds
/// one for the duration of each dispatch burst so a connection can never
/// be destroyed in the middle of its own callbacks.
///
/// States move Connecting -> Connected -> Disconnecting -> Disconnected
/// (with a direct drop to Disconnected on error or peer close). All state
/// and buffer mutation happens on the owner loop's thread; [`send`],
/// [`send_file`] and [`shutdown`] may be called from anywhere and route
/// themselves there.
///
/// [`send`]: TcpConnection::send
/// [`send_file`]: TcpConnection::send_file
/// [`shutdown`]: TcpConnection::shutdown
pub struct TcpConnection {
    self_weak: Weak<TcpConnection>,
    event_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    /// Whether read events are being delivered; toggled by
    /// `start_read`/`stop_read`.
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddrV4,
    peer_addr: SocketAddrV4,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: usize,
    connection_callback: Option<ConnectionCallback>,
    message_callback: Option<MessageCallback>,
    write_complete_callback: Option<WriteCompleteCallback>,
    high_water_mark_callback: Option<HighWaterMarkCallback>,
    close_callback: Option<ConnectionCallback>,
}

impl TcpConnection {
    pub(crate) fn new(
        event_loop: Arc<EventLoop>,
        name: String,
        sockfd: OwnedFd,
        local_addr: SocketAddrV4,
        peer_addr: SocketAddrV4,
        callbacks: ConnectionCallbacks,
    ) -> Arc<TcpConnection> {
        let socket = Socket::new(sockfd);
        if let Err(err) = socket.set_keep_alive(true) {
            error!("SO_KEEPALIVE error on fd {}: {}", socket.fd(), err);
        }

        let owner = Arc::downgrade(&event_loop);
        let connection = Arc::new_cyclic(|self_weak: &Weak<TcpConnection>| {
            let channel = Channel::new(owner, socket.fd());
            debug!("TcpConnection::new [{}] fd {}", name, socket.fd());
            TcpConnection {
                self_weak: self_weak.clone(),
                event_loop,
                name,
                state: AtomicU8::new(State::Connecting as u8),
                reading: AtomicBool::new(true),
                socket,
                channel,
                local_addr,
                peer_addr,
                input_buffer: Mutex::new(Buffer::new()),
                output_buffer: Mutex::new(Buffer::new()),
                high_water_mark: callbacks.high_water_mark_threshold,
                connection_callback: callbacks.connection,
                message_callback: callbacks.message,
                write_complete_callback: callbacks.write_complete,
                high_water_mark_callback: callbacks.high_water_mark,
                close_callback: callbacks.close,
            }
        });

        let weak = Arc::downgrade(&connection);
        connection.channel.set_read_callback(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        });
        let weak = Arc::downgrade(&connection);
        connection.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Arc::downgrade(&connection);
        connection.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Arc::downgrade(&connection);
        connection.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        connection
    }

    /// The unique name the server assigned to this connection.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local endpoint of the accepted socket.
    pub fn local_addr(&self) -> &SocketAddrV4 {
        &self.local_addr
    }

    /// Remote peer endpoint.
    pub fn peer_addr(&self) -> &SocketAddrV4 {
        &self.peer_addr
    }

    /// The loop this connection lives on.
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    /// Returns `true` while the connection is fully established.
    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// Enables or disables Nagle's algorithm on the socket.
    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Returns `true` while read events are being delivered.
    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Resumes read-event delivery after [`stop_read`].
    ///
    /// [`stop_read`]: TcpConnection::stop_read
    pub fn start_read(&self) {
        let conn = self.shared();
        self.event_loop.run_in_loop(move || {
            if !conn.reading.load(Ordering::Acquire) || !conn.channel.is_reading() {
                conn.channel.enable_reading();
                conn.reading.store(true, Ordering::Release);
            }
        });
    }

    /// Pauses read-event delivery. Arriving bytes queue up in the kernel
    /// (and, once its buffers fill, push back on the peer) until
    /// [`start_read`] resumes delivery.
    ///
    /// [`start_read`]: TcpConnection::start_read
    pub fn stop_read(&self) {
        let conn = self.shared();
        self.event_loop.run_in_loop(move || {
            if conn.reading.load(Ordering::Acquire) || conn.channel.is_reading() {
                conn.channel.disable_reading();
                conn.reading.store(false, Ordering::Release);
            }
        });
    }

    /// Sends `data` to the peer.
    ///
    /// On the owner loop's thread the bytes are written (or buffered)
    /// immediately; from any other thread they are copied and posted to
    /// the loop. Silently drops data once the connection is no longer
    /// established.
    pub fn send(&self, data: &[u8]) {
        if self.state() == State::Connected {
            if self.event_loop.is_in_loop_thread() {
                self.send_in_loop(data);
            } else {
                let conn = self.shared();
                let data = data.to_vec();
                self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
            }
        }
    }

    /// Transfers `count` bytes of `file` starting at `offset` with
    /// `sendfile(2)`, bypassing user-space copies.
    ///
    /// A partial transfer re-posts itself with the advanced offset instead
    /// of buffering — the file itself backs the remaining data.
    pub fn send_file(&self, file: Arc<File>, offset: i64, count: usize) {
        if self.state() == State::Connected {
            if self.event_loop.is_in_loop_thread() {
                self.send_file_in_loop(file, offset, count);
            } else {
                let conn = self.shared();
                self.event_loop
                    .run_in_loop(move || conn.send_file_in_loop(file, offset, count));
            }
        } else {
            error!("TcpConnection::send_file [{}] - not connected", self.name);
        }
    }

    /// Half-closes the write end once all pending output has drained.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.shared();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Completes establishment on the owner loop: tethers the channel to
    /// this connection, enables read interest and reports the UP edge.
    pub(crate) fn connect_established(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        self.set_state(State::Connected);
        let tether: Arc<dyn Any + Send + Sync> = self.shared();
        self.channel.tie(&tether);
        self.channel.enable_reading();

        if let Some(callback) = &self.connection_callback {
            callback(&self.shared());
        }
    }

    /// Final teardown on the owner loop; removes the channel from the
    /// multiplexer. Safe to call after `handle_close` already ran.
    pub(crate) fn connect_destroyed(&self) {
        debug_assert!(self.event_loop.is_in_loop_thread());
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(callback) = &self.connection_callback {
                callback(&self.shared());
            }
        }
        self.channel.remove();
    }

    // The equivalent of shared_from_this: every caller of these methods
    // reaches them through a live Arc, so the upgrade cannot fail.
    fn shared(&self) -> TcpConnectionRef {
        self.self_weak
            .upgrade()
            .expect("TcpConnection accessed without a live shared reference")
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn handle_read(&self, receive_time: Timestamp) {
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.channel.fd()) {
            Ok(0) => {
                // Peer closed its write end.
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                if let Some(callback) = &self.message_callback {
                    callback(&self.shared(), &mut input, receive_time);
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        if !self.channel.is_writing() {
            trace!("fd {} is down, no more writing", self.channel.fd());
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match output.write_fd(self.channel.fd()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    drop(output);
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == State::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("TcpConnection::handle_write [{}]: {}", self.name, err),
        }
    }

    fn handle_close(&self) {
        debug!(
            "TcpConnection::handle_close [{}] state {:?}",
            self.name,
            self.state()
        );
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        // Both callbacks observe a live shared reference.
        let conn = self.shared();
        if let Some(callback) = &self.connection_callback {
            callback(&conn);
        }
        if let Some(callback) = &self.close_callback {
            callback(&conn);
        }
    }

    fn handle_error(&self) {
        let err = socket::socket_error(self.channel.fd());
        error!(
            "TcpConnection::handle_error [{}] SO_ERROR = {}",
            self.name, err
        );
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.state() == State::Disconnected {
            error!("[{}] disconnected, give up writing", self.name);
            return;
        }

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        // Try a direct write when nothing is queued ahead of this data.
        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match syscall!(write(
                self.channel.fd(),
                data.as_ptr() as *const libc::c_void,
                data.len()
            )) {
                Ok(n) => {
                    nwrote = n as usize;
                    remaining = data.len() - nwrote;
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                        if matches!(
                            err.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            let mut output = self.output_buffer.lock().unwrap();
            let old_len = output.readable_bytes();
            // Fire only on the strict upward crossing of the watermark.
            if old_len + remaining >= self.high_water_mark && old_len < self.high_water_mark {
                if let Some(callback) = &self.high_water_mark_callback {
                    let callback = Arc::clone(callback);
                    let conn = self.shared();
                    let pending = old_len + remaining;
                    self.event_loop
                        .queue_in_loop(move || callback(&conn, pending));
                }
            }
            output.append(&data[nwrote..]);
            drop(output);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn send_file_in_loop(&self, file: Arc<File>, offset: i64, count: usize) {
        if self.state() == State::Disconnected {
            error!("[{}] disconnected, give up sending file", self.name);
            return;
        }

        let mut offset = offset;
        let mut remaining = count;
        let mut fault = false;

        if !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0 {
            match syscall!(sendfile(
                self.channel.fd(),
                file.as_raw_fd(),
                &mut offset,
                remaining
            )) {
                Ok(n) => {
                    remaining -= n as usize;
                    if remaining == 0 {
                        self.queue_write_complete();
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_file_in_loop [{}]: {}", self.name, err);
                    }
                    if matches!(
                        err.raw_os_error(),
                        Some(libc::EPIPE) | Some(libc::ECONNRESET)
                    ) {
                        fault = true;
                    }
                }
            }
        }

        if !fault && remaining > 0 {
            // The file backs the unsent bytes; re-post with the advanced
            // offset instead of copying into the output buffer.
            let conn = self.shared();
            self.event_loop
                .queue_in_loop(move || conn.send_file_in_loop(file, offset, remaining));
        }
    }

    fn shutdown_in_loop(&self) {
        // Defer the half-close until handle_write drains the output.
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    fn queue_write_complete(&self) {
        if let Some(callback) = &self.write_complete_callback {
            let callback = Arc::clone(callback);
            let conn = self.shared();
            self.event_loop.queue_in_loop(move || callback(&conn));
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd {} state {:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
    }
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("fd", &self.channel.fd())
            .field("state", &self.state())
            .field("peer", &self.peer_addr)
            .finish()
    }
}
