use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info};

use crate::event_loop::EventLoop;
use crate::net::socket;
use crate::net::{
    Acceptor, ConnectionCallback, ConnectionCallbacks, HighWaterMarkCallback, MessageCallback,
    TcpConnection, TcpConnectionRef, WriteCompleteCallback, DEFAULT_HIGH_WATER_MARK,
};
use crate::pool::EventLoopPool;

/// Multi-threaded TCP server facade.
///
/// Binds an [`Acceptor`] on the caller's main loop and distributes
/// accepted connections across a pool of worker loops, picked per peer by
/// consistent hashing so a given peer address always lands on the same
/// worker. Connections are kept in a name-keyed map owned by the main
/// loop; workers post evictions back to it.
///
/// Register callbacks and the thread count before [`start`], then drive
/// the main loop with [`EventLoop::run`].
///
/// [`start`]: TcpServer::start
pub struct TcpServer {
    self_weak: Weak<TcpServer>,
    event_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopPool>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    high_water_mark: AtomicUsize,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionRef>>,
}

impl TcpServer {
    /// Creates a server listening on `listen_addr`, with its acceptor on
    /// `event_loop`.
    pub fn new(
        event_loop: Arc<EventLoop>,
        listen_addr: &SocketAddrV4,
        name: &str,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(&event_loop, listen_addr)?;
        let pool = EventLoopPool::new(Arc::clone(&event_loop), name);

        let server = Arc::new_cyclic(|self_weak: &Weak<TcpServer>| TcpServer {
            self_weak: self_weak.clone(),
            event_loop,
            ip_port: listen_addr.to_string(),
            name: name.to_owned(),
            acceptor,
            pool: Mutex::new(pool),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&server);
        server.acceptor.set_new_connection_callback(move |fd, peer| {
            if let Some(server) = weak.upgrade() {
                server.new_connection(fd, peer);
            }
        });
        Ok(server)
    }

    /// The server's name, used as the prefix of connection names.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Text form of the configured listen endpoint.
    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The actually bound endpoint (resolves port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        self.acceptor.local_addr()
    }

    /// Number of worker loops; zero keeps everything on the main loop.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.pool.lock().unwrap().set_thread_num(num_threads);
    }

    /// Observes connection UP/DOWN edges.
    pub fn set_connection_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionRef) + Send + Sync + 'static,
    {
        *self.connection_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Receives arriving bytes.
    pub fn set_message_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionRef, &mut crate::Buffer, crate::Timestamp) + Send + Sync + 'static,
    {
        *self.message_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Notified each time a connection's output buffer fully drains.
    pub fn set_write_complete_callback<F>(&self, callback: F)
    where
        F: Fn(&TcpConnectionRef) + Send + Sync + 'static,
    {
        *self.write_complete_callback.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Backpressure callback, fired when pending output first reaches
    /// `high_water_mark` bytes.
    pub fn set_high_water_mark_callback<F>(&self, callback: F, high_water_mark: usize)
    where
        F: Fn(&TcpConnectionRef, usize) + Send + Sync + 'static,
    {
        *self.high_water_mark_callback.lock().unwrap() = Some(Arc::new(callback));
        self.high_water_mark.store(high_water_mark, Ordering::Relaxed);
    }

    /// Starts the worker pool and begins listening. Idempotent.
    pub fn start(&self) {
        if !self.started.swap(true, Ordering::AcqRel) {
            info!("TcpServer {} starting on {}", self.name, self.ip_port);
            self.pool.lock().unwrap().start();

            let acceptor = Arc::clone(&self.acceptor);
            self.event_loop.run_in_loop(move || acceptor.listen());
        }
    }

    // Handoff from the acceptor; runs on the main loop.
    fn new_connection(&self, sockfd: OwnedFd, peer_addr: SocketAddrV4) {
        let io_loop = self
            .pool
            .lock()
            .unwrap()
            .get_next_loop(&peer_addr.to_string());

        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, id);
        debug!(
            "TcpServer::new_connection [{}] from {}",
            conn_name, peer_addr
        );

        let local_addr = socket::local_addr(sockfd.as_raw_fd()).unwrap_or_else(|err| {
            error!("getsockname error: {}", err);
            SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)
        });

        let weak = self.self_weak.clone();
        let close: ConnectionCallback = Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        });
        let callbacks = ConnectionCallbacks {
            connection: self.connection_callback.lock().unwrap().clone(),
            message: self.message_callback.lock().unwrap().clone(),
            write_complete: self.write_complete_callback.lock().unwrap().clone(),
            high_water_mark: self.high_water_mark_callback.lock().unwrap().clone(),
            high_water_mark_threshold: self.high_water_mark.load(Ordering::Relaxed),
            close: Some(close),
        };

        let conn = TcpConnection::new(
            Arc::clone(&io_loop),
            conn_name.clone(),
            sockfd,
            local_addr,
            peer_addr,
            callbacks,
        );
        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, Arc::clone(&conn));

        io_loop.run_in_loop(move || conn.connect_established());
    }

    // Close callback of every connection; may run on a worker loop.
    fn remove_connection(&self, conn: &TcpConnectionRef) {
        let weak = self.self_weak.clone();
        let conn = Arc::clone(conn);
        self.event_loop.run_in_loop(move || {
            if let Some(server) = weak.upgrade() {
                server.remove_connection_in_loop(&conn);
            }
        });
    }

    // Evicts from the map on the main loop, then finishes teardown on the
    // connection's own loop.
    fn remove_connection_in_loop(&self, conn: &TcpConnectionRef) {
        debug!(
            "TcpServer::remove_connection [{}] of {}",
            conn.name(),
            self.name
        );
        self.connections.lock().unwrap().remove(conn.name());

        let io_loop = Arc::clone(conn.owner_loop());
        let conn = Arc::clone(conn);
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections = mem::take(&mut *self.connections.lock().unwrap());
        for (_, conn) in connections {
            let owner = Arc::clone(conn.owner_loop());
            owner.run_in_loop(move || conn.connect_destroyed());
        }
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("name", &self.name)
            .field("ip_port", &self.ip_port)
            .field("started", &self.started.load(Ordering::Relaxed))
            .finish()
    }
}
