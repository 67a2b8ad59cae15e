use std::fmt;
use std::io;
use std::net::SocketAddrV4;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::net::socket::{self, Socket};

type NewConnectionCallback = Box<dyn FnMut(OwnedFd, SocketAddrV4) + Send>;

/// Owns the listening socket and hands accepted fds to the server.
///
/// Lives on the main loop. The listening socket is non-blocking and
/// close-on-exec, with address and port reuse enabled; `listen()` puts it
/// in LISTEN state and enables read interest on its channel.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    /// `None` only between `drop` and the posted teardown task.
    socket: Option<Socket>,
    channel: Arc<Channel>,
    listening: AtomicBool,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    /// Binds a listening socket for `listen_addr` on `event_loop`.
    pub fn new(
        event_loop: &Arc<EventLoop>,
        listen_addr: &SocketAddrV4,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new(socket::new_nonblocking_stream_socket()?);
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(true)?;
        socket.bind_addr(listen_addr)?;

        let channel = Channel::new(Arc::downgrade(event_loop), socket.fd());
        let acceptor = Arc::new(Acceptor {
            event_loop: Arc::clone(event_loop),
            socket: Some(socket),
            channel,
            listening: AtomicBool::new(false),
            new_connection_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    /// Installs the handoff invoked with each accepted `(fd, peer)` pair.
    pub fn set_new_connection_callback<F>(&self, callback: F)
    where
        F: FnMut(OwnedFd, SocketAddrV4) + Send + 'static,
    {
        *self.new_connection_callback.lock().unwrap() = Some(Box::new(callback));
    }

    /// Returns `true` once `listen` has run.
    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Starts listening and registers for read readiness. Must run on the
    /// owner loop's thread; a socket that cannot listen is a fatal startup
    /// condition.
    pub fn listen(&self) {
        self.listening.store(true, Ordering::Release);
        self.socket().listen().expect("listen failed");
        // Without read interest the listening fd would never be polled.
        self.channel.enable_reading();
    }

    /// The locally bound endpoint; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        socket::local_addr(self.socket().fd())
    }

    fn socket(&self) -> &Socket {
        self.socket.as_ref().expect("acceptor socket already torn down")
    }

    // Accepts a single connection per readiness event.
    fn handle_read(&self) {
        match self.socket().accept() {
            Ok((fd, peer)) => {
                let mut callback = self.new_connection_callback.lock().unwrap();
                match callback.as_mut() {
                    Some(callback) => callback(fd, peer),
                    // No handoff installed: the fd is closed on drop.
                    None => drop(fd),
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                trace!("accept raced with another readiness event");
            }
            Err(err) => {
                error!("accept error: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    error!("accept reached the process fd limit");
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Interest mutation belongs to the loop thread, and the fd must
        // stay open until it is deregistered, so the socket rides along
        // with the teardown task.
        let channel = Arc::clone(&self.channel);
        let socket = self.socket.take();
        self.event_loop.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
            drop(socket);
        });
    }
}

impl fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acceptor")
            .field("fd", &self.socket.as_ref().map(Socket::fd))
            .field("listening", &self.listening.load(Ordering::Relaxed))
            .finish()
    }
}
