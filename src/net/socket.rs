use std::io;
use std::mem::{size_of, MaybeUninit};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::error;

pub(crate) fn to_sockaddr_in(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    }
}

pub(crate) fn from_sockaddr_in(addr: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(addr.sin_port),
    )
}

/// Creates a non-blocking, close-on-exec TCP socket.
pub(crate) fn new_nonblocking_stream_socket() -> io::Result<OwnedFd> {
    let fd = syscall!(socket(
        libc::AF_INET,
        libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        libc::IPPROTO_TCP
    ))?;
    // SAFETY: `socket(2)` returned a valid, owned fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Returns the locally bound address of `fd`.
pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut storage = MaybeUninit::<libc::sockaddr_in>::zeroed();
    let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
    syscall!(getsockname(
        fd,
        storage.as_mut_ptr() as *mut libc::sockaddr,
        &mut len
    ))?;
    // SAFETY: `getsockname(2)` initialised the storage.
    Ok(from_sockaddr_in(&unsafe { storage.assume_init() }))
}

/// Reads and clears the pending socket error (`SO_ERROR`).
pub(crate) fn socket_error(fd: RawFd) -> i32 {
    let mut optval: libc::c_int = 0;
    let mut optlen = size_of::<libc::c_int>() as libc::socklen_t;
    match syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut optval as *mut libc::c_int as *mut libc::c_void,
        &mut optlen
    )) {
        Ok(_) => optval,
        Err(err) => err.raw_os_error().unwrap_or(0),
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let optval: libc::c_int = on as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        opt,
        &optval as *const libc::c_int as *const libc::c_void,
        size_of::<libc::c_int>() as libc::socklen_t
    ))
    .map(|_| ())
}

/// Thin ownership wrapper over a TCP socket fd.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub(crate) fn new(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn bind_addr(&self, addr: &SocketAddrV4) -> io::Result<()> {
        let raw = to_sockaddr_in(addr);
        syscall!(bind(
            self.fd(),
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t
        ))
        .map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd(), libc::SOMAXCONN)).map(|_| ())
    }

    /// Accepts one pending connection; the returned fd is non-blocking and
    /// close-on-exec.
    pub(crate) fn accept(&self) -> io::Result<(OwnedFd, SocketAddrV4)> {
        let mut storage = MaybeUninit::<libc::sockaddr_in>::zeroed();
        let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd(),
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC
        ))?;
        // SAFETY: `accept4(2)` returned a valid fd and filled the address.
        let peer = from_sockaddr_in(&unsafe { storage.assume_init() });
        Ok((unsafe { OwnedFd::from_raw_fd(fd) }, peer))
    }

    /// Half-closes the write end; the peer will observe EOF after draining
    /// everything already sent.
    pub(crate) fn shutdown_write(&self) {
        if let Err(err) = syscall!(shutdown(self.fd(), libc::SHUT_WR)) {
            error!("shutdown(SHUT_WR) error on fd {}: {}", self.fd(), err);
        }
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_round_trip() {
        let addr = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 40001);
        let raw = to_sockaddr_in(&addr);
        assert_eq!(from_sockaddr_in(&raw), addr);
    }

    #[test]
    fn bind_listen_local_addr() {
        let socket = Socket::new(new_nonblocking_stream_socket().unwrap());
        socket.set_reuse_addr(true).unwrap();
        socket
            .bind_addr(&SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        socket.listen().unwrap();

        let bound = local_addr(socket.fd()).unwrap();
        assert_eq!(*bound.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(bound.port(), 0);
    }
}
