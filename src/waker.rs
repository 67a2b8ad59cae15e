use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use log::error;

/// Cross-thread wakeup handle backed by `eventfd`.
///
/// `eventfd` is effectively a 64 bit counter. All writes must be of 8
/// bytes (64 bits) and are added to the count; reads must also be 8 bytes
/// and reset the count to 0. One waker is owned by each event loop and its
/// fd is registered with the loop's multiplexer for read interest, so a
/// write from any thread unblocks a pending poll.
#[derive(Debug)]
pub(crate) struct Waker {
    fd: File,
}

impl Waker {
    pub(crate) fn new() -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        // SAFETY: `eventfd(2)` returned a valid, owned fd.
        let file = unsafe { File::from_raw_fd(fd) };
        Ok(Waker { fd: file })
    }

    pub(crate) fn wake(&self) {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(8) => {}
            Ok(n) => error!("waker wrote {} bytes instead of 8", n),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter would overflow; reset
                // it and try once more.
                self.drain();
                let _ = (&self.fd).write(&buf);
            }
            Err(err) => error!("waker write error: {}", err),
        }
    }

    /// Consumes the pending counter; the loop's read callback for the
    /// wakeup channel.
    pub(crate) fn drain(&self) {
        let mut buf: [u8; 8] = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf) {
            Ok(8) => {}
            Ok(n) => error!("waker read {} bytes instead of 8", n),
            // Not yet woken; nothing to consume.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("waker read error: {}", err),
        }
    }
}

impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
