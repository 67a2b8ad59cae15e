use std::io;
use std::os::fd::RawFd;

/// Reserved space in front of the read cursor so a protocol header can be
/// prepended without copying the payload.
const CHEAP_PREPEND: usize = 8;
/// Initial readable/writable capacity, excluding the prepend zone.
const INITIAL_SIZE: usize = 1024;

/// Growable byte buffer with separate read and write cursors.
///
/// The underlying region is laid out as
///
/// ```text
/// +------------------+------------------+------------------+
/// | prependable      | readable         | writable         |
/// +------------------+------------------+------------------+
/// 0            reader_index        writer_index        capacity
/// ```
///
/// with `prependable <= reader_index <= writer_index <= capacity` at all
/// times. Retrieving everything resets both cursors back to the prepend
/// boundary, so `prependable() >= 8` holds after construction and after
/// `retrieve_all`.
#[derive(Debug, Clone)]
pub struct Buffer {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
}

impl Default for Buffer {
    fn default() -> Buffer {
        Buffer::new()
    }
}

impl Buffer {
    /// Creates a buffer with the default initial capacity.
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    /// Creates a buffer with `initial` bytes of writable space.
    pub fn with_capacity(initial: usize) -> Buffer {
        Buffer {
            buf: vec![0; CHEAP_PREPEND + initial],
            reader_index: CHEAP_PREPEND,
            writer_index: CHEAP_PREPEND,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be appended without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.writer_index
    }

    /// Number of bytes in front of the read cursor.
    pub fn prependable_bytes(&self) -> usize {
        self.reader_index
    }

    /// Returns the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.reader_index..self.writer_index]
    }

    /// Consumes `len` readable bytes. Consuming everything resets the
    /// cursors to the prepend boundary.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.reader_index += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Discards all readable bytes and reclaims the prepend zone.
    pub fn retrieve_all(&mut self) {
        self.reader_index = CHEAP_PREPEND;
        self.writer_index = CHEAP_PREPEND;
    }

    /// Consumes `len` readable bytes and returns them as a `String` (lossy
    /// on invalid UTF-8).
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        debug_assert!(len <= self.readable_bytes());
        let s = String::from_utf8_lossy(&self.peek()[..len]).into_owned();
        self.retrieve(len);
        s
    }

    /// Consumes the whole readable region as a `String`.
    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable_bytes())
    }

    /// Appends `data` after the write cursor, growing or compacting first
    /// if the writable region is too small.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable_bytes(data.len());
        let start = self.writer_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
        self.writer_index += data.len();
    }

    /// Writes `data` immediately in front of the read cursor.
    ///
    /// Callers must leave enough prependable space; the 8-byte reserve
    /// covers fixed-size length headers.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable_bytes());
        self.reader_index -= data.len();
        let start = self.reader_index;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    /// Makes room for at least `len` writable bytes.
    pub fn ensure_writable_bytes(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
    }

    fn make_space(&mut self, len: usize) {
        if self.writable_bytes() + self.prependable_bytes() < len + CHEAP_PREPEND {
            self.buf.resize(self.writer_index + len, 0);
        } else {
            // Enough slack before the read cursor: shift the readable
            // window back to the prepend boundary instead of growing.
            let readable = self.readable_bytes();
            self.buf
                .copy_within(self.reader_index..self.writer_index, CHEAP_PREPEND);
            self.reader_index = CHEAP_PREPEND;
            self.writer_index = CHEAP_PREPEND + readable;
        }
    }

    /// Reads from `fd` into the buffer using scatter-gather I/O.
    ///
    /// Data lands in the writable window first, overflowing into a 64 KiB
    /// stack buffer that is appended afterwards, so one syscall can pull in
    /// far more than the current writable capacity. When the writable
    /// window alone is at least 64 KiB the stack extension is skipped.
    pub fn read_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extrabuf = [0u8; 65536];
        let writable = self.writable_bytes();

        let mut iov = [
            libc::iovec {
                iov_base: self.buf[self.writer_index..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extrabuf.as_mut_ptr() as *mut libc::c_void,
                iov_len: extrabuf.len(),
            },
        ];
        let iovcnt = if writable < extrabuf.len() { 2 } else { 1 };

        let n = syscall!(readv(fd, iov.as_mut_ptr(), iovcnt))? as usize;
        if n <= writable {
            self.writer_index += n;
        } else {
            self.writer_index = self.buf.len();
            self.append(&extrabuf[..n - writable]);
        }
        Ok(n)
    }

    /// Writes the readable region to `fd`. The cursor is *not* advanced;
    /// callers retrieve the number of bytes actually written.
    pub fn write_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let n = syscall!(write(
            fd,
            self.peek().as_ptr() as *const libc::c_void,
            self.readable_bytes(),
        ))?;
        Ok(n as usize)
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_invariant(buf: &Buffer) {
        assert_eq!(
            buf.readable_bytes() + buf.writable_bytes() + buf.prependable_bytes(),
            buf.capacity()
        );
    }

    #[test]
    fn fresh_buffer_reserves_prepend() {
        let buf = Buffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        check_invariant(&buf);
    }

    #[test]
    fn append_peek_retrieve_round_trip() {
        let mut buf = Buffer::new();
        buf.append(b"hello, world");
        assert_eq!(buf.peek(), b"hello, world");
        check_invariant(&buf);

        buf.retrieve(7);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 7);
        check_invariant(&buf);

        buf.retrieve(5);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn retrieve_all_as_string() {
        let mut buf = Buffer::new();
        buf.append(b"hello\n");
        assert_eq!(buf.retrieve_all_as_string(), "hello\n");
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    }

    #[test]
    fn grows_when_needed() {
        let mut buf = Buffer::with_capacity(16);
        let data = vec![b'x'; 1000];
        buf.append(&data);
        assert_eq!(buf.readable_bytes(), 1000);
        assert_eq!(buf.peek(), &data[..]);
        check_invariant(&buf);
    }

    #[test]
    fn compacts_instead_of_growing() {
        let mut buf = Buffer::with_capacity(64);
        buf.append(&[b'a'; 60]);
        buf.retrieve(50);
        let cap = buf.capacity();
        // 10 readable left; 50 + 8 slack in front. Appending 40 fits after
        // compaction without a reallocation.
        buf.append(&[b'b'; 40]);
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.readable_bytes(), 50);
        assert_eq!(&buf.peek()[..10], &[b'a'; 10]);
        check_invariant(&buf);
    }

    #[test]
    fn prepend_header() {
        let mut buf = Buffer::new();
        buf.append(b"payload");
        let len = (buf.readable_bytes() as u32).to_be_bytes();
        buf.prepend(&len);
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(&buf.peek()[..4], &7u32.to_be_bytes());
        assert_eq!(&buf.peek()[4..], b"payload");
    }

    #[test]
    fn read_fd_uses_stack_extension() {
        // A pipe filled with more data than the writable window forces the
        // overflow path.
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let data = vec![b'z'; 4096];
        let written = unsafe {
            libc::write(fds[1], data.as_ptr() as *const libc::c_void, data.len())
        };
        assert_eq!(written, 4096);

        let mut buf = Buffer::with_capacity(100);
        let n = buf.read_fd(fds[0]).unwrap();
        assert_eq!(n, 4096);
        assert_eq!(buf.readable_bytes(), 4096);
        assert_eq!(buf.peek(), &data[..]);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
