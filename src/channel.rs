use std::any::Any;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::trace;

use crate::event_loop::EventLoop;
use crate::time::Timestamp;

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::EPOLLIN | libc::EPOLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::EPOLLOUT as u32;

/// Relationship between a channel and the multiplexer it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PollerIndex {
    /// Never registered with the multiplexer.
    New = 0,
    /// Known to the kernel and present in the fd map.
    Added = 1,
    /// In the fd map but removed from the kernel (empty interest mask).
    Deleted = 2,
}

impl PollerIndex {
    fn from_u8(v: u8) -> PollerIndex {
        match v {
            1 => PollerIndex::Added,
            2 => PollerIndex::Deleted,
            _ => PollerIndex::New,
        }
    }
}

type ReadCallback = Box<dyn FnMut(Timestamp) + Send>;
type EventCallback = Box<dyn FnMut() + Send>;

/// Registration record binding a file descriptor to per-event callbacks
/// within one [`EventLoop`].
///
/// A channel never owns its fd; the owning object (acceptor, connection,
/// the loop's wakeup and timer handles) creates the channel, installs the
/// callbacks, and drives the interest mask. Interest mutation must happen
/// on the owner loop's thread, and a channel must be removed from the
/// multiplexer before it is dropped.
pub struct Channel {
    self_weak: Weak<Channel>,
    owner: Weak<EventLoop>,
    fd: RawFd,
    /// Registered interest mask (epoll event bits).
    events: AtomicU32,
    /// Ready mask filled in by the poller just before dispatch.
    revents: AtomicU32,
    index: AtomicU8,
    /// Keeps the owning object alive for the duration of a dispatch burst.
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
    read_callback: Mutex<Option<ReadCallback>>,
    write_callback: Mutex<Option<EventCallback>>,
    close_callback: Mutex<Option<EventCallback>>,
    error_callback: Mutex<Option<EventCallback>>,
}

impl Channel {
    /// Creates an unregistered channel for `fd` on `owner`.
    pub(crate) fn new(owner: Weak<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            self_weak: self_weak.clone(),
            owner,
            fd,
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(NONE_EVENT),
            index: AtomicU8::new(PollerIndex::New as u8),
            tie: Mutex::new(None),
            read_callback: Mutex::new(None),
            write_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
            error_callback: Mutex::new(None),
        })
    }

    /// The file descriptor this channel watches.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Relaxed)
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    pub(crate) fn index(&self) -> PollerIndex {
        PollerIndex::from_u8(self.index.load(Ordering::Relaxed))
    }

    pub(crate) fn set_index(&self, index: PollerIndex) {
        self.index.store(index as u8, Ordering::Relaxed);
    }

    /// Returns `true` if no event is being watched.
    pub fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    /// Returns `true` if write readiness is being watched.
    pub fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    /// Returns `true` if read readiness is being watched.
    pub fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    pub(crate) fn set_read_callback<F>(&self, cb: F)
    where
        F: FnMut(Timestamp) + Send + 'static,
    {
        *self.read_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub(crate) fn set_write_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.write_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub(crate) fn set_close_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.close_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub(crate) fn set_error_callback<F>(&self, cb: F)
    where
        F: FnMut() + Send + 'static,
    {
        *self.error_callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// Tethers the channel to the object owning it. Once tied, events are
    /// dispatched only while the owner is still alive; the upgraded
    /// reference is held across the whole callback burst so the owner
    /// cannot be destroyed mid-dispatch.
    pub(crate) fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(Arc::downgrade(owner));
    }

    pub(crate) fn enable_reading(&self) {
        self.events.fetch_or(READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_reading(&self) {
        self.events.fetch_and(!READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.events.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.events.store(NONE_EVENT, Ordering::Relaxed);
        self.update();
    }

    /// Unregisters the channel from its loop's multiplexer.
    pub(crate) fn remove(&self) {
        if let (Some(channel), Some(event_loop)) = (self.self_weak.upgrade(), self.owner.upgrade())
        {
            event_loop.remove_channel(&channel);
        }
    }

    fn update(&self) {
        if let (Some(channel), Some(event_loop)) = (self.self_weak.upgrade(), self.owner.upgrade())
        {
            event_loop.update_channel(&channel);
        }
    }

    /// Dispatches the readiness events recorded by the poller.
    ///
    /// `receive_time` is the timestamp observed right after the poll
    /// returned. If the channel is tied and the owner is gone the events
    /// are silently dropped.
    pub(crate) fn handle_event(&self, receive_time: Timestamp) {
        let tie = self.tie.lock().unwrap().clone();
        match tie {
            Some(weak) => match weak.upgrade() {
                Some(_guard) => self.handle_event_with_guard(receive_time),
                None => trace!("fd {}: owner gone, dropping events", self.fd),
            },
            None => self.handle_event_with_guard(receive_time),
        }
    }

    /// Fire order: close (hang-up without readable) -> error -> read ->
    /// write. Close is skipped while readable is also set so pending
    /// in-kernel bytes are drained by the read branch first.
    fn handle_event_with_guard(&self, receive_time: Timestamp) {
        let revents = self.revents.load(Ordering::Relaxed);
        trace!("fd {}: handling revents {:#x}", self.fd, revents);

        if revents & libc::EPOLLHUP as u32 != 0 && revents & libc::EPOLLIN as u32 == 0 {
            if let Some(cb) = self.close_callback.lock().unwrap().as_mut() {
                cb();
            }
        }
        if revents & libc::EPOLLERR as u32 != 0 {
            if let Some(cb) = self.error_callback.lock().unwrap().as_mut() {
                cb();
            }
        }
        if revents & READ_EVENT != 0 {
            if let Some(cb) = self.read_callback.lock().unwrap().as_mut() {
                cb(receive_time);
            }
        }
        if revents & WRITE_EVENT != 0 {
            if let Some(cb) = self.write_callback.lock().unwrap().as_mut() {
                cb();
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &self.events.load(Ordering::Relaxed))
            .field("revents", &self.revents.load(Ordering::Relaxed))
            .field("index", &self.index())
            .finish()
    }
}
