use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, trace};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::time::Timestamp;

/// Identifies a scheduled timer so it can be cancelled.
///
/// Sequence numbers are allocated from a global counter, which also makes
/// timers with equal expirations fire in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

type TimerCallback = Box<dyn FnMut() + Send>;

struct TimerEntry {
    callback: TimerCallback,
    /// Zero for one-shot timers.
    interval: Duration,
}

#[derive(Default)]
struct TimerList {
    /// Pending timers ordered by (expiration, sequence).
    timers: BTreeMap<(Timestamp, u64), TimerEntry>,
    /// Sequence -> expiration, for cancellation.
    index: HashMap<u64, Timestamp>,
    /// Timers whose callbacks are running right now.
    firing: HashSet<u64>,
    /// Periodic timers cancelled from inside their own callback; they must
    /// not be re-inserted when the firing pass finishes.
    cancelled_while_firing: HashSet<u64>,
}

/// Priority-ordered timer set driven by one `timerfd` per loop.
///
/// The kernel timer is always armed (absolute, `CLOCK_MONOTONIC`) to the
/// earliest pending expiration, and disarmed when the set is empty.
pub(crate) struct TimerQueue {
    fd: OwnedFd,
    channel: Arc<Channel>,
    list: Mutex<TimerList>,
}

pub(crate) fn create_timer_fd() -> io::Result<OwnedFd> {
    let fd = syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
    ))?;
    // SAFETY: `timerfd_create(2)` returned a valid, owned fd.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

impl TimerQueue {
    pub(crate) fn new(owner: Weak<EventLoop>, fd: OwnedFd) -> TimerQueue {
        let channel = Channel::new(owner, fd.as_raw_fd());
        TimerQueue {
            fd,
            channel,
            list: Mutex::new(TimerList::default()),
        }
    }

    pub(crate) fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Schedules `callback` for `when`; a non-zero `interval` makes it
    /// periodic. Re-arms the kernel timer if this becomes the earliest
    /// expiration.
    pub(crate) fn add_timer(
        &self,
        when: Timestamp,
        interval: Duration,
        callback: TimerCallback,
    ) -> TimerId {
        let id = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);

        let mut list = self.list.lock().unwrap();
        let new_earliest = list
            .timers
            .keys()
            .next()
            .map_or(true, |&(earliest, _)| when < earliest);
        list.timers.insert((when, id), TimerEntry { callback, interval });
        list.index.insert(id, when);
        if new_earliest {
            self.arm(when);
        }
        TimerId(id)
    }

    /// Cancels a pending timer. A periodic timer may cancel itself from
    /// inside its own callback; it will not fire again.
    pub(crate) fn cancel(&self, id: TimerId) {
        let mut list = self.list.lock().unwrap();
        if let Some(when) = list.index.remove(&id.0) {
            if list.timers.remove(&(when, id.0)).is_some() {
                match list.timers.keys().next() {
                    Some(&(earliest, _)) => self.arm(earliest),
                    None => self.disarm(),
                }
            }
        } else if list.firing.contains(&id.0) {
            list.cancelled_while_firing.insert(id.0);
        }
    }

    /// Read callback of the timer channel: drains every expired entry,
    /// runs its callback, re-inserts periodic entries at `when + interval`
    /// and re-arms to the new minimum (or disarms).
    pub(crate) fn handle_expired(&self) {
        let mut buf = [0u8; 8];
        if let Err(err) = syscall!(read(
            self.fd.as_raw_fd(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        )) {
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("timerfd read error: {}", err);
            }
        }

        let now = Timestamp::now();
        let mut expired = {
            let mut list = self.list.lock().unwrap();
            // Everything at or before `now`; sequence numbers never reach
            // u64::MAX, so the bound sits after the last expired entry.
            let pending = list.timers.split_off(&(now, u64::MAX));
            let expired = std::mem::replace(&mut list.timers, pending);
            for &(when, id) in expired.keys() {
                list.index.remove(&id);
                list.firing.insert(id);
                trace!("timer {} expired at {}", id, when);
            }
            expired
        };

        // Callbacks run without the lock so they can add or cancel timers.
        for entry in expired.values_mut() {
            (entry.callback)();
        }

        let mut list = self.list.lock().unwrap();
        list.firing.clear();
        for ((when, id), entry) in expired {
            if entry.interval > Duration::ZERO && !list.cancelled_while_firing.remove(&id) {
                let next = when + entry.interval;
                list.timers.insert((next, id), entry);
                list.index.insert(id, next);
            }
        }
        list.cancelled_while_firing.clear();
        match list.timers.keys().next() {
            Some(&(earliest, _)) => self.arm(earliest),
            None => self.disarm(),
        }
    }

    fn arm(&self, when: Timestamp) {
        let mut value = when.to_timespec();
        if value.tv_sec == 0 && value.tv_nsec == 0 {
            // An all-zero it_value would disarm instead of firing.
            value.tv_nsec = 1;
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: value,
        };
        trace!("arming timerfd for {}", when);
        if let Err(err) = syscall!(timerfd_settime(
            self.fd.as_raw_fd(),
            libc::TFD_TIMER_ABSTIME,
            &spec,
            ptr::null_mut()
        )) {
            error!("timerfd_settime error: {}", err);
        }
    }

    fn disarm(&self) {
        let spec = libc::itimerspec {
            it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        };
        trace!("disarming timerfd");
        if let Err(err) = syscall!(timerfd_settime(self.fd.as_raw_fd(), 0, &spec, ptr::null_mut())) {
            error!("timerfd_settime error: {}", err);
        }
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("fd", &self.fd.as_raw_fd())
            .field("pending", &self.list.lock().unwrap().timers.len())
            .finish()
    }
}
