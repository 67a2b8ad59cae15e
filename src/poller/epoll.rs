use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, trace};

use crate::channel::{Channel, PollerIndex};
use crate::poller::Poller;
use crate::time::Timestamp;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Readiness backend built on `epoll`.
///
/// Registrations are level-triggered; the connection write path relies on
/// `EPOLLOUT` firing again while the output buffer still holds data.
pub struct EpollPoller {
    ep: OwnedFd,
    channels: Mutex<HashMap<RawFd, Arc<Channel>>>,
    /// Kernel-filled event list, doubled whenever a poll fills it.
    events: Mutex<Vec<libc::epoll_event>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(EpollPoller {
            // SAFETY: `epoll_create1(2)` returned a valid, owned fd.
            ep: unsafe { OwnedFd::from_raw_fd(ep) },
            channels: Mutex::new(HashMap::new()),
            events: Mutex::new(vec![new_event(); INIT_EVENT_LIST_SIZE]),
        })
    }

    fn ctl(&self, op: libc::c_int, channel: &Channel) {
        let mut event = new_event();
        event.events = channel.events();
        event.u64 = channel.fd() as u64;

        if let Err(err) = syscall!(epoll_ctl(
            self.ep.as_raw_fd(),
            op,
            channel.fd(),
            &mut event
        )) {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl del error on fd {}: {}", channel.fd(), err);
            } else {
                // A failing ADD/MOD means the registration protocol was
                // violated; there is no sane way to continue.
                panic!("epoll_ctl add/mod error on fd {}: {}", channel.fd(), err);
            }
        }
    }
}

fn new_event() -> libc::epoll_event {
    libc::epoll_event { events: 0, u64: 0 }
}

impl Poller for EpollPoller {
    fn poll(&self, timeout: Duration, active_channels: &mut Vec<Arc<Channel>>) -> Timestamp {
        let mut events = self.events.lock().unwrap();

        let n = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            events.as_mut_ptr(),
            events.len() as libc::c_int,
            timeout.as_millis() as libc::c_int,
        ));
        let now = Timestamp::now();

        match n {
            Ok(0) => trace!("nothing happened before the poll timeout"),
            Ok(n) => {
                let n = n as usize;
                trace!("{} events happened", n);
                let channels = self.channels.lock().unwrap();
                for event in events.iter().take(n) {
                    let fd = event.u64 as RawFd;
                    if let Some(channel) = channels.get(&fd) {
                        channel.set_revents(event.events);
                        active_channels.push(Arc::clone(channel));
                    }
                }
                if n == events.len() {
                    let doubled = events.len() * 2;
                    events.resize(doubled, new_event());
                }
            }
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("epoll_wait error: {}", err),
        }
        now
    }

    fn update_channel(&self, channel: &Arc<Channel>) {
        let index = channel.index();
        trace!(
            "update channel fd {} events {:#x} index {:?}",
            channel.fd(),
            channel.events(),
            index
        );

        match index {
            PollerIndex::New | PollerIndex::Deleted => {
                if index == PollerIndex::New {
                    self.channels
                        .lock()
                        .unwrap()
                        .insert(channel.fd(), Arc::clone(channel));
                }
                channel.set_index(PollerIndex::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            PollerIndex::Added => {
                if channel.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_index(PollerIndex::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    fn remove_channel(&self, channel: &Arc<Channel>) {
        trace!("remove channel fd {}", channel.fd());
        self.channels.lock().unwrap().remove(&channel.fd());
        if channel.index() == PollerIndex::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(PollerIndex::New);
    }

    fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.channels
            .lock()
            .unwrap()
            .get(&channel.fd())
            .is_some_and(|found| Arc::ptr_eq(found, channel))
    }
}

impl fmt::Debug for EpollPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpollPoller")
            .field("ep", &self.ep.as_raw_fd())
            .field("fds", &self.channels.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use super::*;

    fn eventfd() -> OwnedFd {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)).unwrap();
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    // Drives a channel through the full registration protocol by hand; the
    // channel has no owner loop, so interest changes are applied directly
    // through the poller.
    #[test]
    fn registration_protocol() {
        let poller = EpollPoller::new().unwrap();
        let fd = eventfd();
        let channel = Channel::new(Weak::new(), fd.as_raw_fd());

        assert_eq!(channel.index(), PollerIndex::New);
        assert!(!poller.has_channel(&channel));

        // new -> added: kernel ADD, inserted into the map.
        channel.enable_reading();
        poller.update_channel(&channel);
        assert_eq!(channel.index(), PollerIndex::Added);
        assert!(poller.has_channel(&channel));

        // added + empty interest -> deleted: kernel DEL, still mapped.
        channel.disable_all();
        poller.update_channel(&channel);
        assert_eq!(channel.index(), PollerIndex::Deleted);
        assert!(poller.has_channel(&channel));

        // deleted -> added: kernel ADD reusing the map entry.
        channel.enable_reading();
        poller.update_channel(&channel);
        assert_eq!(channel.index(), PollerIndex::Added);

        // removal returns the channel to its initial state.
        poller.remove_channel(&channel);
        assert_eq!(channel.index(), PollerIndex::New);
        assert!(!poller.has_channel(&channel));
    }

    #[test]
    fn poll_reports_ready_channel() {
        let poller = EpollPoller::new().unwrap();
        let fd = eventfd();
        let channel = Channel::new(Weak::new(), fd.as_raw_fd());
        channel.enable_reading();
        poller.update_channel(&channel);

        let mut active = Vec::new();
        let ts = poller.poll(Duration::ZERO, &mut active);
        assert!(active.is_empty());
        assert!(ts.as_micros() > 0);

        let one: u64 = 1;
        syscall!(write(
            fd.as_raw_fd(),
            &one as *const u64 as *const libc::c_void,
            8
        ))
        .unwrap();

        let mut active = Vec::new();
        poller.poll(Duration::from_millis(100), &mut active);
        assert_eq!(active.len(), 1);
        assert!(Arc::ptr_eq(&active[0], &channel));

        poller.remove_channel(&channel);
    }
}
