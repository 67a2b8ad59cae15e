use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::time::Timestamp;

mod epoll;

pub use self::epoll::EpollPoller;

/// Abstract readiness multiplexer: the edge between an [`EventLoop`] and
/// the OS readiness facility.
///
/// Implementations keep a non-owning fd -> channel map containing exactly
/// the channels whose index is *added*. All three channel operations are
/// called from the owner loop's thread only.
///
/// [`EventLoop`]: crate::EventLoop
pub trait Poller: Send + Sync {
    /// Blocks for at most `timeout`, appending every ready channel to
    /// `active_channels` with its returned-events mask filled in. Returns
    /// the timestamp observed immediately after the kernel call, which the
    /// loop passes to read callbacks as receive time.
    ///
    /// `EINTR` is swallowed (zero events); other errors are logged and the
    /// caller keeps looping.
    fn poll(&self, timeout: Duration, active_channels: &mut Vec<Arc<Channel>>) -> Timestamp;

    /// Applies the channel's current interest mask, registering, modifying
    /// or (on an empty mask) removing the fd from the kernel set.
    fn update_channel(&self, channel: &Arc<Channel>);

    /// Drops the channel from the fd map, telling the kernel first if it
    /// was still registered.
    fn remove_channel(&self, channel: &Arc<Channel>);

    /// Returns `true` if this exact channel is in the fd map.
    fn has_channel(&self, channel: &Arc<Channel>) -> bool;
}

/// Returns the default multiplexer for this platform.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller>> {
    EpollPoller::new().map(|poller| Box::new(poller) as Box<dyn Poller>)
}
