use std::cell::RefCell;
use std::fmt;
use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::debug;

use crate::channel::Channel;
use crate::poller::{new_default_poller, Poller};
use crate::time::Timestamp;
use crate::timer::{create_timer_fd, TimerId, TimerQueue};
use crate::waker::Waker;

// At most one loop per thread; a second construction is a programmer bug.
thread_local! {
    static CURRENT_LOOP: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

/// Cap on a single multiplexer block so a cross-thread `quit` is always
/// observed, even if the wakeup write were lost.
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce() + Send>;

/// A single-threaded event dispatcher bound to the thread it was created
/// on.
///
/// Each loop owns a multiplexer, a timer queue and an eventfd wakeup
/// handle. [`run`] blocks on readiness, dispatches ready channels, then
/// drains tasks posted from other threads. Everything a channel,
/// connection or timer owned by this loop touches is mutated on this
/// loop's thread only; the sanctioned cross-thread entry points are
/// [`run_in_loop`]/[`queue_in_loop`], [`quit`] and the timer methods.
///
/// [`run`]: EventLoop::run
/// [`run_in_loop`]: EventLoop::run_in_loop
/// [`queue_in_loop`]: EventLoop::queue_in_loop
/// [`quit`]: EventLoop::quit
pub struct EventLoop {
    thread_id: ThreadId,
    poller: Box<dyn Poller>,
    timer_queue: Arc<TimerQueue>,
    waker: Arc<Waker>,
    wakeup_channel: Arc<Channel>,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    pending_tasks: Mutex<Vec<Task>>,
    poll_return_time: AtomicI64,
}

impl EventLoop {
    /// Creates a loop bound to the current thread.
    ///
    /// # Panics
    ///
    /// Panics if this thread already hosts a live `EventLoop`.
    pub fn new() -> io::Result<Arc<EventLoop>> {
        CURRENT_LOOP.with(|current| {
            if current.borrow().upgrade().is_some() {
                panic!(
                    "another EventLoop already exists on thread {:?}",
                    thread::current().id()
                );
            }
        });

        let poller = new_default_poller()?;
        let waker = Arc::new(Waker::new()?);
        let timer_fd = create_timer_fd()?;

        let event_loop = Arc::new_cyclic(|weak: &Weak<EventLoop>| {
            let wakeup_channel = Channel::new(weak.clone(), waker.as_raw_fd());
            let timer_queue = Arc::new(TimerQueue::new(weak.clone(), timer_fd));
            EventLoop {
                thread_id: thread::current().id(),
                poller,
                timer_queue,
                waker: Arc::clone(&waker),
                wakeup_channel,
                looping: AtomicBool::new(false),
                quit: AtomicBool::new(false),
                calling_pending_tasks: AtomicBool::new(false),
                pending_tasks: Mutex::new(Vec::new()),
                poll_return_time: AtomicI64::new(0),
            }
        });

        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Arc::downgrade(&event_loop);
        });

        let wakeup = Arc::clone(&event_loop.waker);
        event_loop
            .wakeup_channel
            .set_read_callback(move |_| wakeup.drain());
        event_loop.wakeup_channel.enable_reading();

        let timers = Arc::downgrade(&event_loop.timer_queue);
        event_loop
            .timer_queue
            .channel()
            .set_read_callback(move |_| {
                if let Some(timers) = timers.upgrade() {
                    timers.handle_expired();
                }
            });
        event_loop.timer_queue.channel().enable_reading();

        debug!("EventLoop created on thread {:?}", event_loop.thread_id);
        Ok(event_loop)
    }

    /// Runs the loop until [`quit`] is observed.
    ///
    /// Each iteration polls the multiplexer (10 s cap), dispatches every
    /// ready channel with the poll-return timestamp, then drains the
    /// pending-task queue.
    ///
    /// [`quit`]: EventLoop::quit
    pub fn run(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop::run called from another thread"
        );
        self.looping.store(true, Ordering::Release);
        self.quit.store(false, Ordering::Release);
        debug!("EventLoop start looping");

        let mut active_channels = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let poll_return_time = self.poller.poll(POLL_TIMEOUT, &mut active_channels);
            self.poll_return_time
                .store(poll_return_time.as_micros(), Ordering::Relaxed);

            for channel in &active_channels {
                channel.handle_event(poll_return_time);
            }
            self.do_pending_tasks();
        }

        debug!("EventLoop stop looping");
        self.looping.store(false, Ordering::Release);
    }

    /// Asks the loop to exit after the current iteration. Safe to call
    /// from any thread; an off-thread caller also wakes the poll.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` on the loop thread: synchronously when already there,
    /// queued (plus wakeup) otherwise.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue.
    ///
    /// The loop is woken when the caller is off-thread, and also when the
    /// loop is currently draining pending tasks — otherwise a task posted
    /// from inside a pending task would sleep a full poll timeout.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending_tasks.lock().unwrap().push(Box::new(task));

        if !self.is_in_loop_thread() || self.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Unblocks the loop's poll by writing the eventfd.
    pub fn wakeup(&self) {
        self.waker.wake();
    }

    /// Schedules `callback` to run on this loop at `when`.
    pub fn run_at<F>(&self, when: Timestamp, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timer_queue
            .add_timer(when, Duration::ZERO, Box::new(callback))
    }

    /// Schedules `callback` to run on this loop after `delay`.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Timestamp::now() + delay, callback)
    }

    /// Schedules `callback` to run on this loop every `interval`, first
    /// firing one interval from now.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.timer_queue
            .add_timer(Timestamp::now() + interval, interval, Box::new(callback))
    }

    /// Cancels a timer scheduled with [`run_at`]/[`run_after`]/
    /// [`run_every`].
    ///
    /// [`run_at`]: EventLoop::run_at
    /// [`run_after`]: EventLoop::run_after
    /// [`run_every`]: EventLoop::run_every
    pub fn cancel(&self, timer_id: TimerId) {
        self.timer_queue.cancel(timer_id);
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        debug_assert!(self.is_in_loop_thread());
        self.poller.remove_channel(channel);
    }

    /// Returns `true` if `channel` is registered with this loop's
    /// multiplexer.
    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.poller.has_channel(channel)
    }

    /// Returns `true` when called from the thread this loop was created
    /// on.
    pub fn is_in_loop_thread(&self) -> bool {
        self.thread_id == thread::current().id()
    }

    /// The timestamp observed when the multiplexer last returned.
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.poll_return_time.load(Ordering::Relaxed))
    }

    fn do_pending_tasks(&self) {
        self.calling_pending_tasks.store(true, Ordering::Release);

        // Swap the queue out so the lock is not held while tasks run and
        // tasks can post new tasks without deadlocking.
        let tasks = mem::take(&mut *self.pending_tasks.lock().unwrap());
        for task in tasks {
            task();
        }

        self.calling_pending_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // The weak back-references inside the channels are already dead at
        // this point, so deregister them against the poller directly.
        self.poller.remove_channel(&self.wakeup_channel);
        self.poller.remove_channel(self.timer_queue.channel());
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread_id", &self.thread_id)
            .field("looping", &self.looping.load(Ordering::Relaxed))
            .field("quit", &self.quit.load(Ordering::Relaxed))
            .finish()
    }
}
