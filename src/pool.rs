use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error};

use crate::event_loop::EventLoop;
use crate::ring::{ConsistentHash, DEFAULT_REPLICAS};

/// Owns one worker thread running its own [`EventLoop`].
///
/// The loop is constructed on the worker's stack so its thread identity is
/// the worker thread; the spawning thread only receives a shared handle.
pub struct EventLoopThread {
    name: String,
    event_loop: Option<Arc<EventLoop>>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Creates a not-yet-started worker named `name`.
    pub fn new(name: &str) -> EventLoopThread {
        EventLoopThread {
            name: name.to_owned(),
            event_loop: None,
            handle: None,
        }
    }

    /// Spawns the worker thread and blocks until its loop is constructed.
    pub fn start_loop(&mut self) -> Arc<EventLoop> {
        assert!(self.handle.is_none(), "loop thread already started");

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                // A worker that cannot build its loop is a fatal startup
                // condition.
                let event_loop = EventLoop::new().expect("failed to create worker EventLoop");
                if tx.send(Arc::clone(&event_loop)).is_err() {
                    return;
                }
                event_loop.run();
            })
            .expect("failed to spawn EventLoop thread");

        let event_loop = rx.recv().expect("EventLoop thread died during startup");
        self.event_loop = Some(Arc::clone(&event_loop));
        self.handle = Some(handle);
        event_loop
    }

    /// The worker's loop, if started.
    pub fn event_loop(&self) -> Option<&Arc<EventLoop>> {
        self.event_loop.as_ref()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.quit();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("EventLoop thread {} panicked", self.name);
            }
        }
    }
}

impl fmt::Debug for EventLoopThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopThread")
            .field("name", &self.name)
            .field("started", &self.handle.is_some())
            .finish()
    }
}

/// A pool of worker loops, one per thread, selected per key by a
/// consistent-hash ring.
///
/// With zero workers every lookup returns the base loop and the server
/// degenerates to a single-reactor setup.
pub struct EventLoopPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: bool,
    num_threads: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<Arc<EventLoop>>,
    ring: ConsistentHash,
}

impl EventLoopPool {
    /// Creates an empty pool around the caller-owned base loop.
    pub fn new(base_loop: Arc<EventLoop>, name: &str) -> EventLoopPool {
        EventLoopPool {
            base_loop,
            name: name.to_owned(),
            started: false,
            num_threads: 0,
            threads: Vec::new(),
            loops: Vec::new(),
            ring: ConsistentHash::new(DEFAULT_REPLICAS),
        }
    }

    /// Sets the number of worker threads to spawn on [`start`].
    ///
    /// [`start`]: EventLoopPool::start
    pub fn set_thread_num(&mut self, num_threads: usize) {
        self.num_threads = num_threads;
    }

    /// Returns `true` once the workers are running.
    pub fn started(&self) -> bool {
        self.started
    }

    /// The pool's name; worker threads are named `"{name}{index}"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns the workers and places each on the ring.
    pub fn start(&mut self) {
        assert!(!self.started, "pool already started");
        self.started = true;

        for i in 0..self.num_threads {
            let worker_name = format!("{}{}", self.name, i);
            let mut worker = EventLoopThread::new(&worker_name);
            let event_loop = worker.start_loop();
            self.threads.push(worker);
            self.loops.push(event_loop);

            let slot = self.ring.add_node(&worker_name);
            debug_assert_eq!(slot, i);
        }
        debug!(
            "EventLoopPool {} started with {} workers",
            self.name, self.num_threads
        );
    }

    /// Picks the worker loop owning `key` on the ring; the base loop when
    /// the pool has no workers.
    pub fn get_next_loop(&self, key: &str) -> Arc<EventLoop> {
        match self.ring.get_node(key) {
            Ok(slot) if slot < self.loops.len() => Arc::clone(&self.loops[slot]),
            _ => Arc::clone(&self.base_loop),
        }
    }

    /// All worker loops, or just the base loop when no workers exist.
    pub fn get_all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            self.loops.clone()
        }
    }
}

impl fmt::Debug for EventLoopPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopPool")
            .field("name", &self.name)
            .field("started", &self.started)
            .field("num_threads", &self.num_threads)
            .finish()
    }
}
