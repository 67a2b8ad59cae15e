use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use muon::{EventLoop, EventLoopThread};

mod util;

#[test]
fn tasks_from_many_threads_all_run_on_the_loop_thread() {
    util::init();

    let mut worker = EventLoopThread::new("queue-test");
    let event_loop = worker.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let on_loop_thread = Arc::new(AtomicBool::new(true));

    let mut senders = Vec::new();
    for _ in 0..4 {
        let event_loop = Arc::clone(&event_loop);
        let count = Arc::clone(&count);
        let on_loop_thread = Arc::clone(&on_loop_thread);
        senders.push(thread::spawn(move || {
            for _ in 0..25 {
                let count = Arc::clone(&count);
                let on_loop_thread = Arc::clone(&on_loop_thread);
                let check = Arc::clone(&event_loop);
                event_loop.queue_in_loop(move || {
                    if !check.is_in_loop_thread() {
                        on_loop_thread.store(false, Ordering::Relaxed);
                    }
                    count.fetch_add(1, Ordering::Relaxed);
                });
            }
        }));
    }
    for sender in senders {
        sender.join().unwrap();
    }

    // Everything above was queued before this sentinel, and the pending
    // queue preserves insertion order.
    let (tx, rx) = mpsc::channel();
    event_loop.queue_in_loop(move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    assert_eq!(count.load(Ordering::Relaxed), 100);
    assert!(on_loop_thread.load(Ordering::Relaxed));
}

#[test]
fn run_in_loop_is_synchronous_on_the_loop_thread() {
    util::init();

    let mut worker = EventLoopThread::new("sync-test");
    let event_loop = worker.start_loop();

    let (tx, rx) = mpsc::channel();
    let inner_loop = Arc::clone(&event_loop);
    event_loop.queue_in_loop(move || {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        inner_loop.run_in_loop(move || flag.store(true, Ordering::Relaxed));
        // Already on the loop thread, so the task must have run inline.
        tx.send(ran.load(Ordering::Relaxed)).unwrap();
    });

    assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn task_posted_from_a_pending_task_runs_without_a_poll_timeout() {
    util::init();

    let mut worker = EventLoopThread::new("reentrant-test");
    let event_loop = worker.start_loop();

    let (tx, rx) = mpsc::channel();
    let inner_loop = Arc::clone(&event_loop);
    event_loop.queue_in_loop(move || {
        // Posted while the loop drains pending tasks; the wakeup keeps the
        // next iteration from sleeping the full 10 s poll cap.
        inner_loop.queue_in_loop(move || tx.send(()).unwrap());
    });

    let start = Instant::now();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn cross_thread_quit_returns_promptly() {
    util::init();

    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(Arc::clone(&event_loop)).unwrap();
        event_loop.run();
    });
    let event_loop = rx.recv().unwrap();

    // Give the loop a moment to block in poll.
    thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    event_loop.quit();
    handle.join().unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
#[should_panic(expected = "another EventLoop")]
fn second_loop_on_one_thread_is_fatal() {
    let _first = EventLoop::new().unwrap();
    let _second = EventLoop::new().unwrap();
}
