use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use muon::{EventLoopThread, Timestamp};

mod util;

#[test]
fn run_after_fires_once() {
    util::init();

    let mut worker = EventLoopThread::new("timer-once");
    let event_loop = worker.start_loop();

    let (tx, rx) = mpsc::channel();
    event_loop.run_after(Duration::from_millis(50), move || {
        tx.send(()).unwrap();
    });

    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    // One-shot: no second firing.
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
}

#[test]
fn run_every_fires_repeatedly_until_cancelled() {
    util::init();

    let mut worker = EventLoopThread::new("timer-every");
    let event_loop = worker.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let timer_id = event_loop.run_every(Duration::from_millis(50), move || {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    util::wait_for("periodic timer to fire a few times", || {
        count.load(Ordering::Relaxed) >= 4
    });
    event_loop.cancel(timer_id);

    // At most one firing can still be in flight at cancellation time.
    let at_cancel = count.load(Ordering::Relaxed);
    thread::sleep(Duration::from_millis(250));
    assert!(count.load(Ordering::Relaxed) <= at_cancel + 1);
}

#[test]
fn cancel_prevents_a_pending_timer() {
    util::init();

    let mut worker = EventLoopThread::new("timer-cancel");
    let event_loop = worker.start_loop();

    let (tx, rx) = mpsc::channel();
    let timer_id = event_loop.run_after(Duration::from_millis(200), move || {
        tx.send(()).unwrap();
    });
    event_loop.cancel(timer_id);

    assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
}

#[test]
fn equal_expirations_fire_in_insertion_order() {
    util::init();

    let mut worker = EventLoopThread::new("timer-fifo");
    let event_loop = worker.start_loop();

    let order = Arc::new(Mutex::new(Vec::new()));
    let when = Timestamp::now() + Duration::from_millis(50);
    for i in 0..3 {
        let order = Arc::clone(&order);
        event_loop.run_at(when, move || order.lock().unwrap().push(i));
    }

    let (tx, rx) = mpsc::channel();
    event_loop.run_after(Duration::from_millis(200), move || tx.send(()).unwrap());
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn periodic_timer_can_cancel_itself() {
    util::init();

    let mut worker = EventLoopThread::new("timer-self-cancel");
    let event_loop = worker.start_loop();

    let count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&count);
    let inner_loop = Arc::clone(&event_loop);
    let timer_slot = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&timer_slot);

    let timer_id = event_loop.run_every(Duration::from_millis(30), move || {
        let fired = counter.fetch_add(1, Ordering::Relaxed) + 1;
        if fired == 2 {
            if let Some(id) = *slot.lock().unwrap() {
                inner_loop.cancel(id);
            }
        }
    });
    *timer_slot.lock().unwrap() = Some(timer_id);

    util::wait_for("self-cancelling timer to fire twice", || {
        count.load(Ordering::Relaxed) >= 2
    });
    thread::sleep(Duration::from_millis(200));
    assert_eq!(count.load(Ordering::Relaxed), 2);
}
