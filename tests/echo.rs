use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use muon::{EventLoopThread, TcpServer};

mod util;

const ANY_PORT: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);

#[test]
fn echo_single_worker() {
    util::init();

    let mut main_thread = EventLoopThread::new("echo-main");
    let main_loop = main_thread.start_loop();

    let server = TcpServer::new(Arc::clone(&main_loop), &ANY_PORT, "echo").unwrap();

    let (edge_tx, edge_rx) = mpsc::channel();
    let edge_tx = Mutex::new(edge_tx);
    server.set_connection_callback(move |conn| {
        edge_tx.lock().unwrap().send(conn.is_connected()).unwrap();
    });
    server.set_message_callback(|conn, buffer, _receive_time| {
        let msg = buffer.retrieve_all_as_string();
        conn.send(msg.as_bytes());
    });
    server.set_thread_num(1);
    server.start();

    let addr = server.local_addr().unwrap();
    let mut client = util::connect_retry(addr);

    // UP edge.
    assert!(edge_rx.recv_timeout(Duration::from_secs(5)).unwrap());

    client.write_all(b"hello\n").unwrap();
    let mut reply = [0u8; 6];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello\n");

    drop(client);
    // DOWN edge after the peer closes.
    assert!(!edge_rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn graceful_half_close_after_bulk_send() {
    util::init();

    const LEN: usize = 1024 * 1024;

    let mut main_thread = EventLoopThread::new("shutdown-main");
    let main_loop = main_thread.start_loop();

    let server = TcpServer::new(Arc::clone(&main_loop), &ANY_PORT, "bulk").unwrap();
    server.set_connection_callback(|conn| {
        if conn.is_connected() {
            // Everything queued before the shutdown must still reach the
            // peer; only then is the write half closed.
            conn.send(&vec![0xAB; LEN]);
            conn.shutdown();
        }
    });
    server.set_thread_num(1);
    server.start();

    let mut client = util::connect_retry(server.local_addr().unwrap());
    let mut total = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut chunk).unwrap() {
            0 => break, // EOF only after the full payload
            n => {
                assert!(chunk[..n].iter().all(|&b| b == 0xAB));
                total += n;
            }
        }
    }
    assert_eq!(total, LEN);
}

#[test]
fn high_watermark_fires_on_the_strict_edge_only() {
    util::init();

    // Far above what the kernel will buffer on loopback, so the direct
    // write is guaranteed to be partial and the output buffer crosses the
    // threshold.
    const LEN: usize = 32 * 1024 * 1024;
    const HIGH_WATER_MARK: usize = 8 * 1024 * 1024;

    let mut main_thread = EventLoopThread::new("hwm-main");
    let main_loop = main_thread.start_loop();

    let server = TcpServer::new(Arc::clone(&main_loop), &ANY_PORT, "hwm").unwrap();

    let hwm_count = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hwm_count);
    server.set_high_water_mark_callback(
        move |_conn, pending| {
            assert!(pending >= HIGH_WATER_MARK);
            counter.fetch_add(1, Ordering::Relaxed);
        },
        HIGH_WATER_MARK,
    );

    let (wc_tx, wc_rx) = mpsc::channel();
    let wc_tx = Mutex::new(wc_tx);
    server.set_write_complete_callback(move |_conn| {
        wc_tx.lock().unwrap().send(()).unwrap();
    });

    let sent = AtomicBool::new(false);
    server.set_message_callback(move |conn, buffer, _receive_time| {
        buffer.retrieve_all();
        // The trigger may arrive split across reads; send the payload once.
        if !sent.swap(true, Ordering::Relaxed) {
            conn.send(&vec![0x5A; LEN]);
        }
    });
    server.set_thread_num(1);
    server.start();

    let mut client = util::connect_retry(server.local_addr().unwrap());
    client.write_all(b"go").unwrap();

    // Let the server fill the kernel buffers and queue the rest before the
    // client starts draining.
    thread::sleep(Duration::from_millis(300));

    let mut total = 0usize;
    let mut chunk = vec![0u8; 64 * 1024];
    while total < LEN {
        let n = client.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "server closed early after {} bytes", total);
        total += n;
    }

    // Output buffer fully drained exactly once.
    wc_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(wc_rx.recv_timeout(Duration::from_millis(300)).is_err());
    assert_eq!(hwm_count.load(Ordering::Relaxed), 1);
}

#[test]
fn stop_read_pauses_message_delivery() {
    util::init();

    let mut main_thread = EventLoopThread::new("pause-main");
    let main_loop = main_thread.start_loop();

    let server = TcpServer::new(Arc::clone(&main_loop), &ANY_PORT, "pause").unwrap();

    let (msg_tx, msg_rx) = mpsc::channel();
    let msg_tx = Mutex::new(msg_tx);
    let paused = AtomicBool::new(false);
    server.set_message_callback(move |conn, buffer, _receive_time| {
        buffer.retrieve_all();
        if !paused.swap(true, Ordering::Relaxed) {
            // First message: pause reading, resume on a timer.
            conn.stop_read();
            let resume = Arc::clone(conn);
            conn.owner_loop()
                .run_after(Duration::from_millis(300), move || resume.start_read());
        }
        msg_tx.lock().unwrap().send(Instant::now()).unwrap();
    });
    server.set_thread_num(1);
    server.start();

    let mut client = util::connect_retry(server.local_addr().unwrap());
    client.write_all(b"first").unwrap();
    let first = msg_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // Written while read interest is off; sits in the kernel until the
    // timer re-enables delivery.
    client.write_all(b"second").unwrap();
    let second = msg_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(second.duration_since(first) >= Duration::from_millis(200));
}

#[test]
fn send_file_transfers_file_contents() {
    util::init();

    const LEN: usize = 256 * 1024;

    let path = std::env::temp_dir().join(format!("muon-sendfile-{}", std::process::id()));
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    fs::write(&path, &payload).unwrap();

    let mut main_thread = EventLoopThread::new("sendfile-main");
    let main_loop = main_thread.start_loop();

    let server = TcpServer::new(Arc::clone(&main_loop), &ANY_PORT, "sendfile").unwrap();
    let file_path = path.clone();
    server.set_connection_callback(move |conn| {
        if conn.is_connected() {
            let file = Arc::new(File::open(&file_path).unwrap());
            conn.send_file(file, 0, LEN);
        }
    });
    server.set_thread_num(1);
    server.start();

    let mut client = util::connect_retry(server.local_addr().unwrap());
    let mut received = vec![0u8; LEN];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);

    drop(client);
    fs::remove_file(&path).unwrap();
}

#[test]
fn connections_spread_across_workers_deterministically() {
    util::init();

    let mut main_thread = EventLoopThread::new("spread-main");
    let main_loop = main_thread.start_loop();

    let server = TcpServer::new(Arc::clone(&main_loop), &ANY_PORT, "spread").unwrap();
    server.set_message_callback(|conn, buffer, _receive_time| {
        // Echo back the name of the thread driving this connection, which
        // identifies the worker loop it was dispatched to.
        buffer.retrieve_all();
        let worker = thread::current().name().unwrap_or("?").to_owned();
        conn.send(worker.as_bytes());
    });
    server.set_thread_num(3);
    server.start();
    let addr = server.local_addr().unwrap();

    let worker_of = |_: usize| {
        let mut client = util::connect_retry(addr);
        client.write_all(b"who").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut name = [0u8; 64];
        let n = client.read(&mut name).unwrap();
        String::from_utf8_lossy(&name[..n]).into_owned()
    };

    let names: Vec<String> = (0..8).map(worker_of).collect();
    for name in &names {
        assert!(name.starts_with("spread"), "unexpected worker {:?}", name);
    }
}
