// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::net::{SocketAddrV4, TcpStream};
use std::sync::Once;
use std::time::{Duration, Instant};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Connects to `addr`, retrying until the server's deferred `listen` has
/// actually run.
pub fn connect_retry(addr: SocketAddrV4) -> TcpStream {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                // A stuck server should fail the test, not hang it.
                stream
                    .set_read_timeout(Some(Duration::from_secs(10)))
                    .unwrap();
                return stream;
            }
            Err(err) => {
                if Instant::now() >= deadline {
                    panic!("unable to connect to {}: {}", addr, err);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

/// Spins until `condition` holds, panicking after five seconds.
pub fn wait_for<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}
