use std::fmt;
use std::mem::MaybeUninit;
use std::ops::{Add, Sub};
use std::time::Duration;

const MICROS_PER_SEC: i64 = 1_000_000;

/// A monotonic point in time with microsecond resolution.
///
/// Read from `CLOCK_MONOTONIC`, so it is unaffected by wall-clock
/// adjustments. `Timestamp` is the "receive time" handed to read callbacks
/// (stamped right after the poll returns) and the key timer expirations are
/// ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    /// Returns the current monotonic time.
    pub fn now() -> Timestamp {
        let mut ts = MaybeUninit::<libc::timespec>::uninit();
        // CLOCK_MONOTONIC cannot fail with a valid timespec pointer.
        let _ = syscall!(clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()));
        let ts = unsafe { ts.assume_init() };
        Timestamp {
            micros: ts.tv_sec as i64 * MICROS_PER_SEC + ts.tv_nsec as i64 / 1_000,
        }
    }

    /// Creates a timestamp from a raw microsecond count.
    pub fn from_micros(micros: i64) -> Timestamp {
        Timestamp { micros }
    }

    /// Returns the raw microsecond count.
    pub fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Duration elapsed since `earlier`, saturating to zero if `earlier` is
    /// in the future.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let diff = self.micros.saturating_sub(earlier.micros).max(0);
        Duration::from_micros(diff as u64)
    }

    pub(crate) fn to_timespec(self) -> libc::timespec {
        libc::timespec {
            tv_sec: (self.micros / MICROS_PER_SEC) as libc::time_t,
            tv_nsec: (self.micros % MICROS_PER_SEC * 1_000) as libc::c_long,
        }
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp {
            micros: self.micros + rhs.as_micros() as i64,
        }
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.duration_since(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.micros / MICROS_PER_SEC,
            self.micros % MICROS_PER_SEC
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
    }

    #[test]
    fn arithmetic() {
        let t = Timestamp::from_micros(1_500_000);
        let later = t + Duration::from_millis(250);
        assert_eq!(later.as_micros(), 1_750_000);
        assert_eq!(later - t, Duration::from_millis(250));
        // Saturates instead of going negative.
        assert_eq!(t - later, Duration::ZERO);
    }

    #[test]
    fn display() {
        let t = Timestamp::from_micros(3_000_042);
        assert_eq!(t.to_string(), "3.000042");
    }
}
