use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A point on the engine's version timeline.
///
/// `Now` reads the present state; `At(version)` reads the state as of the
/// given version, including it. Every historical read in the engine takes a
/// `Timestamp` rather than a raw integer so that "current time" never has to
/// be represented by a magic constant at call sites.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timestamp {
    Now,
    At(u64),
}

impl Timestamp {
    /// The inclusive upper bound on revision versions visible at this
    /// timestamp.
    pub fn horizon(self) -> u64 {
        match self {
            Timestamp::Now => u64::MAX,
            Timestamp::At(version) => version,
        }
    }
}

impl From<u64> for Timestamp {
    fn from(version: u64) -> Self {
        Timestamp::At(version)
    }
}

/// Issues version numbers that are strictly increasing wall-clock
/// microseconds, unique within one engine instance.
///
/// The clock tracks the wall clock but never repeats or goes backwards: if
/// two calls land in the same microsecond (or the wall clock steps back), the
/// next version is the previous one plus one.
#[derive(Debug)]
pub struct VersionClock {
    last: AtomicU64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self { last: AtomicU64::new(0) }
    }

    /// Restore a clock that must only issue versions greater than `floor`.
    /// Used at recovery so that versions stay monotonic across restarts.
    pub fn starting_after(floor: u64) -> Self {
        Self { last: AtomicU64::new(floor) }
    }

    /// Issue the next version.
    pub fn next(&self) -> u64 {
        let now = wall_micros();
        loop {
            let last = self.last.load(Ordering::SeqCst);
            let next = now.max(last + 1);
            if self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }

    /// The most recently issued version, or the recovery floor if none has
    /// been issued yet.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
