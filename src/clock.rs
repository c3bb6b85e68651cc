//! Wall-clock source for bucketing samples and aging buckets.
//!
//! Production code uses [`SystemClock`]; tests freeze time with [`MockClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unix wall-clock time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64;

    /// Whole seconds since the Unix epoch (floor). This is the bucket key.
    fn unix_secs(&self) -> i64 {
        (self.unix_millis() / 1_000) as i64
    }
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A frozen clock that only moves when told to.
///
/// Clones share the same instant, so a test can hold one handle and give
/// another to the code under test.
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    millis: Arc<AtomicU64>,
}

impl MockClock {
    /// A clock frozen at `secs` seconds after the epoch.
    pub fn at_secs(secs: u64) -> Self {
        Self::at_millis(secs * 1_000)
    }

    pub fn at_millis(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    pub fn set_secs(&self, secs: u64) {
        self.millis.store(secs * 1_000, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn unix_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}
