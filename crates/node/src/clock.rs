//! Time sources for the node runtime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Supplies the current time as an offset from the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    fn now_ms(&self) -> u64 {
        self.now().as_millis() as u64
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to. Shared by every node of a
/// deterministic test cluster.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            now_ms: AtomicU64::new(start.as_millis() as u64),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, now: Duration) {
        self.now_ms.store(now.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(Duration::from_secs(10));
        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now_ms(), 10_250);
        clock.set(Duration::ZERO);
        assert_eq!(clock.now(), Duration::ZERO);
    }
}
