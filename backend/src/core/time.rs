//! Time sources for netting runs
//!
//! Protocol timestamps (scan start times, stage transitions, deadlock
//! markers) come from a [`Clock`]. Production nodes use [`SystemClock`];
//! tests drive a [`ManualClock`] so that request ids, and therefore the
//! detection winner, are deterministic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch
pub type Millis = u64;

/// Source of wall-clock time for a node
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the epoch
    fn now_millis(&self) -> Millis;
}

/// Clock backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Millis {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Millis)
            .unwrap_or(0)
    }
}

/// Deterministic clock advanced explicitly
///
/// Clones share the same underlying time, so one handle can be given to every
/// node of a simulated network.
///
/// # Example
/// ```
/// use liquidity_savings_core::core::time::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// let shared = clock.clone();
/// clock.advance(250);
/// assert_eq!(shared.now_millis(), 1_250);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Move time forward by `delta` milliseconds
    pub fn advance(&self, delta: Millis) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Jump to an absolute time
    pub fn set(&self, at: Millis) {
        self.now.store(at, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }

    #[test]
    fn test_manual_clock_set() {
        let clock = ManualClock::new(5);
        clock.set(42);
        assert_eq!(clock.now_millis(), 42);
    }
}
