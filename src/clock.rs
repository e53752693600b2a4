//! Injectable clock
//!
//! All cache timing (heat scoring, demotion thresholds, index timestamps)
//! goes through this trait so tests can drive time deterministically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic second-resolution clock
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch, guaranteed non-decreasing per instance
    fn now_seconds(&self) -> u64;
}

/// Shared clock handle
pub type ClockRef = Arc<dyn Clock>;

// =============================================================================
// System Clock
// =============================================================================

/// Production clock: epoch base captured at construction plus a monotonic
/// offset, so wall-clock adjustments cannot move cache time backwards.
pub struct SystemClock {
    base_epoch: u64,
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        let base_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            base_epoch,
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_seconds(&self) -> u64 {
        self.base_epoch + self.started.elapsed().as_secs()
    }
}

// =============================================================================
// Manual Clock (tests)
// =============================================================================

/// Test clock advanced explicitly
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock frozen at the given epoch second
    pub fn at(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }

    /// Jump to an absolute time (must not go backwards)
    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
