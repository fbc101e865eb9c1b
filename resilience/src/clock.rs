//! A small time seam so the breaker's backoff-boundary tests can assert
//! exact thresholds without depending on wall-clock sleeps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock whose `now()` can be advanced deterministically. The anchor is an
/// `Instant` captured at construction; `advance` moves a monotonic offset
/// forward so callers observe only relative ordering, matching what a real
/// `Instant` guarantees.
#[derive(Clone)]
pub struct ManualClock {
    anchor: Instant,
    offset_ms: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self { anchor: Instant::now(), offset_ms: Arc::new(AtomicU64::new(0)) }
    }

    pub fn advance(&self, duration: Duration) {
        self.offset_ms.fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.anchor + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}
