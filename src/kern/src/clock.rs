use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// Wall-clock source in milliseconds. The lease GC deadline and `time_msec`
/// both read through this, so tests can substitute [`ManualClock`] to step
/// time past the TTL without sleeping.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u32;
}

/// Milliseconds since the node came up.
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        WallClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }
}

/// Hand-driven clock for tests.
pub struct ManualClock(AtomicU32);

impl ManualClock {
    pub fn new(start_ms: u32) -> Self {
        ManualClock(AtomicU32::new(start_ms))
    }

    pub fn advance(&self, ms: u32) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u32) {
        self.0.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}
