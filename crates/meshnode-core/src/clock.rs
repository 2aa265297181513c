//! Time sources for the mesh core.
//!
//! The router and node database never read the system clock directly. All
//! time flows through a [`Clock`] so that retransmission deadlines and
//! last-heard bookkeeping can be driven deterministically in simulation.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A monotonic millisecond counter plus a best-effort wall clock.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin. Never goes backwards.
    fn millis(&self) -> u64;

    /// Wall-clock time in seconds since the Unix epoch, or 0 if the clock
    /// has not been set from any time source yet.
    fn rtc_secs(&self) -> u32;
}

/// Clock backed by the host's `Instant` and `SystemTime`.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn rtc_secs(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

/// Manually advanced clock, shared between every node of a simulation.
///
/// Cloning yields a handle to the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
    rtc_secs: Arc<AtomicU32>,
}

impl ManualClock {
    /// Create a clock at monotonic time 0 with the wall clock unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock whose wall clock starts at `rtc_secs`.
    pub fn with_rtc(rtc_secs: u32) -> Self {
        let clock = Self::default();
        clock.set_rtc_secs(rtc_secs);
        clock
    }

    /// Advance both the monotonic and (if set) the wall clock.
    pub fn advance_millis(&self, ms: u64) {
        let before = self.millis.fetch_add(ms, Ordering::SeqCst);
        let rtc = self.rtc_secs.load(Ordering::SeqCst);
        if rtc != 0 {
            let whole_secs = (before + ms) / 1000 - before / 1000;
            self.rtc_secs
                .store(rtc.saturating_add(whole_secs as u32), Ordering::SeqCst);
        }
    }

    pub fn set_rtc_secs(&self, secs: u32) {
        self.rtc_secs.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }

    fn rtc_secs(&self) -> u32 {
        self.rtc_secs.load(Ordering::SeqCst)
    }
}
