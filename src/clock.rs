//! Time sources for the bucket.
//!
//! All accounting is done in integer ticks of 100ns. A [`Clock`] only has to report the current
//! tick count relative to some fixed epoch; the bucket never cares what that epoch is.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// A point in time, or a span of time, counted in 100ns ticks.
pub type Ticks = i64;

pub const NANOS_PER_TICK: u64 = 100;
pub const TICKS_PER_SECOND: Ticks = 10_000_000;

/// Returned as a wait time when no amount of waiting can satisfy a request.
pub const WAIT_IMPOSSIBLE: Ticks = Ticks::MAX;

pub trait Clock: Send + Sync {
    /// Current time in ticks since this clock's epoch.
    fn now_ticks(&self) -> Ticks;
}

/// Monotonic ticks since the clock was created.
///
/// Reads [`tokio::time::Instant`], so with tokio's `test-util` feature a paused runtime drives this
/// clock as well as the timers the fair queue sleeps on. Clones share the same epoch.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ticks(&self) -> Ticks {
        duration_to_ticks(Instant::now() - self.epoch)
    }
}

/// Wall-clock ticks since the UNIX epoch.
///
/// The wall clock can be set backwards; the bucket treats that as no time passing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ticks(&self) -> Ticks {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(duration_to_ticks)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Clones observe the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start: Ticks) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(start)),
        }
    }

    pub fn set(&self, ticks: Ticks) {
        self.now.store(ticks, Ordering::SeqCst);
    }

    /// Move the clock by `ticks`, saturating at the ends of the range instead of wrapping.
    pub fn advance(&self, ticks: Ticks) {
        let _ = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(ticks))
            });
    }

    pub fn advance_by(&self, duration: Duration) {
        self.advance(duration_to_ticks(duration));
    }
}

impl Clock for ManualClock {
    fn now_ticks(&self) -> Ticks {
        self.now.load(Ordering::SeqCst)
    }
}

/// Convert a wait time into something a timer can sleep on.
///
/// Returns `None` for [`WAIT_IMPOSSIBLE`]. Negative spans are treated as zero.
pub fn ticks_to_duration(ticks: Ticks) -> Option<Duration> {
    if ticks == WAIT_IMPOSSIBLE {
        return None;
    }
    let ticks = u64::try_from(ticks).unwrap_or(0);
    let per_second = TICKS_PER_SECOND as u64;
    let subsec_nanos = (ticks % per_second) * NANOS_PER_TICK;
    Some(Duration::new(ticks / per_second, subsec_nanos as u32))
}

/// Whole ticks in `duration`, rounded down and saturating at [`Ticks::MAX`].
pub fn duration_to_ticks(duration: Duration) -> Ticks {
    Ticks::try_from(duration.as_nanos() / u128::from(NANOS_PER_TICK)).unwrap_or(Ticks::MAX)
}
