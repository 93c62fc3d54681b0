use crate::clock::{Clock, MonotonicClock, Ticks, TICKS_PER_SECOND, WAIT_IMPOSSIBLE};
use crate::{BucketConfig, Error};

/// Something that hands out permits over time.
///
/// Neither method is synchronised: callers sharing a bucket between threads must hold a lock around
/// every call. [`FairQueue`](crate::FairQueue) does this for you.
pub trait Bucket {
    /// Take `amount` permits if they are available right now.
    fn try_consume(&mut self, amount: f64) -> bool;

    /// Ticks until `amount` permits will be available, `0` if they already are, or
    /// [`WAIT_IMPOSSIBLE`] if they never will be.
    fn wait_time_for(&mut self, amount: f64) -> Ticks;
}

/// A token bucket: up to `capacity` permits, refilled continuously at a fixed rate.
///
/// Refilling is lazy. The amount only catches up with the clock when the bucket is queried.
#[derive(Debug)]
pub struct TokenBucket<C = MonotonicClock> {
    rate_per_tick: f64,
    capacity: f64,
    current_amount: f64,
    last_update: Ticks,
    clock: C,
}

impl TokenBucket<MonotonicClock> {
    /// Build a bucket on the default monotonic clock.
    ///
    /// For wall-clock time, pass a [`SystemClock`](crate::SystemClock) to
    /// [`with_clock`](Self::with_clock) instead.
    ///
    /// `init_amount` is clamped to `[0, max_amount]`; pass `max_amount` to allow an initial burst.
    pub fn new(rate_per_second: f64, max_amount: f64, init_amount: f64) -> Result<Self, Error> {
        Self::with_clock(
            rate_per_second,
            max_amount,
            init_amount,
            MonotonicClock::new(),
        )
    }
}

impl<C: Clock> TokenBucket<C> {
    pub fn with_clock(
        rate_per_second: f64,
        max_amount: f64,
        init_amount: f64,
        clock: C,
    ) -> Result<Self, Error> {
        let config = BucketConfig::new(rate_per_second, max_amount).with_init_amount(init_amount);
        Self::from_config(&config, clock)
    }

    pub fn from_config(config: &BucketConfig, clock: C) -> Result<Self, Error> {
        config.validate()?;
        let last_update = clock.now_ticks();
        Ok(Self {
            rate_per_tick: config.rate_per_second / TICKS_PER_SECOND as f64,
            capacity: config.max_amount,
            current_amount: config.clamped_init_amount(),
            last_update,
            clock,
        })
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Bring the bucket up to date and return the permits currently available.
    pub fn available(&mut self) -> f64 {
        self.advance();
        self.current_amount
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Add whatever has accrued since the last update. A clock reading at or before the last update
    /// changes nothing, so a clock stepping backwards never drains the bucket.
    fn advance(&mut self) {
        let now = self.clock.now_ticks();
        let delta = now.saturating_sub(self.last_update);
        if delta > 0 {
            let refilled = self.current_amount + delta as f64 * self.rate_per_tick;
            self.current_amount = refilled.min(self.capacity);
            self.last_update = now;
        }
    }
}

impl<C: Clock> Bucket for TokenBucket<C> {
    fn try_consume(&mut self, amount: f64) -> bool {
        debug_assert!(
            amount >= 0.0 || amount.is_nan(),
            "cannot consume a negative amount"
        );
        self.advance();
        if self.current_amount >= amount {
            self.current_amount -= amount;
            true
        } else {
            false
        }
    }

    fn wait_time_for(&mut self, amount: f64) -> Ticks {
        if amount <= self.current_amount {
            return 0;
        }
        self.advance();
        if amount <= self.current_amount {
            return 0;
        }
        if amount.is_nan() || amount > self.capacity {
            return WAIT_IMPOSSIBLE;
        }

        let lack = amount - self.current_amount;
        let wait = (lack / self.rate_per_tick).ceil();
        if wait >= WAIT_IMPOSSIBLE as f64 {
            WAIT_IMPOSSIBLE
        } else {
            wait as Ticks
        }
    }
}
