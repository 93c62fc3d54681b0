use std::thread;

use crate::clock::{ticks_to_duration, Ticks};
use crate::{Bucket, Error, TokenBucket};

/// Paces a single thread by sleeping until a bucket says enough permits are there.
///
/// This does not take part in the [`FairQueue`](crate::FairQueue) chain and does not lock anything.
/// Share it between threads only behind your own lock, and not alongside a fair queue on the same
/// bucket: another consumer can drain the bucket while this one sleeps.
#[derive(Debug)]
pub struct BlockingLimiter<B = TokenBucket> {
    bucket: B,
}

impl BlockingLimiter<TokenBucket> {
    pub fn from_rate(
        rate_per_second: f64,
        max_amount: f64,
        init_amount: f64,
    ) -> Result<Self, Error> {
        let bucket = TokenBucket::new(rate_per_second, max_amount, init_amount)?;
        Ok(Self::new(bucket))
    }
}

impl<B: Bucket> BlockingLimiter<B> {
    pub fn new(bucket: B) -> Self {
        Self { bucket }
    }

    /// Block the calling thread until `amount` permits should be available.
    ///
    /// The wait is computed once and not re-checked afterwards, and nothing is consumed: follow up
    /// with [`try_consume`](Bucket::try_consume) if the permits should be taken. If `amount` can
    /// never be satisfied this returns at once.
    pub fn wait_for_amount(&mut self, amount: f64) {
        let wait = self.bucket.wait_time_for(amount);
        match ticks_to_duration(wait) {
            Some(duration) if !duration.is_zero() => {
                tracing::trace!(amount, ?duration, "Sleeping until permits are available");
                thread::sleep(duration);
            }
            Some(_) => {}
            None => tracing::warn!(amount, "Amount can never be satisfied, not waiting"),
        }
    }

    pub fn get_ref(&self) -> &B {
        &self.bucket
    }

    pub fn get_mut(&mut self) -> &mut B {
        &mut self.bucket
    }

    pub fn into_inner(self) -> B {
        self.bucket
    }
}

impl<B: Bucket> Bucket for BlockingLimiter<B> {
    fn try_consume(&mut self, amount: f64) -> bool {
        self.bucket.try_consume(amount)
    }

    fn wait_time_for(&mut self, amount: f64) -> Ticks {
        self.bucket.wait_time_for(amount)
    }
}
