use crate::Error;

/// The limits a [`TokenBucket`](crate::TokenBucket) is built from.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BucketConfig {
    /// Permits added to the bucket per second.
    pub rate_per_second: f64,
    /// The most permits the bucket can hold, and so the largest request it can ever grant.
    pub max_amount: f64,
    /// Permits available straight away. Clamped to `[0, max_amount]`.
    #[cfg_attr(feature = "serde", serde(default))]
    pub init_amount: f64,
}

impl BucketConfig {
    /// A bucket that starts empty.
    pub fn new(rate_per_second: f64, max_amount: f64) -> Self {
        Self {
            rate_per_second,
            max_amount,
            init_amount: 0.0,
        }
    }

    pub fn with_init_amount(mut self, init_amount: f64) -> Self {
        self.init_amount = init_amount;
        self
    }

    /// Check the rate and capacity. The initial amount is never rejected, only clamped.
    pub fn validate(&self) -> Result<(), Error> {
        if !(self.rate_per_second.is_finite() && self.rate_per_second > 0.0) {
            return Err(Error::InvalidRate(self.rate_per_second));
        }
        if !(self.max_amount.is_finite() && self.max_amount > 0.0) {
            return Err(Error::InvalidCapacity(self.max_amount));
        }
        Ok(())
    }

    pub(crate) fn clamped_init_amount(&self) -> f64 {
        // f64::max discards NaN
        self.init_amount.max(0.0).min(self.max_amount)
    }
}
