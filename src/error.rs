/// Errors raised while building a limiter.
///
/// Only construction can fail. Once built, a limiter reports unsatisfiable or cancelled requests
/// through its normal return values.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum Error {
    /// The refill rate was zero, negative, NaN or infinite.
    #[error("rate must be a positive, finite number of permits per second (got {0})")]
    InvalidRate(f64),
    /// The capacity was zero, negative, NaN or infinite.
    #[error("capacity must be a positive, finite number of permits (got {0})")]
    InvalidCapacity(f64),
}
