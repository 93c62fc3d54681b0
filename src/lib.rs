//! # Fair Rate Limiter
//! A token bucket rate limiter. Permits refill continuously at a fixed rate up to a capacity, and
//! each request takes some (possibly fractional) amount of them. Use it to turn away excess
//! incoming load with [`Bucket::try_consume`], or to pace outgoing work by waiting until permits
//! are available.
//!
//! Waiting is done through a [`FairQueue`], which serves concurrent requests strictly in the order
//! they arrive. A large request is never starved by a stream of small ones, and two waiters never
//! spend the same permits. Waits can be cancelled with a
//! [`CancellationToken`](tokio_util::sync::CancellationToken).
//!
//! # Example
//! Here, we create a limiter that refills 1 permit per second, holds at most 2, and starts empty.
//! The first request is served after 1 second and the second one, which asked for 2, after another
//! 2 seconds. A request for 3 could never be served and is turned away immediately.
//! ```
//! # use fair_rate_limiter::FairQueue;
//! # use futures::join;
//! # use tokio::time::Instant;
//! # #[tokio::main(flavor = "current_thread", start_paused = true)]
//! # async fn main() {
//!     let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
//!     let start = Instant::now();
//!     let first = async {
//!         queue.consume_when_available(1.0).await;
//!         println!("Got 1 at {:?}", Instant::now() - start);
//!     };
//!     let second = async {
//!         queue.consume_when_available(2.0).await;
//!         println!("Got 2 at {:?}", Instant::now() - start);
//!     };
//!     join!(first, second);
//! #   assert_eq!(Instant::now() - start, std::time::Duration::from_secs(3));
//!     assert!(!queue.consume_when_available(3.0).await);
//!
//!     // Got 1 at 1s
//!     // Got 2 at 3s
//! # }
//! ```
//!
//! # Time
//! All accounting is done in 100ns [`Ticks`] read from a [`Clock`]. The default
//! [`MonotonicClock`] follows tokio's clock, so tests on a paused runtime run instantly;
//! [`ManualClock`] can be stepped by hand.

mod blocking;
mod clock;
mod config;
mod error;
mod fair_queue;
mod token_bucket;

pub use blocking::BlockingLimiter;
pub use clock::{
    duration_to_ticks, ticks_to_duration, Clock, ManualClock, MonotonicClock, SystemClock, Ticks,
    NANOS_PER_TICK, TICKS_PER_SECOND, WAIT_IMPOSSIBLE,
};
pub use config::BucketConfig;
pub use error::Error;
pub use fair_queue::FairQueue;
pub use token_bucket::{Bucket, TokenBucket};
