//! First-come, first-served waiting for permits.
//!
//! The basic flow is:
//! 1. A request arrives and asks the bucket how long it would have to wait.
//! 2. If it never could be served, it is rejected on the spot. If it can be served now and nobody
//!    is queued, it consumes straight away.
//! 3. Otherwise it takes a ticket behind the most recent arrival (the tail) and becomes the tail.
//! 4. Once its predecessor has finished, it consumes, sleeping for the bucket's wait time
//!    between attempts.
//! 5. When it finishes it resolves its ticket, and stops being the tail unless someone has
//!    arrived since.
//!
//! There is no queue container. Each waiter only knows the ticket of the waiter in front of it,
//! which is enough to serve everyone in arrival order. Since only the waiter at the front of the
//! chain ever polls the bucket, small requests cannot repeatedly jump a large one, and two
//! waiters never race for the same permits.

use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::clock::{ticks_to_duration, Ticks, WAIT_IMPOSSIBLE};
use crate::{Bucket, Error, TokenBucket};

/// Resolves once a waiter is finished, and so is anyone it handed its place to.
type Completion = Shared<BoxFuture<'static, ()>>;

#[derive(Clone)]
struct Slot {
    id: u64,
    done: Completion,
}

struct State<B> {
    bucket: B,
    tail: Option<Slot>,
    next_id: u64,
}

impl<B> State<B> {
    /// Forget the tail once it has resolved. A tail restored by a cancelled waiter belongs to a
    /// ticket that no longer exists, so nobody else would clear it.
    fn forget_finished_tail(&mut self) {
        if self
            .tail
            .as_ref()
            .is_some_and(|tail| tail.done.clone().now_or_never().is_some())
        {
            self.tail = None;
        }
    }
}

/// Shares a [`Bucket`] between concurrent tasks, granting permits in the order they were asked for.
///
/// The bucket and the chain tail sit behind a single mutex. It is only ever held for a bucket
/// query, never while waiting.
pub struct FairQueue<B = TokenBucket> {
    state: Mutex<State<B>>,
}

enum Admission<'a, B> {
    Granted,
    Impossible,
    Queued(Ticket<'a, B>),
}

/// A waiter's place in the chain.
///
/// Dropping it, however the request ended, resolves the waiter's slot for its successor.
struct Ticket<'a, B> {
    queue: &'a FairQueue<B>,
    id: u64,
    /// Cleared once the predecessor is done.
    predecessor: Option<Slot>,
    handoff: Option<oneshot::Sender<Option<Completion>>>,
}

impl FairQueue<TokenBucket> {
    /// A fair queue over a fresh [`TokenBucket`] on the default clock.
    pub fn from_rate(
        rate_per_second: f64,
        max_amount: f64,
        init_amount: f64,
    ) -> Result<Self, Error> {
        let bucket = TokenBucket::new(rate_per_second, max_amount, init_amount)?;
        Ok(Self::new(bucket))
    }
}

impl<B> FairQueue<B> {
    pub fn new(bucket: B) -> Self {
        Self {
            state: Mutex::new(State {
                bucket,
                tail: None,
                next_id: 0,
            }),
        }
    }

    /// Whether any request is currently queued.
    pub fn is_contended(&self) -> bool {
        let mut state = self.lock();
        state.forget_finished_tail();
        state.tail.is_some()
    }

    /// Run `f` with exclusive access to the bucket.
    pub fn with_bucket<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
        f(&mut self.lock().bucket)
    }

    pub fn into_inner(self) -> B {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .bucket
    }

    // A panic while the lock was held can only have come from the bucket between two statements;
    // its numbers are still usable.
    fn lock(&self) -> MutexGuard<'_, State<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<B: Bucket> FairQueue<B> {
    /// Take `amount` permits now if available, ignoring anyone queued.
    pub fn try_consume(&self, amount: f64) -> bool {
        self.lock().bucket.try_consume(amount)
    }

    pub fn wait_time_for(&self, amount: f64) -> Ticks {
        self.lock().bucket.wait_time_for(amount)
    }

    /// Wait until `amount` permits can be taken, then take them.
    ///
    /// Returns `false` straight away if the bucket could never hold `amount`.
    pub async fn consume_when_available(&self, amount: f64) -> bool {
        let never_cancelled = CancellationToken::new();
        self.consume_when_available_cancellable(amount, &never_cancelled)
            .await
    }

    /// As [`consume_when_available`](Self::consume_when_available), but gives up and returns
    /// `false` once `cancel` fires. Dropping the future has the same effect.
    ///
    /// A cancelled request never consumes anything. It still keeps its place in line until the
    /// request ahead of it is done, so later requests are not let through early.
    pub async fn consume_when_available_cancellable(
        &self,
        amount: f64,
        cancel: &CancellationToken,
    ) -> bool {
        if cancel.is_cancelled() {
            tracing::debug!(amount, "Request was cancelled before it was made");
            return false;
        }

        let mut ticket = match self.admit(amount) {
            Admission::Granted => return true,
            Admission::Impossible => return false,
            Admission::Queued(ticket) => ticket,
        };

        ticket.consume(amount, cancel).await
    }

    fn admit(&self, amount: f64) -> Admission<'_, B> {
        let mut state = self.lock();
        state.forget_finished_tail();

        let wait = state.bucket.wait_time_for(amount);
        if wait == WAIT_IMPOSSIBLE {
            tracing::debug!(amount, "Rejecting request that can never be satisfied");
            return Admission::Impossible;
        }
        if wait == 0 && state.tail.is_none() && state.bucket.try_consume(amount) {
            tracing::trace!(amount, "Granted without queueing");
            return Admission::Granted;
        }

        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);

        let (handoff, handed_off) = oneshot::channel::<Option<Completion>>();
        let done = async move {
            if let Ok(Some(forwarded)) = handed_off.await {
                forwarded.await;
            }
        }
        .boxed()
        .shared();

        let predecessor = state.tail.replace(Slot { id, done });
        tracing::trace!(
            id,
            amount,
            wait,
            predecessor = predecessor.as_ref().map(|slot| slot.id),
            "Queued request"
        );

        Admission::Queued(Ticket {
            queue: self,
            id,
            predecessor,
            handoff: Some(handoff),
        })
    }
}

impl<B: Bucket> Ticket<'_, B> {
    async fn consume(&mut self, amount: f64, cancel: &CancellationToken) -> bool {
        if let Some(predecessor) = &self.predecessor {
            tokio::select! {
                _ = predecessor.done.clone() => {}
                _ = cancel.cancelled() => {
                    tracing::debug!(
                        id = self.id,
                        predecessor = predecessor.id,
                        "Cancelled while waiting for predecessor"
                    );
                    return false;
                }
            }
        }
        self.predecessor = None;

        loop {
            let wait = {
                let mut state = self.queue.lock();
                if state.bucket.try_consume(amount) {
                    tracing::trace!(id = self.id, amount, "Consumed");
                    return true;
                }
                state.bucket.wait_time_for(amount)
            };

            let Some(duration) = ticks_to_duration(wait) else {
                tracing::warn!(
                    id = self.id,
                    amount,
                    "Bucket can no longer satisfy a queued request, waiting for cancellation"
                );
                cancel.cancelled().await;
                return false;
            };

            tracing::trace!(id = self.id, amount, ?duration, "Waiting for permits");
            tokio::select! {
                _ = sleep(duration) => {}
                _ = cancel.cancelled() => {
                    tracing::debug!(id = self.id, amount, "Cancelled while waiting for permits");
                    return false;
                }
            }
        }
    }
}

impl<B> Drop for Ticket<'_, B> {
    fn drop(&mut self) {
        // Still set if we gave up before the predecessor finished. Anyone behind us has to keep
        // waiting for it.
        let unfinished = self.predecessor.take();

        // Resolve before touching the tail, so a predecessor finishing concurrently either sees
        // itself restored as the tail or has already resolved.
        if let Some(handoff) = self.handoff.take() {
            let _ = handoff.send(unfinished.as_ref().map(|slot| slot.done.clone()));
        }

        let mut state = self.queue.lock();
        if state.tail.as_ref().is_some_and(|tail| tail.id == self.id) {
            state.tail = unfinished;
        }
        state.forget_finished_tail();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TICKS_PER_SECOND;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::Instant;

    const TOLERANCE: Duration = Duration::from_millis(10);

    fn assert_elapsed(start: Instant, at: Instant, expected: Duration) {
        let elapsed = at - start;
        assert!(
            elapsed >= expected && elapsed <= expected + TOLERANCE,
            "expected ~{expected:?}, took {elapsed:?}"
        );
    }

    async fn timed<B: Bucket>(
        queue: &FairQueue<B>,
        amount: f64,
        cancel: &CancellationToken,
    ) -> (bool, Instant) {
        let ok = queue
            .consume_when_available_cancellable(amount, cancel)
            .await;
        (ok, Instant::now())
    }

    #[tokio::test(start_paused = true)]
    async fn test_available_amount_is_granted_immediately() {
        let queue = FairQueue::from_rate(1.0, 2.0, 2.0).unwrap();
        let start = Instant::now();

        assert!(queue.consume_when_available(2.0).await);
        assert_eq!(Instant::now(), start);
        assert!(!queue.is_contended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_the_required_time() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
        let start = Instant::now();

        assert!(queue.consume_when_available(1.0).await);
        assert_elapsed(start, Instant::now(), Duration::from_secs(1));
        assert!(!queue.is_contended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_impossible_amount_is_rejected_immediately() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
        let start = Instant::now();

        assert!(!queue.consume_when_available(3.0).await);
        assert_eq!(Instant::now(), start);
        assert!(!queue.is_contended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_complete_in_arrival_order() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
        let start = Instant::now();

        let never = CancellationToken::new();
        let ((ok1, at1), (ok2, at2)) = tokio::join!(
            timed(&queue, 1.0, &never),
            timed(&queue, 1.0, &never)
        );

        assert!(ok1 && ok2);
        assert_elapsed(start, at1, Duration::from_secs(1));
        assert_elapsed(start, at2, Duration::from_secs(2));
        assert!(!queue.is_contended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_impossible_request_does_not_wait_behind_others() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
        let start = Instant::now();

        let never = CancellationToken::new();
        let ((ok1, at1), (ok2, at2)) = tokio::join!(
            timed(&queue, 1.0, &never),
            timed(&queue, 3.0, &never)
        );

        assert!(ok1);
        assert_elapsed(start, at1, Duration::from_secs(1));
        assert!(!ok2);
        assert_eq!(at2, start);
    }

    /// Without the chain, the two small requests would be served at 1s and 2s and the large one
    /// would keep waiting.
    #[tokio::test(start_paused = true)]
    async fn test_large_request_is_not_starved() {
        let queue = FairQueue::from_rate(1.0, 5.0, 0.0).unwrap();
        let start = Instant::now();

        let never = CancellationToken::new();
        let ((big, big_at), (small1, small1_at), (small2, small2_at)) =
            tokio::join!(
                timed(&queue, 3.0, &never),
                timed(&queue, 1.0, &never),
                timed(&queue, 1.0, &never)
            );

        assert!(big && small1 && small2);
        assert_elapsed(start, big_at, Duration::from_secs(3));
        assert_elapsed(start, small1_at, Duration::from_secs(4));
        assert_elapsed(start, small2_at, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pre_cancelled_request_touches_nothing() {
        let queue = FairQueue::from_rate(1.0, 2.0, 2.0).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!queue.consume_when_available_cancellable(1.0, &cancel).await);
        assert_eq!(queue.with_bucket(|bucket| bucket.available()), 2.0);
        assert!(!queue.is_contended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_waiting_for_permits() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.5).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let (ok, ()) = tokio::join!(
            queue.consume_when_available_cancellable(1.0, &cancel),
            async { cancel.cancel() }
        );

        assert!(!ok);
        assert_eq!(Instant::now(), start);
        assert_eq!(queue.with_bucket(|bucket| bucket.available()), 0.5);
        assert!(!queue.is_contended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_keeps_its_place() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let never = CancellationToken::new();
        let ((ok1, at1), (ok2, at2), (ok3, at3), ()) = tokio::join!(
            timed(&queue, 1.0, &never),
            timed(&queue, 1.0, &cancel),
            timed(&queue, 1.0, &never),
            async { cancel.cancel() }
        );

        assert!(ok1);
        assert_elapsed(start, at1, Duration::from_secs(1));
        assert!(!ok2);
        assert_eq!(at2, start);
        // The third request still waits for the first, rather than racing it
        assert!(ok3);
        assert_elapsed(start, at3, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_tail_hands_the_tail_back() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
        let start = Instant::now();

        let first = queue.consume_when_available(1.0);
        tokio::pin!(first);
        assert!(futures::poll!(&mut first).is_pending());

        let cancel = CancellationToken::new();
        let second = queue.consume_when_available_cancellable(1.0, &cancel);
        tokio::pin!(second);
        assert!(futures::poll!(&mut second).is_pending());
        cancel.cancel();
        assert!(!second.await);

        // The first request is still waiting, so newcomers must queue behind it
        assert!(queue.is_contended());
        assert_eq!(queue.lock().tail.as_ref().map(|slot| slot.id), Some(0));

        let third = async {
            let ok = queue.consume_when_available(1.0).await;
            (ok, Instant::now())
        };
        let first = async {
            let ok = first.await;
            (ok, Instant::now())
        };
        let ((ok1, at1), (ok3, at3)) = tokio::join!(first, third);

        assert!(ok1 && ok3);
        assert_elapsed(start, at1, Duration::from_secs(1));
        assert_elapsed(start, at3, Duration::from_secs(2));
        assert!(!queue.is_contended());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tail_left_by_two_cancelled_waiters_is_cleared() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
        let start = Instant::now();

        let first = queue.consume_when_available(1.0);
        tokio::pin!(first);
        assert!(futures::poll!(&mut first).is_pending());

        let cancel_second = CancellationToken::new();
        let second = queue.consume_when_available_cancellable(1.0, &cancel_second);
        tokio::pin!(second);
        assert!(futures::poll!(&mut second).is_pending());

        let cancel_third = CancellationToken::new();
        let third = queue.consume_when_available_cancellable(1.0, &cancel_third);
        tokio::pin!(third);
        assert!(futures::poll!(&mut third).is_pending());

        cancel_second.cancel();
        assert!(!second.await);
        cancel_third.cancel();
        assert!(!third.await);

        // The tail now forwards to the first request, which is still waiting
        assert_eq!(queue.lock().tail.as_ref().map(|slot| slot.id), Some(1));
        assert!(queue.is_contended());

        assert!(first.await);
        assert_elapsed(start, Instant::now(), Duration::from_secs(1));
        assert!(queue.lock().tail.is_none());
        assert!(!queue.is_contended());

        // Uncontended again, so an available amount is granted without queueing
        sleep(Duration::from_secs(1)).await;
        let before = Instant::now();
        assert!(queue.consume_when_available(1.0).await);
        assert_eq!(Instant::now(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_the_future_releases_its_place() {
        let queue = FairQueue::from_rate(1.0, 2.0, 0.0).unwrap();
        let start = Instant::now();

        {
            let abandoned = queue.consume_when_available(1.0);
            tokio::pin!(abandoned);
            assert!(futures::poll!(&mut abandoned).is_pending());
            assert!(queue.is_contended());
        }
        assert!(!queue.is_contended());

        // Nothing was consumed by the abandoned request
        assert!(queue.consume_when_available(1.0).await);
        assert_elapsed(start, Instant::now(), Duration::from_secs(1));
    }

    /// Reports a short wait once, then claims the amount can never be served.
    struct Fickle {
        asked: bool,
    }

    impl Bucket for Fickle {
        fn try_consume(&mut self, _amount: f64) -> bool {
            false
        }

        fn wait_time_for(&mut self, _amount: f64) -> Ticks {
            if std::mem::replace(&mut self.asked, true) {
                WAIT_IMPOSSIBLE
            } else {
                TICKS_PER_SECOND
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_request_waits_for_cancellation_when_bucket_gives_up() {
        let queue = FairQueue::new(Fickle { asked: false });
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let (ok, ()) = tokio::join!(
            queue.consume_when_available_cancellable(1.0, &cancel),
            async {
                sleep(Duration::from_secs(10)).await;
                cancel.cancel();
            }
        );

        assert!(!ok);
        assert_elapsed(start, Instant::now(), Duration::from_secs(10));
        assert!(!queue.is_contended());
        assert!(queue.into_inner().asked);
    }
}
