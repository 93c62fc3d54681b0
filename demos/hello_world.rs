//! Construct a fair queue that refills 2 permits per second and holds at most 4.
//! Several tasks repeatedly ask for a random amount and print when they were served.

use fair_rate_limiter::FairQueue;

use std::sync::Arc;

use futures::future::join_all;
use rand::{thread_rng, Rng};
use tokio::time::Instant;

#[tokio::main]
async fn main() {
    let queue = Arc::new(FairQueue::from_rate(2.0, 4.0, 4.0).expect("valid limits"));

    let start = Instant::now();

    let workers = (0..3).map(|worker| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            for _ in 0..4 {
                let amount: f64 = thread_rng().gen_range(1..=4) as f64;
                if queue.consume_when_available(amount).await {
                    println!(
                        "Worker {} got {} at {:?}",
                        worker,
                        amount,
                        Instant::now() - start
                    );
                }
            }
        })
    });

    join_all(workers).await;
}
