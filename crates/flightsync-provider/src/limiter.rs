use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket owned by a single tenant's provider client.
///
/// The bucket holds at most `rate_per_second` tokens and refills continuously,
/// so a burst of up to one second's worth of requests goes out immediately and
/// the rest are spaced at `1 / rate` seconds.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_second: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn per_second(rate: u32) -> Self {
        let rate = f64::from(rate.max(1));
        Self {
            rate_per_second: rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_second).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate_per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}
