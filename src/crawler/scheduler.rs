//! Request pacing and retry backoff
//!
//! Every outbound request, from every worker, passes through one
//! `RequestGate`, so the minimum delay between requests holds globally
//! rather than per worker.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Upper bound for a single backoff sleep
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Global minimum-interval gate shared by all workers
#[derive(Debug)]
pub struct RequestGate {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until the caller may send its request
    ///
    /// The lock is held across the sleep so that waiters are released one
    /// interval apart, in arrival order.
    pub async fn acquire(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(slot) = *next_slot {
            tokio::time::sleep_until(slot).await;
        }
        *next_slot = Some(Instant::now() + self.min_interval);
    }
}

/// Sleep before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(MAX_BACKOFF)
}
