//! Dump Rate Limiting
//!
//! Caps the rows per second a dumper reads from the source.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Throughput cap applied between dump batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitAlgorithm {
    #[default]
    Unlimited,
    /// Rows per second
    Qps(u64),
}

impl RateLimitAlgorithm {
    /// Build from a configured rows/sec value; 0 means unlimited
    pub fn from_rows_per_sec(rows_per_sec: u64) -> Self {
        if rows_per_sec == 0 {
            RateLimitAlgorithm::Unlimited
        } else {
            RateLimitAlgorithm::Qps(rows_per_sec)
        }
    }
}

/// Shared limiter; clones draw from the same budget
#[derive(Debug, Clone)]
pub struct RateLimiter {
    algorithm: RateLimitAlgorithm,
    next_slot: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    pub fn new(algorithm: RateLimitAlgorithm) -> Self {
        Self {
            algorithm,
            next_slot: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(RateLimitAlgorithm::Unlimited)
    }

    pub fn algorithm(&self) -> RateLimitAlgorithm {
        self.algorithm
    }

    /// Wait until `rows` more rows fit in the budget
    pub async fn intercept(&self, rows: u64) {
        let RateLimitAlgorithm::Qps(rows_per_sec) = self.algorithm else {
            return;
        };
        if rows == 0 {
            return;
        }
        let cost = Duration::from_secs_f64(rows as f64 / rows_per_sec as f64);

        let wait_until = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let start = (*next_slot).max(now);
            *next_slot = start + cost;
            start
        };
        tokio::time::sleep_until(wait_until).await;
    }

    /// Like [`intercept`](Self::intercept), but stops waiting once `cancel`
    /// fires. Returns false when cancelled.
    pub async fn intercept_until_cancelled(&self, rows: u64, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = self.intercept(rows) => true,
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
