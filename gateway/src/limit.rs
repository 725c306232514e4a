//! Client admission rate limiting.
//!
//! The gateway only depends on the [`RateLimiter`] capability; the shipped
//! implementation is an in-memory per-client token bucket. A shared-state
//! limiter (e.g. backed by a remote store) slots in behind the same trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Admission surface: given a client identifier, admit or reject one request.
pub trait RateLimiter: Send + Sync {
    fn allow(&self, key: &str) -> bool;
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-client token-bucket rate limiter held entirely in memory.
pub struct MemoryRateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    /// Refill rate in tokens per second.
    rate: f64,
    burst: f64,
}

impl MemoryRateLimiter {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate: f64::from(requests_per_minute) / 60.0,
            burst: f64::from(burst.max(1)),
        }
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Periodically drop all buckets so idle clients do not accumulate.
    pub fn spawn_cleanup(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                self.buckets.lock().unwrap().clear();
                tracing::debug!("Cleared stale rate limiter buckets");
            }
        })
    }
}

impl RateLimiter for MemoryRateLimiter {
    fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }
}
