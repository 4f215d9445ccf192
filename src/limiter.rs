//! Per-model token-bucket rate limiting with burst capacity.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::error::GatewayError;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Classical token bucket: `rate` tokens per second, bursting up to
/// `capacity`. Each request consumes one token; callers either fail fast or
/// wait (bounded), per the model's configuration.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    wait: bool,
    wait_timeout: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: &RateLimitConfig) -> Self {
        TokenBucket {
            rate: config.rate,
            capacity: config.capacity,
            wait: config.wait,
            wait_timeout: Duration::from_secs(config.wait_timeout_secs),
            state: Mutex::new(BucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + self.rate * elapsed).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Consume one token if available, without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Acquire one token according to the configured wait discipline.
    ///
    /// Fail-fast mode returns `rate_limited` immediately when the bucket is
    /// empty; wait mode sleeps until a token accrues or the bounded wait
    /// elapses.
    pub async fn acquire(&self, model_id: &str) -> crate::Result<()> {
        if self.try_acquire() {
            return Ok(());
        }
        if !self.wait {
            return Err(GatewayError::RateLimited(format!(
                "model '{}' exceeded {} req/s (burst {})",
                model_id, self.rate, self.capacity
            )));
        }
        let deadline = Instant::now() + self.wait_timeout;
        loop {
            // Sleep just long enough for one token to accrue.
            let wait = Duration::from_secs_f64((1.0 / self.rate).min(0.25));
            tokio::time::sleep(wait).await;
            if self.try_acquire() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GatewayError::RateLimited(format!(
                    "model '{}' no token within {:?}",
                    model_id, self.wait_timeout
                )));
            }
        }
    }

    /// Tokens currently available (may be fractional or momentarily negative
    /// readings are clamped at zero).
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        self.refill(&mut state);
        state.tokens.max(0.0)
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Fraction of burst capacity currently consumed, 0.0..=1.0.
    pub fn utilisation(&self) -> f64 {
        1.0 - (self.available_tokens() / self.capacity).clamp(0.0, 1.0)
    }
}
