//! Token-bucket rate limiting — §3, §4.1–§4.3.
//!
//! Three layers, leaf to root:
//!
//! - [`TokenBucket`] — a single client's counter with atomic take/refill.
//! - [`manager::BucketManager`] — owns every bucket, refills them all on a
//!   fixed cadence from one background task.
//! - [`limiter::RateLimiter`] — maps client identity to a bucket, creating
//!   one on first sight and exposing the CRUD surface the admin API wraps.

pub mod limiter;
pub mod manager;

pub use limiter::{ClientPolicy, RateLimiter};
pub use manager::BucketManager;

use std::sync::Mutex;

/// Per-client token reservoir. §4.1.
///
/// All four operations are total and non-blocking, serialized by a plain
/// mutex (same shape original_source's `pkg/ratelimit/bucket.go` uses — a
/// `sync.Mutex` guarding a float counter; contention per bucket is never
/// more than a handful of concurrent requests for one client).
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    state: Mutex<BucketState>,
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    refill_rate: f64,
}

impl TokenBucket {
    /// A fresh bucket starts full — `tokens == capacity` — matching
    /// original_source's `NewTokenBucket`.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            state: Mutex::new(BucketState { tokens: capacity as f64, refill_rate }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Atomically take one token if available.
    ///
    /// Returns `true` and debits `1.0` when `tokens >= 1.0`; otherwise
    /// returns `false` with no side effect. Never blocks.
    pub fn take(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket mutex poisoned");
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Add `amount` tokens, clamped at `capacity`. `amount` must be `>= 0`.
    pub fn add(&self, amount: f64) {
        debug_assert!(amount >= 0.0, "refill amount must be non-negative");
        let mut state = self.state.lock().expect("token bucket mutex poisoned");
        state.tokens = (state.tokens + amount).min(self.capacity as f64);
    }

    /// Current token count.
    pub fn peek(&self) -> f64 {
        self.state.lock().expect("token bucket mutex poisoned").tokens
    }

    /// Replace the refill rate in place. Does not touch `tokens` or `capacity`.
    pub fn set_rate(&self, rate: f64) {
        self.state.lock().expect("token bucket mutex poisoned").refill_rate = rate;
    }

    pub fn refill_rate(&self) -> f64 {
        self.state.lock().expect("token bucket mutex poisoned").refill_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_bucket_starts_full() {
        let b = TokenBucket::new(5, 1.0);
        assert_eq!(b.peek(), 5.0);
    }

    #[test]
    fn take_debits_exactly_one_token() {
        let b = TokenBucket::new(3, 1.0);
        assert!(b.take());
        assert_eq!(b.peek(), 2.0);
    }

    #[test]
    fn take_fails_once_exhausted() {
        let b = TokenBucket::new(1, 1.0);
        assert!(b.take());
        assert!(!b.take());
        assert_eq!(b.peek(), 0.0);
    }

    #[test]
    fn add_clamps_at_capacity() {
        let b = TokenBucket::new(2, 1.0);
        assert!(b.take());
        b.add(10.0);
        assert_eq!(b.peek(), 2.0);
    }

    #[test]
    fn add_never_exceeds_capacity_even_from_empty() {
        let b = TokenBucket::new(4, 1.0);
        for _ in 0..4 {
            b.take();
        }
        assert_eq!(b.peek(), 0.0);
        b.add(100.0);
        assert_eq!(b.peek(), 4.0);
    }

    #[test]
    fn set_rate_replaces_rate_without_touching_tokens() {
        let b = TokenBucket::new(5, 1.0);
        b.take();
        b.set_rate(9.5);
        assert_eq!(b.refill_rate(), 9.5);
        assert_eq!(b.peek(), 4.0);
    }

    #[test]
    fn bucket_bounds_hold_under_interleaved_take_and_add() {
        let b = TokenBucket::new(10, 1.0);
        for _ in 0..25 {
            b.take();
            b.add(0.3);
            let tokens = b.peek();
            assert!((0.0..=10.0).contains(&tokens), "tokens out of bounds: {tokens}");
        }
    }
}
