//! Token-bucket admission control for archive fetches.
//!
//! Rate limitation is governed by the existence of tokens in a bucket which
//! refills continuously at a configured rate. As long as a token can be
//! consumed, a queue message may be admitted; otherwise the message returns to
//! the queue. A bucket serves a closed set of keys, one per upstream archive,
//! so the primary and secondary fetch rates are throttled independently.
//!
//! Buckets are per-process. They gate outbound request rate per worker, not
//! global correctness, so no cross-process coordination is required.

mod control;

pub use control::control_router;

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The streams a bucket distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKey {
    Primary,
    Secondary,
}

impl ArchiveKey {
    const ALL: [ArchiveKey; 2] = [ArchiveKey::Primary, ArchiveKey::Secondary];

    fn index(self) -> usize {
        match self {
            ArchiveKey::Primary => 0,
            ArchiveKey::Secondary => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ArchiveKey::Primary => "primary",
            ArchiveKey::Secondary => "secondary",
        }
    }
}

#[derive(Debug)]
struct State {
    /// Tokens added per second. May be fractional. Zero means "never admit".
    rate: f64,
    /// Maximum tokens held at any point in time.
    capacity: f64,
    /// Current (fractional) token count per key.
    tokens: [f64; 2],
    last_refill: Instant,
}

/// A token bucket shared by the consumers of one service, adjustable at
/// runtime through [`control_router`].
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<State>,
}

pub const DEFAULT_RATE: f64 = 5.0;
pub const DEFAULT_CAPACITY: u32 = 5;

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_RATE, DEFAULT_CAPACITY)
    }
}

impl TokenBucket {
    /// A bucket which starts full.
    pub fn new(rate: f64, capacity: u32) -> Self {
        let capacity = f64::from(capacity);
        Self {
            state: Mutex::new(State {
                rate,
                capacity,
                tokens: [capacity; 2],
                last_refill: Instant::now(),
            }),
        }
    }

    /// Consume one token for `key` if available. A zero rate always denies,
    /// regardless of capacity or elapsed time.
    pub fn try_acquire(&self, key: ArchiveKey) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: ArchiveKey, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.rate == 0.0 {
            return false;
        }
        state.refill(now);

        let tokens = &mut state.tokens[key.index()];
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens added per second.
    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }

    /// Replace the refill rate. Accrued tokens are kept; a zero rate keeps
    /// them frozen and inaccessible until the rate becomes positive again.
    pub fn set_rate(&self, rate: f64) {
        let mut state = self.state.lock().unwrap();
        // Settle accrual under the old rate before switching.
        let now = Instant::now();
        state.refill(now);
        state.rate = rate;
        tracing::info!(rate, "token bucket rate updated");
    }
}

impl State {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        if self.rate == 0.0 {
            return;
        }
        let accrued = elapsed.as_secs_f64() * self.rate;
        for key in ArchiveKey::ALL {
            let tokens = &mut self.tokens[key.index()];
            *tokens = (*tokens + accrued).min(self.capacity);
        }
    }
}

/// Suggested pause before re-queueing a message denied by the bucket.
pub fn denial_backoff(rate: f64) -> Duration {
    if rate > 0.0 {
        // Half a token's worth, bounded to keep requeue churn visible but low.
        Duration::from_secs_f64((0.5 / rate).clamp(0.001, 1.0))
    } else {
        Duration::from_secs(1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_zero_rate_never_admits() {
        let bucket = TokenBucket::new(0.0, 5);
        let start = Instant::now();
        for seconds in [0u64, 1, 60, 3600] {
            let now = start + Duration::from_secs(seconds);
            assert!(!bucket.try_acquire_at(ArchiveKey::Primary, now));
            assert!(!bucket.try_acquire_at(ArchiveKey::Secondary, now));
        }
    }

    #[test]
    fn test_capacity_bounds_initial_burst() {
        let bucket = TokenBucket::new(1.0, 3);
        let now = Instant::now();
        assert!(bucket.try_acquire_at(ArchiveKey::Primary, now));
        assert!(bucket.try_acquire_at(ArchiveKey::Primary, now));
        assert!(bucket.try_acquire_at(ArchiveKey::Primary, now));
        assert!(!bucket.try_acquire_at(ArchiveKey::Primary, now));
    }

    #[test]
    fn test_keys_consume_independently() {
        let bucket = TokenBucket::new(1.0, 1);
        let now = Instant::now();
        assert!(bucket.try_acquire_at(ArchiveKey::Primary, now));
        assert!(bucket.try_acquire_at(ArchiveKey::Secondary, now));
        assert!(!bucket.try_acquire_at(ArchiveKey::Primary, now));
    }

    #[test]
    fn test_fractional_refill_accrues() {
        let bucket = TokenBucket::new(0.5, 1);
        let start = Instant::now();
        assert!(bucket.try_acquire_at(ArchiveKey::Primary, start));
        // Half a token after one second; not yet admissible.
        assert!(!bucket.try_acquire_at(ArchiveKey::Primary, start + Duration::from_secs(1)));
        // A full token has accrued by two seconds.
        assert!(bucket.try_acquire_at(ArchiveKey::Primary, start + Duration::from_secs(2)));
    }

    #[test]
    fn test_rate_is_adjustable_at_runtime() {
        let bucket = TokenBucket::new(0.0, 1);
        assert!(!bucket.try_acquire(ArchiveKey::Primary));

        bucket.set_rate(100.0);
        let now = Instant::now() + Duration::from_secs(1);
        assert!(bucket.try_acquire_at(ArchiveKey::Primary, now));
        assert_eq!(bucket.rate(), 100.0);
    }

    #[test]
    fn test_denial_backoff_bounds() {
        assert_eq!(denial_backoff(0.0), Duration::from_secs(1));
        assert_eq!(denial_backoff(0.25), Duration::from_secs(1));
        assert!(denial_backoff(5.0) < Duration::from_millis(200));
    }
}
