//! Token-bucket admission for rate-limited overlay systems.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Admits up to `per_second` requests per second for one overlay system.
///
/// The bucket starts full, so the first requests after process start (or
/// after an idle second) are admitted; ties break toward admit. Tokens are
/// scaled by 1000 internally for sub-token refill precision without floating
/// point. All operations are lock-free compare-and-swap loops.
pub(crate) struct RateLimiter {
    /// Max tokens (scaled by 1000).
    capacity: u64,
    /// Nanoseconds between single-token refills.
    refill_nanos: u64,
    /// Current token count (scaled by 1000).
    tokens: AtomicU64,
    /// Last refill timestamp (nanos since `start`).
    last_refill: AtomicU64,
    /// Anchor instant for elapsed time.
    start: Instant,
}

const TOKEN_SCALE: u64 = 1000;

impl RateLimiter {
    /// Creates a limiter targeting `per_second` admissions per second.
    pub(crate) fn new(per_second: u64) -> Self {
        let per_second = per_second.max(1);
        let capacity = per_second.saturating_mul(TOKEN_SCALE);
        Self {
            capacity,
            refill_nanos: 1_000_000_000 / per_second,
            tokens: AtomicU64::new(capacity),
            last_refill: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Takes one token if available.
    pub(crate) fn try_acquire(&self) -> bool {
        self.refill();
        loop {
            let current = self.tokens.load(Ordering::Acquire);
            if current < TOKEN_SCALE {
                return false;
            }
            if self
                .tokens
                .compare_exchange_weak(
                    current,
                    current - TOKEN_SCALE,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Adds tokens for elapsed time. A CAS on `last_refill` ensures one
    /// thread credits each interval.
    fn refill(&self) {
        let now_nanos = u64::try_from(self.start.elapsed().as_nanos()).unwrap_or(u64::MAX);
        loop {
            let last = self.last_refill.load(Ordering::Acquire);
            let elapsed = now_nanos.saturating_sub(last);
            let intervals = elapsed / self.refill_nanos;
            if intervals == 0 {
                return;
            }

            let new_last = last + intervals * self.refill_nanos;
            if self
                .last_refill
                .compare_exchange_weak(last, new_last, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue; // another thread claimed this interval
            }

            let credit = intervals.saturating_mul(TOKEN_SCALE);
            loop {
                let current = self.tokens.load(Ordering::Acquire);
                let next = current.saturating_add(credit).min(self.capacity);
                if current == next {
                    return;
                }
                if self
                    .tokens
                    .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_admits_first_request() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn denies_once_drained() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire(), "third request within a second");
    }

    #[test]
    fn concurrent_acquires_never_exceed_capacity() {
        use std::sync::Arc;
        use std::thread;

        let limiter = Arc::new(RateLimiter::new(10));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = Arc::clone(&limiter);
            handles.push(thread::spawn(move || {
                (0..100).filter(|_| limiter.try_acquire()).count()
            }));
        }

        let admitted: usize = handles
            .into_iter()
            .map(|h| h.join().expect("thread panicked"))
            .sum();
        // 10 seeded tokens plus at most a few refilled during the run.
        assert!(admitted >= 10);
        assert!(admitted <= 20, "admitted {admitted}");
    }
}
