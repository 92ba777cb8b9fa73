//! Jittered exponential backoff for upstream reconnection.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with downward jitter.
///
/// The n-th delay is `min(min_delay * 2^(n-1), max_delay)` scaled by a
/// random factor in `[1 - jitter, 1]`. The first call returns zero so a
/// fresh network connects immediately.
pub struct Backoff {
    min_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(min_delay: Duration, max_delay: Duration, jitter: f64) -> Self {
        Backoff {
            min_delay,
            max_delay,
            jitter,
            attempts: 0,
        }
    }

    /// Delay to sleep before the next connection attempt.
    pub fn next(&mut self) -> Duration {
        if self.attempts == 0 {
            self.attempts = 1;
            return Duration::ZERO;
        }

        let exp = self.attempts.saturating_sub(1).min(16);
        let ceiling = self
            .min_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        self.attempts = self.attempts.saturating_add(1);

        let factor = if self.jitter > 0.0 {
            1.0 - rand::thread_rng().gen_range(0.0..self.jitter)
        } else {
            1.0
        };
        ceiling.mul_f64(factor)
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_is_immediate() {
        let mut b = Backoff::new(Duration::from_secs(60), Duration::from_secs(600), 0.25);
        assert_eq!(b.next(), Duration::ZERO);
    }

    #[test]
    fn delays_grow_and_respect_lower_bound() {
        let min = Duration::from_secs(60);
        let max = Duration::from_secs(600);
        let jitter = 0.25;
        let mut b = Backoff::new(min, max, jitter);
        b.next();

        for i in 1..=8u32 {
            let expected = min
                .saturating_mul(2u32.saturating_pow(i - 1))
                .min(max);
            let d = b.next();
            assert!(
                d >= expected.mul_f64(1.0 - jitter),
                "attempt {}: {:?} below floor of {:?}",
                i,
                d,
                expected.mul_f64(1.0 - jitter)
            );
            assert!(d <= expected, "attempt {}: {:?} above ceiling {:?}", i, d, expected);
        }
    }

    #[test]
    fn reset_restores_immediate_retry() {
        let mut b = Backoff::new(Duration::from_secs(60), Duration::from_secs(600), 0.25);
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::ZERO);
    }
}
