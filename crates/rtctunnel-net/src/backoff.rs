//! Exponential, optionally jittered retry delays
//!
//! Used by the signal receive loop and the rendezvous send path.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Configuration for a [`Backoff`]
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay, and the lower bound of the jitter window
    pub initial_delay: Duration,
    /// Upper bound on the un-jittered delay
    pub max_delay: Duration,
    /// Growth factor applied after each delay
    pub multiplier: f64,
    /// When enabled, each delay is sampled uniformly from
    /// `[initial_delay, current)`
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: true,
        }
    }
}

/// Generates the retry delay sequence `d0 = initial`,
/// `di = min(max, d(i-1) * multiplier)`.
pub struct Backoff {
    cfg: BackoffConfig,
    cur: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(cfg: BackoffConfig) -> Self {
        Self::with_rng(cfg, StdRng::from_entropy())
    }

    /// Use a caller-supplied RNG for the jitter, so sequences can be made
    /// deterministic.
    pub fn with_rng(cfg: BackoffConfig, rng: StdRng) -> Self {
        Self {
            cfg,
            cur: Duration::ZERO,
            rng,
        }
    }

    /// The next delay in the sequence.
    pub fn next(&mut self) -> Duration {
        if self.cur < self.cfg.initial_delay {
            self.cur = self.cfg.initial_delay;
        } else {
            self.cur = self.cfg.initial_delay.max(Duration::from_secs_f64(
                self.cur.as_secs_f64() * self.cfg.multiplier,
            ));
        }
        if self.cur > self.cfg.max_delay {
            self.cur = self.cfg.max_delay;
        }

        let mut next = self.cur;
        if self.cfg.jitter {
            // choose a value within [initial, cur)
            let diff = (next - self.cfg.initial_delay).as_secs_f64();
            next = self.cfg.initial_delay
                + Duration::from_secs_f64(diff * self.rng.gen::<f64>());
        }
        next
    }

    /// Return the sequence to its initial delay.
    pub fn reset(&mut self) {
        self.cur = Duration::ZERO;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: bool) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_non_jittered_sequence() {
        let mut b = Backoff::new(config(false));
        for expect in [1u64, 2, 4, 8, 16, 32, 60, 60] {
            assert_eq!(b.next(), Duration::from_secs(expect));
        }
    }

    #[test]
    fn test_jittered_sequence_is_deterministic_and_bounded() {
        let cfg = config(true);
        let mut a = Backoff::with_rng(cfg.clone(), StdRng::seed_from_u64(1));
        let mut b = Backoff::with_rng(cfg.clone(), StdRng::seed_from_u64(1));

        for _ in 0..16 {
            let next = a.next();
            assert_eq!(next, b.next());
            assert!(next >= cfg.initial_delay);
            assert!(next < cfg.max_delay + cfg.initial_delay);
        }
        // after enough iterations the un-jittered base saturates at max
        assert_eq!(a.cur, cfg.max_delay);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut b = Backoff::new(config(false));
        assert_eq!(b.next(), Duration::from_secs(1));
        assert_eq!(b.next(), Duration::from_secs(2));
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }

    #[test]
    fn test_defaults() {
        let cfg = BackoffConfig::default();
        assert_eq!(cfg.initial_delay, Duration::from_millis(100));
        assert_eq!(cfg.max_delay, Duration::from_secs(30));
        assert_eq!(cfg.multiplier, 1.5);
        assert!(cfg.jitter);
    }
}
