//! Per-source politeness: a jittered delay before every request, widened by
//! a multiplicative backoff after throttling or server errors.
//!
//! A [`Pacer`] is owned by exactly one source worker and mutated through
//! `&mut self`; sources never share pacing state.

use rand::Rng;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Politeness {
    pub delay_min: Duration,
    pub delay_max: Duration,
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub backoff_cap: Duration,
}

impl Default for Politeness {
    fn default() -> Self {
        Self {
            delay_min: Duration::from_secs(2),
            delay_max: Duration::from_secs(5),
            max_retries: 3,
            backoff_factor: 2.0,
            backoff_cap: Duration::from_secs(60),
        }
    }
}

impl Politeness {
    /// Largest multiplier that still changes anything: beyond it every delay
    /// is already clamped to the cap.
    fn max_multiplier(&self) -> f64 {
        let base = self.delay_max.as_secs_f64();
        if base <= 0.0 {
            1.0
        } else {
            (self.backoff_cap.as_secs_f64() / base).max(1.0)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Ok,
    Throttled { retry_after: Option<Duration> },
    ServerError,
    ClientError,
}

impl FetchOutcome {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchOutcome::Throttled { .. } | FetchOutcome::ServerError)
    }
}

#[derive(Debug)]
pub struct Pacer {
    source_id: String,
    policy: Politeness,
    multiplier: f64,
    retry_after: Option<Duration>,
}

impl Pacer {
    pub fn new(source_id: impl Into<String>, policy: Politeness) -> Self {
        Self {
            source_id: source_id.into(),
            policy,
            multiplier: 1.0,
            retry_after: None,
        }
    }

    pub fn policy(&self) -> &Politeness {
        &self.policy
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Inclusive range the next delay is drawn from.
    pub fn delay_bounds(&self) -> (Duration, Duration) {
        let cap = self.policy.backoff_cap;
        let scale = |d: Duration| d.mul_f64(self.multiplier).min(cap);
        let mut lo = scale(self.policy.delay_min);
        let mut hi = scale(self.policy.delay_max);
        if let Some(hint) = self.retry_after {
            lo = lo.max(hint.min(cap));
        }
        if hi < lo {
            hi = lo;
        }
        (lo, hi)
    }

    pub fn next_delay(&self) -> Duration {
        let (lo, hi) = self.delay_bounds();
        if hi <= lo {
            return lo;
        }
        let secs = rand::rng().random_range(lo.as_secs_f64()..=hi.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    /// Wait until the next request to this source is permitted.
    pub async fn acquire(&mut self) {
        let delay = self.next_delay();
        debug!(
            source = %self.source_id,
            delay_ms = delay.as_millis() as u64,
            multiplier = self.multiplier,
            "waiting before request"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.retry_after = None;
    }

    pub fn report(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Ok => {
                self.multiplier = 1.0;
                self.retry_after = None;
            }
            FetchOutcome::Throttled { retry_after } => {
                self.back_off();
                self.retry_after = retry_after;
            }
            FetchOutcome::ServerError => self.back_off(),
            FetchOutcome::ClientError => {}
        }
    }

    fn back_off(&mut self) {
        let factor = self.policy.backoff_factor.max(1.0);
        self.multiplier = (self.multiplier * factor).min(self.policy.max_multiplier());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Politeness {
        Politeness {
            delay_min: Duration::from_secs(2),
            delay_max: Duration::from_secs(5),
            max_retries: 3,
            backoff_factor: 2.0,
            backoff_cap: Duration::from_secs(60),
        }
    }

    #[test]
    fn base_delay_within_range() {
        let pacer = Pacer::new("s", policy());
        for _ in 0..50 {
            let d = pacer.next_delay();
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(5));
        }
    }

    #[test]
    fn backoff_grows_until_cap_then_holds() {
        let mut pacer = Pacer::new("s", policy());
        let mut previous = pacer.delay_bounds().1;
        let mut reached_cap = false;
        for _ in 0..10 {
            pacer.report(FetchOutcome::ServerError);
            let (_, hi) = pacer.delay_bounds();
            if reached_cap {
                assert_eq!(hi, previous);
            } else {
                assert!(hi > previous || hi == Duration::from_secs(60));
            }
            reached_cap = hi == Duration::from_secs(60);
            previous = hi;
        }
        assert!(reached_cap);
        assert_eq!(pacer.delay_bounds().0, Duration::from_secs(24));
    }

    #[test]
    fn success_resets_to_base() {
        let mut pacer = Pacer::new("s", policy());
        pacer.report(FetchOutcome::Throttled { retry_after: None });
        pacer.report(FetchOutcome::ServerError);
        assert_eq!(pacer.multiplier(), 4.0);
        pacer.report(FetchOutcome::Ok);
        assert_eq!(pacer.multiplier(), 1.0);
        assert_eq!(
            pacer.delay_bounds(),
            (Duration::from_secs(2), Duration::from_secs(5))
        );
    }

    #[test]
    fn client_error_does_not_back_off() {
        let mut pacer = Pacer::new("s", policy());
        pacer.report(FetchOutcome::ClientError);
        assert_eq!(pacer.multiplier(), 1.0);
        assert!(!FetchOutcome::ClientError.is_retryable());
        assert!(FetchOutcome::ServerError.is_retryable());
    }

    #[test]
    fn retry_after_hint_raises_floor_once() {
        let mut pacer = Pacer::new("s", policy());
        pacer.report(FetchOutcome::Throttled {
            retry_after: Some(Duration::from_secs(30)),
        });
        let (lo, hi) = pacer.delay_bounds();
        assert_eq!(lo, Duration::from_secs(30));
        assert_eq!(hi, Duration::from_secs(30));

        pacer.report(FetchOutcome::Throttled {
            retry_after: Some(Duration::from_secs(600)),
        });
        assert_eq!(pacer.delay_bounds().0, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_sleeps_for_the_drawn_delay() {
        let mut pacer = Pacer::new("s", policy());
        let start = tokio::time::Instant::now();
        pacer.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2), "waited {:?}", waited);
        assert!(waited <= Duration::from_millis(5_100), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_consumes_retry_hint() {
        let mut pacer = Pacer::new(
            "s",
            Politeness {
                delay_min: Duration::ZERO,
                delay_max: Duration::ZERO,
                ..policy()
            },
        );
        pacer.report(FetchOutcome::Throttled {
            retry_after: Some(Duration::from_secs(7)),
        });
        let start = tokio::time::Instant::now();
        pacer.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(pacer.delay_bounds(), (Duration::ZERO, Duration::ZERO));
    }
}
