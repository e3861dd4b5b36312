//! Restart backoff for supervised processes
//!
//! [`Backoff`] counts consecutive short-lived runs and computes how long to
//! wait before the next launch. The delay for the `n`th consecutive failure
//! is `first × factor^(n-1)`, clamped to `max`. A run that stays alive for at
//! least `healthy` resets the count, so a helper that crashes after hours of
//! service restarts quickly while one that dies on launch backs off.

use std::time::Duration;

use tokio::time::Instant;

use iprov_core::prelude::*;

/// Parameters controlling restart delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub first: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Multiplicative growth per consecutive failure
    pub factor: f64,
    /// Minimum run time that counts as a healthy run
    pub healthy: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            healthy: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given failure count (0 means no failures yet)
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exp = (failures - 1).min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Per-supervisor failure tracking
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    failures: u32,
    started_at: Option<Instant>,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            started_at: None,
        }
    }

    /// Record the start of an attempt
    pub fn mark_start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Record the end of an attempt.
    ///
    /// Runs shorter than the healthy threshold count as a failure; longer runs
    /// reset the failure counter.
    pub fn mark_end(&mut self) {
        let lived = self
            .started_at
            .take()
            .map(|start| start.elapsed())
            .unwrap_or_default();

        if lived >= self.policy.healthy {
            if self.failures > 0 {
                debug!("Run lasted {:?}, resetting backoff", lived);
            }
            self.failures = 0;
        } else {
            self.failures = self.failures.saturating_add(1);
        }
    }

    /// Delay that [`Backoff::wait`] would sleep for right now
    pub fn next_delay(&self) -> Duration {
        self.policy.delay_for(self.failures)
    }

    /// Sleep before the next attempt
    pub async fn wait(&self) {
        let delay = self.next_delay();
        if delay.is_zero() {
            return;
        }
        debug!(
            "Backing off {:?} after {} consecutive failures",
            delay, self.failures
        );
        tokio::time::sleep(delay).await;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            healthy: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_no_failures_means_no_delay() {
        let backoff = Backoff::new(policy());
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_failures_strictly_increase() {
        let mut backoff = Backoff::new(policy());
        let mut delays = Vec::new();

        for _ in 0..3 {
            backoff.mark_start();
            tokio::time::advance(Duration::from_millis(10)).await;
            backoff.mark_end();
            delays.push(backoff.next_delay());
        }

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_capped() {
        let mut backoff = Backoff::new(policy());
        for _ in 0..20 {
            backoff.mark_start();
            backoff.mark_end();
        }
        assert_eq!(backoff.failures(), 20);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_run_resets_counter() {
        let mut backoff = Backoff::new(policy());
        for _ in 0..3 {
            backoff.mark_start();
            backoff.mark_end();
        }
        assert_eq!(backoff.failures(), 3);

        backoff.mark_start();
        tokio::time::advance(Duration::from_secs(6)).await;
        backoff.mark_end();

        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_next_delay() {
        let mut backoff = Backoff::new(policy());
        backoff.mark_start();
        backoff.mark_end();

        let before = Instant::now();
        backoff.wait().await;
        assert!(before.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn test_policy_handles_overflow() {
        let p = BackoffPolicy {
            factor: f64::MAX,
            ..policy()
        };
        assert_eq!(p.delay_for(50), p.max);
    }
}
