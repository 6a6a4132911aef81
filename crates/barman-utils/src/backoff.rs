//! Retry and exponential backoff helpers.
//!
//! `retry` mirrors the shape of `utils::backoff::retry` that
//! `safekeeper::wal_backup` calls into: run a fallible async operation up to
//! `max_attempts` times, sleeping between attempts, and give up once a
//! predicate says the error is not worth retrying.
//!
//! `ExponentialBackoff` implements the Streamer Supervisor's restart policy
//! from spec.md §4.3: base 1s, cap 60s, reset after 5 minutes healthy.

use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Retry `op` up to `max_attempts` times (including the first try), with a
/// delay of `base_delay_ms * 2^attempt` capped at `max_delay_ms` between
/// attempts. `should_stop` inspects an error and returns `true` if retrying
/// is pointless (e.g. a permanent/persistent failure) — in which case the
/// error is returned immediately without using up the remaining budget.
pub async fn retry<T, E, F, Fut, Stop>(
    mut op: F,
    should_stop: Stop,
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    description: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    Stop: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 >= max_attempts || should_stop(&e) => {
                return Err(e);
            }
            Err(e) => {
                let delay = base_delay_ms
                    .saturating_mul(1u64 << attempt.min(32))
                    .min(max_delay_ms);
                warn!(
                    "{description} failed (attempt {}/{}): {e}, retrying in {delay}ms",
                    attempt + 1,
                    max_attempts
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
        }
    }
}

/// Exponential backoff with a healthy-reset window, used by the WAL
/// Streamer Supervisor to schedule restarts of a crashed receiver process.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    cap: Duration,
    reset_after: Duration,
    attempt: u32,
    last_failure: Option<std::time::Instant>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, cap: Duration, reset_after: Duration) -> Self {
        ExponentialBackoff {
            base,
            cap,
            reset_after,
            attempt: 0,
            last_failure: None,
        }
    }

    /// Policy matching spec.md §4.3: base 1s, cap 60s, reset after 5 minutes.
    pub fn streamer_default() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            Duration::from_secs(5 * 60),
        )
    }

    /// Record a failure and return how long to wait before the next
    /// restart attempt. Applies equal jitter (half the computed delay,
    /// plus a random amount up to the other half) so a fleet of
    /// supervisors that failed together don't all restart in lockstep.
    pub fn next_delay(&mut self) -> Duration {
        if let Some(last) = self.last_failure {
            if last.elapsed() >= self.reset_after {
                self.attempt = 0;
            }
        }
        let max_delay = self
            .base
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        self.last_failure = Some(std::time::Instant::now());

        let half_ms = (max_delay.as_millis() / 2) as u64;
        let jitter_ms = if half_ms > 0 { rand::thread_rng().gen_range(0..=half_ms) } else { 0 };
        Duration::from_millis(half_ms + jitter_ms)
    }

    /// Call after a sustained period of health to allow the backoff to
    /// reset proactively (rather than only on the next failure).
    pub fn note_healthy_since(&mut self, healthy_for: Duration) {
        if healthy_for >= self.reset_after {
            self.attempt = 0;
            self.last_failure = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_succeeds_eventually() {
        let mut calls = 0;
        let result: Result<(), &str> = retry(
            || {
                calls += 1;
                async move {
                    if calls < 3 {
                        Err("transient")
                    } else {
                        Ok(())
                    }
                }
            },
            |_| false,
            5,
            1,
            2,
            "test op",
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_stops_on_permanent_error() {
        let mut calls = 0;
        let result: Result<(), &str> = retry(
            || {
                calls += 1;
                async move { Err("permanent") }
            },
            |e| *e == "permanent",
            5,
            1,
            2,
            "test op",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn exponential_backoff_caps_and_grows() {
        let mut b = ExponentialBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(40),
            Duration::from_secs(300),
        );
        // Jittered, so only the bounds are checked: each delay sits in
        // [half the uncapped exponential step, the step itself].
        let d1 = b.next_delay();
        assert!(d1 >= Duration::from_millis(5) && d1 <= Duration::from_millis(10));
        let d2 = b.next_delay();
        assert!(d2 >= Duration::from_millis(10) && d2 <= Duration::from_millis(20));
        let d3 = b.next_delay();
        assert!(d3 >= Duration::from_millis(20) && d3 <= Duration::from_millis(40));
        let d4 = b.next_delay();
        assert!(d4 >= Duration::from_millis(20) && d4 <= Duration::from_millis(40));
    }
}
