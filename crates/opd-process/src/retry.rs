//! Retry with exponential backoff for idempotent provider calls (auth
//! checks, linking, env writes). Build and deploy commands never go
//! through here.

use crate::{ExecResult, Invocation, Runner};
use opd_core::settings::{Settings, DEFAULT_BASE_DELAY, DEFAULT_RETRIES, DEFAULT_STEP_TIMEOUT};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Base delay floor.
const MIN_BASE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first.
    pub retries: u32,
    pub base_delay: Duration,
    /// Per-attempt deadline.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            timeout: DEFAULT_STEP_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Defaults overridden by `OPD_RETRIES`, `OPD_BASE_DELAY_MS`, `OPD_TIMEOUT_MS`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::default()
            .with_retries(settings.retries.unwrap_or(DEFAULT_RETRIES))
            .with_base_delay(
                settings
                    .base_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(DEFAULT_BASE_DELAY),
            )
            .with_timeout(settings.step_timeout())
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base.max(MIN_BASE_DELAY);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// `base * 2^attempt + jitter`, saturating.
pub fn backoff_delay(base: Duration, attempt: u32, jitter: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).saturating_add(jitter)
}

fn random_jitter(base: Duration) -> Duration {
    let ms = base.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..ms))
}

/// Single attempt with a hard deadline. The process is killed when the
/// deadline passes or `cancel` fires.
pub async fn run_with_timeout<R>(
    runner: &R,
    inv: Invocation,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ExecResult
where
    R: Runner + ?Sized,
{
    runner.run_cancellable(inv.with_timeout(Some(timeout)), cancel).await
}

/// Run until the first success or until `retries + 1` attempts have failed,
/// returning the last result. Once `cancel` fires the running attempt is
/// stopped and no further attempt starts.
pub async fn run_with_retry<R>(
    runner: &R,
    inv: &Invocation,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> ExecResult
where
    R: Runner + ?Sized,
{
    let mut attempt: u32 = 0;
    loop {
        let res = run_with_timeout(runner, inv.clone(), policy.timeout, cancel).await;
        if res.ok || attempt >= policy.retries || cancel.is_cancelled() {
            return res;
        }
        let wait = backoff_delay(policy.base_delay, attempt, random_jitter(policy.base_delay));
        tracing::debug!(cmd = %inv.cmd, attempt, wait_ms = wait.as_millis() as u64, "retrying");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.cancelled() => return res,
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{Fixture, ReplayRunner};
    use proptest::prelude::*;
    use tokio::time::Instant;

    fn never() -> CancellationToken {
        CancellationToken::new()
    }

    fn failing(cmd: &str) -> Fixture {
        Fixture::run(cmd, false, Some(1), "", "network error")
    }

    fn passing(cmd: &str) -> Fixture {
        Fixture::run(cmd, true, Some(0), "ok", "")
    }

    #[test]
    fn policy_from_settings() {
        let s = Settings {
            retries: Some(5),
            base_delay_ms: Some(1),
            timeout_ms: Some(2_000),
            ..Default::default()
        };
        let p = RetryPolicy::from_settings(&s);
        assert_eq!(p.retries, 5);
        assert_eq!(p.base_delay, MIN_BASE_DELAY);
        assert_eq!(p.timeout, Duration::from_secs(2));
        assert_eq!(RetryPolicy::from_settings(&Settings::default()), RetryPolicy::default());
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0, Duration::ZERO), base);
        assert_eq!(backoff_delay(base, 3, Duration::ZERO), Duration::from_millis(800));
        assert_eq!(
            backoff_delay(base, 1, Duration::from_millis(7)),
            Duration::from_millis(207)
        );
        // absurd attempt counts saturate instead of panicking
        assert!(backoff_delay(base, 64, Duration::ZERO) > Duration::from_secs(1));
    }

    #[test]
    fn jitter_below_base() {
        let base = Duration::from_millis(50);
        for _ in 0..100 {
            assert!(random_jitter(base) < base);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_success() {
        let runner = ReplayRunner::new(vec![failing("vercel whoami"), passing("vercel whoami")]);
        let policy = RetryPolicy::default().with_base_delay(Duration::from_millis(100));
        let res = run_with_retry(&runner, &Invocation::new("vercel whoami"), &policy, &never()).await;
        assert!(res.ok);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_failure_with_backoff() {
        let runner = ReplayRunner::new(vec![failing("vercel link --yes")]);
        let base = Duration::from_millis(100);
        let policy = RetryPolicy::default()
            .with_retries(3)
            .with_base_delay(base);
        let start = Instant::now();
        let res = run_with_retry(&runner, &Invocation::new("vercel link --yes"), &policy, &never()).await;
        let elapsed = start.elapsed();
        assert!(!res.ok);
        assert_eq!(res.stderr, "network error");
        assert_eq!(runner.calls().len(), 4);
        // 100 + 200 + 400 without jitter; jitter adds < 100 per wait
        assert!(elapsed >= Duration::from_millis(700), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1000), "{elapsed:?}");
    }

    #[tokio::test]
    async fn zero_retries_is_single_attempt() {
        let runner = ReplayRunner::new(vec![failing("x")]);
        let policy = RetryPolicy::default().with_retries(0);
        let res = run_with_retry(&runner, &Invocation::new("x"), &policy, &never()).await;
        assert!(!res.ok);
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_the_backoff() {
        let runner = ReplayRunner::new(vec![failing("vercel whoami")]);
        let policy = RetryPolicy::default()
            .with_retries(5)
            .with_base_delay(Duration::from_secs(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        let res =
            run_with_retry(&runner, &Invocation::new("vercel whoami"), &policy, &cancel).await;
        assert!(!res.ok);
        assert_eq!(runner.calls().len(), 1);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn single_attempt_is_killed_at_the_deadline() {
        let runner = crate::ShellRunner::new();
        let start = std::time::Instant::now();
        let res = run_with_timeout(
            &runner,
            Invocation::new("sleep 5"),
            Duration::from_millis(200),
            &never(),
        )
        .await;
        assert!(!res.ok);
        assert_eq!(res.stop_reason, Some(crate::StopReason::Timeout));
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn cancelled_token_spawns_nothing() {
        let runner = ReplayRunner::new(vec![passing("vercel whoami")]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res = run_with_retry(
            &runner,
            &Invocation::new("vercel whoami"),
            &RetryPolicy::default(),
            &cancel,
        )
        .await;
        assert_eq!(res.stop_reason, Some(crate::StopReason::Stopped));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn attempts_never_exceed_retries_plus_one(retries in 0u32..5, succeed_at in 0usize..8) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let mut fixtures: Vec<Fixture> = (0..succeed_at).map(|_| failing("whoami")).collect();
            fixtures.push(passing("whoami"));
            let runner = ReplayRunner::new(fixtures);
            let policy = RetryPolicy::default()
                .with_retries(retries)
                .with_base_delay(Duration::from_millis(10));
            let res = rt.block_on(run_with_retry(&runner, &Invocation::new("whoami"), &policy, &never()));
            let calls = runner.calls().len();
            prop_assert!(calls <= retries as usize + 1);
            prop_assert_eq!(res.ok, succeed_at <= retries as usize);
            prop_assert_eq!(calls, (succeed_at + 1).min(retries as usize + 1));
        }
    }
}
