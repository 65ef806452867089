//! Shared supervision loop: forwards output, tracks activity, and decides
//! whether the process exits on its own or is stopped by a watchdog.

use crate::{StopReason, StreamChunk};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) enum Outcome {
    Exited(Option<i32>),
    Killed(StopReason),
}

/// How often the idle watchdog samples the last-activity timestamp.
pub(crate) fn idle_check_period(idle: Duration) -> Duration {
    (idle / 4).clamp(Duration::from_millis(10), Duration::from_secs(2))
}

/// Drive `exit` to completion while forwarding chunks from `chunks_in`,
/// unless the hard timeout, the idle window, or `stop` fires first.
pub(crate) async fn supervise<F>(
    exit: F,
    chunks_in: &mut mpsc::UnboundedReceiver<StreamChunk>,
    chunks_out: &mpsc::UnboundedSender<StreamChunk>,
    timeout: Option<Duration>,
    idle_timeout: Option<Duration>,
    stop: &CancellationToken,
) -> Outcome
where
    F: Future<Output = Option<i32>>,
{
    tokio::pin!(exit);
    let started = Instant::now();
    let mut last_activity = started;

    let hard = async {
        match timeout {
            Some(t) => tokio::time::sleep_until(started + t).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(hard);

    let idle = idle_timeout.filter(|d| !d.is_zero());
    let mut idle_tick = tokio::time::interval(idle.map(idle_check_period).unwrap_or(Duration::from_secs(3600)));
    idle_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(chunk) = chunks_in.recv() => {
                last_activity = Instant::now();
                let _ = chunks_out.send(chunk);
            }
            code = &mut exit => return Outcome::Exited(code),
            _ = &mut hard => return Outcome::Killed(StopReason::Timeout),
            _ = idle_tick.tick(), if idle.is_some() => {
                if let Some(window) = idle {
                    if last_activity.elapsed() > window {
                        return Outcome::Killed(StopReason::IdleTimeout);
                    }
                }
            }
            _ = stop.cancelled() => return Outcome::Killed(StopReason::Stopped),
        }
    }
}

/// Forward whatever output is still buffered, bounded by `grace`.
pub(crate) async fn drain(
    chunks_in: &mut mpsc::UnboundedReceiver<StreamChunk>,
    chunks_out: &mpsc::UnboundedSender<StreamChunk>,
    grace: Duration,
) {
    let _ = tokio::time::timeout(grace, async {
        while let Some(chunk) = chunks_in.recv().await {
            let _ = chunks_out.send(chunk);
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_period_is_clamped() {
        assert_eq!(idle_check_period(Duration::from_millis(8)), Duration::from_millis(10));
        assert_eq!(idle_check_period(Duration::from_millis(400)), Duration::from_millis(100));
        assert_eq!(idle_check_period(Duration::from_secs(60)), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_fires_after_silence() {
        let (tx_in, mut rx_in) = mpsc::unbounded_channel();
        let (tx_out, mut rx_out) = mpsc::unbounded_channel();
        tx_in.send(StreamChunk::Stdout("hello".into())).unwrap();
        let stop = CancellationToken::new();
        let outcome = supervise(
            std::future::pending(),
            &mut rx_in,
            &tx_out,
            None,
            Some(Duration::from_millis(500)),
            &stop,
        )
        .await;
        assert!(matches!(outcome, Outcome::Killed(StopReason::IdleTimeout)));
        assert_eq!(rx_out.recv().await, Some(StreamChunk::Stdout("hello".into())));
        drop(tx_in);
    }

    #[tokio::test(start_paused = true)]
    async fn hard_timeout_fires() {
        let (_tx_in, mut rx_in) = mpsc::unbounded_channel();
        let (tx_out, _rx_out) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let outcome = supervise(
            std::future::pending(),
            &mut rx_in,
            &tx_out,
            Some(Duration::from_secs(2)),
            None,
            &stop,
        )
        .await;
        assert!(matches!(outcome, Outcome::Killed(StopReason::Timeout)));
    }

    #[tokio::test]
    async fn stop_wins_when_cancelled() {
        let (_tx_in, mut rx_in) = mpsc::unbounded_channel();
        let (tx_out, _rx_out) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        stop.cancel();
        let outcome = supervise(std::future::pending(), &mut rx_in, &tx_out, None, None, &stop).await;
        assert!(matches!(outcome, Outcome::Killed(StopReason::Stopped)));
    }

    #[tokio::test]
    async fn exit_reported() {
        let (_tx_in, mut rx_in) = mpsc::unbounded_channel();
        let (tx_out, _rx_out) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let outcome = supervise(async { Some(3) }, &mut rx_in, &tx_out, None, None, &stop).await;
        assert!(matches!(outcome, Outcome::Exited(Some(3))));
    }
}
