//! Idle watchdog for backend processes.

use ges_pipe::{Canceller, IdleProbe};
use std::time::Duration;
use tokio::task::JoinHandle;

const MIN_POLL: Duration = Duration::from_millis(50);
const MAX_POLL: Duration = Duration::from_secs(1);

/// Expires the child once no bytes have moved through it for `limit`.
///
/// The task ends by itself when the child is reaped or cancelled.
pub fn spawn_idle_watchdog(
    probe: IdleProbe,
    canceller: Canceller,
    limit: Duration,
) -> JoinHandle<()> {
    let poll = (limit / 4).clamp(MIN_POLL, MAX_POLL);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = canceller.cancelled() => return,
                _ = tokio::time::sleep(poll) => {}
            }
            if probe.is_finished() {
                return;
            }
            let idle = probe.idle_for();
            if idle >= limit {
                tracing::warn!(
                    idle_ms = idle.as_millis() as u64,
                    "Backend idle for too long, killing it"
                );
                canceller.expire();
                return;
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use ges_pipe::{ExitOutcome, PipeCommand, StdinSource, Subprocess};

    #[tokio::test]
    async fn silent_child_is_expired() {
        let mut child =
            Subprocess::spawn(PipeCommand::new("sleep").arg("5"), StdinSource::Null).unwrap();
        let watchdog = spawn_idle_watchdog(
            child.idle_probe(),
            child.canceller(),
            Duration::from_millis(100),
        );

        let report = child.wait().await.unwrap();
        assert_eq!(report.outcome, ExitOutcome::TimedOut);
        watchdog.await.unwrap();
    }

    #[tokio::test]
    async fn watchdog_stops_after_exit() {
        let mut child = Subprocess::spawn(PipeCommand::new("true"), StdinSource::Null).unwrap();
        let watchdog =
            spawn_idle_watchdog(child.idle_probe(), child.canceller(), Duration::from_secs(60));

        assert!(child.wait().await.unwrap().outcome.success());
        tokio::time::timeout(Duration::from_secs(5), watchdog)
            .await
            .unwrap()
            .unwrap();
    }
}
