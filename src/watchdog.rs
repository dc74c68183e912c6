use crate::session::Session;
use crate::sys;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogExit {
    /// The game server died and shutdown was requested.
    ProcessStopped,
    /// Shutdown was already under way.
    Cancelled,
}

/// Probe the game server every `interval` until it disappears or the agent
/// shuts down. A probe error counts as "not running".
pub async fn watch_process<P>(session: &Session, interval: Duration, probe: P) -> WatchdogExit
where
    P: Fn(u32) -> io::Result<bool>,
{
    let pid = session.pid();
    let cancel = session.cancellation();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return WatchdogExit::Cancelled,
            _ = tokio::time::sleep(interval) => {}
        }

        let alive = probe(pid).unwrap_or_else(|e| {
            tracing::warn!(pid, "liveness probe failed: {e}");
            false
        });
        if !alive {
            tracing::info!(pid, "game server process is no longer running");
            session.shutdown("game server exited").await;
            return WatchdogExit::ProcessStopped;
        }
    }
}

pub fn spawn_watchdog(session: Arc<Session>, interval: Duration) -> JoinHandle<WatchdogExit> {
    tokio::spawn(async move { watch_process(&session, interval, sys::check_pid).await })
}
