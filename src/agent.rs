use crate::cancel::Cancellation;
use crate::config::{self, AgentConfig, Metadata};
use crate::connection::{self, Incoming};
use crate::dispatch::{Console, Dispatcher};
use crate::health::{self, SystemMetrics};
use crate::log::{self, LogFollower};
use crate::outbound::{self, OUTBOUND_CAPACITY};
use crate::pid;
use crate::protocol::Outbound;
use crate::session::{ExitFn, Session};
use crate::sys::{self, ScreenConsole};
use crate::watchdog::{self, WATCHDOG_INTERVAL};
use color_eyre::eyre::WrapErr;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Run the agent until something ends the session, then tear down through
/// `exit`. Errors are returned only for failures before the session starts.
pub async fn run(config: AgentConfig, exit: ExitFn) -> color_eyre::Result<()> {
    let metadata = Metadata::load(&config.metadata_dir);
    let url = config::worker_endpoint(&config.worker_url, &config.session_id, &metadata.kind())?;

    tracing::info!(path = %config.pid_file.display(), "waiting for game server PID file");
    let pid = pid::wait_for_pid_file(&config.pid_file, config.pid_timeout).await?;
    tracing::info!(pid, "found game server process");

    let (sink, source) = connection::connect(&url)
        .await
        .wrap_err("failed to connect to worker")?;
    tracing::info!("connected to worker");

    // --- Session and writer ---
    let (outbox, outlet) = outbound::channel(OUTBOUND_CAPACITY);
    let session = Arc::new(Session::new(pid, outbox, exit));
    outbound::spawn_writer(sink, outlet);

    if let Err(e) = session.publish(Outbound::Metadata(metadata.to_fields())).await {
        tracing::warn!("could not queue metadata: {e}");
    }
    let cursor = log::publish_history(&session, &config.log_file).await;

    // --- Background producers ---
    log::spawn_log_follower(session.clone(), LogFollower::open(&config.log_file, cursor));
    health::spawn_health_sampler(
        session.clone(),
        SystemMetrics::new(),
        config.disk_path.clone(),
        config.health_interval,
    );
    watchdog::spawn_watchdog(session.clone(), WATCHDOG_INTERVAL);

    // --- Control loop ---
    let cancel = session.cancellation().clone();
    let (incoming, _reader) = connection::spawn_reader(source, cancel.clone());
    let console = ScreenConsole::new(&config.screen_session);
    let dispatcher = Dispatcher::new(console, &config.script_dir);

    let stop_signal = async {
        if let Err(e) = sys::signal_shutdown().await {
            tracing::warn!("could not install signal handlers: {e}");
            std::future::pending::<()>().await;
        }
    };

    let reason = control_loop(incoming, dispatcher, &cancel, stop_signal).await;
    session.shutdown(reason).await;
    Ok(())
}

/// Feed worker messages to the dispatcher until the session is cancelled,
/// `stop` resolves or the connection ends. Returns why it stopped.
///
/// Dispatching races the same conditions, so a stuck console cannot keep the
/// agent from shutting down.
pub async fn control_loop<C, F>(
    mut incoming: mpsc::Receiver<Incoming>,
    mut dispatcher: Dispatcher<C>,
    cancel: &Cancellation,
    stop: F,
) -> &'static str
where
    C: Console,
    F: Future<Output = ()>,
{
    tokio::pin!(stop);

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return "shutdown requested",
            _ = &mut stop => return "received stop signal",
            next = incoming.recv() => match next {
                Some(Incoming::Message(msg)) => msg,
                Some(Incoming::Malformed(e)) => {
                    tracing::warn!("dropping malformed message from worker: {e}");
                    continue;
                }
                Some(Incoming::Closed(Some(e))) => {
                    tracing::warn!("connection to worker failed: {e}");
                    return "connection lost";
                }
                Some(Incoming::Closed(None)) | None => {
                    tracing::info!("worker closed the connection");
                    return "connection closed";
                }
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return "shutdown requested",
            _ = &mut stop => return "received stop signal",
            _ = dispatcher.dispatch(msg) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Inbound, ScriptPayload};
    use std::io;
    use std::time::Duration;

    /// A console whose `screen` never answers.
    struct HungConsole;

    impl Console for HungConsole {
        async fn send_keys(&self, _text: &str) -> io::Result<()> {
            std::future::pending().await
        }
    }

    /// The returned sender keeps the connection looking open.
    async fn with_hung_command() -> (
        mpsc::Sender<Incoming>,
        mpsc::Receiver<Incoming>,
        Dispatcher<HungConsole>,
    ) {
        let (tx, rx) = mpsc::channel(4);
        tx.send(Incoming::Message(Inbound::Command("status".into())))
            .await
            .unwrap();
        (tx, rx, Dispatcher::new(HungConsole, "/nonexistent"))
    }

    #[tokio::test]
    async fn test_cancel_interrupts_stuck_command() {
        let (_tx, incoming, dispatcher) = with_hung_command().await;
        let cancel = Cancellation::new();

        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let reason = tokio::time::timeout(
            Duration::from_secs(1),
            control_loop(incoming, dispatcher, &cancel, std::future::pending()),
        )
        .await
        .expect("control loop stuck in dispatch");
        stopper.await.unwrap();
        assert_eq!(reason, "shutdown requested");
    }

    #[tokio::test]
    async fn test_stop_signal_interrupts_stuck_command() {
        let (_tx, incoming, dispatcher) = with_hung_command().await;
        let cancel = Cancellation::new();
        let stop = tokio::time::sleep(Duration::from_millis(50));

        let reason = tokio::time::timeout(
            Duration::from_secs(1),
            control_loop(incoming, dispatcher, &cancel, stop),
        )
        .await
        .expect("control loop stuck in dispatch");
        assert_eq!(reason, "received stop signal");
    }

    #[tokio::test]
    async fn test_malformed_then_closed() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::channel(4);
        let decode_error = crate::protocol::decode_inbound(r#"{"type":"COMMAND","payload":1}"#)
            .unwrap_err();
        tx.send(Incoming::Malformed(decode_error)).await.unwrap();
        tx.send(Incoming::Message(Inbound::Script(ScriptPayload {
            name: "init".into(),
            content: "print(1)".into(),
        })))
        .await
        .unwrap();
        tx.send(Incoming::Closed(None)).await.unwrap();

        let dispatcher = Dispatcher::new(HungConsole, dir.path());
        let reason = control_loop(rx, dispatcher, &Cancellation::new(), std::future::pending()).await;

        assert_eq!(reason, "connection closed");
        assert!(dir.path().join("init_1.lua").exists());
    }
}
