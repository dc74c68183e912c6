use crate::cancel::Cancellation;
use crate::outbound::{Outbox, SendError};
use crate::protocol::{Outbound, SHUTDOWN_NOTICE};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Time the writer gets to drain and close the connection before exit.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Terminates the process. Injected so tests can observe the call.
pub type ExitFn = Box<dyn Fn(i32) + Send + Sync>;

/// Process-wide agent state, created once at startup and shared by every task.
pub struct Session {
    pid: u32,
    cancel: Cancellation,
    outbox: Outbox,
    grace: Duration,
    exit: ExitFn,
    shutdown_once: OnceCell<()>,
}

impl Session {
    pub fn new(pid: u32, outbox: Outbox, exit: ExitFn) -> Self {
        Self {
            pid,
            cancel: Cancellation::new(),
            outbox,
            grace: SHUTDOWN_GRACE,
            exit,
            shutdown_once: OnceCell::new(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// PID of the managed game server.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue a message for the worker. Fails instead of blocking once
    /// shutdown has begun.
    pub async fn publish(&self, msg: Outbound) -> Result<(), SendError> {
        self.outbox.send(msg, &self.cancel).await
    }

    /// Run the teardown sequence. Any number of tasks may call this, in any
    /// order; the sequence runs once and later callers wait for it.
    pub async fn shutdown(&self, reason: &str) {
        self.shutdown_once.get_or_init(|| self.teardown(reason)).await;
    }

    async fn teardown(&self, reason: &str) {
        tracing::info!(reason, "initiating shutdown sequence");
        self.cancel.cancel();
        // Publishes racing the cancel above either finish now or fail; the
        // farewell is queued after all of them.
        self.outbox.wait_idle().await;

        let notice = Outbound::AgentShutdown(SHUTDOWN_NOTICE.to_string());
        if let Err(e) = self.outbox.send_timeout(notice, self.grace).await {
            tracing::warn!("could not queue shutdown notice: {e}");
        }
        self.outbox.close();

        tokio::time::sleep(self.grace).await;
        tracing::info!("shutdown complete, exiting");
        (self.exit)(0);
    }
}
