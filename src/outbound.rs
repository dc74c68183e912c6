use crate::cancel::Cancellation;
use crate::protocol::{self, Outbound};
use futures_util::{Sink, SinkExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const OUTBOUND_CAPACITY: usize = 32;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound channel is closed")]
    Closed,
    #[error("agent is shutting down")]
    Cancelled,
    #[error("outbound channel is full")]
    Full,
}

/// Producer side of the outbound queue. Cheap to clone; every task that
/// publishes to the worker holds one.
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Outbound>,
    closing: Cancellation,
    // Held shared by every `send` in progress; `wait_idle` takes it exclusively.
    in_flight: Arc<RwLock<()>>,
}

/// Consumer side, owned by the connection writer.
#[derive(Debug)]
pub struct Outlet {
    rx: mpsc::Receiver<Outbound>,
    closing: Cancellation,
}

pub fn channel(capacity: usize) -> (Outbox, Outlet) {
    let (tx, rx) = mpsc::channel(capacity);
    let closing = Cancellation::new();
    (
        Outbox {
            tx,
            closing: closing.clone(),
            in_flight: Arc::new(RwLock::new(())),
        },
        Outlet { rx, closing },
    )
}

impl Outbox {
    /// Enqueue `msg`, waiting for room while racing `cancel`. Never blocks
    /// past cancellation, and never queues anything once `cancel` has fired.
    pub async fn send(&self, msg: Outbound, cancel: &Cancellation) -> Result<(), SendError> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SendError::Cancelled),
            guard = self.in_flight.read() => guard,
        };
        if cancel.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SendError::Cancelled),
            res = self.tx.send(msg) => res.map_err(|_| SendError::Closed),
        }
    }

    /// Wait until no `send` is in progress. Call after firing the
    /// cancellation passed to `send`: from then on nothing but `send_timeout`
    /// can reach the queue.
    pub async fn wait_idle(&self) {
        drop(self.in_flight.write().await);
    }

    /// Enqueue without consulting cancellation, giving up after `timeout`.
    /// Used for the farewell message, which is sent after cancellation fired.
    pub async fn send_timeout(&self, msg: Outbound, timeout: Duration) -> Result<(), SendError> {
        self.tx.send_timeout(msg, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => SendError::Full,
            SendTimeoutError::Closed(_) => SendError::Closed,
        })
    }

    /// Stop accepting messages. The writer drains what is already queued and
    /// then closes the connection.
    pub fn close(&self) {
        self.closing.cancel();
    }
}

// ---------------------------------------------------------------------------
// Connection writer
// ---------------------------------------------------------------------------

/// The only code that writes to the connection. Transmits queued messages in
/// order until the outbox is closed (or every producer is gone), then sends a
/// normal close frame. Returns early on the first failed write.
pub async fn run_writer<S>(mut sink: S, outlet: Outlet) -> Result<(), S::Error>
where
    S: Sink<Message> + Unpin,
{
    let Outlet { mut rx, closing } = outlet;

    loop {
        let next = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = closing.cancelled() => {
                rx.close();
                rx.recv().await
            }
        };
        let Some(msg) = next else {
            break;
        };

        let text = match protocol::encode_outbound(&msg) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(kind = msg.kind(), "dropping unencodable message: {e}");
                continue;
            }
        };
        sink.send(Message::text(text)).await?;
    }

    tracing::info!("outbound channel closed, closing connection");
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "Normal Closure".into(),
    };
    sink.send(Message::Close(Some(frame))).await?;
    sink.close().await
}

pub fn spawn_writer<S>(sink: S, outlet: Outlet) -> tokio::task::JoinHandle<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: std::fmt::Display,
{
    tokio::spawn(async move {
        if let Err(e) = run_writer(sink, outlet).await {
            tracing::warn!("connection writer stopped: {e}");
        }
    })
}
