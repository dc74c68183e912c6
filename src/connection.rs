use crate::cancel::Cancellation;
use crate::protocol::{self, Inbound, ProtocolError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// Reader results are handed over one at a time.
pub const HANDOFF_CAPACITY: usize = 1;

/// Open the worker connection and split it into its write and read halves.
pub async fn connect(url: &Url) -> Result<(WsSink, WsSource), tungstenite::Error> {
    tracing::info!(%url, "connecting to worker");
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str()).await?;
    Ok(ws.split())
}

/// What the reader task hands to the control loop.
#[derive(Debug)]
pub enum Incoming {
    Message(Inbound),
    /// A frame that could not be decoded. Only that frame is lost.
    Malformed(ProtocolError),
    /// The connection is finished; nothing follows this.
    Closed(Option<tungstenite::Error>),
}

/// Start the background receive loop. The returned receiver yields decoded
/// frames until the connection ends.
///
/// The loop never outlives cancellation: both the read and the hand-off race
/// against `cancel`, so it exits even when the control loop has stopped
/// receiving.
pub fn spawn_reader<S>(stream: S, cancel: Cancellation) -> (mpsc::Receiver<Incoming>, JoinHandle<()>)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
    let handle = tokio::spawn(read_loop(stream, tx, cancel));
    (rx, handle)
}

async fn read_loop<S>(mut stream: S, tx: mpsc::Sender<Incoming>, cancel: Cancellation)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            _ = cancel.cancelled() => return,
        };

        let incoming = match frame {
            Some(Ok(Message::Text(text))) => match protocol::decode_inbound(text.as_str()) {
                Ok(msg) => Incoming::Message(msg),
                Err(e) => Incoming::Malformed(e),
            },
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(?frame, "worker sent close frame");
                Incoming::Closed(None)
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => Incoming::Closed(Some(e)),
            None => Incoming::Closed(None),
        };
        let last = matches!(incoming, Incoming::Closed(_));

        tokio::select! {
            res = tx.send(incoming) => {
                if res.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }

        if last {
            return;
        }
    }
}
