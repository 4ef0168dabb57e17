use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket connect failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("transport is closed")]
    Closed,
}

/// How a websocket connection ended.
///
/// `was_clean` records whether a close frame was actually exchanged. Per the
/// wire contract, codes 1000/1005 are clean, 1006 is an abnormal closure
/// eligible for a one-shot token-refresh retry, and anything else is an
/// error with no retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub(crate) fn abnormal(reason: impl Into<String>) -> Self {
        Self {
            code: 1006,
            reason: reason.into(),
            was_clean: false,
        }
    }

    pub fn is_clean(&self) -> bool {
        matches!(self.code, 1000 | 1005)
    }

    pub fn is_abnormal(&self) -> bool {
        self.code == 1006
    }
}

/// One event from a live websocket connection.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Binary(Bytes),
    Text(String),
    /// Delivered exactly once, after which no further events follow.
    Closed(CloseInfo),
}

/// A websocket connection reduced to event-stream form: inbound frames and
/// the final close arrive on the receiver handed out by [`WsTransport::connect`],
/// outbound frames go through [`send`](WsTransport::send) /
/// [`send_text`](WsTransport::send_text).
pub struct WsTransport {
    out_tx: mpsc::UnboundedSender<Message>,
    reader: Mutex<Option<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicBool>,
}

impl WsTransport {
    /// Opens a websocket connection. Transport setup failures surface as an
    /// error here; once connected, all failures arrive as a `Closed` event.
    pub async fn connect(
        url: &Url,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let (stream, _) = connect_async(url.as_str()).await?;
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let (sink, source) = stream.split();
        let writer = tokio::spawn(write_loop(sink, out_rx));
        let reader = tokio::spawn(read_loop(source, event_tx));

        Ok((
            Self {
                out_tx,
                reader: Mutex::new(Some(reader)),
                writer: Mutex::new(Some(writer)),
                closed: Arc::new(AtomicBool::new(false)),
            },
            event_rx,
        ))
    }

    /// Sends a binary frame.
    pub fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.out_tx
            .send(Message::Binary(data.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    /// Sends a text frame.
    pub fn send_text(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.out_tx
            .send(Message::Text(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Closes the connection. Idempotent; no `Closed` event is produced for
    /// a locally requested close.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
        if let Some(task) = self.writer.lock().take() {
            task.abort();
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

async fn write_loop(mut sink: WsSink, mut out_rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = out_rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
}

async fn read_loop(mut source: WsSource, event_tx: mpsc::UnboundedSender<TransportEvent>) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Binary(data)) => {
                if event_tx.send(TransportEvent::Binary(Bytes::from(data))).is_err() {
                    return;
                }
            }
            Ok(Message::Text(text)) => {
                if event_tx.send(TransportEvent::Text(text)).is_err() {
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                let info = match frame {
                    Some(frame) => CloseInfo {
                        code: u16::from(frame.code),
                        reason: frame.reason.into_owned(),
                        was_clean: true,
                    },
                    // No status code in the close frame maps to 1005.
                    None => CloseInfo {
                        code: 1005,
                        reason: String::new(),
                        was_clean: true,
                    },
                };
                debug!(code = info.code, reason = %info.reason, "websocket closed");
                let _ = event_tx.send(TransportEvent::Closed(info));
                return;
            }
            Ok(_) => {
                trace!("ignoring control frame");
            }
            Err(err) => {
                debug!(error = %err, "websocket terminated without close handshake");
                let _ = event_tx.send(TransportEvent::Closed(CloseInfo::abnormal(err.to_string())));
                return;
            }
        }
    }
    // EOF without a close frame is an abnormal closure, same as a browser
    // reporting code 1006.
    let _ = event_tx.send(TransportEvent::Closed(CloseInfo::abnormal(
        "connection reset without closing handshake",
    )));
}
