//! WebSocket push channel.
//!
//! Implements [`PushChannel`] over a WebSocket connection carrying JSON
//! text frames. Each [`connect`](PushChannel::connect) opens a fresh
//! socket, splits it, and spawns a background reader that decodes frames
//! into [`ServerEvent`]s. Identity and the joined conversation are not
//! part of the socket handshake; the manager re-emits `identify` and `join`
//! after every connect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use matchchat_proto::codec;
use matchchat_proto::event::{ClientEvent, ServerEvent};

use super::{PushChannel, TransportError, TransportType};

/// Type alias for the write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Default timeout for opening the socket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffer between the reader task and [`PushChannel::next_event`].
const INCOMING_BUFFER: usize = 256;

/// WebSocket implementation of [`PushChannel`].
pub struct WsPushChannel {
    /// Push endpoint (`ws://` or `wss://`).
    url: Url,
    connect_timeout: Duration,
    /// Write half of the current connection.
    sink: Mutex<Option<WsSender>>,
    /// Events decoded by the current reader task.
    incoming: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    /// Whether the current connection is open.
    connected: Arc<AtomicBool>,
    /// Reader task of the current connection.
    reader: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsPushChannel {
    /// Create an unconnected channel for `url`.
    #[must_use]
    pub fn new(url: Url) -> Self {
        Self::with_timeout(url, DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create an unconnected channel with a custom connect timeout.
    #[must_use]
    pub fn with_timeout(url: Url, connect_timeout: Duration) -> Self {
        Self {
            url,
            connect_timeout,
            sink: Mutex::new(None),
            incoming: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            reader: parking_lot::Mutex::new(None),
        }
    }

    /// Return the push endpoint.
    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }
}

impl Drop for WsPushChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

impl PushChannel for WsPushChannel {
    async fn connect(&self) -> Result<(), TransportError> {
        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
                .await
                .map_err(|_| {
                    tracing::warn!(url = %self.url, "push channel connect timed out");
                    TransportError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = %self.url, err = %e, "push channel connect failed");
                    map_ws_connect_error(e)
                })?;

        let (sink, reader) = stream.split();
        let (tx, rx) = mpsc::channel(INCOMING_BUFFER);

        // A previous reader may still be parked on a half-dead socket.
        if let Some(old) = self.reader.lock().take() {
            old.abort();
        }
        *self.sink.lock().await = Some(sink);
        *self.incoming.lock().await = Some(rx);
        self.connected.store(true, Ordering::SeqCst);

        let handle = tokio::spawn(reader_loop(reader, tx, Arc::clone(&self.connected)));
        *self.reader.lock() = Some(handle);

        tracing::info!(url = %self.url, "push channel connected");
        Ok(())
    }

    async fn emit(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let frame = codec::encode(event)?;

        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        sink.send(Message::Text(frame.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "push channel send failed");
            self.connected.store(false, Ordering::SeqCst);
            TransportError::ConnectionClosed
        })
    }

    async fn next_event(&self) -> Result<ServerEvent, TransportError> {
        let mut guard = self.incoming.lock().await;
        let rx = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        match rx.recv().await {
            Some(event) => Ok(event),
            None => {
                *guard = None;
                self.connected.store(false, Ordering::SeqCst);
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Push
    }
}

/// Background task that decodes frames and forwards them.
///
/// Malformed frames are logged and skipped; the connection stays up.
/// Sets `connected` to `false` when the socket closes or errors out.
async fn reader_loop(
    mut reader: WsReader,
    tx: mpsc::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match codec::decode::<ServerEvent>(text.as_str()) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed push frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("push channel closed by server");
                break;
            }
            Ok(Message::Binary(_)) => {
                tracing::debug!("ignoring binary push frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(e) => {
                tracing::warn!(err = %e, "push channel read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    tracing::debug!("push reader task exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`TransportError`].
fn map_ws_connect_error(err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => TransportError::Unreachable(io_err.to_string()),
        WsError::Http(response) => TransportError::Http(format!(
            "push handshake rejected: status {}",
            response.status()
        )),
        other => TransportError::Unreachable(other.to_string()),
    }
}
