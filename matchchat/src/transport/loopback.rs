//! Loopback transports for testing.
//!
//! [`LoopbackPush`] is an in-process push channel whose far end is a
//! [`LoopbackServer`] handle: tests read what the client emitted, inject
//! server events, drop the connection, and make the server unreachable.
//! [`LoopbackFallback`] is an in-memory request/response server with a
//! switchable [`FallbackMode`] and call counters.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use matchchat_proto::api::{ApiError, HistoryPage, HistoryQuery, SendRequest};
use matchchat_proto::event::{ClientEvent, ServerEvent};
use matchchat_proto::message::{MessageId, PeerId, Timestamp, WireMessage};

use super::{Fallback, PushChannel, TransportError, TransportType};

/// Frames travelling from the loopback server to the client.
#[derive(Debug)]
enum Frame {
    Event(ServerEvent),
    Close,
}

/// State shared between a [`LoopbackPush`] and its [`LoopbackServer`].
#[derive(Debug)]
struct Link {
    reachable: AtomicBool,
    connected: AtomicBool,
    connects: AtomicUsize,
}

/// Client end of an in-process push channel.
pub struct LoopbackPush {
    link: Arc<Link>,
    to_server: mpsc::UnboundedSender<ClientEvent>,
    from_server: tokio::sync::Mutex<mpsc::UnboundedReceiver<Frame>>,
}

/// Server end of an in-process push channel.
pub struct LoopbackServer {
    link: Arc<Link>,
    to_client: mpsc::UnboundedSender<Frame>,
    from_client: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
}

impl LoopbackPush {
    /// Create a connected client/server pair.
    ///
    /// The server starts reachable; the client still has to
    /// [`connect`](PushChannel::connect) before it can emit.
    #[must_use]
    pub fn create_pair() -> (Self, LoopbackServer) {
        let link = Arc::new(Link {
            reachable: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
        });
        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();

        let client = Self {
            link: Arc::clone(&link),
            to_server,
            from_server: tokio::sync::Mutex::new(from_server),
        };
        let server = LoopbackServer {
            link,
            to_client,
            from_client: tokio::sync::Mutex::new(from_client),
        };
        (client, server)
    }
}

impl PushChannel for LoopbackPush {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.link.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable("loopback server offline".into()));
        }
        self.link.connected.store(true, Ordering::SeqCst);
        self.link.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn emit(&self, event: &ClientEvent) -> Result<(), TransportError> {
        if !self.link.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.to_server
            .send(event.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn next_event(&self) -> Result<ServerEvent, TransportError> {
        if !self.link.connected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        let mut rx = self.from_server.lock().await;
        match rx.recv().await {
            Some(Frame::Event(event)) => Ok(event),
            Some(Frame::Close) | None => {
                self.link.connected.store(false, Ordering::SeqCst);
                Err(TransportError::ConnectionClosed)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}

impl LoopbackServer {
    /// Deliver an event to the client.
    pub fn push(&self, event: ServerEvent) {
        let _ = self.to_client.send(Frame::Event(event));
    }

    /// Wait for the next event the client emitted.
    ///
    /// Returns `None` once the client has been dropped.
    pub async fn next_client_event(&self) -> Option<ClientEvent> {
        self.from_client.lock().await.recv().await
    }

    /// Return an already-emitted client event without waiting.
    pub fn try_client_event(&self) -> Option<ClientEvent> {
        self.from_client.try_lock().ok()?.try_recv().ok()
    }

    /// Drop the current connection. The client sees `ConnectionClosed`.
    pub fn drop_connection(&self) {
        let _ = self.to_client.send(Frame::Close);
    }

    /// Make future connection attempts fail (`false`) or succeed (`true`).
    pub fn set_reachable(&self, reachable: bool) {
        self.link.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of successful `connect` calls so far.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.link.connects.load(Ordering::SeqCst)
    }

    /// Whether the client currently holds an open connection.
    #[must_use]
    pub fn is_client_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }
}

/// How the loopback fallback answers requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackMode {
    /// Serve requests from the in-memory log.
    Up,
    /// Never answer (simulates a black-holed network).
    Hang,
    /// Fail immediately as unreachable.
    Down,
    /// Reject every request with the given error body.
    Reject(ApiError),
}

#[derive(Debug)]
struct FallbackState {
    self_id: PeerId,
    log: Vec<WireMessage>,
    next_id: u64,
    mode: FallbackMode,
    send_calls: usize,
    history_calls: usize,
}

/// In-memory request/response server.
///
/// Cloning yields another handle to the same server, so a test can keep one
/// handle while the engine owns the other.
#[derive(Debug, Clone)]
pub struct LoopbackFallback {
    state: Arc<Mutex<FallbackState>>,
}

impl LoopbackFallback {
    /// Create a server that answers as `self_id`.
    #[must_use]
    pub fn new(self_id: PeerId) -> Self {
        Self {
            state: Arc::new(Mutex::new(FallbackState {
                self_id,
                log: Vec::new(),
                next_id: 1,
                mode: FallbackMode::Up,
                send_calls: 0,
                history_calls: 0,
            })),
        }
    }

    /// Add messages to the server-side log.
    pub fn seed(&self, messages: impl IntoIterator<Item = WireMessage>) {
        let mut state = self.state.lock();
        state.log.extend(messages);
        state.log.sort_by(|a, b| (a.at, &a.id).cmp(&(b.at, &b.id)));
    }

    /// Switch how requests are answered.
    pub fn set_mode(&self, mode: FallbackMode) {
        self.state.lock().mode = mode;
    }

    /// Number of `send` calls received.
    #[must_use]
    pub fn send_calls(&self) -> usize {
        self.state.lock().send_calls
    }

    /// Number of `history` calls received.
    #[must_use]
    pub fn history_calls(&self) -> usize {
        self.state.lock().history_calls
    }

    /// Snapshot of the server-side log.
    #[must_use]
    pub fn log(&self) -> Vec<WireMessage> {
        self.state.lock().log.clone()
    }

    /// Check the mode, turning it into an early error or a hang.
    async fn gate(mode: FallbackMode) -> Result<(), TransportError> {
        match mode {
            FallbackMode::Up => Ok(()),
            FallbackMode::Hang => std::future::pending().await,
            FallbackMode::Down => Err(TransportError::Unreachable(
                "loopback fallback offline".into(),
            )),
            FallbackMode::Reject(err) => Err(TransportError::Rejected(err)),
        }
    }
}

impl Fallback for LoopbackFallback {
    async fn send(&self, request: &SendRequest) -> Result<WireMessage, TransportError> {
        let mode = {
            let mut state = self.state.lock();
            state.send_calls += 1;
            state.mode.clone()
        };
        Self::gate(mode).await?;

        let mut state = self.state.lock();
        let id = MessageId::new(format!("m{}", state.next_id));
        state.next_id += 1;
        let item = WireMessage {
            id,
            from: state.self_id.clone(),
            to: request.peer_id.clone(),
            body: request.body.clone(),
            at: Timestamp::now(),
            reply_to_id: request.reply_to_id.clone(),
        };
        state.log.push(item.clone());
        Ok(item)
    }

    async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage, TransportError> {
        let mode = {
            let mut state = self.state.lock();
            state.history_calls += 1;
            state.mode.clone()
        };
        Self::gate(mode).await?;

        let state = self.state.lock();
        Ok(HistoryPage::slice(
            &state.log,
            query.before_cursor.as_ref(),
            query.limit,
        ))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Loopback
    }
}
