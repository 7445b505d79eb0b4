//! Push-first transport with request/response fallback.
//!
//! [`TransportManager`] wraps a [`PushChannel`] and a [`Fallback`]. Sends
//! travel over the push channel while it is up and are correlated with
//! their acknowledgment by request id; while it is down they transparently
//! degrade to the fallback. If neither can reach the server the send stays
//! pending and is retried until one comes back. Either way the caller sees
//! one contract: a confirmed [`WireMessage`] or an error, within a bounded
//! timeout.
//!
//! A background supervisor ([`TransportManager::start`]) owns the push
//! connection lifecycle: it connects while the environment reports online,
//! re-runs `identify` + `join` after every connect, reads inbound events,
//! and reconnects with exponential backoff after a drop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};

use matchchat_proto::api::{ApiError, HistoryPage, HistoryQuery, SendRequest};
use matchchat_proto::event::{ClientEvent, PushedMessage, ReceiptState, SendAck, ServerEvent};
use matchchat_proto::message::{MessageId, PeerId, TempId, WireMessage};

use super::{ConnectionState, Fallback, PushChannel, TransportError, TransportType};
use crate::environment::Environment;

/// Exponential reconnect backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the second attempt.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Randomize each delay into `[d/2, d]`.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait after the `attempt`-th consecutive failure (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let base = self.initial.saturating_mul(factor).min(self.max);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let millis = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
    }
}

/// Timeouts and reconnect behavior of a [`TransportManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How long a send may wait for its acknowledgment.
    pub send_timeout: Duration,
    /// How long a history fetch may take.
    pub history_timeout: Duration,
    /// Pause between attempts of a send that found the server unreachable.
    /// Cut short when the push channel changes state.
    pub retry_interval: Duration,
    /// Backoff between reconnect attempts.
    pub reconnect: ReconnectPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            history_timeout: Duration::from_secs(15),
            retry_interval: Duration::from_secs(1),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Inbound traffic and connection changes surfaced to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A message pushed by the server (including echoes of our own sends).
    Message(PushedMessage),
    /// A delivery receipt for an outgoing message.
    Receipt {
        /// The outgoing message.
        id: MessageId,
        /// The reported state.
        state: ReceiptState,
    },
    /// The peer is typing.
    Typing {
        /// Who is typing.
        peer_id: PeerId,
    },
    /// The push channel went up or down.
    Connection(ConnectionState),
    /// The push channel came back after a drop and the handshake was re-run.
    Reconnected,
    /// The server reported a connection-level error.
    Rejected(ApiError),
}

/// Unified send/receive over a push channel and a fallback.
pub struct TransportManager<P: PushChannel, F: Fallback> {
    push: P,
    fallback: F,
    config: ManagerConfig,
    identity: Mutex<Option<PeerId>>,
    joined: Mutex<Option<PeerId>>,
    /// Acknowledgment slots of in-flight push sends, keyed by request id.
    pending_acks: Mutex<HashMap<String, oneshot::Sender<SendAck>>>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl<P: PushChannel, F: Fallback> TransportManager<P, F> {
    /// Create a manager and the receiver for its [`TransportEvent`]s.
    ///
    /// The push channel is not touched until [`start`](Self::start).
    #[must_use]
    pub fn new(
        push: P,
        fallback: F,
        config: ManagerConfig,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(event_buffer.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Down);
        let manager = Self {
            push,
            fallback,
            config,
            identity: Mutex::new(None),
            joined: Mutex::new(None),
            pending_acks: Mutex::new(HashMap::new()),
            state_tx,
            events_tx,
        };
        (manager, events_rx)
    }

    /// Current push channel state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch push channel state changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The configured timeouts.
    #[must_use]
    pub const fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The push channel.
    pub const fn push(&self) -> &P {
        &self.push
    }

    /// The request/response fallback.
    pub const fn fallback(&self) -> &F {
        &self.fallback
    }

    fn push_up(&self) -> bool {
        self.connection_state() == ConnectionState::Up && self.push.is_connected()
    }

    /// Record who we are; announced now if connected, and after every reconnect.
    pub async fn set_identity(&self, self_id: PeerId) {
        *self.identity.lock() = Some(self_id.clone());
        if self.push_up() {
            self.emit_best_effort(ClientEvent::Identify { self_id }).await;
        }
    }

    /// Subscribe to the conversation with `peer_id`; re-sent after every reconnect.
    pub async fn join(&self, peer_id: PeerId) {
        *self.joined.lock() = Some(peer_id.clone());
        if self.push_up() {
            self.emit_best_effort(ClientEvent::Join { peer_id }).await;
        }
    }

    /// Submit a message and wait for the confirmed copy.
    ///
    /// Uses the push channel when it is up and the fallback otherwise (or
    /// when emitting on the push channel fails). While the fallback cannot
    /// reach the server either, the send stays pending: it is attempted
    /// again every retry interval and as soon as the push channel changes
    /// state. An attempt that may have reached the server is never repeated.
    /// The whole call is bounded by the send timeout.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if no acknowledgment arrives in time,
    ///   including when the server stayed unreachable throughout.
    /// - [`TransportError::Rejected`] if the server refused the message.
    /// - Any other fallback error when the push channel is down.
    pub async fn send(
        &self,
        temp_id: TempId,
        to: &PeerId,
        body: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<(WireMessage, TransportType), TransportError> {
        let request_id = temp_id.to_string();
        let attempt = self.send_until_reachable(&request_id, to, body, reply_to);
        match tokio::time::timeout(self.config.send_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => {
                self.pending_acks.lock().remove(&request_id);
                tracing::warn!(request_id = %request_id, "send timed out");
                Err(TransportError::Timeout)
            }
        }
    }

    async fn send_until_reachable(
        &self,
        request_id: &str,
        to: &PeerId,
        body: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<(WireMessage, TransportType), TransportError> {
        let mut state_rx = self.subscribe_state();
        let mut attempt = 0u32;
        loop {
            state_rx.mark_unchanged();
            match self.send_once(request_id, to, body, reply_to).await {
                Err(TransportError::Unreachable(reason)) => {
                    attempt = attempt.saturating_add(1);
                    tracing::debug!(
                        request_id = %request_id,
                        attempt,
                        reason = %reason,
                        "server unreachable, send stays pending"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(self.config.retry_interval) => {}
                        _ = state_rx.changed() => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// One attempt: push if up, fallback otherwise.
    async fn send_once(
        &self,
        request_id: &str,
        to: &PeerId,
        body: &str,
        reply_to: Option<&MessageId>,
    ) -> Result<(WireMessage, TransportType), TransportError> {
        if self.push_up() {
            let (ack_tx, ack_rx) = oneshot::channel();
            self.pending_acks
                .lock()
                .insert(request_id.to_owned(), ack_tx);

            let event = ClientEvent::Send {
                request_id: request_id.to_owned(),
                to: to.clone(),
                body: body.to_owned(),
                reply_to_id: reply_to.cloned(),
            };
            match self.push.emit(&event).await {
                Ok(()) => {
                    let ack = ack_rx.await.map_err(|_| TransportError::ConnectionClosed)?;
                    let item = ack.into_result()?;
                    return Ok((item, self.push.transport_type()));
                }
                Err(err) => {
                    self.pending_acks.lock().remove(request_id);
                    tracing::debug!(
                        transport = %self.push.transport_type(),
                        err = %err,
                        "push emit failed, trying fallback"
                    );
                }
            }
        }

        let request = SendRequest {
            peer_id: to.clone(),
            body: body.to_owned(),
            reply_to_id: reply_to.cloned(),
        };
        let item = self.fallback.send(&request).await?;
        Ok((item, self.fallback.transport_type()))
    }

    /// Fetch one page of history through the fallback.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] past the history timeout, or the
    /// fallback's own error.
    pub async fn history(&self, query: &HistoryQuery) -> Result<HistoryPage, TransportError> {
        tokio::time::timeout(self.config.history_timeout, self.fallback.history(query))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Tell the peer we are typing. Dropped silently while the push channel is down.
    pub async fn emit_typing(&self, peer_id: &PeerId) {
        if self.push_up() {
            self.emit_best_effort(ClientEvent::Typing {
                peer_id: peer_id.clone(),
            })
            .await;
        }
    }

    /// Tell the author that `ids` were displayed.
    ///
    /// Returns `false` if nothing went out (push channel down or emit failed),
    /// so the caller can report the same ids again later.
    pub async fn emit_seen(&self, peer_id: &PeerId, ids: Vec<MessageId>) -> bool {
        if ids.is_empty() || !self.push_up() {
            return false;
        }
        let event = ClientEvent::Seen {
            peer_id: peer_id.clone(),
            ids,
        };
        match self.push.emit(&event).await {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(err = %err, "seen receipt dropped");
                false
            }
        }
    }

    async fn emit_best_effort(&self, event: ClientEvent) {
        if let Err(err) = self.push.emit(&event).await {
            tracing::debug!(err = %err, "push emit dropped");
        }
    }

    /// Route one inbound server event.
    async fn dispatch(&self, event: ServerEvent) {
        let forwarded = match event {
            ServerEvent::Ack(ack) => {
                let slot = self.pending_acks.lock().remove(&ack.request_id);
                match slot {
                    Some(tx) => {
                        let _ = tx.send(ack);
                    }
                    None => {
                        tracing::debug!(request_id = %ack.request_id, "ack for unknown or expired request");
                    }
                }
                return;
            }
            ServerEvent::Identified { self_id } => {
                tracing::debug!(self_id = %self_id, "push channel identified");
                return;
            }
            ServerEvent::New(message) => {
                self.confirm_from_echo(&message);
                TransportEvent::Message(message)
            }
            ServerEvent::Status { id, state } => TransportEvent::Receipt { id, state },
            ServerEvent::Typing { peer_id } => TransportEvent::Typing { peer_id },
            ServerEvent::Error(err) => {
                tracing::warn!(error = %err, "server reported an error");
                TransportEvent::Rejected(err)
            }
        };
        let _ = self.events_tx.send(forwarded).await;
    }

    /// Resolve a pending send from its echo, in case the ack is lost.
    fn confirm_from_echo(&self, message: &PushedMessage) {
        let Some(request_id) = message.request_id.as_deref() else {
            return;
        };
        let slot = self.pending_acks.lock().remove(request_id);
        if let Some(tx) = slot {
            tracing::debug!(request_id = %request_id, message_id = %message.item.id, "send confirmed by echo");
            let _ = tx.send(SendAck::confirmed(request_id, message.item.clone()));
        }
    }

    async fn handshake(&self) -> Result<(), TransportError> {
        let identity = self.identity.lock().clone();
        if let Some(self_id) = identity {
            self.push.emit(&ClientEvent::Identify { self_id }).await?;
        }
        let joined = self.joined.lock().clone();
        if let Some(peer_id) = joined {
            self.push.emit(&ClientEvent::Join { peer_id }).await?;
        }
        Ok(())
    }

    async fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::info!(state = %state, "push channel state changed");
            let _ = self.events_tx.send(TransportEvent::Connection(state)).await;
        }
    }

    /// Connect (with backoff) and run the handshake. Returns once connected.
    async fn connect_with_backoff(&self, env: &mut Environment) {
        let mut attempt = 0u32;
        loop {
            env.wait_online().await;
            let result = match self.push.connect().await {
                Ok(()) => self.handshake().await,
                Err(err) => Err(err),
            };
            let Err(err) = result else {
                return;
            };

            let delay = self.config.reconnect.delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::warn!(
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                err = %err,
                "push connect failed, backing off"
            );
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                state = env.changed() => {
                    if state.online {
                        attempt = 0;
                    }
                }
            }
        }
    }

    /// Spawn the connection supervisor.
    ///
    /// The task runs until the returned handle is aborted or the runtime
    /// shuts down. Sends made while it is reconnecting use the fallback.
    pub fn start(self: &Arc<Self>, env: Environment) -> tokio::task::JoinHandle<()>
    where
        P: 'static,
        F: 'static,
    {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.supervise(env).await })
    }

    async fn supervise(&self, mut env: Environment) {
        let mut connected_before = false;
        loop {
            self.connect_with_backoff(&mut env).await;
            self.set_state(ConnectionState::Up).await;
            if connected_before {
                tracing::info!("push channel reconnected");
                let _ = self.events_tx.send(TransportEvent::Reconnected).await;
            }
            connected_before = true;

            loop {
                match self.push.next_event().await {
                    Ok(event) => self.dispatch(event).await,
                    Err(err) => {
                        tracing::warn!(err = %err, "push channel lost");
                        break;
                    }
                }
            }
            self.set_state(ConnectionState::Down).await;
        }
    }
}
