//! Conversation synchronization for `MatchChat`.
//!
//! [`ChatEngine`] owns one conversation and wires the pieces together:
//!
//! ```text
//! Draft ─► composer ─► store.insert_optimistic ─► TransportManager::send
//!                                   ▲                     │
//!                                   └── store.reconcile ◄─┘ (or mark_failed)
//!
//! TransportEvent ─► store.merge_incoming / apply_receipt / typing indicator
//! load_older ─► fallback history ─► store.prepend_history ─► viewport shift
//! ```
//!
//! Every store mutation happens under one lock that is never held across an
//! `.await`, so no mutation is ever observed half-applied. The rendering
//! layer reads snapshots and [`ChatEvent`]s; it never mutates the store.

pub mod composer;
pub mod delivery;
pub mod pagination;
pub mod presence;
pub mod search;
pub mod store;

mod receive;
mod send;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use matchchat_proto::api::{ApiError, Cursor, ErrorCode};
use matchchat_proto::message::{MAX_BODY_SIZE, MessageId, PeerId, TempId, ValidationError};

use crate::environment::Environment;
use crate::transport::manager::{TransportEvent, TransportManager};
use crate::transport::{ConnectionState, Fallback, PushChannel, TransportError};

use delivery::DeliveryState;
use pagination::{PaginationController, Skip, Viewport};
use presence::{TypingDebouncer, TypingIndicator};
use store::{Message, MessageKey, MessageStore, StoreError};

pub use receive::EngineTasks;

/// User-facing error taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// The session is no longer valid; the whole view must re-authenticate.
    #[error("not authenticated")]
    Unauthenticated,

    /// The two users may not chat; the conversation is read-only.
    #[error("no relationship with this user")]
    NoRelationship,

    /// The user must upgrade before sending more.
    #[error("upgrade required")]
    EntitlementRequired {
        /// Where to upgrade.
        upgrade_url: Option<String>,
    },

    /// The message was not confirmed in time. Retry explicitly.
    #[error("timed out waiting for the server")]
    TransportTimeout,

    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    TransportDown(String),

    /// The draft was rejected before anything was sent.
    #[error("invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// The server refused the request for another reason.
    #[error("rejected by server: {0}")]
    Server(ApiError),

    /// No message with this key is loaded.
    #[error("message not found: {0}")]
    NotFound(MessageKey),

    /// Only failed messages can be retried.
    #[error("message has not failed: {0}")]
    NotFailed(MessageKey),

    /// Composition is disabled for this conversation.
    #[error("conversation is blocked")]
    Blocked,
}

impl From<ApiError> for ChatError {
    fn from(err: ApiError) -> Self {
        match err.error {
            ErrorCode::Unauthenticated => Self::Unauthenticated,
            ErrorCode::NoRelationship => Self::NoRelationship,
            ErrorCode::EntitlementRequired => Self::EntitlementRequired {
                upgrade_url: err.upgrade_url,
            },
            ErrorCode::Validation | ErrorCode::NotFound | ErrorCode::Internal => Self::Server(err),
        }
    }
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::TransportTimeout,
            TransportError::Rejected(api) => api.into(),
            other => Self::TransportDown(other.to_string()),
        }
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => Self::NotFound(key),
            StoreError::NotPending(key) => Self::NotFailed(key),
        }
    }
}

/// Whether the user may compose in this conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Access {
    /// Normal.
    #[default]
    Open,
    /// The server reported `no_relationship`; read-only.
    Blocked,
    /// The server asked for an upgrade. Sending is still attempted.
    UpgradeRequired {
        /// Where to upgrade.
        upgrade_url: Option<String>,
    },
    /// The session expired; nothing works until re-authentication.
    SessionExpired,
}

/// Notifications for the rendering layer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// A message was added at `index`.
    MessageInserted {
        /// The new entry.
        key: MessageKey,
        /// Its position.
        index: usize,
    },
    /// An optimistic message was confirmed and re-keyed.
    MessageReconciled {
        /// The old key.
        temp_id: TempId,
        /// The new key.
        id: MessageId,
        /// Its position after the swap.
        index: usize,
    },
    /// Local fields (reactions, pin, star) changed.
    MessageUpdated {
        /// The entry.
        key: MessageKey,
    },
    /// A message was removed locally.
    MessageRemoved {
        /// The removed entry.
        key: MessageKey,
    },
    /// Delivery state changed.
    DeliveryChanged {
        /// The entry.
        key: MessageKey,
        /// The new state.
        state: DeliveryState,
    },
    /// Older history was merged; the viewport moved down by `scroll_delta`.
    HistoryPrepended {
        /// Entries added.
        inserted: usize,
        /// Height added above the previously first entry.
        scroll_delta: f64,
    },
    /// Loading older history failed. Loaded history is untouched.
    HistoryFailed {
        /// What went wrong.
        error: ChatError,
    },
    /// The peer started or stopped typing.
    TypingChanged {
        /// Whether the peer is typing.
        typing: bool,
    },
    /// The push channel went up or down.
    ConnectionChanged(ConnectionState),
    /// The user must upgrade.
    UpgradeRequired {
        /// Where to upgrade.
        upgrade_url: Option<String>,
    },
    /// The conversation became read-only.
    Blocked,
    /// The session expired.
    SessionExpired,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    /// Maximum message body size in bytes.
    pub max_body_size: usize,
    /// Items per history page.
    pub page_size: usize,
    /// Page in whatever arrived while disconnected after every reconnect.
    pub resync_on_reconnect: bool,
    /// Outbound typing debounce window.
    pub typing_debounce: Duration,
    /// How long an inbound typing signal lasts.
    pub typing_expiry: Duration,
    /// Distance from the top (in the same units as the measure function)
    /// that triggers loading older history.
    pub top_threshold: f64,
    /// Capacity of the [`ChatEvent`] channel.
    pub event_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_body_size: MAX_BODY_SIZE,
            page_size: 30,
            resync_on_reconnect: true,
            typing_debounce: Duration::from_millis(800),
            typing_expiry: Duration::from_millis(1200),
            top_threshold: 200.0,
            event_buffer: 64,
        }
    }
}

/// Read-only snapshot of the conversation state.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    /// The other participant.
    pub peer_id: PeerId,
    /// Whether older history may exist.
    pub has_more: bool,
    /// Cursor of the oldest loaded page.
    pub oldest_cursor: Option<Cursor>,
    /// When the peer's typing indicator expires, if shown.
    pub typing_until: Option<tokio::time::Instant>,
    /// Push channel state.
    pub connection_state: ConnectionState,
    /// Whether a history load is running.
    pub loading_older: bool,
    /// Error of the last failed history load.
    pub pagination_error: Option<String>,
    /// Whether composing is allowed.
    pub access: Access,
    /// Current scroll position.
    pub viewport: Viewport,
}

/// Result of [`ChatEngine::load_older`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoadOutcome {
    /// A page was fetched and merged.
    Loaded {
        /// Entries added.
        inserted: usize,
        /// Whether more history may exist.
        has_more: bool,
        /// How far the viewport moved.
        scroll_delta: f64,
    },
    /// No request was made.
    Skipped(Skip),
}

/// Rendered height of a message row.
pub type Measure = dyn Fn(&Message) -> f64 + Send + Sync;

/// Mutable conversation state, guarded as one unit.
struct EngineState {
    store: MessageStore,
    pagination: PaginationController,
    viewport: Viewport,
    debouncer: TypingDebouncer,
    typing: TypingIndicator,
    connection: ConnectionState,
    access: Access,
    visible: bool,
}

/// Synchronization engine for one conversation.
///
/// Share it behind an [`Arc`]; [`start`](Self::start) spawns the tasks
/// that feed it inbound traffic.
pub struct ChatEngine<P: PushChannel, F: Fallback> {
    transport: Arc<TransportManager<P, F>>,
    self_id: PeerId,
    peer_id: PeerId,
    config: ChatConfig,
    state: Mutex<EngineState>,
    measure: Box<Measure>,
    event_tx: mpsc::Sender<ChatEvent>,
}

impl<P: PushChannel, F: Fallback> ChatEngine<P, F> {
    /// Create an engine for the conversation between `self_id` and `peer_id`.
    ///
    /// Returns the engine and a receiver for [`ChatEvent`]s that the
    /// rendering layer should consume.
    pub fn new(
        transport: Arc<TransportManager<P, F>>,
        self_id: PeerId,
        peer_id: PeerId,
        config: ChatConfig,
    ) -> (Self, mpsc::Receiver<ChatEvent>) {
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer.max(1));
        let state = EngineState {
            store: MessageStore::new(),
            pagination: PaginationController::new(peer_id.clone(), config.page_size),
            viewport: Viewport::default(),
            debouncer: TypingDebouncer::new(config.typing_debounce),
            typing: TypingIndicator::new(config.typing_expiry),
            connection: transport.connection_state(),
            access: Access::Open,
            visible: true,
        };
        let engine = Self {
            transport,
            self_id,
            peer_id,
            config,
            state: Mutex::new(state),
            measure: Box::new(|_| 1.0),
            event_tx,
        };
        (engine, event_rx)
    }

    /// Use `measure` for row heights (defaults to one unit per message).
    #[must_use]
    pub fn with_measure(mut self, measure: impl Fn(&Message) -> f64 + Send + Sync + 'static) -> Self {
        self.measure = Box::new(measure);
        self
    }

    /// The local user.
    pub const fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    /// The other participant.
    pub const fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// The engine settings.
    pub const fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// The transport this engine sends through.
    pub const fn transport(&self) -> &Arc<TransportManager<P, F>> {
        &self.transport
    }

    /// Snapshot of all loaded messages, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().store.messages().to_vec()
    }

    /// Look up one message.
    pub fn message(&self, key: &MessageKey) -> Option<Message> {
        self.state.lock().store.get(key).cloned()
    }

    /// Snapshot of the conversation state.
    pub fn conversation(&self) -> Conversation {
        let state = self.state.lock();
        Conversation {
            peer_id: self.peer_id.clone(),
            has_more: state.pagination.has_more(),
            oldest_cursor: state.pagination.oldest_cursor().cloned(),
            typing_until: state.typing.until(),
            connection_state: state.connection,
            loading_older: state.pagination.in_flight(),
            pagination_error: state.pagination.last_error().map(str::to_owned),
            access: state.access.clone(),
            viewport: state.viewport,
        }
    }

    /// Local search over the loaded window.
    pub fn search(&self, query: &str) -> Vec<search::SearchHit> {
        search::search(self.state.lock().store.messages(), query)
    }

    /// Add or remove the local user's reaction. Local only.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] if the message is not loaded.
    pub fn toggle_reaction(&self, key: &MessageKey, emoji: &str) -> Result<bool, ChatError> {
        let added = self.state.lock().store.toggle_reaction(key, emoji)?;
        self.emit(ChatEvent::MessageUpdated { key: key.clone() });
        Ok(added)
    }

    /// Flip the pinned flag. Local only.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] if the message is not loaded.
    pub fn toggle_pinned(&self, key: &MessageKey) -> Result<bool, ChatError> {
        let pinned = self.state.lock().store.toggle_pinned(key)?;
        self.emit(ChatEvent::MessageUpdated { key: key.clone() });
        Ok(pinned)
    }

    /// Flip the starred flag. Local only.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] if the message is not loaded.
    pub fn toggle_starred(&self, key: &MessageKey) -> Result<bool, ChatError> {
        let starred = self.state.lock().store.toggle_starred(key)?;
        self.emit(ChatEvent::MessageUpdated { key: key.clone() });
        Ok(starred)
    }

    /// Remove a message from this device. Nothing is sent to the server.
    ///
    /// # Errors
    ///
    /// [`ChatError::NotFound`] if the message is not loaded.
    pub fn delete_local(&self, key: &MessageKey) -> Result<Message, ChatError> {
        let removed = self.state.lock().store.delete_local(key)?;
        self.emit(ChatEvent::MessageRemoved { key: key.clone() });
        Ok(removed)
    }

    fn emit(&self, event: ChatEvent) {
        if self.event_tx.try_send(event).is_err() {
            tracing::debug!("chat event dropped, receiver full or gone");
        }
    }

    /// Record the access consequence of an error and notify the view.
    fn note_access(&self, err: &ChatError) {
        let (access, event) = match err {
            ChatError::Unauthenticated => (Access::SessionExpired, ChatEvent::SessionExpired),
            ChatError::NoRelationship => (Access::Blocked, ChatEvent::Blocked),
            ChatError::EntitlementRequired { upgrade_url } => (
                Access::UpgradeRequired {
                    upgrade_url: upgrade_url.clone(),
                },
                ChatEvent::UpgradeRequired {
                    upgrade_url: upgrade_url.clone(),
                },
            ),
            _ => return,
        };
        {
            let mut state = self.state.lock();
            if state.access == access {
                return;
            }
            if access == Access::Blocked {
                state.pagination.exhaust();
            }
            state.access = access;
        }
        tracing::warn!(peer_id = %self.peer_id, error = %err, "conversation access changed");
        self.emit(event);
    }

    /// Reject composition if the conversation does not allow it.
    fn check_access(&self) -> Result<(), ChatError> {
        match self.state.lock().access {
            Access::Blocked => Err(ChatError::Blocked),
            Access::SessionExpired => Err(ChatError::Unauthenticated),
            Access::Open | Access::UpgradeRequired { .. } => Ok(()),
        }
    }

    /// Whether `start` wired this engine to an environment that is visible.
    fn is_visible(&self) -> bool {
        self.state.lock().visible
    }

    fn set_visible(&self, visible: bool) {
        self.state.lock().visible = visible;
    }

    /// Wire the engine to its transport and spawn the background tasks.
    ///
    /// Announces identity and conversation, starts the connection
    /// supervisor, and starts the loop that applies [`TransportEvent`]s and
    /// environment changes. Dropping the returned [`EngineTasks`] stops both.
    pub async fn start(
        self: &Arc<Self>,
        transport_events: mpsc::Receiver<TransportEvent>,
        env: Environment,
    ) -> EngineTasks
    where
        P: 'static,
        F: 'static,
    {
        self.set_visible(env.current().visible);
        self.transport.set_identity(self.self_id.clone()).await;
        self.transport.join(self.peer_id.clone()).await;
        let supervisor = self.transport.start(env.clone());
        let events = tokio::spawn(Arc::clone(self).run(transport_events, env));
        EngineTasks::new(supervisor, events)
    }
}
