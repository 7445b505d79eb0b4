//! Inbound methods for [`ChatEngine`].
//!
//! Applies pushed messages, receipts, typing signals and connection
//! changes, and pages older history in through the fallback.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use matchchat_proto::api::{HistoryPage, HistoryQuery, MAX_PAGE_SIZE};
use matchchat_proto::event::PushedMessage;
use matchchat_proto::message::{TempId, WireMessage};

use crate::environment::Environment;
use crate::transport::manager::TransportEvent;
use crate::transport::{Fallback, PushChannel};

use super::store::{Direction, MergeOutcome, Message, MessageKey, PrependOutcome};
use super::{ChatEngine, ChatError, ChatEvent, EngineState, LoadOutcome};

/// Background tasks of a started engine. Dropping this stops them.
pub struct EngineTasks {
    supervisor: JoinHandle<()>,
    events: JoinHandle<()>,
}

impl EngineTasks {
    pub(super) const fn new(supervisor: JoinHandle<()>, events: JoinHandle<()>) -> Self {
        Self { supervisor, events }
    }

    /// Stop both tasks now.
    pub fn abort(&self) {
        self.supervisor.abort();
        self.events.abort();
    }
}

impl Drop for EngineTasks {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Holds the pagination slot of a history load; releases it if the load
/// is dropped before it records an outcome.
struct InFlightSlot<'a> {
    state: &'a Mutex<EngineState>,
    armed: bool,
}

impl<'a> InFlightSlot<'a> {
    const fn new(state: &'a Mutex<EngineState>) -> Self {
        Self { state, armed: true }
    }

    fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("older history load cancelled");
            self.state.lock().pagination.abandon();
        }
    }
}

impl<P: PushChannel + 'static, F: Fallback + 'static> ChatEngine<P, F> {
    /// Apply transport events and environment changes until the transport
    /// event channel closes.
    pub(super) async fn run(
        self: Arc<Self>,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        mut env: Environment,
    ) {
        loop {
            tokio::select! {
                event = transport_events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("transport event channel closed, engine loop exiting");
                        break;
                    };
                    self.handle_transport_event(event).await;
                }
                state = env.changed() => {
                    self.set_visible(state.visible);
                    if state.visible {
                        self.mark_seen().await;
                    }
                }
            }
        }
    }

    /// Apply one transport event.
    pub async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Message(pushed) => self.apply_pushed(&pushed).await,
            TransportEvent::Receipt { id, state } => {
                let changed = self.state.lock().store.apply_receipt(&id, state.into());
                if let Some(state) = changed {
                    tracing::debug!(message_id = %id, state = %state, "delivery advanced");
                    self.emit(ChatEvent::DeliveryChanged {
                        key: MessageKey::Confirmed(id),
                        state,
                    });
                }
            }
            TransportEvent::Typing { peer_id } => {
                if peer_id == self.peer_id {
                    self.peer_typing();
                }
            }
            TransportEvent::Connection(connection) => {
                self.state.lock().connection = connection;
                self.emit(ChatEvent::ConnectionChanged(connection));
            }
            TransportEvent::Reconnected => {
                if self.config.resync_on_reconnect {
                    self.resync().await;
                }
            }
            TransportEvent::Rejected(api) => {
                self.note_access(&ChatError::from(api));
            }
        }
    }

    fn belongs_here(&self, wire: &WireMessage) -> bool {
        (wire.from == self.self_id && wire.to == self.peer_id)
            || (wire.from == self.peer_id && wire.to == self.self_id)
    }

    async fn apply_pushed(&self, pushed: &PushedMessage) {
        let wire = &pushed.item;
        if !self.belongs_here(wire) {
            tracing::debug!(message_id = %wire.id, "message for another conversation ignored");
            return;
        }
        // The echo of our own send names its optimistic entry.
        if wire.from == self.self_id
            && let Some(temp) = pushed.request_id.as_deref().and_then(TempId::parse)
            && self.confirm(temp, wire)
        {
            tracing::debug!(temp_id = %temp, message_id = %wire.id, "message confirmed by echo");
            return;
        }
        let message = Message::from_wire(wire, &self.self_id);
        let incoming = message.direction == Direction::Incoming;
        let key = message.key.clone();

        let (outcome, typing_cleared) = {
            let mut state = self.state.lock();
            let outcome = state.store.merge_incoming(message);
            let cleared = incoming
                && matches!(outcome, MergeOutcome::Inserted(_))
                && state.typing.clear();
            (outcome, cleared)
        };

        let MergeOutcome::Inserted(index) = outcome else {
            return;
        };
        self.emit(ChatEvent::MessageInserted { key, index });
        if typing_cleared {
            self.emit(ChatEvent::TypingChanged { typing: false });
        }
        if incoming && self.is_visible() {
            self.mark_seen().await;
        }
    }

    /// Show the typing indicator and schedule its decay.
    fn peer_typing(self: &Arc<Self>) {
        let now = tokio::time::Instant::now();
        let (generation, was_typing, expiry) = {
            let mut state = self.state.lock();
            let was_typing = state.typing.is_typing(now);
            let generation = state.typing.signal(now);
            (generation, was_typing, state.typing.expiry())
        };
        if !was_typing {
            self.emit(ChatEvent::TypingChanged { typing: true });
        }

        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            let Some(engine) = engine.upgrade() else {
                return;
            };
            let expired = engine.state.lock().typing.expire(generation);
            if expired {
                engine.emit(ChatEvent::TypingChanged { typing: false });
            }
        });
    }

    /// Merge a page and shift the viewport by the height added above.
    fn apply_page(&self, page: &HistoryPage) -> (PrependOutcome, f64) {
        let batch: Vec<Message> = page
            .items
            .iter()
            .filter(|w| self.belongs_here(w))
            .map(|w| Message::from_wire(w, &self.self_id))
            .collect();

        let mut state = self.state.lock();
        let outcome = state.store.prepend_history(batch);
        let delta: f64 = state.store.messages()[..outcome.above]
            .iter()
            .map(|m| (self.measure)(m))
            .sum();
        state.viewport.shift_for_prepend(delta);
        (outcome, delta)
    }

    /// Load the next older page, unless one is in flight or history is exhausted.
    ///
    /// # Errors
    ///
    /// Returns the fetch failure. Loaded history is kept and the failure is
    /// also recorded in the conversation's pagination error slot.
    pub async fn load_older(&self) -> Result<LoadOutcome, ChatError> {
        let begun = self.state.lock().pagination.begin();
        let request = match begun {
            Ok(request) => request,
            Err(skip) => {
                tracing::debug!(?skip, "older history load skipped");
                return Ok(LoadOutcome::Skipped(skip));
            }
        };

        let slot = InFlightSlot::new(&self.state);
        let fetched = self.transport.history(&request.query).await;
        slot.settle();

        match fetched {
            Ok(page) => {
                self.state.lock().pagination.complete(&page);
                let (outcome, scroll_delta) = self.apply_page(&page);
                let has_more = self.state.lock().pagination.has_more();
                tracing::debug!(
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    has_more,
                    "older history merged"
                );
                self.emit(ChatEvent::HistoryPrepended {
                    inserted: outcome.inserted,
                    scroll_delta,
                });
                Ok(LoadOutcome::Loaded {
                    inserted: outcome.inserted,
                    has_more,
                    scroll_delta,
                })
            }
            Err(err) => {
                let err = ChatError::from(err);
                tracing::warn!(error = %err, "loading older history failed");
                self.state.lock().pagination.fail(err.to_string());
                self.note_access(&err);
                self.emit(ChatEvent::HistoryFailed { error: err.clone() });
                Err(err)
            }
        }
    }

    /// Record a new scroll offset; loads older history when near the top.
    ///
    /// # Errors
    ///
    /// Returns the fetch failure of a triggered load.
    pub async fn on_scroll(&self, scroll_offset: f64) -> Result<LoadOutcome, ChatError> {
        let near_top = {
            let mut state = self.state.lock();
            state.viewport.scroll_offset = scroll_offset;
            state.viewport.near_top(self.config.top_threshold)
        };
        if near_top {
            self.load_older().await
        } else {
            Ok(LoadOutcome::Skipped(super::pagination::Skip::NotNearTop))
        }
    }

    /// Fetch what arrived while disconnected.
    ///
    /// Pages backward from the newest message until a page overlaps what is
    /// already stored or history runs out. Pagination cursors are left alone.
    pub async fn resync(&self) {
        let known = self.state.lock().store.newest_confirmed_at();
        let limit = self.config.page_size.clamp(1, MAX_PAGE_SIZE);
        let mut before_cursor = None;
        let mut pages = 0u32;
        let mut inserted = 0;
        let mut scroll_delta = 0.0;

        loop {
            let query = HistoryQuery {
                peer_id: self.peer_id.clone(),
                limit,
                before_cursor: before_cursor.take(),
            };
            let page = match self.transport.history(&query).await {
                Ok(page) => page,
                Err(err) => {
                    let err = ChatError::from(err);
                    tracing::warn!(error = %err, pages, "resync after reconnect failed");
                    self.note_access(&err);
                    break;
                }
            };
            pages += 1;
            let (outcome, delta) = self.apply_page(&page);
            inserted += outcome.inserted;
            scroll_delta += delta;

            let overlaps = known.is_none_or(|newest| {
                outcome.duplicates > 0 || page.items.first().is_none_or(|w| w.at <= newest)
            });
            if overlaps || page.items.len() < limit || page.next_cursor.is_none() {
                break;
            }
            before_cursor = page.next_cursor;
        }

        tracing::info!(inserted, pages, "resynced after reconnect");
        if inserted > 0 {
            self.emit(ChatEvent::HistoryPrepended {
                inserted,
                scroll_delta,
            });
        }
    }
}
