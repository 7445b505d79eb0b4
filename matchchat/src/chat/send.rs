//! Outbound methods for [`ChatEngine`].
//!
//! Sending is optimistic: the draft is validated and inserted with state
//! `Sending` before any network call, then reconciled with the server's
//! copy or marked failed. A failed message stays until the user retries it
//! (under a fresh temporary id) or deletes it.

use matchchat_proto::message::{MessageId, TempId, Timestamp, WireMessage};

use crate::transport::{Fallback, PushChannel};

use super::composer::{Draft, Payload, compose};
use super::delivery::DeliveryState;
use super::store::MessageKey;
use super::{ChatEngine, ChatError, ChatEvent};

impl<P: PushChannel, F: Fallback> ChatEngine<P, F> {
    /// Compose and send a draft.
    ///
    /// A draft with an attachment and text produces two messages. All of
    /// them are inserted before the first network call; each then resolves
    /// independently. Returns the confirmed ids in send order.
    ///
    /// # Errors
    ///
    /// - [`ChatError::Validation`] if the draft is empty or too large; nothing is inserted.
    /// - [`ChatError::Blocked`] / [`ChatError::Unauthenticated`] if composing is disabled.
    /// - The first transport failure; the affected messages are marked failed.
    pub async fn send(&self, draft: Draft) -> Result<Vec<MessageId>, ChatError> {
        self.check_access()?;
        let composed = compose(draft, self.config.max_body_size)?;

        let pending: Vec<(TempId, Payload)> = {
            let mut state = self.state.lock();
            state.debouncer.reset();
            composed
                .payloads
                .into_iter()
                .map(|payload| {
                    let temp = state.store.insert_optimistic(
                        self.peer_id.clone(),
                        payload.clone(),
                        composed.reply_to.clone(),
                        Timestamp::now(),
                    );
                    (temp, payload)
                })
                .collect()
        };
        self.announce_inserted(pending.iter().map(|(temp, _)| *temp));

        let mut confirmed = Vec::with_capacity(pending.len());
        let mut first_error = None;
        for (temp, payload) in pending {
            match self
                .transmit(temp, &payload, composed.reply_to.as_ref())
                .await
            {
                Ok(id) => confirmed.push(id),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(confirmed), Err)
    }

    /// Send plain text.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_text(&self, text: &str) -> Result<MessageId, ChatError> {
        let ids = self.send(Draft::text(text)).await?;
        ids.into_iter()
            .next()
            .ok_or(ChatError::Validation(matchchat_proto::message::ValidationError::Empty))
    }

    /// Resend a failed message under a new temporary id.
    ///
    /// The failed entry is replaced by a fresh optimistic one carrying the
    /// same content and reply reference.
    ///
    /// # Errors
    ///
    /// - [`ChatError::NotFound`] if no such message is loaded.
    /// - [`ChatError::NotFailed`] if it has not failed.
    /// - The transport failure if the retry fails as well.
    pub async fn retry(&self, temp: TempId) -> Result<MessageId, ChatError> {
        self.check_access()?;
        let old_key = MessageKey::Pending(temp);
        let (new_temp, payload, reply_to) = {
            let mut state = self.state.lock();
            let entry = state
                .store
                .get(&old_key)
                .ok_or_else(|| ChatError::NotFound(old_key.clone()))?;
            if entry.delivery != DeliveryState::Failed {
                return Err(ChatError::NotFailed(old_key));
            }
            let removed = state.store.delete_local(&old_key)?;
            let new_temp = state.store.insert_optimistic(
                removed.peer_id,
                removed.payload.clone(),
                removed.reply_to.clone(),
                Timestamp::now(),
            );
            (new_temp, removed.payload, removed.reply_to)
        };
        tracing::info!(old = %temp, new = %new_temp, "retrying failed message");
        self.emit(ChatEvent::MessageRemoved { key: old_key });
        self.announce_inserted(std::iter::once(new_temp));

        self.transmit(new_temp, &payload, reply_to.as_ref()).await
    }

    fn announce_inserted(&self, temps: impl Iterator<Item = TempId>) {
        for temp in temps {
            let key = MessageKey::Pending(temp);
            let index = self.state.lock().store.position(&key);
            if let Some(index) = index {
                self.emit(ChatEvent::MessageInserted { key, index });
            }
        }
    }

    /// Hand one optimistic message to the transport and record the outcome.
    async fn transmit(
        &self,
        temp: TempId,
        payload: &Payload,
        reply_to: Option<&MessageId>,
    ) -> Result<MessageId, ChatError> {
        let body = payload.to_body();
        match self
            .transport
            .send(temp, &self.peer_id, &body, reply_to)
            .await
        {
            Ok((item, via)) => {
                if self.confirm(temp, &item) {
                    tracing::debug!(temp_id = %temp, message_id = %item.id, transport = %via, "message confirmed");
                } else {
                    // Already reconciled by its echo, or deleted locally.
                    tracing::debug!(temp_id = %temp, message_id = %item.id, "no optimistic entry left to confirm");
                }
                Ok(item.id)
            }
            Err(err) => {
                let err = ChatError::from(err);
                tracing::warn!(temp_id = %temp, error = %err, "send failed");
                if self.state.lock().store.mark_failed(temp).is_ok() {
                    self.emit(ChatEvent::DeliveryChanged {
                        key: MessageKey::Pending(temp),
                        state: DeliveryState::Failed,
                    });
                }
                self.note_access(&err);
                Err(err)
            }
        }
    }

    /// Swap the server's copy into the optimistic entry `temp` and announce it.
    ///
    /// Returns `false` if no such entry is stored.
    pub(super) fn confirm(&self, temp: TempId, item: &WireMessage) -> bool {
        let key = MessageKey::Confirmed(item.id.clone());
        let (index, state) = {
            let mut state = self.state.lock();
            let Ok(index) = state.store.reconcile(temp, item) else {
                return false;
            };
            let delivery = state
                .store
                .get(&key)
                .map_or(DeliveryState::Sent, |m| m.delivery);
            (index, delivery)
        };
        self.emit(ChatEvent::MessageReconciled {
            temp_id: temp,
            id: item.id.clone(),
            index,
        });
        self.emit(ChatEvent::DeliveryChanged { key, state });
        true
    }

    /// Register a keystroke; emits a typing signal at most once per window.
    pub async fn on_keystroke(&self) {
        let fire = self
            .state
            .lock()
            .debouncer
            .keystroke(tokio::time::Instant::now());
        if fire {
            self.transport.emit_typing(&self.peer_id).await;
        }
    }

    /// Report every unseen incoming message as seen.
    ///
    /// Does nothing while the push channel is down; the same messages are
    /// reported on the next call.
    pub async fn mark_seen(&self) {
        let ids = self.state.lock().store.unseen_incoming();
        if ids.is_empty() {
            return;
        }
        if self.transport.emit_seen(&self.peer_id, ids.clone()).await {
            tracing::debug!(count = ids.len(), "reported messages seen");
            self.state.lock().store.mark_incoming_seen(&ids);
        }
    }
}
