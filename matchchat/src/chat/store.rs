//! Ordered, deduplicated in-memory log of one conversation.
//!
//! [`MessageStore`] is the only place conversation messages are mutated.
//! Entries stay sorted ascending by `(created_at, key)` and no two entries
//! share a confirmed [`MessageId`]. Optimistic entries are keyed by their
//! [`TempId`] until [`reconcile`](MessageStore::reconcile) swaps the server
//! id in place, carrying reactions, pin and star across the swap.

use std::fmt;

use matchchat_proto::message::{MessageId, PeerId, TempId, Timestamp, WireMessage};

use super::composer::{MessageKind, Payload};
use super::delivery::DeliveryState;

/// Errors from store operations that name a specific entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No entry with this key.
    #[error("message not found: {0}")]
    NotFound(MessageKey),

    /// The entry exists but is not an optimistic one awaiting confirmation.
    #[error("message is not pending: {0}")]
    NotPending(MessageKey),
}

/// Identity of a stored message.
///
/// Confirmed keys sort before pending ones at the same timestamp, and
/// pending keys sort by creation (temporary ids are time-ordered).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKey {
    /// Confirmed by the server.
    Confirmed(MessageId),
    /// Optimistic, awaiting confirmation.
    Pending(TempId),
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Confirmed(id) => write!(f, "{id}"),
            Self::Pending(temp) => write!(f, "{temp}"),
        }
    }
}

impl From<MessageId> for MessageKey {
    fn from(id: MessageId) -> Self {
        Self::Confirmed(id)
    }
}

impl From<TempId> for MessageKey {
    fn from(temp: TempId) -> Self {
        Self::Pending(temp)
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Written by the local user.
    Outgoing,
    /// Written by the peer.
    Incoming,
}

/// An emoji reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    /// The emoji.
    pub emoji: String,
    /// Whether the local user added it.
    pub by_me: bool,
}

/// One stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Temporary or confirmed identity.
    pub key: MessageKey,
    /// The other participant of the conversation.
    pub peer_id: PeerId,
    /// Who wrote it.
    pub direction: Direction,
    /// Structured content.
    pub payload: Payload,
    /// Wire body the payload was read from (or will be sent as).
    pub body: String,
    /// Creation time; server time once confirmed.
    pub created_at: Timestamp,
    /// Message replied to. Not required to be loaded.
    pub reply_to: Option<MessageId>,
    /// Reactions, in the order they were added. Local only.
    pub reactions: Vec<Reaction>,
    /// Local only.
    pub pinned: bool,
    /// Local only.
    pub starred: bool,
    /// Delivery state. For incoming messages `Seen` means we reported it seen.
    pub delivery: DeliveryState,
}

impl Message {
    /// Build an entry from a confirmed wire message.
    #[must_use]
    pub fn from_wire(wire: &WireMessage, self_id: &PeerId) -> Self {
        let (direction, peer_id, delivery) = if &wire.from == self_id {
            (Direction::Outgoing, wire.to.clone(), DeliveryState::Sent)
        } else {
            (Direction::Incoming, wire.from.clone(), DeliveryState::Delivered)
        };
        Self {
            key: MessageKey::Confirmed(wire.id.clone()),
            peer_id,
            direction,
            payload: Payload::from_body(&wire.body),
            body: wire.body.clone(),
            created_at: wire.at,
            reply_to: wire.reply_to_id.clone(),
            reactions: Vec::new(),
            pinned: false,
            starred: false,
            delivery,
        }
    }

    /// What the message displays as.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// The confirmed id, if any.
    #[must_use]
    pub const fn id(&self) -> Option<&MessageId> {
        match &self.key {
            MessageKey::Confirmed(id) => Some(id),
            MessageKey::Pending(_) => None,
        }
    }

    /// The temporary id, while unconfirmed.
    #[must_use]
    pub const fn temp_id(&self) -> Option<TempId> {
        match self.key {
            MessageKey::Pending(temp) => Some(temp),
            MessageKey::Confirmed(_) => None,
        }
    }

    fn order_key(&self) -> (Timestamp, &MessageKey) {
        (self.created_at, &self.key)
    }
}

/// Result of [`MessageStore::merge_incoming`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Stored at this index.
    Inserted(usize),
    /// An entry with the same id already existed; nothing changed.
    Duplicate,
}

/// Result of [`MessageStore::prepend_history`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrependOutcome {
    /// Entries added.
    pub inserted: usize,
    /// Batch items skipped because their id was already stored.
    pub duplicates: usize,
    /// Entries now above the previously first entry, i.e. `messages()[..above]`.
    /// These are the rows whose height shifts the viewport.
    pub above: usize,
}

/// The conversation log.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries, oldest first.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up an entry.
    #[must_use]
    pub fn get(&self, key: &MessageKey) -> Option<&Message> {
        self.position(key).map(|i| &self.messages[i])
    }

    /// Index of an entry.
    #[must_use]
    pub fn position(&self, key: &MessageKey) -> Option<usize> {
        self.messages.iter().position(|m| &m.key == key)
    }

    /// Server time of the newest confirmed entry.
    #[must_use]
    pub fn newest_confirmed_at(&self) -> Option<Timestamp> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.id().is_some())
            .map(|m| m.created_at)
            .max()
    }

    fn contains_id(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| m.id() == Some(id))
    }

    /// Insert at the sorted position; equal keys keep insertion order.
    fn insert_sorted(&mut self, message: Message) -> usize {
        let index = {
            let key = message.order_key();
            self.messages.partition_point(|m| m.order_key() <= key)
        };
        self.messages.insert(index, message);
        index
    }

    /// Store a local message before the network call and return its temporary id.
    pub fn insert_optimistic(
        &mut self,
        peer_id: PeerId,
        payload: Payload,
        reply_to: Option<MessageId>,
        created_at: Timestamp,
    ) -> TempId {
        let temp = TempId::new();
        let body = payload.to_body();
        self.insert_sorted(Message {
            key: MessageKey::Pending(temp),
            peer_id,
            direction: Direction::Outgoing,
            payload,
            body,
            created_at,
            reply_to,
            reactions: Vec::new(),
            pinned: false,
            starred: false,
            delivery: DeliveryState::Sending,
        });
        tracing::debug!(temp_id = %temp, "optimistic message stored");
        temp
    }

    /// Swap the server's copy into an optimistic entry.
    ///
    /// Server fields (id, time, body, reply) replace the optimistic ones and
    /// the state moves to `Sent`, even from `Failed`: a confirmation that
    /// arrives after the send timed out still wins. Local fields stay. If the push echo of the
    /// same message was merged first, the echo is folded into this entry so
    /// only one remains. The entry only moves if the server timestamp puts
    /// it out of order.
    ///
    /// Returns the index the entry ends up at.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no entry has this temporary id (for
    /// example because it was deleted locally while in flight).
    pub fn reconcile(&mut self, temp: TempId, confirmed: &WireMessage) -> Result<usize, StoreError> {
        let key = MessageKey::Pending(temp);
        if self.position(&key).is_none() {
            return Err(StoreError::NotFound(key));
        }

        let echo_key = MessageKey::Confirmed(confirmed.id.clone());
        let echo = self
            .position(&echo_key)
            .map(|i| self.messages.remove(i));
        let index = self.position(&key).ok_or(StoreError::NotFound(key))?;

        let entry = &mut self.messages[index];
        entry.key = echo_key;
        entry.created_at = confirmed.at;
        entry.payload = Payload::from_body(&confirmed.body);
        entry.body.clone_from(&confirmed.body);
        entry.reply_to.clone_from(&confirmed.reply_to_id);
        entry.delivery = entry.delivery.furthest(DeliveryState::Sent);

        if let Some(echo) = echo {
            tracing::debug!(message_id = %confirmed.id, "folding push echo into acknowledged message");
            entry.delivery = entry.delivery.furthest(echo.delivery);
            entry.pinned |= echo.pinned;
            entry.starred |= echo.starred;
            for reaction in echo.reactions {
                if !entry.reactions.contains(&reaction) {
                    entry.reactions.push(reaction);
                }
            }
        }

        Ok(self.restore_order(index))
    }

    /// Move the entry at `index` if its neighbours are now out of order.
    fn restore_order(&mut self, index: usize) -> usize {
        let in_order = {
            let key = self.messages[index].order_key();
            let after_prev = index == 0 || self.messages[index - 1].order_key() <= key;
            let before_next = self
                .messages
                .get(index + 1)
                .is_none_or(|next| key <= next.order_key());
            after_prev && before_next
        };
        if in_order {
            return index;
        }
        let entry = self.messages.remove(index);
        self.insert_sorted(entry)
    }

    /// Mark an optimistic entry as failed.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the entry is gone.
    pub fn mark_failed(&mut self, temp: TempId) -> Result<(), StoreError> {
        let key = MessageKey::Pending(temp);
        let index = self.position(&key).ok_or(StoreError::NotFound(key))?;
        let entry = &mut self.messages[index];
        entry.delivery = entry.delivery.advance(DeliveryState::Failed);
        Ok(())
    }

    /// Store a confirmed message unless its id is already present.
    pub fn merge_incoming(&mut self, message: Message) -> MergeOutcome {
        if let Some(id) = message.id()
            && self.contains_id(id)
        {
            tracing::debug!(message_id = %id, "duplicate message ignored");
            return MergeOutcome::Duplicate;
        }
        MergeOutcome::Inserted(self.insert_sorted(message))
    }

    /// Merge an older page of history.
    ///
    /// Items are merged by `(created_at, id)` like live messages, so a page
    /// arriving after a live push still lands in the right place.
    pub fn prepend_history(&mut self, batch: Vec<Message>) -> PrependOutcome {
        let anchor = self.messages.first().map(|m| m.key.clone());
        let mut outcome = PrependOutcome::default();
        for message in batch {
            match self.merge_incoming(message) {
                MergeOutcome::Inserted(_) => outcome.inserted += 1,
                MergeOutcome::Duplicate => outcome.duplicates += 1,
            }
        }
        outcome.above = match anchor {
            Some(key) => self.position(&key).unwrap_or(0),
            None => self.messages.len(),
        };
        outcome
    }

    /// Apply a delivery receipt to an outgoing message.
    ///
    /// Returns the new state if it changed.
    pub fn apply_receipt(&mut self, id: &MessageId, state: DeliveryState) -> Option<DeliveryState> {
        let entry = self
            .messages
            .iter_mut()
            .find(|m| m.id() == Some(id) && m.direction == Direction::Outgoing)?;
        let next = entry.delivery.advance(state);
        if next == entry.delivery {
            return None;
        }
        entry.delivery = next;
        Some(next)
    }

    /// Incoming confirmed messages not yet reported as seen.
    #[must_use]
    pub fn unseen_incoming(&self) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|m| m.direction == Direction::Incoming && m.delivery != DeliveryState::Seen)
            .filter_map(|m| m.id().cloned())
            .collect()
    }

    /// Record that incoming messages were reported as seen.
    pub fn mark_incoming_seen(&mut self, ids: &[MessageId]) {
        for entry in &mut self.messages {
            if entry.direction == Direction::Incoming
                && entry.id().is_some_and(|id| ids.contains(id))
            {
                entry.delivery = DeliveryState::Seen;
            }
        }
    }

    fn entry_mut(&mut self, key: &MessageKey) -> Result<&mut Message, StoreError> {
        self.messages
            .iter_mut()
            .find(|m| &m.key == key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    /// Add the local user's `emoji` reaction, or remove it if present.
    ///
    /// Returns whether the reaction is now present.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the entry is gone.
    pub fn toggle_reaction(&mut self, key: &MessageKey, emoji: &str) -> Result<bool, StoreError> {
        let entry = self.entry_mut(key)?;
        if let Some(i) = entry
            .reactions
            .iter()
            .position(|r| r.by_me && r.emoji == emoji)
        {
            entry.reactions.remove(i);
            Ok(false)
        } else {
            entry.reactions.push(Reaction {
                emoji: emoji.to_owned(),
                by_me: true,
            });
            Ok(true)
        }
    }

    /// Flip the pinned flag. Returns the new value.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the entry is gone.
    pub fn toggle_pinned(&mut self, key: &MessageKey) -> Result<bool, StoreError> {
        let entry = self.entry_mut(key)?;
        entry.pinned = !entry.pinned;
        Ok(entry.pinned)
    }

    /// Flip the starred flag. Returns the new value.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the entry is gone.
    pub fn toggle_starred(&mut self, key: &MessageKey) -> Result<bool, StoreError> {
        let entry = self.entry_mut(key)?;
        entry.starred = !entry.starred;
        Ok(entry.starred)
    }

    /// Remove an entry from this device only.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if the entry is gone.
    pub fn delete_local(&mut self, key: &MessageKey) -> Result<Message, StoreError> {
        let index = self
            .position(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        Ok(self.messages.remove(index))
    }
}
