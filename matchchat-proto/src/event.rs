//! Push-channel events.
//!
//! Every frame on the push channel is one JSON object of the form
//! `{"event": "<name>", "data": {...}}`. [`ClientEvent`] flows from the
//! client to the server and [`ServerEvent`] the other way.

use serde::{Deserialize, Serialize};

use crate::api::ApiError;
use crate::message::{MessageId, PeerId, WireMessage};

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Announce who is on the other end of this connection.
    ///
    /// Must be the first event after the connection opens and must be
    /// repeated after every reconnect.
    #[serde(rename = "identify", rename_all = "camelCase")]
    Identify {
        /// The connecting user.
        self_id: PeerId,
    },

    /// Subscribe to the conversation with `peer_id`.
    #[serde(rename = "join", rename_all = "camelCase")]
    Join {
        /// The other participant.
        peer_id: PeerId,
    },

    /// Submit a message. The server replies with [`ServerEvent::Ack`]
    /// carrying the same `request_id`.
    #[serde(rename = "message:send", rename_all = "camelCase")]
    Send {
        /// Correlates the acknowledgment with this request.
        request_id: String,
        /// Recipient.
        to: PeerId,
        /// Message body.
        body: String,
        /// Message this one replies to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to_id: Option<MessageId>,
    },

    /// Tell the author that these messages were seen.
    #[serde(rename = "message:seen", rename_all = "camelCase")]
    Seen {
        /// Author of the messages.
        peer_id: PeerId,
        /// Messages that were displayed.
        ids: Vec<MessageId>,
    },

    /// The local user is typing in the conversation with `peer_id`.
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        /// Who should be told.
        peer_id: PeerId,
    },
}

/// Delivery receipt states the server reports for outgoing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptState {
    /// The message reached the recipient's device.
    Delivered,
    /// The recipient displayed the message.
    Seen,
}

/// Acknowledgment of a [`ClientEvent::Send`].
///
/// Exactly one of `item` and `error` is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendAck {
    /// The `request_id` of the acknowledged send.
    pub request_id: String,
    /// The confirmed message on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<WireMessage>,
    /// The rejection on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl SendAck {
    /// Builds a successful acknowledgment.
    pub fn confirmed(request_id: impl Into<String>, item: WireMessage) -> Self {
        Self {
            request_id: request_id.into(),
            item: Some(item),
            error: None,
        }
    }

    /// Builds a rejecting acknowledgment.
    pub fn rejected(request_id: impl Into<String>, error: ApiError) -> Self {
        Self {
            request_id: request_id.into(),
            item: None,
            error: Some(error),
        }
    }

    /// Converts the acknowledgment into the confirmed message or the error.
    ///
    /// # Errors
    ///
    /// Returns the carried [`ApiError`], or an internal error when the
    /// acknowledgment is malformed and carries neither field.
    pub fn into_result(self) -> Result<WireMessage, ApiError> {
        match (self.item, self.error) {
            (_, Some(err)) => Err(err),
            (Some(item), None) => Ok(item),
            (None, None) => Err(ApiError::new(crate::api::ErrorCode::Internal)),
        }
    }
}

/// A message pushed over `message:new`.
///
/// The copy echoed to the author's own connection carries the `request_id`
/// of the `message:send` that produced it, so the author can confirm the
/// optimistic entry even if the acknowledgment is lost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushedMessage {
    /// The stored message.
    #[serde(flatten)]
    pub item: WireMessage,
    /// Request id of the author's send, on the author's echo only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl PushedMessage {
    /// Echo of the author's own send.
    pub fn echo(item: WireMessage, request_id: impl Into<String>) -> Self {
        Self {
            item,
            request_id: Some(request_id.into()),
        }
    }
}

impl From<WireMessage> for PushedMessage {
    fn from(item: WireMessage) -> Self {
        Self {
            item,
            request_id: None,
        }
    }
}

/// Events emitted by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    /// The server accepted an [`ClientEvent::Identify`].
    #[serde(rename = "identified", rename_all = "camelCase")]
    Identified {
        /// The identity the server bound to this connection.
        self_id: PeerId,
    },

    /// Acknowledgment of a send.
    #[serde(rename = "message:ack")]
    Ack(SendAck),

    /// A new message in a joined conversation. Also echoed to the author.
    #[serde(rename = "message:new")]
    New(PushedMessage),

    /// Receipt for an outgoing message.
    #[serde(rename = "message:status", rename_all = "camelCase")]
    Status {
        /// The outgoing message.
        id: MessageId,
        /// What happened to it.
        state: ReceiptState,
    },

    /// The peer is typing.
    #[serde(rename = "typing", rename_all = "camelCase")]
    Typing {
        /// Who is typing.
        peer_id: PeerId,
    },

    /// A connection-level failure (for example a rejected `identify`).
    #[serde(rename = "error")]
    Error(ApiError),
}
