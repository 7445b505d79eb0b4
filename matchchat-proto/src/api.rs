//! Request/response fallback DTOs.
//!
//! The HTTP fallback carries the same semantics as the push channel:
//! `GET /history` pages backwards through a conversation and `POST /send`
//! submits a message. Failures share one error body, [`ApiError`].

use serde::{Deserialize, Serialize};

use crate::message::{MessageId, PeerId, Timestamp, WireMessage};

/// Upper bound on a history page; servers clamp larger requests to it.
pub const MAX_PAGE_SIZE: usize = 100;

/// Opaque position in a conversation's history used for backward paging.
///
/// Clients treat cursors as opaque tokens. The server encodes the
/// `(at, id)` ordering key of the oldest item of a page so cursors stay
/// valid across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wrap a raw cursor token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Builds the cursor pointing just before the given ordering key.
    #[must_use]
    pub fn from_key(at: Timestamp, id: &MessageId) -> Self {
        Self(format!("{}:{}", at.as_millis(), id.as_str()))
    }

    /// Splits the cursor back into its ordering key.
    ///
    /// Returns `None` for tokens that were not produced by [`Cursor::from_key`].
    #[must_use]
    pub fn to_key(&self) -> Option<(Timestamp, MessageId)> {
        let (at, id) = self.0.split_once(':')?;
        let at = at.parse::<u64>().ok()?;
        if id.is_empty() {
            return None;
        }
        Some((Timestamp::from_millis(at), MessageId::new(id)))
    }

    /// Returns the raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Query string of `GET /history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    /// The other participant of the conversation.
    pub peer_id: PeerId,
    /// Maximum number of items to return.
    pub limit: usize,
    /// Only return items strictly older than this cursor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_cursor: Option<Cursor>,
}

/// Response body of `GET /history`.
///
/// Items are in ascending `(at, id)` order. `next_cursor` is `None` once the
/// beginning of the conversation has been reached.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    /// Page items, oldest first.
    pub items: Vec<WireMessage>,
    /// Cursor for the next older page, if any.
    pub next_cursor: Option<Cursor>,
}

impl HistoryPage {
    /// Cuts one page out of a conversation log sorted ascending by `(at, id)`.
    ///
    /// Returns the newest `limit` items strictly older than `before`. A
    /// cursor that does not decode is treated as "from the newest end".
    #[must_use]
    pub fn slice(sorted: &[WireMessage], before: Option<&Cursor>, limit: usize) -> Self {
        let end = before.and_then(Cursor::to_key).map_or(sorted.len(), |key| {
            sorted.partition_point(|m| (m.at, &m.id) < (key.0, &key.1))
        });
        let start = end.saturating_sub(limit);
        let items = sorted[start..end].to_vec();
        let next_cursor = match items.first() {
            Some(first) if start > 0 => Some(Cursor::from_key(first.at, &first.id)),
            _ => None,
        };
        Self { items, next_cursor }
    }
}

/// Request body of `POST /send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// Recipient of the message.
    pub peer_id: PeerId,
    /// Message body.
    pub body: String,
    /// Message this one replies to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
}

/// Response body of `POST /send`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    /// The confirmed message.
    pub item: WireMessage,
}

/// Response body of `POST /upload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Where the uploaded bytes can be fetched from.
    pub url: String,
}

/// Machine-readable error category shared by both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Caller identity missing or unknown.
    Unauthenticated,
    /// The two users are not allowed to chat.
    NoRelationship,
    /// The caller must upgrade before sending more messages.
    EntitlementRequired,
    /// The request was malformed (empty body, bad limit, ...).
    Validation,
    /// A referenced resource does not exist.
    NotFound,
    /// Any other server failure.
    Internal,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::NoRelationship => "no_relationship",
            Self::EntitlementRequired => "entitlement_required",
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error body returned by the server on either transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{error} (status {status})")]
pub struct ApiError {
    /// Error category.
    pub error: ErrorCode,
    /// HTTP-equivalent status code.
    pub status: u16,
    /// Where the user can upgrade, for [`ErrorCode::EntitlementRequired`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_url: Option<String>,
}

impl ApiError {
    /// Builds an error with the conventional status code for `error`.
    #[must_use]
    pub const fn new(error: ErrorCode) -> Self {
        let status = match error {
            ErrorCode::Unauthenticated => 401,
            ErrorCode::EntitlementRequired => 402,
            ErrorCode::NoRelationship => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Validation => 422,
            ErrorCode::Internal => 500,
        };
        Self {
            error,
            status,
            upgrade_url: None,
        }
    }

    /// Builds an [`ErrorCode::EntitlementRequired`] error pointing at `url`.
    pub fn entitlement_required(url: impl Into<String>) -> Self {
        Self {
            upgrade_url: Some(url.into()),
            ..Self::new(ErrorCode::EntitlementRequired)
        }
    }
}
