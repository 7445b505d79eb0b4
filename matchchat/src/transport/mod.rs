//! Transport layer abstraction for `MatchChat`.
//!
//! Two seams carry traffic to the server:
//! - [`PushChannel`]: a persistent bidirectional connection exchanging
//!   [`ClientEvent`]s and [`ServerEvent`]s.
//! - [`Fallback`]: one-shot request/response calls with the same semantics.
//!
//! [`manager::TransportManager`] unifies both behind one send/receive
//! contract. Concrete implementations:
//! - [`ws::WsPushChannel`]: WebSocket push channel
//! - [`http::HttpFallback`]: HTTP request/response fallback
//! - [`loopback`]: in-process push channel and fallback for testing

pub mod http;
pub mod loopback;
pub mod manager;
pub mod ws;

use std::fmt;
use std::future::Future;

use matchchat_proto::api::{ApiError, HistoryPage, HistoryQuery, SendRequest};
use matchchat_proto::codec::CodecError;
use matchchat_proto::event::{ClientEvent, ServerEvent};
use matchchat_proto::message::WireMessage;

pub use matchchat_proto::message::PeerId;

/// Describes which path a request travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Persistent push channel (WebSocket).
    Push,
    /// Request/response fallback (HTTP).
    Fallback,
    /// In-process loopback for testing.
    Loopback,
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "Push"),
            Self::Fallback => write!(f, "Fallback"),
            Self::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Whether the push channel is currently usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// The push channel is connected and identified.
    Up,
    /// The push channel is down; sends use the fallback.
    #[default]
    Down,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The server could not be reached.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The server answered with an error body.
    #[error("rejected by server: {0}")]
    Rejected(#[from] ApiError),

    /// A frame or body could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Any other HTTP-level failure.
    #[error("http error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unreachable(err.to_string())
        } else if err.is_decode() {
            Self::Codec(CodecError::Serialization(err.to_string()))
        } else {
            Self::Http(err.to_string())
        }
    }
}

/// Persistent bidirectional event channel to the server.
///
/// Implementations own the connection lifecycle below the manager: the
/// manager calls [`connect`](PushChannel::connect) again after
/// [`next_event`](PushChannel::next_event) reports a closed connection.
pub trait PushChannel: Send + Sync {
    /// Open (or re-open) the connection.
    fn connect(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Emit one event to the server.
    ///
    /// Returns `Ok(())` once the frame has been handed to the connection.
    /// This does NOT mean the server processed it.
    fn emit(&self, event: &ClientEvent) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Wait for the next event from the server.
    ///
    /// Returns [`TransportError::ConnectionClosed`] once the connection drops.
    fn next_event(&self) -> impl Future<Output = Result<ServerEvent, TransportError>> + Send;

    /// Whether the connection is currently open.
    fn is_connected(&self) -> bool;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}

/// One-shot request/response calls used when the push channel is down and
/// for history fetches.
pub trait Fallback: Send + Sync {
    /// Submit a message and wait for the confirmed copy.
    fn send(
        &self,
        request: &SendRequest,
    ) -> impl Future<Output = Result<WireMessage, TransportError>> + Send;

    /// Fetch one page of history.
    fn history(
        &self,
        query: &HistoryQuery,
    ) -> impl Future<Output = Result<HistoryPage, TransportError>> + Send;

    /// Return the type of this transport.
    fn transport_type(&self) -> TransportType;
}
