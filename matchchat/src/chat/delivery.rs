//! Per-message delivery state machine.
//!
//! ```text
//! Sending ──► Sent ──► Delivered ──► Seen
//!    │          └──────────────────►──┘
//!    └──► Failed
//! ```
//!
//! Transitions only move forward. An event implying an earlier state than
//! the current one is ignored, and `Failed` is terminal: the only way
//! forward from it is a fresh send under a new temporary id.

use std::fmt;

use matchchat_proto::event::ReceiptState;

/// Lifecycle stage of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryState {
    /// Submitted, waiting for the server's confirmation.
    Sending,
    /// Confirmed by the server.
    Sent,
    /// Reached the recipient's device.
    Delivered,
    /// Displayed to the recipient.
    Seen,
    /// Not confirmed in time, or rejected. Waits for an explicit retry.
    Failed,
}

impl DeliveryState {
    /// Position along the success path. `Failed` sits outside it.
    const fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Seen => Some(3),
            Self::Failed => None,
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    #[must_use]
    pub const fn can_advance_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Sending, Self::Failed) => true,
            (Self::Sending, Self::Delivered | Self::Seen) => false,
            (Self::Failed, _) | (_, Self::Failed | Self::Sending) => false,
            _ => match (self.rank(), next.rank()) {
                (Some(a), Some(b)) => b > a,
                _ => false,
            },
        }
    }

    /// Apply a transition, returning the resulting state.
    ///
    /// Illegal or regressing transitions leave the state unchanged.
    #[must_use]
    pub fn advance(self, next: Self) -> Self {
        if self.can_advance_to(next) {
            next
        } else {
            if self != next {
                tracing::debug!(from = %self, to = %next, "ignoring delivery transition");
            }
            self
        }
    }

    /// The furthest along of two states on the success path.
    ///
    /// Used when two copies of the same message meet (an echo and its
    /// acknowledgment). `Failed` loses to any success state.
    #[must_use]
    pub fn furthest(self, other: Self) -> Self {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) if b > a => other,
            (None, Some(_)) => other,
            _ => self,
        }
    }

    /// Whether the message has been confirmed by the server.
    #[must_use]
    pub const fn is_confirmed(self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Seen)
    }
}

impl From<ReceiptState> for DeliveryState {
    fn from(state: ReceiptState) -> Self {
        match state {
            ReceiptState::Delivered => Self::Delivered,
            ReceiptState::Seen => Self::Seen,
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Seen => "seen",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}
