//! Who may talk to whom, and how much.
//!
//! Two users may exchange messages only if they are matched. An empty match
//! list matches everyone, which is how the relay runs for local testing.
//! Users that are not entitled may send a limited number of messages before
//! every further send is refused with an upgrade link.

use std::collections::HashSet;

use matchchat_proto::api::{ApiError, ErrorCode};
use matchchat_proto::message::PeerId;

/// Matching and entitlement rules.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    matches: HashSet<(PeerId, PeerId)>,
    free_message_limit: Option<u32>,
    entitled: HashSet<PeerId>,
    upgrade_url: Option<String>,
}

impl AccessPolicy {
    /// A policy that matches everyone and never asks for an upgrade.
    #[must_use]
    pub fn open() -> Self {
        Self::default()
    }

    /// Allow `a` and `b` to chat. Once any pair is added, unlisted pairs
    /// are refused.
    #[must_use]
    pub fn with_match(mut self, a: &str, b: &str) -> Self {
        self.matches.insert(ordered(&PeerId::new(a), &PeerId::new(b)));
        self
    }

    /// Refuse sends from non-entitled users beyond `limit` messages.
    #[must_use]
    pub fn with_free_limit(mut self, limit: u32, upgrade_url: Option<String>) -> Self {
        self.free_message_limit = Some(limit);
        self.upgrade_url = upgrade_url;
        self
    }

    /// Exempt `user` from the free-message limit.
    #[must_use]
    pub fn with_entitled(mut self, user: &str) -> Self {
        self.entitled.insert(PeerId::new(user));
        self
    }

    /// Check that `a` and `b` are matched.
    ///
    /// # Errors
    ///
    /// Returns a `no_relationship` error if they are not.
    pub fn check_pair(&self, a: &PeerId, b: &PeerId) -> Result<(), ApiError> {
        if a == b {
            return Err(ApiError::new(ErrorCode::NoRelationship));
        }
        if self.matches.is_empty() || self.matches.contains(&ordered(a, b)) {
            Ok(())
        } else {
            Err(ApiError::new(ErrorCode::NoRelationship))
        }
    }

    /// Check that `author`, having already sent `sent` messages, may send another.
    ///
    /// # Errors
    ///
    /// Returns an `entitlement_required` error once the free limit is used up.
    pub fn check_quota(&self, author: &PeerId, sent: u32) -> Result<(), ApiError> {
        match self.free_message_limit {
            Some(limit) if sent >= limit && !self.entitled.contains(author) => {
                Err(self.upgrade_url.as_ref().map_or_else(
                    || ApiError::new(ErrorCode::EntitlementRequired),
                    ApiError::entitlement_required,
                ))
            }
            _ => Ok(()),
        }
    }
}

fn ordered(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}
