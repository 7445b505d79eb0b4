//! `MatchChat`: synchronization engine for one-to-one matched-user chat.
//!
//! Keeps a local conversation consistent with the server over a push
//! channel with a request/response fallback: optimistic sends, ordered
//! dedup-safe merging, delivery receipts, paged history with scroll-anchor
//! preservation, and typing presence.

pub mod chat;
pub mod config;
pub mod environment;
pub mod transport;
pub mod upload;
