//! Shared protocol definitions for the `MatchChat` wire format.

pub mod api;
pub mod codec;
pub mod event;
pub mod message;
