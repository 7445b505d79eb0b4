//! `MatchChat` reference relay.
//!
//! Serves the push channel over WebSocket plus the HTTP fallback
//! (`GET /history`, `POST /send`, `POST /upload`) over an in-memory history.
//! Exposed as a library so tests can run it in-process.

pub mod access;
pub mod config;
pub mod relay;
pub mod store;
