//! Rust client SDK for realtime workspace event streams.
//!
//! The crate is organized by concern:
//! - `stream`: websocket session, delivery queue and the pull-based
//!   `EventStream` handle.
//! - `auth`: bearer credential storage shared across sessions.
//! - `retry`: caller-side retry and deadline helpers.

/// Bearer credential store and authentication state.
pub mod auth;
/// Retry and timeout helpers for stream construction.
pub mod retry;
/// Realtime stream client, protocol types, and session state.
pub mod stream;
