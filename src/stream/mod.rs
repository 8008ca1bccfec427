//! Realtime event-stream modules.
//!
//! - `transport`: connection seam and the websocket implementation.
//! - `codec`: payload encoding for requests and inbound messages.
//! - `queue`: delivery queue between the session worker and the consumer.
//! - `session`: handshake and per-connection state machine.
//! - `client`: client configuration and the public `EventStream` handle.
//! - `proto`: workspace event protocol types.

/// Stream client and cancelable event stream handle.
pub mod client;
/// Request/message codec boundary.
pub mod codec;
/// Workspace event protocol messages.
pub mod proto;
/// Single-consumer delivery queue.
pub mod queue;
/// Transport session state machine.
pub mod session;
/// Physical connection abstraction.
pub mod transport;
