//! Binary message codec used by the stream session.
//!
//! The session never inspects payloads itself; it hands raw frame bytes to a
//! [`Codec`] and forwards whatever comes back.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Serializes outbound requests and deserializes inbound messages.
///
/// Implementations must be pure: the same bytes always decode to the same
/// value, and there is no state carried between frames.
pub trait Codec: Send + Sync + 'static {
    /// Outbound request sent once per session after the token frame.
    type Request: Send + 'static;
    /// Inbound message decoded from each binary frame.
    type Message: Send + 'static;

    /// Encodes the outbound request into a binary frame payload.
    fn encode(&self, request: &Self::Request) -> Result<Vec<u8>, EncodeError>;

    /// Decodes one inbound binary frame payload.
    fn decode(&self, bytes: &[u8]) -> Result<Self::Message, DecodeError>;
}

/// Inbound frame could not be turned into a message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Payload bytes were not a valid message.
    #[error("malformed frame payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A text frame arrived where only binary frames are expected.
    #[error("unexpected text frame ({len} bytes)")]
    UnexpectedText { len: usize },

    /// Codec-specific decode failure.
    #[error("{0}")]
    Other(String),
}

/// Outbound request could not be serialized.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("request serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// JSON-over-binary codec backed by serde.
pub struct JsonCodec<Req, Msg> {
    _types: PhantomData<fn(&Req) -> Msg>,
}

impl<Req, Msg> JsonCodec<Req, Msg> {
    pub fn new() -> Self {
        Self {
            _types: PhantomData,
        }
    }
}

impl<Req, Msg> Default for JsonCodec<Req, Msg> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req, Msg> Clone for JsonCodec<Req, Msg> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<Req, Msg> fmt::Debug for JsonCodec<Req, Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec").finish()
    }
}

impl<Req, Msg> Codec for JsonCodec<Req, Msg>
where
    Req: Serialize + Send + 'static,
    Msg: DeserializeOwned + Send + 'static,
{
    type Request = Req;
    type Message = Msg;

    fn encode(&self, request: &Req) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(request)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Msg, DecodeError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
