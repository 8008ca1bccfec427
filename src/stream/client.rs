//! Stream client and the pull-based [`EventStream`] handle.
//!
//! `StreamClient::open` encodes the request, reads the credential once and
//! starts a transport session. The returned handle yields decoded messages
//! until the server closes, a failure is delivered, or the caller cancels.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::debug;

use crate::auth::CredentialStore;
use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::stream::codec::{Codec, DecodeError, EncodeError};
use crate::stream::queue::{delivery_queue, QueueConsumer};
use crate::stream::session::{
    self, CloseCodes, Delivered, SessionHandle, SessionParams, SessionState, Termination,
};
use crate::stream::transport::{Connector, Endpoint, TransportError, WsConnector};

/// Default close codes and queue limits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StreamDefaults;

impl StreamDefaults {
    pub const NORMAL_CLOSE_CODE: u16 = 1000;
    /// Reserved by the server to signal an invalid or expired credential.
    pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;
    pub const CLIENT_ABORTED_CLOSE_CODE: u16 = 4000;
    pub const CLIENT_ABORTED_REASON: &'static str = "client aborted";
    pub const INVALID_PAYLOAD_CLOSE_CODE: u16 = 1007;
    pub const QUEUE_WARN_THRESHOLD: usize = 1024;
}

/// Tunables for [`StreamClient`].
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub close_codes: CloseCodes,
    /// Buffered depth that triggers a warning log. `0` disables it.
    pub queue_warn_threshold: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            close_codes: CloseCodes {
                normal: StreamDefaults::NORMAL_CLOSE_CODE,
                unauthorized: StreamDefaults::UNAUTHORIZED_CLOSE_CODE,
                client_aborted: StreamDefaults::CLIENT_ABORTED_CLOSE_CODE,
                client_aborted_reason: StreamDefaults::CLIENT_ABORTED_REASON.to_string(),
                invalid_payload: StreamDefaults::INVALID_PAYLOAD_CLOSE_CODE,
            },
            queue_warn_threshold: StreamDefaults::QUEUE_WARN_THRESHOLD,
        }
    }
}

impl StreamOptions {
    pub(crate) fn validate(&self) -> Result<(), StreamError> {
        let codes = &self.close_codes;
        if codes.client_aborted == codes.normal || codes.client_aborted == codes.unauthorized {
            return Err(StreamError::Config(format!(
                "client_aborted close code {} must differ from normal ({}) and unauthorized ({})",
                codes.client_aborted, codes.normal, codes.unauthorized
            )));
        }
        if codes.normal == codes.unauthorized {
            return Err(StreamError::Config(
                "normal and unauthorized close codes must differ".to_string(),
            ));
        }
        // 1004-1006 are reserved and never appear in a close frame.
        for (name, code) in [
            ("client_aborted", codes.client_aborted),
            ("invalid_payload", codes.invalid_payload),
        ] {
            if !matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999) {
                return Err(StreamError::Config(format!(
                    "{name} close code {code} cannot be sent by a client"
                )));
            }
        }
        Ok(())
    }
}

/// Errors surfaced by stream construction and iteration.
#[derive(Debug, Error)]
pub enum StreamError {
    /// An inbound frame could not be decoded. Terminal.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The connection failed outside a clean close. Terminal.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The outbound request could not be encoded.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Client options are inconsistent.
    #[error("invalid stream options: {0}")]
    Config(String),
}

impl StreamError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Entry point for opening event streams against one endpoint.
pub struct StreamClient<K: Codec, C: Connector = WsConnector> {
    endpoint: Endpoint,
    credentials: Arc<dyn CredentialStore>,
    codec: Arc<K>,
    connector: Arc<C>,
    options: StreamOptions,
}

impl<K: Codec> StreamClient<K, WsConnector> {
    /// Creates a websocket-backed client.
    pub fn new(endpoint: Endpoint, credentials: Arc<dyn CredentialStore>, codec: K) -> Self {
        Self {
            endpoint,
            credentials,
            codec: Arc::new(codec),
            connector: Arc::new(WsConnector),
            options: StreamOptions::default(),
        }
    }
}

impl<K: Codec, C: Connector> StreamClient<K, C> {
    /// Replaces the transport used to open sessions.
    pub fn with_connector<C2: Connector>(self, connector: C2) -> StreamClient<K, C2> {
        StreamClient {
            endpoint: self.endpoint,
            credentials: self.credentials,
            codec: self.codec,
            connector: Arc::new(connector),
            options: self.options,
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Overrides the endpoint URL, keeping the sub-protocol.
    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Endpoint::new(url, self.endpoint.protocol());
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    /// Opens a stream. The connection starts immediately in the background.
    ///
    /// Only option and request-encoding problems are reported here; connection
    /// failures arrive as the stream's terminal error. Must be called from
    /// within a tokio runtime.
    pub fn open(
        &self,
        request: &K::Request,
        cancel: CancellationToken,
    ) -> Result<EventStream<K::Message>, StreamError> {
        self.options.validate()?;
        let payload = self.codec.encode(request)?;
        let token = self.credentials.get();
        if token.is_none() {
            debug!(event = "stream_open_without_token", url = self.endpoint.url());
        }

        let (producer, consumer) = delivery_queue(self.options.queue_warn_threshold);
        let session = session::open(
            SessionParams {
                connector: Arc::clone(&self.connector),
                codec: Arc::clone(&self.codec),
                endpoint: self.endpoint.clone(),
                token,
                credentials: Arc::clone(&self.credentials),
                request: payload,
                codes: self.options.close_codes.clone(),
            },
            producer,
        );

        Ok(EventStream::new(
            session,
            consumer,
            cancel,
            self.options.close_codes.clone(),
        ))
    }

    /// Opens a stream, retrying while the connection cannot be established.
    ///
    /// Retries happen only when an attempt failed before its handshake was
    /// written. Once the handshake is out, the stream is returned as-is and
    /// later failures surface through it.
    pub async fn open_with_retry(
        &self,
        request: &K::Request,
        cancel: CancellationToken,
        policy: &RetryPolicy,
    ) -> Result<EventStream<K::Message>, StreamError> {
        retry_async(
            policy,
            |attempt| {
                let cancel = cancel.clone();
                async move {
                    debug!(event = "stream_open_attempt", attempt);
                    let mut stream = self.open(request, cancel)?;
                    stream.wait_handshake().await?;
                    Ok::<_, StreamError>(stream)
                }
            },
            |err: &StreamError| err.is_transport() && !cancel.is_cancelled(),
        )
        .await
    }
}

impl<K: Codec, C: Connector> Clone for StreamClient<K, C> {
    fn clone(&self) -> Self {
        Self {
            endpoint: self.endpoint.clone(),
            credentials: Arc::clone(&self.credentials),
            codec: Arc::clone(&self.codec),
            connector: Arc::clone(&self.connector),
            options: self.options.clone(),
        }
    }
}

impl<K: Codec, C: Connector> fmt::Debug for StreamClient<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamClient")
            .field("endpoint", &self.endpoint)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Cancelable, single-pass sequence of decoded messages.
///
/// Ends with `None` on remote close or cancellation, or with one
/// `Some(Err(_))` on a decode/transport failure. A stream that ended because
/// the server rejected the credential also ends with `None`; check
/// [`EventStream::termination`] or the credential store to tell it apart from
/// a normal completion.
pub struct EventStream<M> {
    session: Arc<SessionHandle>,
    queue: QueueConsumer<Delivered<M>>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    watcher: Option<JoinHandle<()>>,
    codes: CloseCodes,
    finished: bool,
}

impl<M> EventStream<M> {
    fn new(
        session: SessionHandle,
        queue: QueueConsumer<Delivered<M>>,
        cancel: CancellationToken,
        codes: CloseCodes,
    ) -> Self {
        let session = Arc::new(session);
        // Closes the session as soon as the token fires, even if nobody is
        // polling the stream.
        let watcher = {
            let session = Arc::clone(&session);
            let cancel = cancel.clone();
            let code = codes.client_aborted;
            let reason = codes.client_aborted_reason.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                session.request_close(code, &reason);
            })
        };

        Self {
            session,
            queue,
            cancelled: Box::pin(cancel.cancelled_owned()),
            watcher: Some(watcher),
            codes,
            finished: false,
        }
    }

    /// Receives the next message.
    pub async fn recv(&mut self) -> Option<Result<M, StreamError>> {
        std::future::poll_fn(|cx| self.poll_item(cx)).await
    }

    /// Receives the next message, giving up after `timeout`.
    ///
    /// Timing out leaves the stream usable.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Result<M, StreamError>>, tokio::time::error::Elapsed> {
        with_timeout(timeout, self.recv()).await
    }

    /// Stops the stream and discards anything not yet received. Idempotent.
    ///
    /// Once connected, the transport is closed exactly once with the
    /// client-aborted code. Cancelling while still connecting abandons the
    /// connection attempt instead, so no close frame is sent.
    pub fn cancel(&mut self) {
        if self.finished {
            return;
        }
        let discarded = self.queue.discard();
        debug!(event = "stream_cancelled", discarded);
        self.finish();
    }

    /// Why the underlying session closed, once it has.
    pub fn termination(&self) -> Option<Termination> {
        self.session.termination()
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// Messages received from the server but not yet pulled.
    pub fn queued_len(&self) -> usize {
        self.queue.buffered()
    }

    /// Whether the stream has yielded its last item.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Waits until the underlying session is fully closed.
    pub async fn closed(&self) {
        self.session.closed().await;
    }

    /// Waits for the handshake to be written. Returns the connection error if
    /// the session failed before that point.
    pub(crate) async fn wait_handshake(&mut self) -> Result<(), StreamError> {
        if self.session.wait_handshake().await {
            return Ok(());
        }
        if self.session.termination() != Some(Termination::Failed) {
            return Ok(());
        }
        match self.queue.pull().await {
            Some(Delivered::Failure(err)) => {
                self.finish();
                Err(err)
            }
            _ => Ok(()),
        }
    }

    fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<M, StreamError>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        if self.cancelled.as_mut().poll(cx).is_ready() {
            self.cancel();
            return Poll::Ready(None);
        }
        match self.queue.poll_pull(cx) {
            Poll::Ready(Some(Delivered::Message(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(Delivered::Failure(err))) => {
                self.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.session
            .request_close(self.codes.client_aborted, &self.codes.client_aborted_reason);
    }
}

// No field is structurally pinned.
impl<M> Unpin for EventStream<M> {}

impl<M> Stream for EventStream<M> {
    type Item = Result<M, StreamError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_item(cx)
    }
}

impl<M> Drop for EventStream<M> {
    fn drop(&mut self) {
        if !self.finished {
            debug!(event = "stream_dropped_unfinished");
            self.finish();
        }
    }
}

impl<M> fmt::Debug for EventStream<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("state", &self.session.state())
            .field("buffered", &self.queue.buffered())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;

    use super::{StreamClient, StreamDefaults, StreamOptions};
    use crate::auth::MemoryCredentialStore;
    use crate::stream::codec::JsonCodec;
    use crate::stream::transport::Endpoint;

    fn client() -> StreamClient<JsonCodec<Value, Value>> {
        StreamClient::new(
            Endpoint::new("ws://localhost:8080/api/ws/events", "workspace.v1"),
            Arc::new(MemoryCredentialStore::new()),
            JsonCodec::new(),
        )
    }

    #[test]
    fn endpoint_override_keeps_protocol() {
        let client = client().with_endpoint("wss://hub.example/ws   \n");
        assert_eq!(client.endpoint().url(), "wss://hub.example/ws");
        assert_eq!(client.endpoint().protocol(), "workspace.v1");
    }

    #[test]
    fn default_options_are_valid() {
        let options = StreamOptions::default();
        assert!(options.validate().is_ok());
        assert_eq!(
            options.close_codes.unauthorized,
            StreamDefaults::UNAUTHORIZED_CLOSE_CODE
        );
    }

    #[test]
    fn validation_rejects_aborted_code_colliding_with_unauthorized() {
        let mut options = StreamOptions::default();
        options.close_codes.client_aborted = options.close_codes.unauthorized;
        assert!(options.validate().is_err());
    }

    #[test]
    fn validation_rejects_reserved_client_code() {
        for reserved in [1004, 1005, 1006, 1015, 2999, 5000] {
            let mut options = StreamOptions::default();
            options.close_codes.client_aborted = reserved;
            assert!(options.validate().is_err(), "client_aborted {reserved}");

            let mut options = StreamOptions::default();
            options.close_codes.invalid_payload = reserved;
            assert!(options.validate().is_err(), "invalid_payload {reserved}");
        }
    }

    #[test]
    fn validation_accepts_sendable_codes() {
        for code in [1003, 1007, 1014, 3000, 4999] {
            let mut options = StreamOptions::default();
            options.close_codes.invalid_payload = code;
            assert!(options.validate().is_ok(), "invalid_payload {code}");
        }
    }

    #[test]
    fn open_reports_invalid_options_without_spawning() {
        let mut options = StreamOptions::default();
        options.close_codes.normal = options.close_codes.unauthorized;
        let client = client().with_options(options);
        let err = client
            .open(&Value::Null, Default::default())
            .expect_err("invalid options");
        assert!(matches!(err, super::StreamError::Config(_)));
    }
}
