//! Transport session: one physical connection and its handshake.
//!
//! A session is driven by a background worker that owns the connection. The
//! worker connects, sends the bearer token as a text frame and the encoded
//! request as a binary frame, then turns every inbound event into zero or
//! more [`Delivered`] items on the delivery queue. [`SessionHandle`] is the
//! only way to influence a running session from outside.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::auth::CredentialStore;
use crate::stream::client::StreamError;
use crate::stream::codec::{Codec, DecodeError};
use crate::stream::queue::QueueProducer;
use crate::stream::transport::{Connection, Connector, Endpoint, Frame, Inbound, TransportError};

/// Session lifecycle. States only move forward.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Why a session reached [`SessionState::Closed`]. Recorded once.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Termination {
    /// Remote closed with a code other than the unauthorized one.
    Completed { code: Option<u16> },
    /// Remote closed with the unauthorized code; the credential was cleared.
    Unauthorized,
    /// Local close request, or every handle was dropped.
    Cancelled,
    /// Decode or transport failure; a `Failure` item was delivered.
    Failed,
}

/// Unit of transfer on the delivery queue.
#[derive(Debug)]
pub enum Delivered<M> {
    Message(M),
    Failure(StreamError),
}

/// Close codes used on the wire.
///
/// `client_aborted` must stay distinct from `normal` and `unauthorized` so
/// that close-reason dispatch is unambiguous.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseCodes {
    pub normal: u16,
    pub unauthorized: u16,
    pub client_aborted: u16,
    pub client_aborted_reason: String,
    pub invalid_payload: u16,
}

/// Close request delivered to the worker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseRequest {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug)]
struct Shared {
    state: watch::Sender<SessionState>,
    termination: OnceLock<Termination>,
    handshake_sent: AtomicBool,
}

impl Shared {
    fn advance(&self, next: SessionState) {
        self.state.send_if_modified(|state| {
            if next > *state {
                *state = next;
                true
            } else {
                false
            }
        });
    }

    /// Records why the session is ending. The first call wins.
    fn record(&self, termination: Termination) {
        if self.termination.set(termination).is_ok() {
            info!(event = "session_terminated", termination = ?termination);
        }
    }
}

/// Everything a session worker needs, fixed at construction.
pub(crate) struct SessionParams<C: Connector, K: Codec> {
    pub connector: Arc<C>,
    pub codec: Arc<K>,
    pub endpoint: Endpoint,
    pub token: Option<SecretString>,
    pub credentials: Arc<dyn CredentialStore>,
    pub request: Vec<u8>,
    pub codes: CloseCodes,
}

/// Control handle for a running session.
#[derive(Debug)]
pub struct SessionHandle {
    shared: Arc<Shared>,
    close_tx: Mutex<Option<oneshot::Sender<CloseRequest>>>,
}

impl SessionHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Subscribes to lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Why the session closed, once it has.
    pub fn termination(&self) -> Option<Termination> {
        self.shared.termination.get().copied()
    }

    /// Whether both handshake frames were written to the connection.
    pub fn handshake_sent(&self) -> bool {
        self.shared.handshake_sent.load(Ordering::Acquire)
    }

    /// Waits until the handshake frames are written or the session closes.
    ///
    /// Returns whether the handshake went out.
    pub async fn wait_handshake(&self) -> bool {
        let mut rx = self.subscribe();
        let shared = &self.shared;
        let _ = rx
            .wait_for(|state| {
                *state == SessionState::Closed || shared.handshake_sent.load(Ordering::Acquire)
            })
            .await;
        self.handshake_sent()
    }

    /// Waits until the worker has fully stopped.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Asks the worker to close the connection with `code`.
    ///
    /// At most one request is ever delivered. Returns `false` when the session
    /// is already closing/closed or a request was sent earlier.
    pub fn request_close(&self, code: u16, reason: &str) -> bool {
        if self.state() >= SessionState::Closing {
            return false;
        }
        let sender = match self.close_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return false;
        };
        debug!(event = "session_close_requested", code);
        sender
            .send(CloseRequest {
                code,
                reason: reason.to_string(),
            })
            .is_ok()
    }
}

/// Starts a session. Returns immediately; the handshake runs on the worker.
///
/// Must be called from within a tokio runtime.
pub(crate) fn open<C, K>(
    params: SessionParams<C, K>,
    queue: QueueProducer<Delivered<K::Message>>,
) -> SessionHandle
where
    C: Connector,
    K: Codec,
{
    let (state, _) = watch::channel(SessionState::Connecting);
    let shared = Arc::new(Shared {
        state,
        termination: OnceLock::new(),
        handshake_sent: AtomicBool::new(false),
    });
    let (close_tx, close_rx) = oneshot::channel();

    tokio::spawn(run_session(params, Arc::clone(&shared), close_rx, queue));

    SessionHandle {
        shared,
        close_tx: Mutex::new(Some(close_tx)),
    }
}

async fn run_session<C, K>(
    params: SessionParams<C, K>,
    shared: Arc<Shared>,
    mut close_rx: oneshot::Receiver<CloseRequest>,
    mut queue: QueueProducer<Delivered<K::Message>>,
) where
    C: Connector,
    K: Codec,
{
    let SessionParams {
        connector,
        codec,
        endpoint,
        token,
        credentials,
        request,
        codes,
    } = params;

    debug!(event = "session_connecting", url = endpoint.url());
    let mut connection = tokio::select! {
        biased;
        request = &mut close_rx => {
            let code = request.map(|r| r.code).unwrap_or(codes.client_aborted);
            debug!(event = "session_aborted_while_connecting", code);
            shared.record(Termination::Cancelled);
            queue.mark_done();
            shared.advance(SessionState::Closed);
            return;
        }
        result = connector.connect(&endpoint) => match result {
            Ok(connection) => connection,
            Err(err) => {
                warn!(event = "session_connect_failed", url = endpoint.url(), error = %err);
                fail(&shared, &mut queue, StreamError::Transport(err));
                return;
            }
        },
    };
    shared.advance(SessionState::Open);

    // Token first, then the request, each exactly once. A close request
    // arriving while a send is stalled wins.
    let aborted = tokio::select! {
        biased;
        request = &mut close_rx => Some(close_request(request, &codes)),
        result = send_handshake(&mut connection, token.as_ref(), request) => match result {
            Ok(()) => None,
            Err(err) => {
                warn!(event = "session_handshake_failed", error = %err);
                fail(&shared, &mut queue, StreamError::Transport(err));
                return;
            }
        },
    };
    if let Some(request) = aborted {
        close_on_request(&shared, &mut queue, &mut connection, request).await;
        return;
    }
    shared.handshake_sent.store(true, Ordering::Release);
    shared.state.send_modify(|_| {});
    info!(event = "session_open", url = endpoint.url());

    loop {
        tokio::select! {
            biased;
            request = &mut close_rx => {
                let request = close_request(request, &codes);
                close_on_request(&shared, &mut queue, &mut connection, request).await;
                return;
            }
            inbound = connection.recv() => match inbound {
                Some(Ok(Inbound::Binary(bytes))) => match codec.decode(&bytes) {
                    Ok(message) => {
                        queue.push(Delivered::Message(message));
                    }
                    Err(err) => {
                        reject_frame(&shared, &mut queue, &mut connection, &codes, err).await;
                        return;
                    }
                },
                Some(Ok(Inbound::Text(text))) => {
                    let err = DecodeError::UnexpectedText { len: text.len() };
                    reject_frame(&shared, &mut queue, &mut connection, &codes, err).await;
                    return;
                }
                Some(Ok(Inbound::Close(info))) => {
                    let code = info.as_ref().map(|info| info.code);
                    let termination = if code == Some(codes.unauthorized) {
                        warn!(event = "session_unauthorized", code = codes.unauthorized);
                        credentials.clear();
                        Termination::Unauthorized
                    } else {
                        debug!(event = "session_remote_close", code = ?code);
                        Termination::Completed { code }
                    };
                    shared.record(termination);
                    queue.mark_done();
                    shared.advance(SessionState::Closed);
                    return;
                }
                Some(Err(err)) => {
                    warn!(event = "session_transport_error", error = %err);
                    fail(&shared, &mut queue, StreamError::Transport(err));
                    return;
                }
                None => {
                    warn!(event = "session_transport_ended");
                    fail(&shared, &mut queue, StreamError::Transport(TransportError::Disconnected));
                    return;
                }
            },
        }
    }
}

async fn send_handshake<T: Connection>(
    connection: &mut T,
    token: Option<&SecretString>,
    request: Vec<u8>,
) -> Result<(), TransportError> {
    let token = token
        .map(|token| token.expose_secret().to_string())
        .unwrap_or_default();
    connection.send(Frame::Text(token)).await?;
    connection.send(Frame::Binary(request)).await
}

/// A dropped handle counts as a client abort.
fn close_request(
    request: Result<CloseRequest, oneshot::error::RecvError>,
    codes: &CloseCodes,
) -> CloseRequest {
    request.unwrap_or_else(|_| CloseRequest {
        code: codes.client_aborted,
        reason: codes.client_aborted_reason.clone(),
    })
}

async fn close_on_request<M, T: Connection>(
    shared: &Shared,
    queue: &mut QueueProducer<Delivered<M>>,
    connection: &mut T,
    request: CloseRequest,
) {
    shared.record(Termination::Cancelled);
    shared.advance(SessionState::Closing);
    queue.mark_done();
    if let Err(err) = connection.close(request.code, &request.reason).await {
        debug!(event = "session_close_error", error = %err);
    }
    shared.advance(SessionState::Closed);
}

fn fail<M>(shared: &Shared, queue: &mut QueueProducer<Delivered<M>>, error: StreamError) {
    shared.record(Termination::Failed);
    queue.push_terminal(Delivered::Failure(error));
    shared.advance(SessionState::Closed);
}

async fn reject_frame<M, T>(
    shared: &Shared,
    queue: &mut QueueProducer<Delivered<M>>,
    connection: &mut T,
    codes: &CloseCodes,
    error: DecodeError,
) where
    T: Connection,
{
    warn!(event = "session_decode_failed", error = %error);
    shared.record(Termination::Failed);
    queue.push_terminal(Delivered::Failure(StreamError::Decode(error)));
    shared.advance(SessionState::Closing);
    if let Err(err) = connection.close(codes.invalid_payload, "invalid payload").await {
        debug!(event = "session_close_error", error = %err);
    }
    shared.advance(SessionState::Closed);
}
