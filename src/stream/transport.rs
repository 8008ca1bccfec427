//! Physical connection layer for stream sessions.
//!
//! [`Connector`] and [`Connection`] are the seam between the session state
//! machine and the socket. [`WsConnector`] is the websocket implementation;
//! tests substitute scripted connectors.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, InvalidHeaderValue, SEC_WEBSOCKET_PROTOCOL,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Address of a stream service plus the sub-protocol it requires.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Endpoint {
    url: String,
    protocol: String,
}

impl Endpoint {
    /// Creates an endpoint. Surrounding whitespace is trimmed from both parts.
    pub fn new(url: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            url: url.into().trim().to_string(),
            protocol: protocol.into().trim().to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Sub-protocol identifier negotiated during connection setup.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

/// Outbound frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Close code and reason carried by a close frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// Inbound frame or transport-control event.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// Remote close. `None` when the peer sent a close frame with no status.
    Close(Option<CloseInfo>),
}

/// Underlying connection failed outside a clean close.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Websocket protocol or I/O error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Sub-protocol could not be encoded as a header value.
    #[error("invalid sub-protocol header: {0}")]
    InvalidProtocolHeader(#[from] InvalidHeaderValue),

    /// The connection ended without a close frame.
    #[error("connection ended without a close frame")]
    Disconnected,

    #[error("{0}")]
    Other(String),
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    async fn connect(&self, endpoint: &Endpoint) -> Result<Self::Connection, TransportError>;
}

/// One open physical connection, exclusively owned by a session.
#[async_trait]
pub trait Connection: Send + 'static {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Next inbound event. `None` once the connection is gone.
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    /// Terminates the connection with the given close code.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Websocket connector backed by tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    type Connection = WsConnection;

    async fn connect(&self, endpoint: &Endpoint) -> Result<WsConnection, TransportError> {
        let mut request = endpoint.url().into_client_request()?;
        let protocol = HeaderValue::from_str(endpoint.protocol())?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

        let (socket, response) = connect_async(request).await?;
        debug!(
            event = "ws_connected",
            url = endpoint.url(),
            status = response.status().as_u16()
        );
        Ok(WsConnection { socket })
    }
}

/// Websocket connection returned by [`WsConnector`].
pub struct WsConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.socket.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            match self.socket.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text.to_string()))),
                Ok(Message::Binary(bytes)) => return Some(Ok(Inbound::Binary(bytes.to_vec()))),
                Ok(Message::Ping(payload)) => {
                    if let Err(err) = self.socket.send(Message::Pong(payload)).await {
                        return Some(Err(err.into()));
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                Ok(Message::Close(frame)) => {
                    // Send the queued close reply before the session drops the socket.
                    if let Err(err) = self.socket.flush().await {
                        debug!(event = "ws_close_reply_failed", error = %err);
                    }
                    let info = frame.map(|frame| CloseInfo {
                        code: u16::from(frame.code),
                        reason: frame.reason.to_string(),
                    });
                    return Some(Ok(Inbound::Close(info)));
                }
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {
                    return Some(Err(TransportError::Disconnected));
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        match self.socket.close(Some(frame)).await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Endpoint;

    #[test]
    fn endpoint_trims_url_and_protocol() {
        let endpoint = Endpoint::new("  wss://hub.example/ws/events \n", " workspace.v1 ");
        assert_eq!(endpoint.url(), "wss://hub.example/ws/events");
        assert_eq!(endpoint.protocol(), "workspace.v1");
    }
}
