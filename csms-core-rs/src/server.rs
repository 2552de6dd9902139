//! WebSocket listener
//!
//! Accepts charge points at `ws://host:port/ocpp/{identity}` with the
//! `ocpp1.6` subprotocol and bridges each socket to a channel transport.
//! HTTP Basic credentials, when present, must name the same identity.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{
    accept_hdr_async_with_config,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::{frame::coding::CloseCode, CloseFrame, WebSocketConfig},
        Message,
    },
};
use tracing::{debug, error, info, warn};

use crate::central::CentralSystem;
use crate::config::ServerConfig;
use crate::csms::connection::ConnectionEnd;
use crate::error::CsmsError;
use crate::ocpp::session::ChargePointIdentity;

/// Frames buffered from the socket before the reader waits
const INCOMING_BUFFER: usize = 32;

/// How long the writer gets to flush and close after the session ends
const WRITER_LINGER: Duration = Duration::from_secs(5);

/// What the upgrade request told us
#[derive(Debug, Clone, PartialEq, Eq)]
struct Handshake {
    identity: ChargePointIdentity,
    password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
enum HandshakeRejection {
    #[error("path {0} does not name a charge point")]
    Path(String),

    #[error("subprotocol {0} not offered")]
    Subprotocol(String),

    #[error("malformed Authorization header")]
    Authorization,

    #[error("credentials name {user}, not {identity}")]
    CredentialMismatch { user: String, identity: String },
}

impl HandshakeRejection {
    fn status(&self) -> StatusCode {
        match self {
            HandshakeRejection::Path(_) => StatusCode::NOT_FOUND,
            HandshakeRejection::Subprotocol(_) => StatusCode::BAD_REQUEST,
            HandshakeRejection::Authorization | HandshakeRejection::CredentialMismatch { .. } => {
                StatusCode::UNAUTHORIZED
            }
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// Accepts charge point connections for a central system
pub struct Server {
    central: Arc<CentralSystem>,
    listener: TcpListener,
}

impl Server {
    /// Bind the configured listen address
    pub async fn bind(central: Arc<CentralSystem>) -> Result<Self, CsmsError> {
        let listener = TcpListener::bind(central.config().server.listen_addr).await?;
        Ok(Self { central, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CsmsError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the task is dropped
    pub async fn run(self) -> Result<(), CsmsError> {
        info!("Listening for charge points on {}", self.local_addr()?);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let central = Arc::clone(&self.central);
            tokio::spawn(async move {
                if let Err(e) = handle_socket(central, stream, peer).await {
                    debug!(%peer, "Connection ended with error: {}", e);
                }
            });
        }
    }
}

async fn handle_socket(
    central: Arc<CentralSystem>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), CsmsError> {
    let server = central.config().server.clone();
    let ws_config = WebSocketConfig {
        max_message_size: Some(server.max_message_size),
        max_frame_size: Some(server.max_message_size),
        ..Default::default()
    };

    let mut handshake = None;
    let callback = |request: &Request, mut response: Response| {
        match inspect_request(&server, request) {
            Ok((accepted, protocol)) => {
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);
                handshake = Some(accepted);
                Ok(response)
            }
            Err(rejection) => {
                warn!(%peer, "Upgrade refused: {}", rejection);
                Err(rejection.into_response())
            }
        }
    };

    let mut ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config)).await?;
    let Some(Handshake { identity, password }) = handshake else {
        return Ok(());
    };

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let accepted = match central
        .accept(identity.clone(), password.as_deref(), outgoing_tx)
        .await
    {
        Ok(accepted) => accepted,
        Err(e) => {
            warn!(%identity, %peer, "Connection refused: {}", e);
            let frame = CloseFrame {
                code: CloseCode::Policy,
                reason: e.to_string().into(),
            };
            if let Err(close_err) = ws_stream.close(Some(frame)).await {
                debug!(%identity, "Close after refusal failed: {}", close_err);
            }
            return Err(e);
        }
    };

    info!(%identity, %peer, "Charge point connected");

    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (incoming_tx, incoming_rx) = mpsc::channel::<String>(INCOMING_BUFFER);
    let (stop_tx, mut stop_rx) = oneshot::channel::<Option<CloseFrame<'static>>>();

    let writer_identity = identity.clone();
    let writer = tokio::spawn(async move {
        let close = loop {
            tokio::select! {
                text = outgoing_rx.recv() => {
                    let Some(text) = text else {
                        break None;
                    };
                    debug!(identity = %writer_identity, "Sending: {}", text);
                    if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                        warn!(identity = %writer_identity, "Failed to send WebSocket message: {}", e);
                        return;
                    }
                }
                close = &mut stop_rx => break close.ok().flatten(),
            }
        };

        while let Ok(text) = outgoing_rx.try_recv() {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        if let Err(e) = ws_tx.send(Message::Close(close)).await {
            debug!(identity = %writer_identity, "Close frame not sent: {}", e);
        }
    });

    let reader_identity = identity.clone();
    let reader = tokio::spawn(async move {
        while let Some(message) = ws_rx.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Binary(bytes)) => {
                    warn!(
                        identity = %reader_identity,
                        len = bytes.len(),
                        "Binary frame dropped, OCPP-J is text only"
                    );
                    continue;
                }
                Ok(Message::Close(frame)) => {
                    debug!(identity = %reader_identity, "Close received: {:?}", frame);
                    break;
                }
                // Ping/pong is answered by tungstenite
                Ok(_) => continue,
                Err(e) => {
                    warn!(identity = %reader_identity, "WebSocket error: {}", e);
                    break;
                }
            };

            if incoming_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    let end = central.run(accepted, incoming_rx).await;
    reader.abort();

    let _ = stop_tx.send(close_frame(end));
    let mut writer = writer;
    if tokio::time::timeout(WRITER_LINGER, &mut writer).await.is_err() {
        debug!(%identity, "Writer did not finish in time");
        writer.abort();
    }

    info!(%identity, %peer, "Charge point disconnected: {:?}", end);
    Ok(())
}

fn close_frame(end: ConnectionEnd) -> Option<CloseFrame<'static>> {
    let (code, reason) = match end {
        ConnectionEnd::TransportClosed => return None,
        ConnectionEnd::Idle => (CloseCode::Away, "no traffic"),
        ConnectionEnd::MalformedFrames => (CloseCode::Protocol, "too many malformed frames"),
        ConnectionEnd::Shutdown => (CloseCode::Normal, "session closed"),
    };
    Some(CloseFrame {
        code,
        reason: reason.into(),
    })
}

/// Validate an upgrade request: identity from the path, subprotocol, and
/// optional Basic credentials
fn inspect_request(
    config: &ServerConfig,
    request: &Request,
) -> Result<(Handshake, HeaderValue), HandshakeRejection> {
    let path = request.uri().path();
    let identity = path
        .strip_prefix(config.path_prefix.as_str())
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .ok_or_else(|| HandshakeRejection::Path(path.to_string()))?;

    let offered = request
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == config.subprotocol);
    if !offered {
        return Err(HandshakeRejection::Subprotocol(config.subprotocol.clone()));
    }
    let protocol = HeaderValue::from_str(&config.subprotocol)
        .map_err(|_| HandshakeRejection::Subprotocol(config.subprotocol.clone()))?;

    let password = match request.headers().get(header::AUTHORIZATION) {
        Some(value) => Some(basic_password(value, identity)?),
        None => None,
    };

    Ok((
        Handshake {
            identity: identity.into(),
            password,
        },
        protocol,
    ))
}

/// Password from `Basic base64(identity:password)`
fn basic_password(value: &HeaderValue, identity: &str) -> Result<String, HandshakeRejection> {
    let encoded = value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Basic "))
        .ok_or(HandshakeRejection::Authorization)?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| HandshakeRejection::Authorization)?;
    let decoded = String::from_utf8(decoded).map_err(|_| HandshakeRejection::Authorization)?;
    let (user, password) = decoded
        .split_once(':')
        .ok_or(HandshakeRejection::Authorization)?;

    if user != identity {
        return Err(HandshakeRejection::CredentialMismatch {
            user: user.to_string(),
            identity: identity.to_string(),
        });
    }
    Ok(password.to_string())
}
