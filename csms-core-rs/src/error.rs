//! Errors shared across the session core

use thiserror::Error;

use crate::ocpp::messages::ErrorCode;
use crate::ocpp::session::{ChargePointIdentity, SessionState};

/// A call that breaks OCPP-J ordering or the session's registration rules.
///
/// Answered with a CALLERROR; the connection survives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("call {rejected} arrived while call {in_flight} is still being processed")]
    PipelinedCall { rejected: String, in_flight: String },

    #[error("{action} is not permitted while the session is {state}")]
    ActionNotPermitted { action: String, state: SessionState },
}

impl ProtocolViolation {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolViolation::PipelinedCall { .. } => ErrorCode::RpcFrameworkError,
            ProtocolViolation::ActionNotPermitted { .. } => ErrorCode::SecurityError,
        }
    }
}

/// A connect attempt for an identity that already has a live session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("charge point {0} already has a live session")]
pub struct IdentityConflict(pub ChargePointIdentity);

/// Errors surfaced by the central system facade and listener
#[derive(Debug, Error)]
pub enum CsmsError {
    #[error(transparent)]
    IdentityConflict(#[from] IdentityConflict),

    #[error("charge point {0} presented invalid credentials")]
    Unauthorized(ChargePointIdentity),

    #[error("directory lookup failed: {0}")]
    Directory(#[from] crate::external::ExternalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
