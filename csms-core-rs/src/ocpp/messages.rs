//! OCPP-J message framing
//!
//! OCPP carries JSON arrays over WebSocket text frames:
//! - CALL: [2, uniqueId, action, payload]
//! - CALLRESULT: [3, uniqueId, payload]
//! - CALLERROR: [4, uniqueId, errorCode, errorDescription, errorDetails]
//!
//! The codec checks the envelope only. Action names and payload contents are
//! validated downstream by the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP-J error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // Spelling is from the OCPP 1.6 specification.
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    RpcFrameworkError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::RpcFrameworkError => "RpcFrameworkError",
        }
    }

    fn parse(s: &str) -> Self {
        serde_json::from_value(Value::String(s.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame that could not be decoded.
///
/// Every variant counts as a malformed frame for the connection's
/// consecutive-failure budget.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed envelope: {0}")]
    Envelope(&'static str),

    #[error("unknown message type id {0}")]
    UnknownMessageType(i64),

    #[error("malformed call {unique_id}: {reason}")]
    Call {
        unique_id: String,
        reason: &'static str,
    },

    #[error("malformed response {unique_id}: {reason}")]
    Response {
        unique_id: String,
        reason: &'static str,
    },
}

impl DecodeError {
    /// Unique id of a CALL whose envelope was readable but whose body was not.
    ///
    /// OCPP-J expects such calls to be answered with a FormationViolation.
    pub fn call_unique_id(&self) -> Option<&str> {
        match self {
            DecodeError::Call { unique_id, .. } => Some(unique_id),
            _ => None,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with an auto-generated unique id
    pub fn new(action: impl Into<String>, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            unique_id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload: serde_json::to_value(payload)?,
        })
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: Value,
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub unique_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        unique_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }

    /// Attach error details; anything but a JSON object is ignored.
    pub fn with_details(mut self, details: Value) -> Self {
        if details.is_object() {
            self.error_details = details;
        }
        self
    }
}

/// Any OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Frame {
    pub fn unique_id(&self) -> &str {
        match self {
            Frame::Call(c) => &c.unique_id,
            Frame::CallResult(r) => &r.unique_id,
            Frame::CallError(e) => &e.unique_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Call(_) => MessageType::Call,
            Frame::CallResult(_) => MessageType::CallResult,
            Frame::CallError(_) => MessageType::CallError,
        }
    }
}

impl From<Call> for Frame {
    fn from(call: Call) -> Self {
        Frame::Call(call)
    }
}

impl From<CallResult> for Frame {
    fn from(result: CallResult) -> Self {
        Frame::CallResult(result)
    }
}

impl From<CallError> for Frame {
    fn from(error: CallError) -> Self {
        Frame::CallError(error)
    }
}

/// Decode a text frame received from the transport
pub fn decode(text: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    let Value::Array(mut array) = value else {
        return Err(DecodeError::Envelope("frame is not a JSON array"));
    };

    if array.len() < 3 {
        return Err(DecodeError::Envelope("frame has fewer than 3 elements"));
    }

    let message_type = array[0]
        .as_i64()
        .ok_or(DecodeError::Envelope("message type id is not an integer"))?;

    let unique_id = match &array[1] {
        Value::String(id) => id.clone(),
        _ => return Err(DecodeError::Envelope("unique id is not a string")),
    };

    match message_type {
        2 => {
            let malformed = |reason| DecodeError::Call {
                unique_id: unique_id.clone(),
                reason,
            };
            if array.len() != 4 {
                return Err(malformed("CALL must have exactly 4 elements"));
            }
            let payload = array.pop().unwrap_or(Value::Null);
            let action = match array.pop() {
                Some(Value::String(action)) => action,
                _ => return Err(malformed("action is not a string")),
            };
            if !payload.is_object() {
                return Err(malformed("payload is not a JSON object"));
            }
            Ok(Frame::Call(Call {
                unique_id,
                action,
                payload,
            }))
        }
        3 => {
            if array.len() != 3 {
                return Err(DecodeError::Response {
                    unique_id,
                    reason: "CALLRESULT must have exactly 3 elements",
                });
            }
            let payload = array.pop().unwrap_or(Value::Null);
            if !payload.is_object() {
                return Err(DecodeError::Response {
                    unique_id,
                    reason: "payload is not a JSON object",
                });
            }
            Ok(Frame::CallResult(CallResult { unique_id, payload }))
        }
        4 => {
            if array.len() != 5 {
                return Err(DecodeError::Response {
                    unique_id,
                    reason: "CALLERROR must have exactly 5 elements",
                });
            }
            let error_details = array.pop().unwrap_or(Value::Null);
            let error_description = match array.pop() {
                Some(Value::String(description)) => description,
                _ => {
                    return Err(DecodeError::Response {
                        unique_id,
                        reason: "error description is not a string",
                    })
                }
            };
            let error_code = match array.pop() {
                Some(Value::String(code)) => ErrorCode::parse(&code),
                _ => {
                    return Err(DecodeError::Response {
                        unique_id,
                        reason: "error code is not a string",
                    })
                }
            };
            if !error_details.is_object() {
                return Err(DecodeError::Response {
                    unique_id,
                    reason: "error details is not a JSON object",
                });
            }
            Ok(Frame::CallError(CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            }))
        }
        other => Err(DecodeError::UnknownMessageType(other)),
    }
}

/// Encode a frame to its wire text
pub fn encode(frame: &Frame) -> String {
    let array = match frame {
        Frame::Call(c) => serde_json::json!([
            MessageType::Call as i32,
            &c.unique_id,
            &c.action,
            &c.payload
        ]),
        Frame::CallResult(r) => serde_json::json!([
            MessageType::CallResult as i32,
            &r.unique_id,
            &r.payload
        ]),
        Frame::CallError(e) => serde_json::json!([
            MessageType::CallError as i32,
            &e.unique_id,
            e.error_code.as_str(),
            &e.error_description,
            &e.error_details
        ]),
    };
    array.to_string()
}
