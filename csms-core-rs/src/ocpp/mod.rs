//! OCPP 1.6-J protocol layer
//!
//! - `types`: message payloads and enumerations
//! - `messages`: OCPP-J framing (CALL, CALLRESULT, CALLERROR)
//! - `correlation`: outbound/inbound call bookkeeping per connection
//! - `session`: charge point session state machine

pub mod types;
pub mod messages;
pub mod correlation;
pub mod session;

pub use types::*;
pub use messages::*;
pub use correlation::{CallFailure, CallOutcome, CorrelationTracker};
pub use session::{
    ChargePointIdentity, ChargePointSession, ConnectionHandle, SessionEvent, SessionHandle,
    SessionRef, SessionState,
};
