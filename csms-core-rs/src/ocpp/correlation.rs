//! Request/response correlation for one charge point
//!
//! OCPP-J is strictly request/response per direction: a side may not send a
//! new CALL before the previous one was answered. The tracker holds the
//! single outbound call awaiting a response and the id of the single inbound
//! call being processed.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::messages::{Call, ErrorCode, Frame};
use crate::error::ProtocolViolation;

/// Why an outbound call produced no result payload
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallFailure {
    #[error("outbound call {0} is still awaiting a response")]
    CallInFlight(String),

    #[error("no response before the deadline")]
    Timeout,

    #[error("session closed before the call was answered")]
    SessionClosed,

    #[error("transport lost before the call was answered")]
    Disconnected,

    #[error("charge point is not connected")]
    NotConnected,

    #[error("charge point answered {code}: {description}")]
    Rejected {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("response does not match the expected payload: {0}")]
    InvalidResponse(String),

    #[error("request could not be encoded: {0}")]
    InvalidRequest(String),
}

/// Resolution delivered to whoever awaits an outbound call
pub type CallOutcome = Result<Value, CallFailure>;

/// An outbound call awaiting its CALLRESULT or CALLERROR
#[derive(Debug)]
pub struct PendingCall {
    pub unique_id: String,
    pub action: String,
    pub deadline: Instant,
    responder: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    fn resolve(self, outcome: CallOutcome) {
        if self.responder.send(outcome).is_err() {
            debug!(unique_id = %self.unique_id, "Caller stopped waiting for {}", self.action);
        }
    }
}

/// Per-session correlation state
#[derive(Debug, Default)]
pub struct CorrelationTracker {
    outbound: Option<PendingCall>,
    inbound: Option<String>,
}

impl CorrelationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new outbound call.
    ///
    /// Returns the CALL to put on the wire and the receiver that resolves
    /// when the charge point answers, the deadline passes or the session
    /// goes away.
    pub fn begin_outbound(
        &mut self,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<(Call, oneshot::Receiver<CallOutcome>), CallFailure> {
        if let Some(pending) = &self.outbound {
            return Err(CallFailure::CallInFlight(pending.unique_id.clone()));
        }

        let call = Call {
            unique_id: Uuid::new_v4().to_string(),
            action: action.to_string(),
            payload,
        };
        let (responder, receiver) = oneshot::channel();
        self.outbound = Some(PendingCall {
            unique_id: call.unique_id.clone(),
            action: call.action.clone(),
            deadline: Instant::now() + timeout,
            responder,
        });

        Ok((call, receiver))
    }

    /// The outbound call awaiting a response, if any
    pub fn outbound(&self) -> Option<&PendingCall> {
        self.outbound.as_ref()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.outbound.as_ref().map(|p| p.deadline)
    }

    /// Match a CALLRESULT or CALLERROR to the pending outbound call.
    ///
    /// Returns false when the frame answers nothing we are waiting for; such
    /// frames are logged and dropped.
    pub fn resolve(&mut self, frame: Frame) -> bool {
        let unique_id = frame.unique_id().to_string();
        let matches = self
            .outbound
            .as_ref()
            .is_some_and(|p| p.unique_id == unique_id);

        if !matches {
            warn!(%unique_id, "Discarding response that matches no pending call");
            return false;
        }

        let Some(pending) = self.outbound.take() else {
            return false;
        };

        match frame {
            Frame::CallResult(result) => {
                debug!(%unique_id, action = %pending.action, "Call answered");
                pending.resolve(Ok(result.payload));
            }
            Frame::CallError(error) => {
                warn!(
                    %unique_id,
                    action = %pending.action,
                    code = %error.error_code,
                    "Call rejected: {}",
                    error.error_description
                );
                pending.resolve(Err(CallFailure::Rejected {
                    code: error.error_code,
                    description: error.error_description,
                    details: error.error_details,
                }));
            }
            Frame::Call(_) => {
                // A CALL never answers anything; put the pending call back.
                self.outbound = Some(pending);
                return false;
            }
        }

        true
    }

    /// Resolve the pending call as timed out if its deadline has passed
    pub fn expire_overdue(&mut self, now: Instant) -> Option<String> {
        if self.outbound.as_ref().is_some_and(|p| p.deadline <= now) {
            let pending = self.outbound.take()?;
            let unique_id = pending.unique_id.clone();
            warn!(%unique_id, action = %pending.action, "Call timed out");
            pending.resolve(Err(CallFailure::Timeout));
            return Some(unique_id);
        }
        None
    }

    /// Fail the pending outbound call and forget the inbound one
    pub fn cancel(&mut self, failure: CallFailure) {
        if let Some(pending) = self.outbound.take() {
            debug!(unique_id = %pending.unique_id, "Cancelling pending call: {}", failure);
            pending.resolve(Err(failure));
        }
        self.inbound = None;
    }

    /// Start processing an inbound call; rejects pipelined calls
    pub fn begin_inbound(&mut self, unique_id: &str) -> Result<(), ProtocolViolation> {
        if let Some(in_flight) = &self.inbound {
            return Err(ProtocolViolation::PipelinedCall {
                rejected: unique_id.to_string(),
                in_flight: in_flight.clone(),
            });
        }
        self.inbound = Some(unique_id.to_string());
        Ok(())
    }

    /// Mark an inbound call answered. Ids other than the in-flight one are ignored.
    pub fn finish_inbound(&mut self, unique_id: &str) -> bool {
        if self.inbound.as_deref() == Some(unique_id) {
            self.inbound = None;
            true
        } else {
            false
        }
    }

    pub fn inbound(&self) -> Option<&str> {
        self.inbound.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::messages::{CallError, CallResult};
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_result_resolves_pending_call() {
        let mut tracker = CorrelationTracker::new();
        let (call, rx) = tracker
            .begin_outbound("Reset", json!({"type": "Soft"}), TIMEOUT)
            .unwrap();

        let result = CallResult {
            unique_id: call.unique_id.clone(),
            payload: json!({"status": "Accepted"}),
        };
        assert!(tracker.resolve(Frame::CallResult(result)));
        assert!(tracker.outbound().is_none());
        assert_eq!(rx.await.unwrap(), Ok(json!({"status": "Accepted"})));
    }

    #[tokio::test]
    async fn test_call_error_resolves_as_rejected() {
        let mut tracker = CorrelationTracker::new();
        let (call, rx) = tracker.begin_outbound("Reset", json!({}), TIMEOUT).unwrap();

        let error = CallError::new(call.unique_id, ErrorCode::NotSupported, "no reset here");
        assert!(tracker.resolve(Frame::CallError(error)));

        match rx.await.unwrap() {
            Err(CallFailure::Rejected { code, description, .. }) => {
                assert_eq!(code, ErrorCode::NotSupported);
                assert_eq!(description, "no reset here");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_second_outbound_call_is_refused() {
        let mut tracker = CorrelationTracker::new();
        let (first, _rx) = tracker.begin_outbound("Reset", json!({}), TIMEOUT).unwrap();

        let err = tracker
            .begin_outbound("RemoteStopTransaction", json!({"transactionId": 1}), TIMEOUT)
            .unwrap_err();
        assert_eq!(err, CallFailure::CallInFlight(first.unique_id.clone()));
        assert_eq!(tracker.outbound().unwrap().unique_id, first.unique_id);
    }

    #[test]
    fn test_unknown_response_is_discarded() {
        let mut tracker = CorrelationTracker::new();
        let (_call, _rx) = tracker.begin_outbound("Reset", json!({}), TIMEOUT).unwrap();

        let stray = CallResult {
            unique_id: "not-ours".into(),
            payload: json!({}),
        };
        assert!(!tracker.resolve(Frame::CallResult(stray)));
        assert!(tracker.outbound().is_some());

        let mut idle = CorrelationTracker::new();
        let stray = CallResult {
            unique_id: "nothing-pending".into(),
            payload: json!({}),
        };
        assert!(!idle.resolve(Frame::CallResult(stray)));
    }

    #[tokio::test]
    async fn test_expiry_resolves_timeout() {
        let mut tracker = CorrelationTracker::new();
        let (call, rx) = tracker.begin_outbound("Reset", json!({}), TIMEOUT).unwrap();
        let deadline = tracker.next_deadline().unwrap();

        assert_eq!(tracker.expire_overdue(deadline - Duration::from_millis(1)), None);
        assert_eq!(tracker.expire_overdue(deadline), Some(call.unique_id));
        assert_eq!(rx.await.unwrap(), Err(CallFailure::Timeout));

        // Slot is free again
        assert!(tracker.begin_outbound("Reset", json!({}), TIMEOUT).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_uses_given_reason() {
        let mut tracker = CorrelationTracker::new();
        let (_call, rx) = tracker.begin_outbound("Reset", json!({}), TIMEOUT).unwrap();
        tracker.begin_inbound("in-1").unwrap();

        tracker.cancel(CallFailure::SessionClosed);
        assert_eq!(rx.await.unwrap(), Err(CallFailure::SessionClosed));
        assert!(tracker.inbound().is_none());
    }

    #[test]
    fn test_pipelined_inbound_call_is_a_violation() {
        let mut tracker = CorrelationTracker::new();
        tracker.begin_inbound("a").unwrap();

        let err = tracker.begin_inbound("b").unwrap_err();
        assert_eq!(
            err,
            ProtocolViolation::PipelinedCall {
                rejected: "b".into(),
                in_flight: "a".into(),
            }
        );

        assert!(!tracker.finish_inbound("b"));
        assert!(tracker.finish_inbound("a"));
        assert!(tracker.begin_inbound("b").is_ok());
    }
}
