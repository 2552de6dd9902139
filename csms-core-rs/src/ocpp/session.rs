//! Charge point session state machine
//!
//! Tracks one charge point across connections:
//! - Registration (BootNotification → Online)
//! - Heartbeat bookkeeping
//! - Offline grace period after the transport drops
//! - Outbound calls from the central system to the charge point
//!
//! ```text
//!  Connecting ──BootAccepted──► Online ◄──Reconnected── Offline
//!      │  ▲                      │  ▲                     │
//!      │  └─BootRejected         │  └─Heartbeat          GraceExpired
//!      │                         │                        │
//!  BootPending                   └────TransportLost───────┘
//!      ▼                                                  ▼
//!  PendingRegistration ────TransportLost / Close──────► Closed
//! ```

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::correlation::{CallFailure, CallOutcome, CorrelationTracker};
use super::messages::{encode, Frame};
use super::types::*;
use crate::external::StationInfo;

/// Vendor-assigned charge point id, taken from the connection URL path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChargePointIdentity(String);

impl ChargePointIdentity {
    pub fn new(identity: impl Into<String>) -> Self {
        Self(identity.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChargePointIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChargePointIdentity {
    fn from(identity: &str) -> Self {
        Self::new(identity)
    }
}

impl From<String> for ChargePointIdentity {
    fn from(identity: String) -> Self {
        Self(identity)
    }
}

impl Borrow<str> for ChargePointIdentity {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Session state in the charge point lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Transport open, no accepted BootNotification yet
    Connecting,
    /// Known station that the directory has disabled
    PendingRegistration,
    /// Registered and connected
    Online,
    /// Registered, transport lost, grace period running
    Offline,
    /// Terminal
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "Connecting",
            SessionState::PendingRegistration => "PendingRegistration",
            SessionState::Online => "Online",
            SessionState::Offline => "Offline",
            SessionState::Closed => "Closed",
        };
        f.write_str(name)
    }
}

/// Events that drive the session state machine
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// BootNotification answered Accepted
    BootAccepted { interval: u32 },
    /// BootNotification answered Pending
    BootPending,
    /// BootNotification answered Rejected
    BootRejected,
    /// Heartbeat received
    Heartbeat,
    /// Transport dropped
    TransportLost,
    /// Same charge point connected again while Offline
    Reconnected { connection: ConnectionHandle },
    /// Offline grace period ran out
    GraceExpired,
    /// Explicit closure (fatal protocol error, deregistration)
    Close,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::BootAccepted { .. } => "BootAccepted",
            SessionEvent::BootPending => "BootPending",
            SessionEvent::BootRejected => "BootRejected",
            SessionEvent::Heartbeat => "Heartbeat",
            SessionEvent::TransportLost => "TransportLost",
            SessionEvent::Reconnected { .. } => "Reconnected",
            SessionEvent::GraceExpired => "GraceExpired",
            SessionEvent::Close => "Close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event} is not valid while the session is {state}")]
pub struct IllegalTransition {
    pub state: SessionState,
    pub event: &'static str,
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
struct ConnectionSignals {
    shutdown: Notify,
    rearm: Notify,
}

/// Sending half of one transport connection.
///
/// Every connection gets a process-unique id so late notifications from a
/// replaced connection can be told apart from the current one.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    connection_id: u64,
    outgoing: mpsc::UnboundedSender<String>,
    signals: Arc<ConnectionSignals>,
}

impl ConnectionHandle {
    pub fn new(outgoing: mpsc::UnboundedSender<String>) -> Self {
        Self {
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            outgoing,
            signals: Arc::new(ConnectionSignals::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.connection_id
    }

    /// Encode and queue a frame. False once the transport is gone.
    pub fn send(&self, frame: &Frame) -> bool {
        self.outgoing.send(encode(frame)).is_ok()
    }

    /// Ask the connection task to stop
    pub fn close(&self) {
        self.signals.shutdown.notify_one();
    }

    pub(crate) async fn closed(&self) {
        self.signals.shutdown.notified().await
    }

    /// Tell the connection task the outbound deadline changed
    pub(crate) fn rearm(&self) {
        self.signals.rearm.notify_one();
    }

    pub(crate) async fn rearmed(&self) {
        self.signals.rearm.notified().await
    }
}

/// Last reported state of one connector
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectorState {
    pub status: ChargePointStatus,
    pub error_code: ChargePointErrorCode,
    pub info: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One charge point as seen by the central system
#[derive(Debug)]
pub struct ChargePointSession {
    identity: ChargePointIdentity,
    state: SessionState,
    connection: Option<ConnectionHandle>,
    heartbeat_interval: u32,
    tracker: CorrelationTracker,
    open_transactions: BTreeSet<i32>,
    offline_generation: u64,
    grace_timer: Option<AbortHandle>,

    pub connected_at: DateTime<Utc>,
    pub registered_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,

    /// Details from the last BootNotification
    pub boot: Option<BootNotificationRequest>,
    /// Directory entry fetched at boot
    pub station: Option<StationInfo>,
    /// connector id → last StatusNotification (0 is the charge point itself)
    pub connectors: BTreeMap<u32, ConnectorState>,
}

impl ChargePointSession {
    /// New session in `Connecting` on a fresh transport
    pub fn new(
        identity: ChargePointIdentity,
        connection: ConnectionHandle,
        heartbeat_interval: u32,
    ) -> Self {
        Self {
            identity,
            state: SessionState::Connecting,
            connection: Some(connection),
            heartbeat_interval,
            tracker: CorrelationTracker::new(),
            open_transactions: BTreeSet::new(),
            offline_generation: 0,
            grace_timer: None,
            connected_at: Utc::now(),
            registered_at: None,
            last_heartbeat: None,
            disconnected_at: None,
            boot: None,
            station: None,
            connectors: BTreeMap::new(),
        }
    }

    pub fn identity(&self) -> &ChargePointIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn heartbeat_interval(&self) -> u32 {
        self.heartbeat_interval
    }

    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    pub fn connection_id(&self) -> Option<u64> {
        self.connection.as_ref().map(ConnectionHandle::id)
    }

    pub fn tracker(&self) -> &CorrelationTracker {
        &self.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut CorrelationTracker {
        &mut self.tracker
    }

    pub fn offline_generation(&self) -> u64 {
        self.offline_generation
    }

    /// Apply an event and return the new state
    pub fn handle_event(&mut self, event: SessionEvent) -> Result<SessionState, IllegalTransition> {
        use SessionState::*;

        let from = self.state;
        let name = event.name();
        debug!(identity = %self.identity, state = %from, "Session event: {}", name);

        let to = match (from, event) {
            (Closed, _) => {
                return Err(IllegalTransition { state: from, event: name });
            }

            (Connecting | PendingRegistration | Online, SessionEvent::BootAccepted { interval }) => {
                self.heartbeat_interval = interval;
                if from != Online {
                    self.registered_at = Some(Utc::now());
                }
                Online
            }

            (Connecting | PendingRegistration | Online, SessionEvent::BootPending) => {
                PendingRegistration
            }

            (Connecting | PendingRegistration | Online, SessionEvent::BootRejected) => from,

            (Online, SessionEvent::Heartbeat) => {
                self.last_heartbeat = Some(Utc::now());
                Online
            }

            (Online, SessionEvent::TransportLost) => {
                self.connection = None;
                self.tracker.cancel(CallFailure::Disconnected);
                self.offline_generation += 1;
                self.disconnected_at = Some(Utc::now());
                Offline
            }

            (Connecting | PendingRegistration, SessionEvent::TransportLost) => {
                self.disconnected_at = Some(Utc::now());
                self.shut_down();
                Closed
            }

            (Offline, SessionEvent::Reconnected { connection }) => {
                self.abort_grace_timer();
                self.connection = Some(connection);
                self.connected_at = Utc::now();
                self.disconnected_at = None;
                Online
            }

            (Offline, SessionEvent::GraceExpired) => {
                // The expiring timer is the caller; forget it without aborting.
                self.grace_timer = None;
                self.shut_down();
                Closed
            }

            (_, SessionEvent::Close) => {
                self.abort_grace_timer();
                self.shut_down();
                Closed
            }

            _ => {
                return Err(IllegalTransition { state: from, event: name });
            }
        };

        if to != from {
            info!(identity = %self.identity, "Session {} -> {}", from, to);
        }
        self.state = to;
        Ok(to)
    }

    /// Swap the transport of a live session (supersede).
    ///
    /// The pending outbound call belonged to the old transport and fails
    /// with `Disconnected`. Returns the old handle so the caller can close it.
    pub fn replace_connection(&mut self, connection: ConnectionHandle) -> Option<ConnectionHandle> {
        self.tracker.cancel(CallFailure::Disconnected);
        self.connected_at = Utc::now();
        self.connection.replace(connection)
    }

    fn shut_down(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.tracker.cancel(CallFailure::SessionClosed);
    }

    /// Keep the grace timer of the current offline period.
    ///
    /// A timer armed for an older offline period (the session resumed in the
    /// meantime) is aborted straight away.
    pub fn arm_grace_timer(&mut self, generation: u64, timer: AbortHandle) -> bool {
        if self.state == SessionState::Offline && self.offline_generation == generation {
            self.abort_grace_timer();
            self.grace_timer = Some(timer);
            true
        } else {
            timer.abort();
            false
        }
    }

    fn abort_grace_timer(&mut self) {
        if let Some(timer) = self.grace_timer.take() {
            timer.abort();
        }
    }

    pub fn open_transactions(&self) -> &BTreeSet<i32> {
        &self.open_transactions
    }

    /// Attach a transaction to this session. Refused once Closed.
    pub fn track_transaction(&mut self, transaction_id: i32) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.open_transactions.insert(transaction_id);
        true
    }

    pub fn release_transaction(&mut self, transaction_id: i32) -> bool {
        self.open_transactions.remove(&transaction_id)
    }

    pub fn take_open_transactions(&mut self) -> Vec<i32> {
        std::mem::take(&mut self.open_transactions).into_iter().collect()
    }

    pub fn record_boot(&mut self, request: BootNotificationRequest, station: Option<StationInfo>) {
        self.boot = Some(request);
        self.station = station;
    }

    pub fn record_status(&mut self, request: &StatusNotificationRequest) {
        let state = ConnectorState {
            status: request.status,
            error_code: request.error_code,
            info: request.info.clone(),
            updated_at: request.timestamp.unwrap_or_else(Utc::now),
        };

        if request.error_code != ChargePointErrorCode::NoError {
            warn!(
                identity = %self.identity,
                connector_id = request.connector_id,
                "Connector reports {:?} ({:?})",
                request.error_code,
                request.status
            );
        }

        self.connectors.insert(request.connector_id, state);
    }

    /// Connector count from the directory, if the station is known
    pub fn connector_count(&self) -> Option<u32> {
        self.station.as_ref().map(|s| s.connectors)
    }

    pub fn rate_per_kwh(&self) -> Option<f64> {
        self.station.as_ref().and_then(|s| s.rate_per_kwh)
    }
}

/// Shared handle to a session owned by the registry
#[derive(Debug)]
pub struct SessionHandle {
    identity: ChargePointIdentity,
    response_timeout: Duration,
    inner: Mutex<ChargePointSession>,
}

pub type SessionRef = Arc<SessionHandle>;

impl SessionHandle {
    pub fn new(session: ChargePointSession, response_timeout: Duration) -> SessionRef {
        Arc::new(Self {
            identity: session.identity().clone(),
            response_timeout,
            inner: Mutex::new(session),
        })
    }

    pub fn identity(&self) -> &ChargePointIdentity {
        &self.identity
    }

    /// Lock the session. Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, ChargePointSession> {
        self.inner.lock()
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state()
    }

    /// Send a CALL to the charge point and wait for its answer
    pub async fn call(&self, action: &str, payload: Value) -> CallOutcome {
        let receiver = {
            let mut session = self.inner.lock();
            if session.state() != SessionState::Online {
                return Err(CallFailure::NotConnected);
            }
            let connection = session.connection().cloned().ok_or(CallFailure::NotConnected)?;

            let (call, receiver) =
                session
                    .tracker_mut()
                    .begin_outbound(action, payload, self.response_timeout)?;

            debug!(identity = %self.identity, unique_id = %call.unique_id, "Calling {}", action);
            if !connection.send(&Frame::Call(call)) {
                session.tracker_mut().cancel(CallFailure::Disconnected);
            }
            connection.rearm();
            receiver
        };

        receiver.await.unwrap_or(Err(CallFailure::SessionClosed))
    }

    /// Typed variant of [`call`](Self::call)
    pub async fn send<R: OutboundRequest>(&self, request: &R) -> Result<R::Response, CallFailure> {
        let payload = serde_json::to_value(request)
            .map_err(|e| CallFailure::InvalidRequest(e.to_string()))?;
        let response = self.call(R::ACTION, payload).await?;
        serde_json::from_value(response).map_err(|e| CallFailure::InvalidResponse(e.to_string()))
    }
}
