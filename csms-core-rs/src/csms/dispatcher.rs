//! Action dispatcher
//!
//! Routes inbound CALLs to their handlers, enforcing which actions a session
//! may send in its current state. Everything that is not a first-class action
//! is refused with `NotImplemented`.
//!
//! | Condition | CALLERROR code |
//! |-----------|----------------|
//! | unknown action | NotImplemented |
//! | action not allowed in state | SecurityError |
//! | payload does not match the schema | FormationViolation |
//! | connector id out of range | PropertyConstraintViolation |
//! | unknown / foreign transaction, occupied connector | GenericError |
//! | ledger, directory or authorizer failure | InternalError |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::transaction::{StartRequest, StopReason, TransactionCoordinator, TransactionError};
use crate::config::CsmsConfig;
use crate::error::ProtocolViolation;
use crate::external::{ExternalError, StationDirectory};
use crate::ocpp::messages::{Call, CallError, CallResult, ErrorCode, Frame};
use crate::ocpp::session::{IllegalTransition, SessionEvent, SessionRef, SessionState};
use crate::ocpp::types::*;

/// Charge point initiated actions with a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    BootNotification,
    Heartbeat,
    StatusNotification,
    Authorize,
    StartTransaction,
    MeterValues,
    StopTransaction,
}

impl Action {
    pub const ALL: [Action; 7] = [
        Action::BootNotification,
        Action::Heartbeat,
        Action::StatusNotification,
        Action::Authorize,
        Action::StartTransaction,
        Action::MeterValues,
        Action::StopTransaction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::BootNotification => "BootNotification",
            Action::Heartbeat => "Heartbeat",
            Action::StatusNotification => "StatusNotification",
            Action::Authorize => "Authorize",
            Action::StartTransaction => "StartTransaction",
            Action::MeterValues => "MeterValues",
            Action::StopTransaction => "StopTransaction",
        }
    }

    /// Whether a session in `state` may send this action
    pub fn permitted_in(&self, state: SessionState) -> bool {
        match (self, state) {
            (
                Action::BootNotification,
                SessionState::Connecting | SessionState::PendingRegistration | SessionState::Online,
            ) => true,
            (_, SessionState::Online) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown action {0}")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

/// Why a handler produced a CALLERROR
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    NotImplemented(#[from] UnknownAction),

    #[error(transparent)]
    Violation(#[from] ProtocolViolation),

    #[error("invalid {action} payload: {reason}")]
    Formation { action: Action, reason: String },

    #[error("connector {connector_id} is not valid for this charge point")]
    ConnectorOutOfRange { connector_id: u32 },

    #[error("transaction {0} belongs to another charge point")]
    ForeignTransaction(i32),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error(transparent)]
    Session(#[from] IllegalTransition),

    #[error("response encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HandlerError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            HandlerError::NotImplemented(_) => ErrorCode::NotImplemented,
            HandlerError::Violation(v) => v.error_code(),
            HandlerError::Formation { .. } => ErrorCode::FormationViolation,
            HandlerError::ConnectorOutOfRange { .. } => ErrorCode::PropertyConstraintViolation,
            HandlerError::ForeignTransaction(_) => ErrorCode::GenericError,
            HandlerError::Transaction(e) => match e {
                TransactionError::ConnectorOccupied { .. }
                | TransactionError::Unknown(_)
                | TransactionError::NotAuthorized(_) => ErrorCode::GenericError,
                TransactionError::LedgerUnavailable { .. } | TransactionError::Authorization(_) => {
                    ErrorCode::InternalError
                }
            },
            HandlerError::External(_) | HandlerError::Encode(_) => ErrorCode::InternalError,
            HandlerError::Session(_) => ErrorCode::GenericError,
        }
    }

    pub fn details(&self) -> Value {
        match self {
            HandlerError::Transaction(TransactionError::ConnectorOccupied {
                connector_id,
                transaction_id,
            }) => json!({
                "reason": "ConnectorOccupied",
                "connectorId": connector_id,
                "transactionId": transaction_id,
            }),
            HandlerError::Transaction(TransactionError::Unknown(id)) => json!({
                "reason": "UnknownTransaction",
                "transactionId": id,
            }),
            HandlerError::ForeignTransaction(id) => json!({
                "reason": "UnknownTransaction",
                "transactionId": id,
            }),
            _ => json!({}),
        }
    }

    fn into_call_error(self, unique_id: String) -> CallError {
        CallError::new(unique_id, self.error_code(), self.to_string()).with_details(self.details())
    }
}

fn parse<T: DeserializeOwned>(action: Action, payload: Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload).map_err(|e| HandlerError::Formation {
        action,
        reason: e.to_string(),
    })
}

fn respond<T: Serialize>(response: T) -> Result<Value, HandlerError> {
    Ok(serde_json::to_value(response)?)
}

/// Handles inbound calls against sessions
pub struct Dispatcher {
    directory: Arc<dyn StationDirectory>,
    coordinator: Arc<TransactionCoordinator>,
    config: CsmsConfig,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<dyn StationDirectory>,
        coordinator: Arc<TransactionCoordinator>,
        config: CsmsConfig,
    ) -> Self {
        Self {
            directory,
            coordinator,
            config,
        }
    }

    /// Answer one inbound call with a CALLRESULT or CALLERROR
    pub async fn dispatch(&self, session: &SessionRef, call: Call) -> Frame {
        let unique_id = call.unique_id.clone();
        let action = call.action.clone();

        match self.handle(session, call).await {
            Ok(payload) => Frame::CallResult(CallResult { unique_id, payload }),
            Err(e) => {
                warn!(
                    identity = %session.identity(),
                    %unique_id,
                    code = %e.error_code(),
                    "{} refused: {}",
                    action,
                    e
                );
                Frame::CallError(e.into_call_error(unique_id))
            }
        }
    }

    async fn handle(&self, session: &SessionRef, call: Call) -> Result<Value, HandlerError> {
        let action: Action = call.action.parse()?;
        let state = session.state();
        if !action.permitted_in(state) {
            return Err(ProtocolViolation::ActionNotPermitted {
                action: call.action,
                state,
            }
            .into());
        }

        debug!(identity = %session.identity(), unique_id = %call.unique_id, "Handling {}", action);

        match action {
            Action::BootNotification => {
                respond(self.boot_notification(session, parse(action, call.payload)?).await?)
            }
            Action::Heartbeat => {
                let _: HeartbeatRequest = parse(action, call.payload)?;
                respond(self.heartbeat(session)?)
            }
            Action::StatusNotification => {
                respond(self.status_notification(session, parse(action, call.payload)?)?)
            }
            Action::Authorize => {
                respond(self.authorize(parse(action, call.payload)?).await?)
            }
            Action::StartTransaction => {
                respond(self.start_transaction(session, parse(action, call.payload)?).await?)
            }
            Action::MeterValues => {
                respond(self.meter_values(session, parse(action, call.payload)?).await?)
            }
            Action::StopTransaction => {
                respond(self.stop_transaction(session, parse(action, call.payload)?).await?)
            }
        }
    }

    async fn boot_notification(
        &self,
        session: &SessionRef,
        request: BootNotificationRequest,
    ) -> Result<BootNotificationResponse, HandlerError> {
        let identity = session.identity();
        let station = self.directory.find_by_identity(identity).await?;

        let status = match &station {
            None => {
                warn!(%identity, "BootNotification from unknown charge point");
                RegistrationStatus::Rejected
            }
            Some(info)
                if info.vendor != request.charge_point_vendor
                    || info.model != request.charge_point_model =>
            {
                warn!(
                    %identity,
                    "BootNotification {}/{} does not match directory {}/{}",
                    request.charge_point_vendor,
                    request.charge_point_model,
                    info.vendor,
                    info.model
                );
                RegistrationStatus::Rejected
            }
            Some(info) if !info.enabled => RegistrationStatus::Pending,
            Some(_) => RegistrationStatus::Accepted,
        };

        let (event, interval) = match status {
            RegistrationStatus::Accepted => {
                let interval = self.config.heartbeat_interval;
                (SessionEvent::BootAccepted { interval }, interval)
            }
            RegistrationStatus::Pending => (SessionEvent::BootPending, self.config.boot_retry_interval),
            RegistrationStatus::Rejected => (SessionEvent::BootRejected, self.config.boot_retry_interval),
        };

        {
            let mut inner = session.lock();
            inner.handle_event(event)?;
            let station = if status == RegistrationStatus::Rejected { None } else { station };
            inner.record_boot(request, station);
        }

        info!(%identity, "BootNotification answered {:?}, interval {}s", status, interval);
        Ok(BootNotificationResponse {
            current_time: Utc::now(),
            interval,
            status,
        })
    }

    fn heartbeat(&self, session: &SessionRef) -> Result<HeartbeatResponse, HandlerError> {
        session.lock().handle_event(SessionEvent::Heartbeat)?;
        Ok(HeartbeatResponse {
            current_time: Utc::now(),
        })
    }

    fn status_notification(
        &self,
        session: &SessionRef,
        request: StatusNotificationRequest,
    ) -> Result<StatusNotificationResponse, HandlerError> {
        let mut inner = session.lock();
        if let Some(count) = inner.connector_count() {
            if request.connector_id > count {
                return Err(HandlerError::ConnectorOutOfRange {
                    connector_id: request.connector_id,
                });
            }
        }
        inner.record_status(&request);
        Ok(StatusNotificationResponse {})
    }

    async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeResponse, HandlerError> {
        let id_tag_info = self.coordinator.authorize(&request.id_tag).await?;
        Ok(AuthorizeResponse { id_tag_info })
    }

    async fn start_transaction(
        &self,
        session: &SessionRef,
        request: StartTransactionRequest,
    ) -> Result<StartTransactionResponse, HandlerError> {
        let rate_per_kwh = {
            let inner = session.lock();
            check_transaction_connector(inner.connector_count(), request.connector_id)?;
            inner.rate_per_kwh()
        };

        let start = StartRequest {
            charge_point: session.identity().clone(),
            connector_id: request.connector_id,
            id_tag: request.id_tag,
            meter_start: request.meter_start,
            timestamp: request.timestamp,
            rate_per_kwh,
        };

        let transaction = match self.coordinator.start_transaction(start).await {
            Ok(transaction) => transaction,
            Err(TransactionError::NotAuthorized(id_tag_info)) => {
                return Ok(StartTransactionResponse {
                    id_tag_info,
                    transaction_id: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let transaction_id = transaction.transaction_id;
        let tracked = session.lock().track_transaction(transaction_id);
        if !tracked {
            // Session closed while the ledger was being written
            warn!(identity = %session.identity(), transaction_id, "Session gone, stopping new transaction");
            self.coordinator.force_stop(&[transaction_id]).await;
        }

        Ok(StartTransactionResponse {
            id_tag_info: IdTagInfo::accepted(),
            transaction_id,
        })
    }

    async fn meter_values(
        &self,
        session: &SessionRef,
        request: MeterValuesRequest,
    ) -> Result<MeterValuesResponse, HandlerError> {
        let connector_count = session.lock().connector_count();
        if connector_count.is_some_and(|count| request.connector_id > count) {
            return Err(HandlerError::ConnectorOutOfRange {
                connector_id: request.connector_id,
            });
        }

        let Some(transaction_id) = request.transaction_id else {
            debug!(identity = %session.identity(), "Meter values outside a transaction");
            return Ok(MeterValuesResponse {});
        };
        self.check_owner(session, transaction_id)?;
        if !self.coordinator.is_active(transaction_id) {
            return Err(TransactionError::Unknown(transaction_id).into());
        }

        let reading = request
            .meter_value
            .iter()
            .filter_map(|mv| mv.energy_import_wh().map(|wh| (wh, mv.timestamp)))
            .last();

        if let Some((reading_wh, timestamp)) = reading {
            self.coordinator
                .record_meter_value(transaction_id, reading_wh, timestamp)
                .await?;
        }
        Ok(MeterValuesResponse {})
    }

    async fn stop_transaction(
        &self,
        session: &SessionRef,
        request: StopTransactionRequest,
    ) -> Result<StopTransactionResponse, HandlerError> {
        let transaction_id = request.transaction_id;
        self.check_owner(session, transaction_id)?;

        let reason = request.reason.map(StopReason::from).unwrap_or(StopReason::Local);
        self.coordinator
            .stop_transaction(transaction_id, request.meter_stop, request.timestamp, reason)
            .await?;
        session.lock().release_transaction(transaction_id);

        let id_tag_info = match request.id_tag {
            Some(id_tag) => match self.coordinator.authorize(&id_tag).await {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(%id_tag, "Authorizer unavailable at stop: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(StopTransactionResponse { id_tag_info })
    }

    fn check_owner(&self, session: &SessionRef, transaction_id: i32) -> Result<(), HandlerError> {
        match self.coordinator.get(transaction_id) {
            None => Err(TransactionError::Unknown(transaction_id).into()),
            Some(t) if &t.charge_point != session.identity() => {
                Err(HandlerError::ForeignTransaction(transaction_id))
            }
            Some(_) => Ok(()),
        }
    }
}

/// Transactions run on connectors 1..=count
fn check_transaction_connector(count: Option<u32>, connector_id: u32) -> Result<(), HandlerError> {
    let in_range = connector_id > 0 && count.map_or(true, |count| connector_id <= count);
    if in_range {
        Ok(())
    } else {
        Err(HandlerError::ConnectorOutOfRange { connector_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csms::registry::SessionRegistry;
    use crate::csms::transaction::RetryPolicy;
    use crate::external::authorizer::IdTagEntry;
    use crate::external::{InMemoryLedger, StaticAuthorizer, StaticDirectory, StationInfo};
    use crate::ocpp::session::ConnectionHandle;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<SessionRegistry>,
        dispatcher: Dispatcher,
    }

    fn station(identity: &str, enabled: bool) -> StationInfo {
        StationInfo {
            identity: identity.into(),
            name: format!("Station {}", identity),
            vendor: "Acme".into(),
            model: "X1".into(),
            enabled,
            connectors: 2,
            rate_per_kwh: Some(0.4),
            auth_key: None,
        }
    }

    fn fixture() -> Fixture {
        let config = CsmsConfig::default();
        let directory = StaticDirectory::new(vec![station("CP-1", true), station("CP-2", false)]);
        let authorizer = StaticAuthorizer::with_tags(vec![IdTagEntry {
            id_tag: "TAG-1".into(),
            status: AuthorizationStatus::Accepted,
            expiry_date: None,
            parent_id_tag: None,
        }]);
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::new(InMemoryLedger::new()),
            Arc::new(authorizer),
            RetryPolicy::default(),
        ));
        Fixture {
            registry: SessionRegistry::new(coordinator.clone(), config.clone()),
            dispatcher: Dispatcher::new(Arc::new(directory), coordinator, config),
        }
    }

    fn attach(fixture: &Fixture, identity: &str) -> SessionRef {
        let (tx, _rx) = mpsc::unbounded_channel();
        fixture
            .registry
            .attach(identity.into(), ConnectionHandle::new(tx), false)
            .unwrap()
    }

    fn call(action: &str, payload: Value) -> Call {
        Call {
            unique_id: "1".into(),
            action: action.into(),
            payload,
        }
    }

    async fn boot(fixture: &Fixture, session: &SessionRef) -> Frame {
        fixture
            .dispatcher
            .dispatch(
                session,
                call(
                    "BootNotification",
                    json!({"chargePointVendor": "Acme", "chargePointModel": "X1"}),
                ),
            )
            .await
    }

    fn result(frame: Frame) -> Value {
        match frame {
            Frame::CallResult(r) => r.payload,
            other => panic!("expected CALLRESULT, got {:?}", other),
        }
    }

    fn error(frame: Frame) -> CallError {
        match frame {
            Frame::CallError(e) => e,
            other => panic!("expected CALLERROR, got {:?}", other),
        }
    }

    #[test]
    fn test_permission_table() {
        for action in Action::ALL {
            assert!(action.permitted_in(SessionState::Online));
            assert!(!action.permitted_in(SessionState::Offline));
            assert!(!action.permitted_in(SessionState::Closed));
            assert_eq!(
                action.permitted_in(SessionState::Connecting),
                action == Action::BootNotification
            );
            assert_eq!(
                action.permitted_in(SessionState::PendingRegistration),
                action == Action::BootNotification
            );
        }
        assert_eq!("DataTransfer".parse::<Action>(), Err(UnknownAction("DataTransfer".into())));
        assert_eq!("Heartbeat".parse::<Action>(), Ok(Action::Heartbeat));
    }

    #[tokio::test]
    async fn test_boot_accepted() {
        let fixture = fixture();
        let session = attach(&fixture, "CP-1");

        let payload = result(boot(&fixture, &session).await);
        assert_eq!(payload["status"], "Accepted");
        assert_eq!(payload["interval"], 300);
        assert_eq!(session.state(), SessionState::Online);
        assert_eq!(session.lock().connector_count(), Some(2));
    }

    #[tokio::test]
    async fn test_boot_rejected_and_pending() {
        let fixture = fixture();

        let session = attach(&fixture, "CP-1");
        let mismatch = fixture
            .dispatcher
            .dispatch(
                &session,
                call(
                    "BootNotification",
                    json!({"chargePointVendor": "Acme", "chargePointModel": "Z9"}),
                ),
            )
            .await;
        let payload = result(mismatch);
        assert_eq!(payload["status"], "Rejected");
        assert_eq!(payload["interval"], 60);
        assert_eq!(session.state(), SessionState::Connecting);

        let unknown = attach(&fixture, "CP-404");
        assert_eq!(result(boot(&fixture, &unknown).await)["status"], "Rejected");

        let disabled = attach(&fixture, "CP-2");
        assert_eq!(result(boot(&fixture, &disabled).await)["status"], "Pending");
        assert_eq!(disabled.state(), SessionState::PendingRegistration);
    }

    #[tokio::test]
    async fn test_unregistered_session_rejects_other_actions() {
        let fixture = fixture();
        let session = attach(&fixture, "CP-1");

        let err = error(
            fixture
                .dispatcher
                .dispatch(&session, call("Heartbeat", json!({})))
                .await,
        );
        assert_eq!(err.error_code, ErrorCode::SecurityError);
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_unknown_action_and_bad_payload() {
        let fixture = fixture();
        let session = attach(&fixture, "CP-1");

        let err = error(
            fixture
                .dispatcher
                .dispatch(&session, call("DataTransfer", json!({"vendorId": "x"})))
                .await,
        );
        assert_eq!(err.error_code, ErrorCode::NotImplemented);

        let err = error(
            fixture
                .dispatcher
                .dispatch(&session, call("BootNotification", json!({"chargePointVendor": 7})))
                .await,
        );
        assert_eq!(err.error_code, ErrorCode::FormationViolation);
    }

    #[tokio::test]
    async fn test_heartbeat_updates_session() {
        let fixture = fixture();
        let session = attach(&fixture, "CP-1");
        boot(&fixture, &session).await;

        let payload = result(
            fixture
                .dispatcher
                .dispatch(&session, call("Heartbeat", json!({})))
                .await,
        );
        assert!(payload["currentTime"].is_string());
        assert!(session.lock().last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_status_notification_connector_range() {
        let fixture = fixture();
        let session = attach(&fixture, "CP-1");
        boot(&fixture, &session).await;

        let ok = fixture
            .dispatcher
            .dispatch(
                &session,
                call(
                    "StatusNotification",
                    json!({"connectorId": 2, "errorCode": "NoError", "status": "Charging"}),
                ),
            )
            .await;
        assert_eq!(result(ok), json!({}));
        assert_eq!(
            session.lock().connectors[&2].status,
            ChargePointStatus::Charging
        );

        let err = error(
            fixture
                .dispatcher
                .dispatch(
                    &session,
                    call(
                        "StatusNotification",
                        json!({"connectorId": 3, "errorCode": "NoError", "status": "Available"}),
                    ),
                )
                .await,
        );
        assert_eq!(err.error_code, ErrorCode::PropertyConstraintViolation);
    }

    #[tokio::test]
    async fn test_start_transaction_outcomes() {
        let fixture = fixture();
        let session = attach(&fixture, "CP-1");
        boot(&fixture, &session).await;

        let start = |id_tag: &str| {
            call(
                "StartTransaction",
                json!({
                    "connectorId": 1,
                    "idTag": id_tag,
                    "meterStart": 100,
                    "timestamp": "2026-01-20T12:00:00Z"
                }),
            )
        };

        let rejected = result(fixture.dispatcher.dispatch(&session, start("NOPE")).await);
        assert_eq!(rejected["idTagInfo"]["status"], "Invalid");
        assert_eq!(rejected["transactionId"], 0);

        let accepted = result(fixture.dispatcher.dispatch(&session, start("TAG-1")).await);
        assert_eq!(accepted["idTagInfo"]["status"], "Accepted");
        let transaction_id = accepted["transactionId"].as_i64().unwrap() as i32;
        assert!(session.lock().open_transactions().contains(&transaction_id));

        let occupied = error(fixture.dispatcher.dispatch(&session, start("TAG-1")).await);
        assert_eq!(occupied.error_code, ErrorCode::GenericError);
        assert_eq!(occupied.error_details["reason"], "ConnectorOccupied");
        assert_eq!(occupied.error_details["transactionId"], transaction_id);
    }

    #[tokio::test]
    async fn test_foreign_transaction_refused() {
        let fixture = fixture();
        let owner = attach(&fixture, "CP-1");
        boot(&fixture, &owner).await;

        let accepted = result(
            fixture
                .dispatcher
                .dispatch(
                    &owner,
                    call(
                        "StartTransaction",
                        json!({"connectorId": 1, "idTag": "TAG-1", "meterStart": 0,
                               "timestamp": "2026-01-20T12:00:00Z"}),
                    ),
                )
                .await,
        );
        let transaction_id = accepted["transactionId"].clone();

        let other = attach(&fixture, "CP-3");
        other
            .lock()
            .handle_event(SessionEvent::BootAccepted { interval: 300 })
            .unwrap();

        let err = error(
            fixture
                .dispatcher
                .dispatch(
                    &other,
                    call(
                        "StopTransaction",
                        json!({"transactionId": transaction_id, "meterStop": 10,
                               "timestamp": "2026-01-20T13:00:00Z"}),
                    ),
                )
                .await,
        );
        assert_eq!(err.error_code, ErrorCode::GenericError);

        let err = error(
            fixture
                .dispatcher
                .dispatch(
                    &owner,
                    call(
                        "MeterValues",
                        json!({"connectorId": 1, "transactionId": 999, "meterValue": []}),
                    ),
                )
                .await,
        );
        assert_eq!(err.error_code, ErrorCode::GenericError);
    }

    #[tokio::test]
    async fn test_meter_values_after_stop_refused() {
        let fixture = fixture();
        let session = attach(&fixture, "CP-1");
        boot(&fixture, &session).await;

        let accepted = result(
            fixture
                .dispatcher
                .dispatch(
                    &session,
                    call(
                        "StartTransaction",
                        json!({"connectorId": 1, "idTag": "TAG-1", "meterStart": 0,
                               "timestamp": "2026-01-20T12:00:00Z"}),
                    ),
                )
                .await,
        );
        let transaction_id = accepted["transactionId"].clone();

        let voltage_only = call(
            "MeterValues",
            json!({"connectorId": 1, "transactionId": transaction_id, "meterValue": [{
                "timestamp": "2026-01-20T12:30:00Z",
                "sampledValue": [{"value": "230", "measurand": "Voltage"}]
            }]}),
        );
        result(fixture.dispatcher.dispatch(&session, voltage_only.clone()).await);

        result(
            fixture
                .dispatcher
                .dispatch(
                    &session,
                    call(
                        "StopTransaction",
                        json!({"transactionId": transaction_id, "meterStop": 10,
                               "timestamp": "2026-01-20T13:00:00Z"}),
                    ),
                )
                .await,
        );

        let err = error(fixture.dispatcher.dispatch(&session, voltage_only).await);
        assert_eq!(err.error_code, ErrorCode::GenericError);
        assert_eq!(err.error_details["reason"], "UnknownTransaction");
    }
}
