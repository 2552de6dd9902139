//! Whole charge point conversations driven through the channel transport

use std::sync::Arc;
use std::time::Duration;

use csms_core::external::ledger::LedgerOp;
use csms_core::ocpp::types::{
    RemoteStartStopStatus, RemoteStartTransactionRequest, RemoteStopTransactionRequest,
    ResetRequest, ResetType,
};
use csms_core::{
    CallFailure, CentralSystem, ConnectionEnd, CsmsConfig, CsmsError, InMemoryLedger, JsonlLedger,
    SessionState, StaticDirectory, StationInfo, StopReason, TransactionStatus, Transport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

type ServeResult = Result<ConnectionEnd, CsmsError>;

/// The charge point end of one connection
struct ChargePoint {
    to_csms: mpsc::Sender<String>,
    from_csms: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<ServeResult>,
}

impl ChargePoint {
    fn connect(central: &Arc<CentralSystem>, identity: &str, password: Option<&str>) -> Self {
        let (transport, peer) = Transport::pair(16);
        let central = Arc::clone(central);
        let identity = identity.to_string();
        let password = password.map(str::to_string);
        let task = tokio::spawn(async move {
            central
                .serve(identity.as_str(), password.as_deref(), transport)
                .await
        });
        Self {
            to_csms: peer.to_csms,
            from_csms: peer.from_csms,
            task,
        }
    }

    async fn send_raw(&self, text: impl Into<String>) {
        self.to_csms.send(text.into()).await.unwrap();
    }

    async fn send_call(&self, unique_id: &str, action: &str, payload: Value) {
        self.send_raw(json!([2, unique_id, action, payload]).to_string())
            .await;
    }

    async fn recv(&mut self) -> Value {
        let text = timeout(Duration::from_secs(5), self.from_csms.recv())
            .await
            .expect("no frame from the central system")
            .expect("connection closed");
        serde_json::from_str(&text).unwrap()
    }

    async fn call(&mut self, unique_id: &str, action: &str, payload: Value) -> Value {
        self.send_call(unique_id, action, payload).await;
        let reply = self.recv().await;
        assert_eq!(reply[1], unique_id);
        reply
    }

    async fn boot(&mut self) -> Value {
        self.call(
            "boot-1",
            "BootNotification",
            json!({"chargePointVendor": "Acme", "chargePointModel": "X1"}),
        )
        .await
    }

    async fn start(&mut self, unique_id: &str, connector_id: u32, meter_start: i64) -> Value {
        self.call(
            unique_id,
            "StartTransaction",
            json!({
                "connectorId": connector_id,
                "idTag": "TAG-1",
                "meterStart": meter_start,
                "timestamp": "2024-05-01T10:00:00Z"
            }),
        )
        .await
    }

    /// Drop the transport and wait for the connection task
    async fn disconnect(self) -> ServeResult {
        drop(self.to_csms);
        self.task.await.unwrap()
    }
}

fn station(identity: &str, auth_key: Option<&str>) -> StationInfo {
    StationInfo {
        identity: identity.into(),
        name: format!("Station {}", identity),
        vendor: "Acme".into(),
        model: "X1".into(),
        enabled: true,
        connectors: 2,
        rate_per_kwh: Some(0.4),
        auth_key: auth_key.map(str::to_string),
    }
}

fn directory() -> Arc<StaticDirectory> {
    Arc::new(StaticDirectory::new([
        station("CP-1", None),
        station("CP-2", Some("secret")),
    ]))
}

fn central_with(ledger: Arc<InMemoryLedger>) -> Arc<CentralSystem> {
    Arc::new(
        CentralSystem::builder()
            .directory(directory())
            .ledger(ledger)
            .build(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_boot_accepted() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut cp = ChargePoint::connect(&central, "CP-1", None);

    let reply = cp.boot().await;
    assert_eq!(reply[0], 3);
    assert_eq!(reply[2]["status"], "Accepted");
    assert_eq!(reply[2]["interval"], 300);
    assert!(reply[2]["currentTime"].is_string());

    let session = central.session("CP-1").unwrap();
    assert_eq!(session.state(), SessionState::Online);
    assert_eq!(session.lock().heartbeat_interval(), 300);

    let reply = cp.call("hb-1", "Heartbeat", json!({})).await;
    assert_eq!(reply[0], 3);
    assert!(reply[2]["currentTime"].is_string());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_station_rejected() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut cp = ChargePoint::connect(&central, "CP-9", None);

    let reply = cp.boot().await;
    assert_eq!(reply[2]["status"], "Rejected");
    assert_eq!(reply[2]["interval"], 60);
    assert_eq!(central.session("CP-9").unwrap().state(), SessionState::Connecting);
}

#[tokio::test(start_paused = true)]
async fn test_connecting_session_refuses_other_actions() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut cp = ChargePoint::connect(&central, "CP-1", None);

    let reply = cp.call("hb-1", "Heartbeat", json!({})).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "SecurityError");

    // The connection survives and can still register
    let reply = cp.boot().await;
    assert_eq!(reply[2]["status"], "Accepted");
}

#[tokio::test(start_paused = true)]
async fn test_unknown_action_not_implemented() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;

    let reply = cp.call("dt-1", "DataTransfer", json!({"vendorId": "Acme"})).await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "NotImplemented");
}

#[tokio::test(start_paused = true)]
async fn test_pipelined_call_during_ledger_outage() {
    let ledger = Arc::new(InMemoryLedger::new());
    let central = central_with(ledger.clone());
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;

    ledger.set_available(false);
    cp.send_call(
        "start-1",
        "StartTransaction",
        json!({"connectorId": 1, "idTag": "TAG-1", "meterStart": 0, "timestamp": "2024-05-01T10:00:00Z"}),
    )
    .await;
    cp.send_call("hb-1", "Heartbeat", json!({})).await;

    // The heartbeat is refused while the start is still retrying the ledger
    let reply = cp.recv().await;
    assert_eq!(reply[1], "hb-1");
    assert_eq!(reply[2], "RpcFrameworkError");

    let reply = cp.recv().await;
    assert_eq!(reply[1], "start-1");
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "InternalError");

    assert_eq!(central.coordinator().active_count(), 0);
    assert!(ledger.records().is_empty());
    assert!(central.session("CP-1").unwrap().lock().open_transactions().is_empty());

    // Ledger back: the connector was released
    ledger.set_available(true);
    let reply = cp.start("start-2", 1, 0).await;
    assert_eq!(reply[0], 3);
    assert_eq!(reply[2]["idTagInfo"]["status"], "Accepted");
    assert_eq!(central.coordinator().active_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_close_connection() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;

    // A readable call id gets a FormationViolation
    cp.send_raw(r#"[2,"bad-1","Heartbeat"]"#).await;
    let reply = cp.recv().await;
    assert_eq!(reply, json!([4, "bad-1", "FormationViolation", reply[3], {}]));

    // A valid frame resets the counter
    cp.call("hb-1", "Heartbeat", json!({})).await;

    cp.send_raw("not json").await;
    cp.send_raw("{}").await;
    cp.send_raw("[7]").await;

    let end = timeout(Duration::from_secs(5), cp.task).await.unwrap().unwrap();
    assert_eq!(end.unwrap(), ConnectionEnd::MalformedFrames);
    assert!(central.session("CP-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_outbound_call_timeout_and_in_flight() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;

    let reset = {
        let central = Arc::clone(&central);
        tokio::spawn(async move {
            central
                .send("CP-1", &ResetRequest { reset_type: ResetType::Soft })
                .await
        })
    };

    let call = cp.recv().await;
    assert_eq!(call[0], 2);
    assert_eq!(call[2], "Reset");
    assert_eq!(call[3], json!({"type": "Soft"}));

    let second = central
        .send("CP-1", &ResetRequest { reset_type: ResetType::Hard })
        .await;
    assert!(matches!(second, Err(CallFailure::CallInFlight(_))));

    // No answer within the response timeout
    let outcome = reset.await.unwrap();
    assert_eq!(outcome.unwrap_err(), CallFailure::Timeout);

    // A late answer is dropped and the session carries on
    let unique_id = call[1].as_str().unwrap();
    cp.send_raw(json!([3, unique_id, {"status": "Accepted"}]).to_string())
        .await;
    let reply = cp.call("hb-1", "Heartbeat", json!({})).await;
    assert_eq!(reply[0], 3);
    assert_eq!(central.session("CP-1").unwrap().state(), SessionState::Online);
}

#[tokio::test(start_paused = true)]
async fn test_outbound_call_answered() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;

    let reset = {
        let central = Arc::clone(&central);
        tokio::spawn(async move {
            central
                .send("CP-1", &ResetRequest { reset_type: ResetType::Hard })
                .await
        })
    };

    let call = cp.recv().await;
    cp.send_raw(json!([3, call[1], {"status": "Accepted"}]).to_string())
        .await;

    let response = reset.await.unwrap().unwrap();
    assert_eq!(response.status, RemoteStartStopStatus::Accepted);
}

#[tokio::test(start_paused = true)]
async fn test_remote_start_and_stop() {
    let ledger = Arc::new(InMemoryLedger::new());
    let central = central_with(ledger.clone());
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;

    let remote_start = {
        let central = Arc::clone(&central);
        tokio::spawn(async move {
            let request = RemoteStartTransactionRequest {
                connector_id: Some(2),
                id_tag: "TAG-1".into(),
            };
            central.send("CP-1", &request).await
        })
    };
    let call = cp.recv().await;
    assert_eq!(call[0], 2);
    assert_eq!(call[2], "RemoteStartTransaction");
    assert_eq!(call[3], json!({"connectorId": 2, "idTag": "TAG-1"}));
    cp.send_raw(json!([3, call[1], {"status": "Accepted"}]).to_string())
        .await;
    assert_eq!(
        remote_start.await.unwrap().unwrap().status,
        RemoteStartStopStatus::Accepted
    );

    let started = cp.start("start-1", 2, 0).await;
    let transaction_id = started[2]["transactionId"].as_i64().unwrap() as i32;

    let remote_stop = {
        let central = Arc::clone(&central);
        tokio::spawn(async move {
            central
                .send("CP-1", &RemoteStopTransactionRequest { transaction_id })
                .await
        })
    };
    let call = cp.recv().await;
    assert_eq!(call[2], "RemoteStopTransaction");
    assert_eq!(call[3]["transactionId"], transaction_id);
    cp.send_raw(json!([3, call[1], {"status": "Rejected"}]).to_string())
        .await;
    assert_eq!(
        remote_stop.await.unwrap().unwrap().status,
        RemoteStartStopStatus::Rejected
    );

    cp.call(
        "stop-1",
        "StopTransaction",
        json!({"transactionId": transaction_id, "meterStop": 1000,
               "timestamp": "2024-05-01T11:00:00Z", "reason": "Remote"}),
    )
    .await;
    let record = ledger.get(transaction_id).unwrap();
    assert_eq!(record.status, TransactionStatus::Stopped);
    assert_eq!(record.stop_reason, Some(StopReason::Remote));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_start_connector_occupied() {
    let ledger = Arc::new(InMemoryLedger::new());
    let central = central_with(ledger.clone());
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;

    let first = cp.start("start-1", 1, 1000).await;
    let transaction_id = first[2]["transactionId"].as_i64().unwrap() as i32;
    assert_eq!(transaction_id, 1);

    let second = cp.start("start-2", 1, 1000).await;
    assert_eq!(second[0], 4);
    assert_eq!(second[2], "GenericError");
    assert_eq!(second[4]["reason"], "ConnectorOccupied");
    assert_eq!(second[4]["transactionId"], 1);

    assert_eq!(central.coordinator().active_count(), 1);
    assert_eq!(
        ledger.operations(),
        vec![(LedgerOp::Create, transaction_id)]
    );

    let reply = cp
        .call(
            "mv-1",
            "MeterValues",
            json!({
                "connectorId": 1,
                "transactionId": transaction_id,
                "meterValue": [{
                    "timestamp": "2024-05-01T10:30:00Z",
                    "sampledValue": [{"value": "3.5", "unit": "kWh"}]
                }]
            }),
        )
        .await;
    assert_eq!(reply[0], 3);
    assert_eq!(central.coordinator().get(transaction_id).unwrap().current_meter_value, 3500);

    let reply = cp
        .call(
            "stop-1",
            "StopTransaction",
            json!({
                "transactionId": transaction_id,
                "idTag": "TAG-1",
                "meterStop": 6000,
                "timestamp": "2024-05-01T11:00:00Z"
            }),
        )
        .await;
    assert_eq!(reply[0], 3);
    assert_eq!(reply[2]["idTagInfo"]["status"], "Accepted");

    let stopped = central.coordinator().get(transaction_id).unwrap();
    assert_eq!(stopped.status, TransactionStatus::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::Local));
    assert_eq!(stopped.energy_wh(), 5000);
    assert_eq!(stopped.cost(), Some(2.0));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_within_grace_keeps_transaction() {
    let ledger = Arc::new(InMemoryLedger::new());
    let central = central_with(ledger.clone());
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;
    cp.start("start-1", 1, 0).await;

    assert_eq!(cp.disconnect().await.unwrap(), ConnectionEnd::TransportClosed);
    assert_eq!(central.session("CP-1").unwrap().state(), SessionState::Offline);

    tokio::time::sleep(Duration::from_secs(120)).await;
    let mut cp = ChargePoint::connect(&central, "CP-1", None);

    // Resumed straight into Online, no new boot needed
    let reply = cp.call("hb-1", "Heartbeat", json!({})).await;
    assert_eq!(reply[0], 3);

    tokio::time::sleep(Duration::from_secs(600)).await;
    let session = central.session("CP-1").unwrap();
    assert_eq!(session.state(), SessionState::Online);
    assert!(session.lock().open_transactions().contains(&1));
    assert_eq!(central.coordinator().get(1).unwrap().status, TransactionStatus::Active);
    assert!(!ledger.operations().contains(&(LedgerOp::Close, 1)));
}

#[tokio::test(start_paused = true)]
async fn test_grace_expiry_force_stops() {
    let ledger = Arc::new(InMemoryLedger::new());
    let central = central_with(ledger.clone());
    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;
    cp.start("start-1", 2, 500).await;

    let session = central.session("CP-1").unwrap();
    cp.disconnect().await.unwrap();

    tokio::time::sleep(Duration::from_secs(301)).await;
    for _ in 0..100 {
        if ledger.operations().contains(&(LedgerOp::Close, 1)) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(session.state(), SessionState::Closed);
    assert!(central.session("CP-1").is_none());

    let stopped = ledger.get(1).unwrap();
    assert_eq!(stopped.status, TransactionStatus::Stopped);
    assert_eq!(stopped.stop_reason, Some(StopReason::ConnectionLost));
    assert_eq!(stopped.current_meter_value, 500);
}

#[tokio::test(start_paused = true)]
async fn test_supersede_requires_credentials() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut first = ChargePoint::connect(&central, "CP-2", Some("secret"));
    first.boot().await;

    let wrong = ChargePoint::connect(&central, "CP-2", Some("guess"));
    assert!(matches!(wrong.task.await.unwrap(), Err(CsmsError::Unauthorized(_))));

    let anonymous = ChargePoint::connect(&central, "CP-2", None);
    assert!(matches!(anonymous.task.await.unwrap(), Err(CsmsError::Unauthorized(_))));

    let mut second = ChargePoint::connect(&central, "CP-2", Some("secret"));
    let reply = second.call("hb-1", "Heartbeat", json!({})).await;
    assert_eq!(reply[0], 3);

    let end = timeout(Duration::from_secs(5), first.task).await.unwrap().unwrap();
    assert_eq!(end.unwrap(), ConnectionEnd::Shutdown);
    assert_eq!(central.session("CP-2").unwrap().state(), SessionState::Online);
}

#[tokio::test(start_paused = true)]
async fn test_keyless_station_cannot_supersede() {
    let central = central_with(Arc::new(InMemoryLedger::new()));
    let mut first = ChargePoint::connect(&central, "CP-1", None);
    first.boot().await;

    let second = ChargePoint::connect(&central, "CP-1", Some("anything"));
    assert!(matches!(
        second.task.await.unwrap(),
        Err(CsmsError::IdentityConflict(_))
    ));

    let reply = first.call("hb-1", "Heartbeat", json!({})).await;
    assert_eq!(reply[0], 3);
}

#[tokio::test]
async fn test_jsonl_recovery_restores_transactions() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");

    {
        let ledger = JsonlLedger::open(&path).unwrap().without_sync();
        let central = Arc::new(
            CentralSystem::builder()
                .directory(directory())
                .ledger(Arc::new(ledger))
                .build(),
        );
        let mut cp = ChargePoint::connect(&central, "CP-1", None);
        cp.boot().await;
        cp.start("start-1", 1, 0).await;
        cp.start("start-2", 2, 100).await;
        cp.call(
            "stop-1",
            "StopTransaction",
            json!({"transactionId": 1, "meterStop": 2000, "timestamp": "2024-05-01T11:00:00Z"}),
        )
        .await;
        central.shutdown();
    }

    let recovered = JsonlLedger::recover(&path).unwrap();
    assert_eq!(recovered.len(), 2);

    let ledger = JsonlLedger::open(&path).unwrap().without_sync();
    let central = Arc::new(
        CentralSystem::builder()
            .config(CsmsConfig::default())
            .directory(directory())
            .ledger(Arc::new(ledger))
            .restore(recovered)
            .build(),
    );
    assert_eq!(central.coordinator().get(1).unwrap().status, TransactionStatus::Stopped);
    assert_eq!(central.coordinator().get(2).unwrap().status, TransactionStatus::Active);

    let mut cp = ChargePoint::connect(&central, "CP-1", None);
    cp.boot().await;
    assert!(central.session("CP-1").unwrap().lock().open_transactions().contains(&2));

    let occupied = cp.start("start-3", 2, 100).await;
    assert_eq!(occupied[2], "GenericError");
    assert_eq!(occupied[4]["transactionId"], 2);

    let fresh = cp.start("start-4", 1, 2000).await;
    assert_eq!(fresh[2]["transactionId"], 3);
}
