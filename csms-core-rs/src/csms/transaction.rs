//! Transaction coordinator
//!
//! Owns the book of charging transactions across all charge points. A
//! connector holds at most one Pending or Active transaction; the ledger is
//! written before in-memory state advances, so a ledger outage never leaves
//! memory ahead of what is durable. Writes for one transaction are serialized
//! and re-check its status under the write lock, so a record is never written
//! after its close.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as WriteLock, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::external::{Authorizer, ExternalError, SessionLedger};
use crate::ocpp::session::ChargePointIdentity;
use crate::ocpp::types::{AuthorizationStatus, IdTagInfo, Reason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Connector reserved, ledger not yet written
    Pending,
    Active,
    Stopped,
}

/// Why a transaction ended: the OCPP 1.6 reasons plus central system closure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    DeAuthorized,
    EmergencyStop,
    EVDisconnected,
    HardReset,
    Local,
    Other,
    PowerLoss,
    Reboot,
    Remote,
    SoftReset,
    UnlockCommand,
    /// Charge point stayed offline past the grace period or was closed
    ConnectionLost,
}

impl From<Reason> for StopReason {
    fn from(reason: Reason) -> Self {
        match reason {
            Reason::DeAuthorized => StopReason::DeAuthorized,
            Reason::EmergencyStop => StopReason::EmergencyStop,
            Reason::EVDisconnected => StopReason::EVDisconnected,
            Reason::HardReset => StopReason::HardReset,
            Reason::Local => StopReason::Local,
            Reason::Other => StopReason::Other,
            Reason::PowerLoss => StopReason::PowerLoss,
            Reason::Reboot => StopReason::Reboot,
            Reason::Remote => StopReason::Remote,
            Reason::SoftReset => StopReason::SoftReset,
            Reason::UnlockCommand => StopReason::UnlockCommand,
        }
    }
}

/// A charging transaction. Meter values are in Wh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub transaction_id: i32,
    pub charge_point: ChargePointIdentity,
    pub connector_id: u32,
    pub id_tag: String,
    pub start_meter_value: i64,
    pub current_meter_value: i64,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    pub status: TransactionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_per_kwh: Option<f64>,
}

impl Transaction {
    /// Delivered energy; a meter that went backwards counts as zero
    pub fn energy_wh(&self) -> i64 {
        self.current_meter_value
            .saturating_sub(self.start_meter_value)
            .max(0)
    }

    pub fn cost(&self) -> Option<f64> {
        self.rate_per_kwh
            .map(|rate| self.energy_wh() as f64 / 1000.0 * rate)
    }

    pub fn is_open(&self) -> bool {
        self.status != TransactionStatus::Stopped
    }
}

/// Everything needed to open a transaction
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub charge_point: ChargePointIdentity,
    pub connector_id: u32,
    pub id_tag: String,
    pub meter_start: i64,
    pub timestamp: DateTime<Utc>,
    pub rate_per_kwh: Option<f64>,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("connector {connector_id} is occupied (transaction {transaction_id:?})")]
    ConnectorOccupied {
        connector_id: u32,
        /// None while the other start is still being authorized
        transaction_id: Option<i32>,
    },

    #[error("unknown transaction {0}")]
    Unknown(i32),

    #[error("id tag not accepted: {:?}", .0.status)]
    NotAuthorized(IdTagInfo),

    #[error("ledger unavailable ({operation} transaction {transaction_id}): {source}")]
    LedgerUnavailable {
        operation: &'static str,
        transaction_id: i32,
        source: ExternalError,
    },

    #[error("authorizer failed: {0}")]
    Authorization(#[source] ExternalError),
}

/// Bounded retry for ledger writes
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given failed attempt (1-based), plus up to 50% jitter
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let base = exp.min(self.max_backoff);
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

type ConnectorKey = (ChargePointIdentity, u32);

#[derive(Debug, Default)]
struct Book {
    transactions: HashMap<i32, Transaction>,
    /// Pending (None until an id is allocated) or Active transaction per connector
    connectors: HashMap<ConnectorKey, Option<i32>>,
}

impl Book {
    fn release(&mut self, key: &ConnectorKey, transaction_id: Option<i32>) {
        if self.connectors.get(key) == Some(&transaction_id) {
            self.connectors.remove(key);
        }
        if let Some(id) = transaction_id {
            if self
                .transactions
                .get(&id)
                .is_some_and(|t| t.status == TransactionStatus::Pending)
            {
                self.transactions.remove(&id);
            }
        }
    }
}

pub struct TransactionCoordinator {
    book: Mutex<Book>,
    /// Ledger write lock per open transaction
    writers: Mutex<HashMap<i32, Arc<WriteLock<()>>>>,
    next_id: AtomicI32,
    ledger: Arc<dyn SessionLedger>,
    authorizer: Arc<dyn Authorizer>,
    retry: RetryPolicy,
}

impl TransactionCoordinator {
    pub fn new(
        ledger: Arc<dyn SessionLedger>,
        authorizer: Arc<dyn Authorizer>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            book: Mutex::new(Book::default()),
            writers: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
            ledger,
            authorizer,
            retry,
        }
    }

    /// Start allocating ids at `first_id` (never below ids already handed out)
    pub fn starting_at(self, first_id: i32) -> Self {
        self.next_id.fetch_max(first_id, Ordering::SeqCst);
        self
    }

    pub async fn authorize(&self, id_tag: &str) -> Result<IdTagInfo, ExternalError> {
        self.authorizer.authorize(id_tag).await
    }

    /// Open a transaction on a free connector
    pub async fn start_transaction(
        &self,
        request: StartRequest,
    ) -> Result<Transaction, TransactionError> {
        let key = (request.charge_point.clone(), request.connector_id);

        // Reserve the connector before anything can await
        {
            let mut book = self.book.lock();
            if let Some(holder) = book.connectors.get(&key) {
                return Err(TransactionError::ConnectorOccupied {
                    connector_id: request.connector_id,
                    transaction_id: *holder,
                });
            }
            book.connectors.insert(key.clone(), None);
        }

        let id_tag_info = match self.authorizer.authorize(&request.id_tag).await {
            Ok(info) => info,
            Err(e) => {
                self.book.lock().release(&key, None);
                return Err(TransactionError::Authorization(e));
            }
        };
        if id_tag_info.status != AuthorizationStatus::Accepted {
            self.book.lock().release(&key, None);
            return Err(TransactionError::NotAuthorized(id_tag_info));
        }

        let transaction_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut transaction = Transaction {
            transaction_id,
            charge_point: request.charge_point,
            connector_id: request.connector_id,
            id_tag: request.id_tag,
            start_meter_value: request.meter_start,
            current_meter_value: request.meter_start,
            start_time: request.timestamp,
            stop_time: None,
            stop_reason: None,
            status: TransactionStatus::Pending,
            rate_per_kwh: request.rate_per_kwh,
        };
        {
            let mut book = self.book.lock();
            book.transactions.insert(transaction_id, transaction.clone());
            book.connectors.insert(key.clone(), Some(transaction_id));
        }

        transaction.status = TransactionStatus::Active;
        if let Err(e) = self
            .persist("create", transaction_id, || self.ledger.create(&transaction))
            .await
        {
            self.book.lock().release(&key, Some(transaction_id));
            return Err(e);
        }

        self.book
            .lock()
            .transactions
            .insert(transaction_id, transaction.clone());

        info!(
            charge_point = %transaction.charge_point,
            connector_id = transaction.connector_id,
            transaction_id,
            "Started transaction for {} at {} Wh",
            transaction.id_tag,
            transaction.start_meter_value
        );
        Ok(transaction)
    }

    /// Record the latest energy register reading of an Active transaction
    pub async fn record_meter_value(
        &self,
        transaction_id: i32,
        reading_wh: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), TransactionError> {
        let Some(_write) = self.write_lock(transaction_id).await else {
            return Err(TransactionError::Unknown(transaction_id));
        };

        let updated = {
            let book = self.book.lock();
            match book.transactions.get(&transaction_id) {
                Some(t) if t.status == TransactionStatus::Active => Transaction {
                    current_meter_value: reading_wh,
                    ..t.clone()
                },
                _ => return Err(TransactionError::Unknown(transaction_id)),
            }
        };

        self.persist("update", transaction_id, || self.ledger.update(&updated))
            .await?;

        if let Some(t) = self.book.lock().transactions.get_mut(&transaction_id) {
            t.current_meter_value = reading_wh;
        }
        debug!(transaction_id, reading_wh, %timestamp, "Meter value recorded");
        Ok(())
    }

    /// Stop an Active transaction.
    ///
    /// Stopping one that is already Stopped returns the stored record without
    /// touching the ledger again.
    pub async fn stop_transaction(
        &self,
        transaction_id: i32,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
        reason: StopReason,
    ) -> Result<Transaction, TransactionError> {
        self.stop(transaction_id, Some(meter_stop), timestamp, reason)
            .await
    }

    /// Stop transactions on behalf of a charge point that went away.
    ///
    /// Uses the last recorded meter reading. Transactions the ledger refuses
    /// stay Active and are logged.
    pub async fn force_stop(&self, transaction_ids: &[i32]) -> Vec<Transaction> {
        let mut stopped = Vec::with_capacity(transaction_ids.len());

        for &transaction_id in transaction_ids {
            if !self.is_active(transaction_id) {
                continue;
            }
            match self
                .stop(transaction_id, None, Utc::now(), StopReason::ConnectionLost)
                .await
            {
                Ok(t) => stopped.push(t),
                Err(TransactionError::Unknown(_)) => {}
                Err(e) => error!(transaction_id, "Forced stop failed: {}", e),
            }
        }

        stopped
    }

    /// `meter_stop` of None keeps the last recorded reading
    async fn stop(
        &self,
        transaction_id: i32,
        meter_stop: Option<i64>,
        timestamp: DateTime<Utc>,
        reason: StopReason,
    ) -> Result<Transaction, TransactionError> {
        // None when already Stopped; the book check below answers that
        let _write = self.write_lock(transaction_id).await;

        let stopped = {
            let book = self.book.lock();
            match book.transactions.get(&transaction_id) {
                Some(t) if t.status == TransactionStatus::Stopped => {
                    debug!(transaction_id, "Transaction already stopped");
                    return Ok(t.clone());
                }
                Some(t) if t.status == TransactionStatus::Active => Transaction {
                    current_meter_value: meter_stop.unwrap_or(t.current_meter_value),
                    stop_time: Some(timestamp),
                    stop_reason: Some(reason),
                    status: TransactionStatus::Stopped,
                    ..t.clone()
                },
                _ => return Err(TransactionError::Unknown(transaction_id)),
            }
        };

        if stopped.current_meter_value < stopped.start_meter_value {
            warn!(
                transaction_id,
                meter_start = stopped.start_meter_value,
                meter_stop = stopped.current_meter_value,
                "Meter went backwards, recording zero energy"
            );
        }

        self.persist("close", transaction_id, || self.ledger.close(&stopped))
            .await?;

        {
            let mut book = self.book.lock();
            let key = (stopped.charge_point.clone(), stopped.connector_id);
            book.release(&key, Some(transaction_id));
            book.transactions.insert(transaction_id, stopped.clone());
        }
        // Later writers see Stopped in the book, with or without this lock
        self.writers.lock().remove(&transaction_id);

        info!(
            charge_point = %stopped.charge_point,
            transaction_id,
            reason = ?reason,
            "Stopped transaction, {} Wh delivered",
            stopped.energy_wh()
        );
        Ok(stopped)
    }

    /// Rebuild the book from recovered ledger records
    pub fn restore(&self, transactions: impl IntoIterator<Item = Transaction>) -> usize {
        let mut book = self.book.lock();
        let mut active = 0;

        for transaction in transactions {
            let transaction_id = transaction.transaction_id;
            self.next_id.fetch_max(transaction_id.saturating_add(1), Ordering::SeqCst);

            if transaction.status == TransactionStatus::Active {
                let key = (transaction.charge_point.clone(), transaction.connector_id);
                book.connectors.insert(key, Some(transaction_id));
                active += 1;
            }
            book.transactions.insert(transaction_id, transaction);
        }

        info!(
            "Restored {} transactions ({} active), next id {}",
            book.transactions.len(),
            active,
            self.next_id.load(Ordering::SeqCst)
        );
        active
    }

    pub fn get(&self, transaction_id: i32) -> Option<Transaction> {
        self.book.lock().transactions.get(&transaction_id).cloned()
    }

    pub fn is_active(&self, transaction_id: i32) -> bool {
        self.book
            .lock()
            .transactions
            .get(&transaction_id)
            .is_some_and(|t| t.status == TransactionStatus::Active)
    }

    /// Ids of the Active transactions of one charge point
    pub fn active_for(&self, charge_point: &ChargePointIdentity) -> Vec<i32> {
        let book = self.book.lock();
        let mut ids: Vec<i32> = book
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Active && &t.charge_point == charge_point)
            .map(|t| t.transaction_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.book
            .lock()
            .transactions
            .values()
            .filter(|t| t.status == TransactionStatus::Active)
            .count()
    }

    /// Write lock of an Active transaction, None for any other id
    async fn write_lock(&self, transaction_id: i32) -> Option<OwnedMutexGuard<()>> {
        let lock = {
            let book = self.book.lock();
            let active = book
                .transactions
                .get(&transaction_id)
                .is_some_and(|t| t.status == TransactionStatus::Active);
            if !active {
                return None;
            }
            Arc::clone(self.writers.lock().entry(transaction_id).or_default())
        };
        Some(lock.lock_owned().await)
    }

    async fn persist<F, Fut>(
        &self,
        operation: &'static str,
        transaction_id: i32,
        mut write: F,
    ) -> Result<(), TransactionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ExternalError>>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match write().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        transaction_id,
                        "Ledger {} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation,
                        attempt,
                        attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(transaction_id, "Ledger {} failed after {} attempts: {}", operation, attempts, e);
                    return Err(TransactionError::LedgerUnavailable {
                        operation,
                        transaction_id,
                        source: e,
                    });
                }
            }
        }
    }
}
