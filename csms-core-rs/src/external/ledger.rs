//! Session ledger implementations
//!
//! - `InMemoryLedger`: map of records, with switchable failures for tests
//! - `JsonlLedger`: append-only JSON lines file with crash recovery

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{ExternalError, SessionLedger};
use crate::csms::transaction::Transaction;

/// Ledger write kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LedgerOp {
    Create,
    Update,
    Close,
}

/// In-memory ledger
#[derive(Debug)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<i32, Transaction>>,
    operations: Mutex<Vec<(LedgerOp, i32)>>,
    available: AtomicBool,
    fail_next: AtomicU32,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            operations: Mutex::new(Vec::new()),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Simulate an outage: every write fails while unavailable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` writes, then recover
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, transaction_id: i32) -> Option<Transaction> {
        self.records.lock().get(&transaction_id).cloned()
    }

    pub fn records(&self) -> Vec<Transaction> {
        let mut records: Vec<Transaction> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|t| t.transaction_id);
        records
    }

    /// Successful writes, oldest first
    pub fn operations(&self) -> Vec<(LedgerOp, i32)> {
        self.operations.lock().clone()
    }

    fn write(&self, op: LedgerOp, transaction: &Transaction) -> Result<(), ExternalError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ExternalError::Unavailable("ledger offline".into()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ExternalError::Unavailable("injected failure".into()));
        }

        self.records
            .lock()
            .insert(transaction.transaction_id, transaction.clone());
        self.operations.lock().push((op, transaction.transaction_id));
        Ok(())
    }
}

#[async_trait]
impl SessionLedger for InMemoryLedger {
    async fn create(&self, transaction: &Transaction) -> Result<(), ExternalError> {
        self.write(LedgerOp::Create, transaction)
    }

    async fn update(&self, transaction: &Transaction) -> Result<(), ExternalError> {
        self.write(LedgerOp::Update, transaction)
    }

    async fn close(&self, transaction: &Transaction) -> Result<(), ExternalError> {
        self.write(LedgerOp::Close, transaction)
    }
}

/// One line of the ledger file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    op: LedgerOp,
    at: DateTime<Utc>,
    transaction: Transaction,
}

/// Append-only ledger in a JSON lines file.
///
/// Writes and fsyncs run on the blocking pool.
#[derive(Debug)]
pub struct JsonlLedger {
    path: PathBuf,
    sync_on_write: bool,
    file: Arc<Mutex<BufWriter<File>>>,
}

impl JsonlLedger {
    /// Open (or create) the ledger file for appending
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Ledger: Opened {:?} (size={})", path, file.metadata()?.len());

        Ok(Self {
            path,
            sync_on_write: true,
            file: Arc::new(Mutex::new(BufWriter::new(file))),
        })
    }

    /// Skip fsync after each line
    pub fn without_sync(mut self) -> Self {
        self.sync_on_write = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the file and return the latest record of every transaction,
    /// ordered by id. Unparseable lines are logged and skipped.
    pub fn recover(path: impl AsRef<Path>) -> io::Result<Vec<Transaction>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(path)?);
        let mut latest: BTreeMap<i32, Transaction> = BTreeMap::new();
        let mut line_num = 0;

        for line in reader.lines() {
            line_num += 1;
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    warn!("Ledger: read error at line {}: {}", line_num, e);
                    break;
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => {
                    latest.insert(entry.transaction.transaction_id, entry.transaction);
                }
                Err(e) => {
                    warn!("Ledger: parse error at line {}: {} - {}", line_num, e, line);
                }
            }
        }

        info!(
            "Ledger: Replayed {} lines, {} transactions recovered",
            line_num,
            latest.len()
        );
        Ok(latest.into_values().collect())
    }

    async fn append(&self, op: LedgerOp, transaction: &Transaction) -> Result<(), ExternalError> {
        let entry = LedgerEntry {
            op,
            at: Utc::now(),
            transaction: transaction.clone(),
        };
        let data = serde_json::to_string(&entry)?;
        let file = Arc::clone(&self.file);
        let sync_on_write = self.sync_on_write;

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut file = file.lock();
            writeln!(file, "{}", data)?;
            file.flush()?;
            if sync_on_write {
                file.get_ref().sync_data()?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ExternalError::Unavailable(format!("ledger writer stopped: {}", e)))??;
        Ok(())
    }
}

#[async_trait]
impl SessionLedger for JsonlLedger {
    async fn create(&self, transaction: &Transaction) -> Result<(), ExternalError> {
        self.append(LedgerOp::Create, transaction).await
    }

    async fn update(&self, transaction: &Transaction) -> Result<(), ExternalError> {
        self.append(LedgerOp::Update, transaction).await
    }

    async fn close(&self, transaction: &Transaction) -> Result<(), ExternalError> {
        self.append(LedgerOp::Close, transaction).await
    }
}
