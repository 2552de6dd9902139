//! Collaborators outside the session core
//!
//! The core consumes three services and never cares how they are backed:
//! - `StationDirectory`: which charge points exist and what they look like
//! - `SessionLedger`: durable record of charging transactions
//! - `Authorizer`: id tag decisions
//!
//! The implementations here are the small ones the node ships with.

pub mod authorizer;
pub mod directory;
pub mod ledger;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::csms::transaction::Transaction;
use crate::ocpp::session::ChargePointIdentity;
use crate::ocpp::types::IdTagInfo;

pub use authorizer::StaticAuthorizer;
pub use directory::{StaticDirectory, StationsFile};
pub use ledger::{InMemoryLedger, JsonlLedger};

#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Directory entry for one charge point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationInfo {
    pub identity: ChargePointIdentity,
    #[serde(default)]
    pub name: String,
    pub vendor: String,
    pub model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_connectors")]
    pub connectors: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_per_kwh: Option<f64>,
    /// HTTP Basic password the charge point must present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_connectors() -> u32 {
    1
}

#[async_trait]
pub trait StationDirectory: Send + Sync {
    async fn find_by_identity(
        &self,
        identity: &ChargePointIdentity,
    ) -> Result<Option<StationInfo>, ExternalError>;
}

#[async_trait]
pub trait SessionLedger: Send + Sync {
    /// Record a transaction that just became Active
    async fn create(&self, transaction: &Transaction) -> Result<(), ExternalError>;

    /// Record a new meter reading
    async fn update(&self, transaction: &Transaction) -> Result<(), ExternalError>;

    /// Record the stopped transaction
    async fn close(&self, transaction: &Transaction) -> Result<(), ExternalError>;
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, id_tag: &str) -> Result<IdTagInfo, ExternalError>;
}
