//! Configuration for the central system
//!
//! Session timers, registration answers and the WebSocket listener.

use std::net::SocketAddr;
use std::time::Duration;

use crate::csms::transaction::RetryPolicy;

/// Complete central system configuration
#[derive(Debug, Clone)]
pub struct CsmsConfig {
    /// Heartbeat interval handed out in accepted BootNotifications (seconds)
    pub heartbeat_interval: u32,

    /// Interval handed out in rejected/pending BootNotifications (seconds)
    pub boot_retry_interval: u32,

    /// How long an outbound call waits for the charge point
    pub response_timeout: Duration,

    /// How long an Offline session keeps its transactions open
    pub offline_grace: Duration,

    /// Consecutive undecodable frames before the connection is dropped
    pub max_malformed_frames: u32,

    /// A connection silent for this many heartbeat intervals is considered
    /// lost. 0 disables the check.
    pub liveness_factor: u32,

    /// First transaction id handed out on an empty ledger
    pub first_transaction_id: i32,

    /// Ledger write retry
    pub ledger_retry: RetryPolicy,

    pub server: ServerConfig,
}

/// WebSocket listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,

    /// URL path before the charge point identity
    pub path_prefix: String,

    /// Subprotocol offered by charge points
    pub subprotocol: String,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 300,
            boot_retry_interval: 60,
            response_timeout: Duration::from_secs(30),
            offline_grace: Duration::from_secs(300),
            max_malformed_frames: 3,
            liveness_factor: 3,
            first_transaction_id: 1,
            ledger_retry: RetryPolicy::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            path_prefix: "/ocpp/".to_string(),
            subprotocol: "ocpp1.6".to_string(),
            max_message_size: 64 * 1024,
        }
    }
}

impl CsmsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set heartbeat interval (seconds)
    pub fn with_heartbeat_interval(mut self, seconds: u32) -> Self {
        self.heartbeat_interval = seconds;
        self
    }

    /// Set boot retry interval (seconds)
    pub fn with_boot_retry_interval(mut self, seconds: u32) -> Self {
        self.boot_retry_interval = seconds;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_offline_grace(mut self, grace: Duration) -> Self {
        self.offline_grace = grace;
        self
    }

    pub fn with_max_malformed_frames(mut self, max: u32) -> Self {
        self.max_malformed_frames = max;
        self
    }

    pub fn with_liveness_factor(mut self, factor: u32) -> Self {
        self.liveness_factor = factor;
        self
    }

    pub fn with_first_transaction_id(mut self, id: i32) -> Self {
        self.first_transaction_id = id;
        self
    }

    pub fn with_ledger_retry(mut self, retry: RetryPolicy) -> Self {
        self.ledger_retry = retry;
        self
    }

    /// Set listen address
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.server.listen_addr = addr;
        self
    }

    /// Silence after which a connection counts as lost
    pub fn liveness_timeout(&self, heartbeat_interval: u32) -> Option<Duration> {
        if self.liveness_factor == 0 || heartbeat_interval == 0 {
            return None;
        }
        Some(Duration::from_secs(
            u64::from(heartbeat_interval) * u64::from(self.liveness_factor),
        ))
    }
}
