//! # CSMS Core
//!
//! Session core of an OCPP 1.6-J central system.
//!
//! Tracks charge points over long-lived, unreliable WebSocket connections:
//! who is connected, what they may do in their current state, which calls
//! are in flight, and which charging transactions are open.
//!
//! ## Architecture
//!
//! ```text
//! Charge points
//!       │ WebSocket, OCPP-J arrays
//!       ▼
//! ┌─────────────────────────────────────┐
//! │    server (tokio-tungstenite)       │
//! └─────────────┬───────────────────────┘
//!               │ Transport (channels)
//!               ▼
//! ┌─────────────────────────────────────┐
//! │    central                          │
//! │  ┌──────────┐  ┌────────────────┐   │
//! │  │ Registry │  │  Dispatcher    │   │
//! │  │ sessions │  │ Action × State │   │
//! │  └────┬─────┘  └───────┬────────┘   │
//! │       └───► Coordinator ◄───┘       │
//! └─────────────┬───────────────────────┘
//!               ▼
//!  StationDirectory │ SessionLedger │ Authorizer
//! ```
//!
//! ## Session States
//!
//! | State | Entered on | Accepts |
//! |-------|-----------|---------|
//! | Connecting | transport open | BootNotification |
//! | PendingRegistration | boot Pending | BootNotification |
//! | Online | boot Accepted | everything |
//! | Offline | transport lost while Online | (nothing, grace timer running) |
//! | Closed | grace expiry, fatal error, deregistration | (nothing) |
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use csms_core::{CentralSystem, CsmsConfig, Server, StationsFile};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (directory, authorizer) = StationsFile::load("stations.json")?.into_parts();
//!
//!     let central = CentralSystem::builder()
//!         .config(CsmsConfig::new().with_heartbeat_interval(60))
//!         .directory(Arc::new(directory))
//!         .authorizer(Arc::new(authorizer))
//!         .build();
//!
//!     Server::bind(Arc::new(central)).await?.run().await?;
//!     Ok(())
//! }
//! ```

pub mod ocpp;
pub mod csms;
pub mod external;
pub mod config;
pub mod error;
pub mod central;
pub mod server;

pub use config::{CsmsConfig, ServerConfig};
pub use central::{Accepted, CentralSystem, CentralSystemBuilder};
pub use error::{CsmsError, IdentityConflict, ProtocolViolation};
pub use server::Server;

// Re-export key types
pub use ocpp::{
    Call, CallError, CallFailure, CallResult, ChargePointIdentity, ErrorCode, Frame, SessionRef,
    SessionState,
};
pub use csms::{
    Action, ConnectionEnd, SessionRegistry, StopReason, Transaction, TransactionCoordinator,
    TransactionStatus, Transport, TransportPeer,
};
pub use external::{
    Authorizer, InMemoryLedger, JsonlLedger, SessionLedger, StaticAuthorizer, StaticDirectory,
    StationDirectory, StationInfo, StationsFile,
};
