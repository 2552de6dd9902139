//! Central system side of the session core
//!
//! - `registry`: who is connected, and in what state
//! - `dispatcher`: inbound call handlers
//! - `transaction`: charging transactions and the ledger
//! - `connection`: per-connection receive loop

pub mod connection;
pub mod dispatcher;
pub mod registry;
pub mod transaction;

pub use connection::{run_connection, ConnectionEnd, Transport, TransportPeer};
pub use dispatcher::{Action, Dispatcher, HandlerError};
pub use registry::SessionRegistry;
pub use transaction::{
    RetryPolicy, StartRequest, StopReason, Transaction, TransactionCoordinator, TransactionError,
    TransactionStatus,
};
