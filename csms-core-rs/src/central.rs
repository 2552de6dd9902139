//! Central system facade
//!
//! Wires the directory, ledger and authorizer into a registry, a transaction
//! coordinator and a dispatcher, and hands out connections to them.
//!
//! ```text
//!  transport (WebSocket / channels)
//!        │ accept(identity, password)
//!        ▼
//! ┌──────────────────────────────┐
//! │ CentralSystem                │
//! │  ┌──────────┐ ┌───────────┐  │
//! │  │ Registry │ │Dispatcher │  │
//! │  └────┬─────┘ └─────┬─────┘  │
//! │       └──► Coordinator ◄┘    │
//! └───────────────┬──────────────┘
//!                 ▼
//!   Directory · Ledger · Authorizer
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::CsmsConfig;
use crate::csms::connection::{run_connection, ConnectionEnd, Transport};
use crate::csms::dispatcher::Dispatcher;
use crate::csms::registry::SessionRegistry;
use crate::csms::transaction::{Transaction, TransactionCoordinator};
use crate::error::CsmsError;
use crate::external::{
    Authorizer, InMemoryLedger, SessionLedger, StaticAuthorizer, StaticDirectory, StationDirectory,
};
use crate::ocpp::correlation::CallFailure;
use crate::ocpp::session::{ChargePointIdentity, ConnectionHandle, SessionRef};
use crate::ocpp::types::OutboundRequest;

/// A connection admitted to the registry, not yet running
#[derive(Debug)]
pub struct Accepted {
    pub session: SessionRef,
    pub connection: ConnectionHandle,
}

pub struct CentralSystem {
    config: CsmsConfig,
    directory: Arc<dyn StationDirectory>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl CentralSystem {
    pub fn builder() -> CentralSystemBuilder {
        CentralSystemBuilder::new()
    }

    pub fn config(&self) -> &CsmsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        self.registry.coordinator()
    }

    pub fn session(&self, identity: &str) -> Option<SessionRef> {
        self.registry.lookup(identity)
    }

    /// Check HTTP Basic credentials against the directory.
    ///
    /// `Ok(true)` when the station has an auth key and the password matches it,
    /// `Ok(false)` when the station has no key (or is unknown). A wrong or
    /// missing password for a keyed station is `Unauthorized`.
    pub async fn authenticate(
        &self,
        identity: &ChargePointIdentity,
        password: Option<&str>,
    ) -> Result<bool, CsmsError> {
        let station = self.directory.find_by_identity(identity).await?;

        match station.and_then(|s| s.auth_key) {
            Some(key) if password == Some(key.as_str()) => Ok(true),
            Some(_) => Err(CsmsError::Unauthorized(identity.clone())),
            None => Ok(false),
        }
    }

    /// Admit a new transport for `identity`.
    ///
    /// Resumes an Offline session, supersedes a live one when the credentials
    /// check out, and otherwise refuses with `IdentityConflict`.
    pub async fn accept(
        &self,
        identity: ChargePointIdentity,
        password: Option<&str>,
        outgoing: mpsc::UnboundedSender<String>,
    ) -> Result<Accepted, CsmsError> {
        let authenticated = self.authenticate(&identity, password).await?;
        let connection = ConnectionHandle::new(outgoing);
        let session = self
            .registry
            .attach(identity, connection.clone(), authenticated)?;

        Ok(Accepted {
            session,
            connection,
        })
    }

    /// Drive an accepted connection until it ends
    pub async fn run(&self, accepted: Accepted, incoming: mpsc::Receiver<String>) -> ConnectionEnd {
        run_connection(
            Arc::clone(&self.registry),
            Arc::clone(&self.dispatcher),
            accepted.session,
            accepted.connection,
            incoming,
        )
        .await
    }

    /// Accept and run a transport in one go
    pub async fn serve(
        &self,
        identity: impl Into<ChargePointIdentity>,
        password: Option<&str>,
        transport: Transport,
    ) -> Result<ConnectionEnd, CsmsError> {
        let identity = identity.into();
        let accepted = match self.accept(identity.clone(), password, transport.outgoing).await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(%identity, "Connection refused: {}", e);
                return Err(e);
            }
        };
        Ok(self.run(accepted, transport.incoming).await)
    }

    /// Send a typed request to a connected charge point
    pub async fn send<R: OutboundRequest>(
        &self,
        identity: &str,
        request: &R,
    ) -> Result<R::Response, CallFailure> {
        let session = self.registry.lookup(identity).ok_or(CallFailure::NotConnected)?;
        session.send(request).await
    }

    /// Remove a charge point, stopping its open transactions
    pub async fn deregister(&self, identity: &ChargePointIdentity) -> bool {
        self.registry.remove(identity).await.is_some()
    }

    /// Close every session. Open transactions stay Active in the ledger.
    pub fn shutdown(&self) {
        info!(
            sessions = self.registry.len(),
            active = self.coordinator().active_count(),
            "Central system shutting down"
        );
        self.registry.shutdown();
    }
}

/// Builder for the central system
pub struct CentralSystemBuilder {
    config: CsmsConfig,
    directory: Option<Arc<dyn StationDirectory>>,
    ledger: Option<Arc<dyn SessionLedger>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    restore: Vec<Transaction>,
}

impl CentralSystemBuilder {
    pub fn new() -> Self {
        Self {
            config: CsmsConfig::default(),
            directory: None,
            ledger: None,
            authorizer: None,
            restore: Vec::new(),
        }
    }

    pub fn config(mut self, config: CsmsConfig) -> Self {
        self.config = config;
        self
    }

    /// Defaults to an empty directory (every boot is rejected)
    pub fn directory(mut self, directory: Arc<dyn StationDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Defaults to an in-memory ledger
    pub fn ledger(mut self, ledger: Arc<dyn SessionLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Defaults to accepting every id tag
    pub fn authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Transactions recovered from the ledger
    pub fn restore(mut self, transactions: impl IntoIterator<Item = Transaction>) -> Self {
        self.restore.extend(transactions);
        self
    }

    pub fn build(self) -> CentralSystem {
        let config = self.config;
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticDirectory::default()));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(InMemoryLedger::new()));
        let authorizer = self
            .authorizer
            .unwrap_or_else(|| Arc::new(StaticAuthorizer::accept_all()));

        let coordinator = TransactionCoordinator::new(ledger, authorizer, config.ledger_retry.clone())
            .starting_at(config.first_transaction_id);
        if !self.restore.is_empty() {
            coordinator.restore(self.restore);
        }
        let coordinator = Arc::new(coordinator);

        let registry = SessionRegistry::new(Arc::clone(&coordinator), config.clone());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&directory),
            coordinator,
            config.clone(),
        ));

        CentralSystem {
            config,
            directory,
            registry,
            dispatcher,
        }
    }
}

impl Default for CentralSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
