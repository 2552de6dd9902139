//! Session registry
//!
//! The single owner of charge point sessions, keyed by identity. Connects,
//! disconnects and closures for one identity serialize on the registry lock.
//!
//! Lock order is registry, then session. Forced transaction stops run after
//! both locks are released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::transaction::TransactionCoordinator;
use crate::config::CsmsConfig;
use crate::error::IdentityConflict;
use crate::ocpp::session::{
    ChargePointIdentity, ChargePointSession, ConnectionHandle, SessionEvent, SessionHandle,
    SessionRef, SessionState,
};

pub struct SessionRegistry {
    sessions: Mutex<HashMap<ChargePointIdentity, SessionRef>>,
    coordinator: Arc<TransactionCoordinator>,
    config: CsmsConfig,
}

impl SessionRegistry {
    pub fn new(coordinator: Arc<TransactionCoordinator>, config: CsmsConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            coordinator,
            config,
        })
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &CsmsConfig {
        &self.config
    }

    /// Add a session. Fails while another live session holds the identity.
    pub fn register(&self, session: SessionRef) -> Result<(), IdentityConflict> {
        let identity = session.identity().clone();
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(&identity) {
            if existing.state() != SessionState::Closed {
                return Err(IdentityConflict(identity));
            }
        }

        sessions.insert(identity, session);
        Ok(())
    }

    pub fn lookup(&self, identity: &str) -> Option<SessionRef> {
        self.sessions.lock().get(identity).cloned()
    }

    pub fn sessions(&self) -> Vec<SessionRef> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Bind a new transport to the identity.
    ///
    /// - no session (or a Closed one): a fresh `Connecting` session
    /// - `Offline`: resumed in place
    /// - live and `authenticated`: the old transport is closed and replaced
    /// - live otherwise: `IdentityConflict`
    pub fn attach(
        &self,
        identity: ChargePointIdentity,
        connection: ConnectionHandle,
        authenticated: bool,
    ) -> Result<SessionRef, IdentityConflict> {
        let restored = self.coordinator.active_for(&identity);
        let connection_id = connection.id();
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get(&identity) {
            let mut session = existing.lock();
            match session.state() {
                SessionState::Offline => {
                    if let Err(e) = session.handle_event(SessionEvent::Reconnected { connection }) {
                        warn!(%identity, "Resume failed: {}", e);
                        return Err(IdentityConflict(identity));
                    }
                    info!(
                        %identity,
                        connection_id,
                        open = session.open_transactions().len(),
                        "Charge point reconnected within grace period"
                    );
                    return Ok(existing.clone());
                }
                SessionState::Closed => {}
                state if authenticated => {
                    if let Some(old) = session.replace_connection(connection) {
                        old.close();
                    }
                    warn!(%identity, connection_id, "New connection supersedes live {} session", state);
                    return Ok(existing.clone());
                }
                state => {
                    warn!(%identity, "Refusing second connection for live {} session", state);
                    return Err(IdentityConflict(identity));
                }
            }
        }

        let session = SessionHandle::new(
            ChargePointSession::new(identity.clone(), connection, self.config.heartbeat_interval),
            self.config.response_timeout,
        );
        if !restored.is_empty() {
            let mut inner = session.lock();
            for transaction_id in &restored {
                inner.track_transaction(*transaction_id);
            }
            info!(%identity, "Adopted open transactions {:?}", restored);
        }

        sessions.insert(identity.clone(), session.clone());
        debug!(%identity, connection_id, "Session registered");
        Ok(session)
    }

    /// Transport of `connection_id` is gone. Ignored if that connection was
    /// already replaced.
    pub async fn connection_lost(self: &Arc<Self>, identity: &ChargePointIdentity, connection_id: u64) {
        let Some(session) = self.lookup(identity.as_str()) else {
            return;
        };

        let orphaned = {
            let mut inner = session.lock();
            if inner.connection_id() != Some(connection_id) {
                debug!(%identity, connection_id, "Ignoring loss of a replaced connection");
                return;
            }

            match inner.handle_event(SessionEvent::TransportLost) {
                Ok(SessionState::Offline) => {
                    let generation = inner.offline_generation();
                    let grace = self.config.offline_grace;
                    let registry = Arc::clone(self);
                    let timer_identity = identity.clone();
                    let timer = tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        registry.expire_grace(&timer_identity, generation).await;
                    });
                    inner.arm_grace_timer(generation, timer.abort_handle());

                    info!(
                        %identity,
                        open = inner.open_transactions().len(),
                        "Charge point offline, grace period {:?}",
                        grace
                    );
                    return;
                }
                Ok(_) => inner.take_open_transactions(),
                Err(e) => {
                    warn!(%identity, "Transport loss not applied: {}", e);
                    return;
                }
            }
        };

        self.forget(&session);
        self.stop_orphans(identity, orphaned).await;
    }

    /// Close the session after a fatal protocol error on `connection_id`
    pub async fn close(&self, identity: &ChargePointIdentity, connection_id: u64) {
        let Some(session) = self.lookup(identity.as_str()) else {
            return;
        };

        let orphaned = {
            let mut inner = session.lock();
            if inner.connection_id() != Some(connection_id) {
                return;
            }
            if let Err(e) = inner.handle_event(SessionEvent::Close) {
                warn!(%identity, "Close not applied: {}", e);
                return;
            }
            inner.take_open_transactions()
        };

        warn!(%identity, connection_id, "Session closed");
        self.forget(&session);
        self.stop_orphans(identity, orphaned).await;
    }

    /// Deregister a charge point: close its session and stop its transactions
    pub async fn remove(&self, identity: &ChargePointIdentity) -> Option<SessionRef> {
        let session = self.sessions.lock().remove(identity.as_str())?;

        let orphaned = {
            let mut inner = session.lock();
            if inner.state() != SessionState::Closed {
                if let Err(e) = inner.handle_event(SessionEvent::Close) {
                    warn!(%identity, "Close not applied: {}", e);
                }
            }
            inner.take_open_transactions()
        };

        info!(%identity, "Charge point deregistered");
        self.stop_orphans(identity, orphaned).await;
        Some(session)
    }

    async fn expire_grace(&self, identity: &ChargePointIdentity, generation: u64) {
        let Some(session) = self.lookup(identity.as_str()) else {
            return;
        };

        let orphaned = {
            let mut inner = session.lock();
            if inner.state() != SessionState::Offline || inner.offline_generation() != generation {
                debug!(%identity, generation, "Stale grace timer");
                return;
            }
            if let Err(e) = inner.handle_event(SessionEvent::GraceExpired) {
                warn!(%identity, "Grace expiry not applied: {}", e);
                return;
            }
            inner.take_open_transactions()
        };

        warn!(
            %identity,
            "Grace period expired with {} open transactions",
            orphaned.len()
        );
        self.forget(&session);
        self.stop_orphans(identity, orphaned).await;
    }

    /// Close every session without stopping transactions; they stay Active
    /// in the ledger for the next start.
    pub fn shutdown(&self) {
        let sessions: Vec<SessionRef> = self.sessions.lock().drain().map(|(_, s)| s).collect();

        for session in sessions {
            let mut inner = session.lock();
            if inner.state() != SessionState::Closed {
                if let Err(e) = inner.handle_event(SessionEvent::Close) {
                    warn!(identity = %session.identity(), "Close not applied: {}", e);
                }
            }
            let open = inner.take_open_transactions();
            if !open.is_empty() {
                info!(identity = %session.identity(), "Leaving transactions {:?} open", open);
            }
        }
    }

    /// Drop a closed session from the map unless a newer one took its place
    fn forget(&self, session: &SessionRef) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(session.identity())
            .is_some_and(|current| Arc::ptr_eq(current, session))
        {
            sessions.remove(session.identity());
        }
    }

    async fn stop_orphans(&self, identity: &ChargePointIdentity, transaction_ids: Vec<i32>) {
        if transaction_ids.is_empty() {
            return;
        }
        let stopped = self.coordinator.force_stop(&transaction_ids).await;
        info!(
            %identity,
            "Force-stopped {}/{} transactions",
            stopped.len(),
            transaction_ids.len()
        );
    }
}
