//! Per-connection receive loop
//!
//! One task per transport. It waits on:
//! - frames from the charge point
//! - replies from the inbound call handler
//! - the outbound call deadline
//! - the liveness deadline
//! - the shutdown signal (superseded, closed by the registry)
//!
//! Inbound calls are handled on their own task so responses to our outbound
//! calls keep flowing while a handler waits on the ledger.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::dispatcher::Dispatcher;
use super::registry::SessionRegistry;
use crate::ocpp::messages::{decode, CallError, ErrorCode, Frame};
use crate::ocpp::session::{ConnectionHandle, SessionRef};

/// Raw text frames to and from one charge point.
///
/// Dropping the sender behind `incoming` signals that the transport is gone.
#[derive(Debug)]
pub struct Transport {
    pub incoming: mpsc::Receiver<String>,
    pub outgoing: mpsc::UnboundedSender<String>,
}

/// The charge point side of an in-process transport
#[derive(Debug)]
pub struct TransportPeer {
    pub to_csms: mpsc::Sender<String>,
    pub from_csms: mpsc::UnboundedReceiver<String>,
}

impl Transport {
    pub fn pair(buffer: usize) -> (Transport, TransportPeer) {
        let (to_csms, incoming) = mpsc::channel(buffer);
        let (outgoing, from_csms) = mpsc::unbounded_channel();
        (
            Transport { incoming, outgoing },
            TransportPeer { to_csms, from_csms },
        )
    }
}

/// Why a connection loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// Charge point side went away
    TransportClosed,
    /// Nothing received within the liveness window
    Idle,
    /// Too many consecutive undecodable frames
    MalformedFrames,
    /// Superseded or closed by the registry
    Shutdown,
}

/// Drive one connection until it ends, then report the end to the registry
pub async fn run_connection(
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    session: SessionRef,
    connection: ConnectionHandle,
    mut incoming: mpsc::Receiver<String>,
) -> ConnectionEnd {
    let identity = session.identity().clone();
    let connection_id = connection.id();
    let max_malformed = registry.config().max_malformed_frames.max(1);

    let (reply_tx, mut reply_rx) = mpsc::channel::<(String, Frame)>(4);
    let mut malformed = 0u32;
    let mut last_seen = Instant::now();

    info!(%identity, connection_id, "Connection task started");

    let end = loop {
        let (deadline, heartbeat_interval) = {
            let inner = session.lock();
            (inner.tracker().next_deadline(), inner.heartbeat_interval())
        };
        let idle_deadline = registry
            .config()
            .liveness_timeout(heartbeat_interval)
            .map(|timeout| last_seen + timeout);

        tokio::select! {
            _ = connection.closed() => break ConnectionEnd::Shutdown,

            _ = connection.rearmed() => continue,

            text = incoming.recv() => {
                let Some(text) = text else {
                    break ConnectionEnd::TransportClosed;
                };
                last_seen = Instant::now();
                debug!(%identity, "Received: {}", text);

                match decode(&text) {
                    Ok(frame) => {
                        malformed = 0;
                        handle_frame(&dispatcher, &session, &connection, &reply_tx, frame);
                    }
                    Err(e) => {
                        malformed += 1;
                        warn!(%identity, malformed, "Malformed frame: {}", e);

                        if let Some(unique_id) = e.call_unique_id() {
                            let error = CallError::new(unique_id, ErrorCode::FormationViolation, e.to_string());
                            connection.send(&Frame::CallError(error));
                        }
                        if malformed >= max_malformed {
                            break ConnectionEnd::MalformedFrames;
                        }
                    }
                }
            }

            Some((unique_id, reply)) = reply_rx.recv() => {
                let current = session.lock().tracker_mut().finish_inbound(&unique_id);
                if current {
                    connection.send(&reply);
                } else {
                    debug!(%identity, %unique_id, "Dropping reply for a call no longer in flight");
                }
            }

            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                session.lock().tracker_mut().expire_overdue(Instant::now());
            }

            _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                warn!(%identity, "No traffic within the liveness window");
                break ConnectionEnd::Idle;
            }
        }
    };

    info!(%identity, connection_id, "Connection ended: {:?}", end);

    match end {
        ConnectionEnd::TransportClosed | ConnectionEnd::Idle => {
            registry.connection_lost(&identity, connection_id).await;
        }
        ConnectionEnd::MalformedFrames => {
            registry.close(&identity, connection_id).await;
        }
        ConnectionEnd::Shutdown => {}
    }

    end
}

fn handle_frame(
    dispatcher: &Arc<Dispatcher>,
    session: &SessionRef,
    connection: &ConnectionHandle,
    reply_tx: &mpsc::Sender<(String, Frame)>,
    frame: Frame,
) {
    let call = match frame {
        Frame::Call(call) => call,
        response => {
            session.lock().tracker_mut().resolve(response);
            return;
        }
    };

    let begun = session.lock().tracker_mut().begin_inbound(&call.unique_id);
    if let Err(violation) = begun {
        warn!(identity = %session.identity(), "{}", violation);
        let error = CallError::new(call.unique_id, violation.error_code(), violation.to_string());
        connection.send(&Frame::CallError(error));
        return;
    }

    let dispatcher = Arc::clone(dispatcher);
    let session = Arc::clone(session);
    let reply_tx = reply_tx.clone();
    tokio::spawn(async move {
        let unique_id = call.unique_id.clone();
        let reply = dispatcher.dispatch(&session, call).await;
        if reply_tx.send((unique_id, reply)).await.is_err() {
            debug!(identity = %session.identity(), "Connection ended before the reply was ready");
        }
    });
}
