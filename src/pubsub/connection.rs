//! Connection lifecycle
//!
//! [`ConnectionManager`] owns the broker session and hands it out as an
//! epoch-tagged [`EpochConnection`]. Every successful dial produces a new
//! epoch, so a consumer holding a handle from a dead session can tell it is
//! stale instead of silently talking to its replacement.
//!
//! The connected signal is level-triggered: it is the current value of a
//! `watch` channel, so late waiters observe it immediately and a waiter that
//! saw epoch N fail simply waits for a status carrying another epoch.

use super::drain::{DrainGroup, DrainGuard};
use crate::config::ConnectionConfig;
use crate::error::PubSubError;
use crate::transport::{Connector, Session, TransportError};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection state owned by the [`ConnectionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A session tagged with the epoch that produced it
#[derive(Clone)]
pub struct EpochConnection {
    epoch: u64,
    session: Arc<dyn Session>,
    lost: CancellationToken,
}

impl EpochConnection {
    fn new(epoch: u64, session: Arc<dyn Session>) -> Self {
        Self {
            epoch,
            session,
            lost: CancellationToken::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// True once the session closed or the epoch was reported lost
    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled() || self.session.is_closed()
    }

    /// Resolves when the session closes or the epoch is reported lost
    pub async fn lost(&self) {
        tokio::select! {
            _ = self.session.closed() => {}
            _ = self.lost.cancelled() => {}
        }
    }
}

impl fmt::Debug for EpochConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochConnection")
            .field("epoch", &self.epoch)
            .field("lost", &self.is_lost())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct Status {
    state: ConnectionState,
    current: Option<EpochConnection>,
}

impl Status {
    fn live(&self) -> Option<&EpochConnection> {
        match (&self.state, &self.current) {
            (ConnectionState::Connected, Some(conn)) if !conn.is_lost() => Some(conn),
            _ => None,
        }
    }

    fn is_shutting_down(&self) -> bool {
        matches!(self.state, ConnectionState::Closing | ConnectionState::Closed)
    }
}

/// Point-in-time view of the manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub state: ConnectionState,
    pub epoch: Option<u64>,
    pub reconnects: u64,
    pub publishes_in_flight: usize,
    pub active_subscriptions: usize,
}

/// Owns the broker connection, its signals and the close sequence
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    connect_lock: Mutex<()>,
    status: watch::Sender<Status>,
    closing: CancellationToken,
    closed: AtomicBool,
    epochs: AtomicU64,
    reconnects: AtomicU64,
    publishing: DrainGroup,
    subscribing: DrainGroup,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, PubSubError> {
        config.validate()?;

        let (status, _rx) = watch::channel(Status {
            state: ConnectionState::Disconnected,
            current: None,
        });

        Ok(Self {
            config,
            connector,
            connect_lock: Mutex::new(()),
            status,
            closing: CancellationToken::new(),
            closed: AtomicBool::new(false),
            epochs: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            publishing: DrainGroup::new("publishing"),
            subscribing: DrainGroup::new("subscribing"),
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Dial the broker and raise the connected signal
    pub async fn connect(&self) -> Result<(), PubSubError> {
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }
        let _lock = self.connect_lock.lock().await;
        if self.is_closed() {
            return Err(PubSubError::Closed);
        }
        if self.is_connected() {
            return Err(PubSubError::AlreadyConnected);
        }

        self.dial_locked().await.map(|_| ())
    }

    /// Must be called with `connect_lock` held
    async fn dial_locked(&self) -> Result<EpochConnection, PubSubError> {
        let options = self.config.connect_options()?;

        let mut previous = ConnectionState::Disconnected;
        self.status.send_if_modified(|status| {
            if status.is_shutting_down() {
                return false;
            }
            previous = status.state;
            status.state = ConnectionState::Connecting;
            true
        });

        debug!(network = %options.network, addr = %options.addr, "Dialing STOMP broker");
        let dialed = match tokio::time::timeout(options.timeout, self.connector.dial(&options)).await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!("connect to {}", options.addr))),
        };

        let session = match dialed {
            Ok(session) => session,
            Err(e) => {
                self.status.send_if_modified(|status| {
                    if status.state != ConnectionState::Connecting {
                        return false;
                    }
                    status.state = previous;
                    true
                });
                warn!(addr = %options.addr, error = %e, "Failed to connect to STOMP broker");
                return Err(PubSubError::Connection(e));
            }
        };

        let conn = EpochConnection::new(self.epochs.fetch_add(1, Ordering::SeqCst) + 1, session);
        let installed = self.status.send_if_modified(|status| {
            if status.is_shutting_down() {
                return false;
            }
            status.state = ConnectionState::Connected;
            status.current = Some(conn.clone());
            true
        });

        if !installed {
            debug!(epoch = conn.epoch, "Close began during dial, dropping new session");
            if let Err(e) = conn.session.disconnect().await {
                debug!(epoch = conn.epoch, error = %e, "Disconnect of discarded session failed");
            }
            return Err(PubSubError::Closed);
        }

        info!(epoch = conn.epoch, addr = %options.addr, "Connected to STOMP broker");
        Ok(conn)
    }

    /// Non-blocking check of the current connection
    pub fn is_connected(&self) -> bool {
        self.status.borrow().live().is_some()
    }

    /// True once `close()` has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        let status = self.status.borrow();
        match status.state {
            ConnectionState::Connected if status.live().is_none() => ConnectionState::Disconnected,
            state => state,
        }
    }

    /// The live connection, if any
    pub fn current(&self) -> Option<EpochConnection> {
        self.status.borrow().live().cloned()
    }

    /// Broadcast fired once when `close()` begins
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Wait until connected with an epoch other than `stale_epoch`
    pub async fn wait_connected(
        &self,
        stale_epoch: Option<u64>,
    ) -> Result<EpochConnection, PubSubError> {
        let mut rx = self.status.subscribe();
        loop {
            {
                let status = rx.borrow_and_update();
                if status.is_shutting_down() {
                    return Err(PubSubError::Closed);
                }
                if let Some(conn) = status.live() {
                    if Some(conn.epoch) != stale_epoch {
                        return Ok(conn.clone());
                    }
                }
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(PubSubError::Closed);
                    }
                }
                _ = self.closing.cancelled() => return Err(PubSubError::Closed),
            }
        }
    }

    /// Report `epoch` as lost. Only the first report for the current epoch
    /// has an effect.
    pub fn mark_lost(&self, epoch: u64) {
        let marked = self.status.send_if_modified(|status| match &status.current {
            Some(conn) if conn.epoch == epoch && status.state == ConnectionState::Connected => {
                conn.lost.cancel();
                status.state = ConnectionState::Disconnected;
                true
            }
            _ => false,
        });

        if marked {
            warn!(epoch, "STOMP connection lost");
        }
    }

    /// Replace `stale_epoch` with a fresh connection. Returns the current
    /// connection without dialing when another caller already replaced it.
    pub async fn reconnect(&self, stale_epoch: u64) -> Result<EpochConnection, PubSubError> {
        if self.closing.is_cancelled() {
            return Err(PubSubError::Closed);
        }
        let _lock = self.connect_lock.lock().await;
        if self.closing.is_cancelled() {
            return Err(PubSubError::Closed);
        }

        let stale = {
            let status = self.status.borrow();
            if let Some(conn) = status.live() {
                if conn.epoch != stale_epoch {
                    return Ok(conn.clone());
                }
            }
            status
                .current
                .clone()
                .filter(|conn| conn.epoch == stale_epoch)
        };

        if let Some(stale) = stale {
            self.mark_lost(stale.epoch);
            if !stale.session.is_closed() {
                if let Err(e) = stale.session.disconnect().await {
                    debug!(epoch = stale.epoch, error = %e, "Disconnect of stale session failed");
                }
            }
        }

        info!(stale_epoch, "Reconnecting to STOMP broker");
        let conn = self.dial_locked().await?;
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }

    pub(crate) fn enter_publish(&self) -> Result<DrainGuard, PubSubError> {
        self.publishing.enter().map_err(|_| PubSubError::Closed)
    }

    pub(crate) fn enter_subscription(&self) -> Result<DrainGuard, PubSubError> {
        self.subscribing.enter().map_err(|_| PubSubError::Closed)
    }

    pub fn stats(&self) -> ConnectionStats {
        let epoch = self.status.borrow().current.as_ref().map(|conn| conn.epoch);
        ConnectionStats {
            state: self.state(),
            epoch,
            reconnects: self.reconnects.load(Ordering::SeqCst),
            publishes_in_flight: self.publishing.active(),
            active_subscriptions: self.subscribing.active(),
        }
    }

    /// Shut down: drain publishes, disconnect, drain subscription loops.
    /// Idempotent; later calls return immediately.
    pub async fn close(&self) -> Result<(), PubSubError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing pub/sub connection");
        self.closing.cancel();
        self.status.send_modify(|status| status.state = ConnectionState::Closing);

        self.publishing.seal_and_wait().await;
        debug!("Publishes drained");

        {
            let _lock = self.connect_lock.lock().await;
            let current = self.status.borrow().current.clone();
            if let Some(conn) = current {
                if let Err(e) = conn.session.disconnect().await {
                    warn!(epoch = conn.epoch, error = %e, "Disconnect failed during close");
                }
                conn.lost.cancel();
            }
        }

        self.subscribing.seal_and_wait().await;
        debug!("Subscription loops drained");

        self.status.send_modify(|status| {
            status.state = ConnectionState::Closed;
            status.current = None;
        });
        info!("Pub/sub connection closed");
        Ok(())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("addr", &self.config.addr)
            .field("stats", &self.stats())
            .finish()
    }
}
