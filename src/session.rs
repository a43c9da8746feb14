//! Session lifecycle: configuration, the state machine, and the acquire
//! entry point that wires the background activities together.

use std::sync::Arc;
use std::time::Duration;

use snafu::{ensure, ResultExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::acquire;
use crate::error::{InvalidConfigSnafu, InvalidRangeSnafu, RausError, StoreSnafu};
use crate::heartbeat;
use crate::store::{IdStore, RedisStore};

/// Default key namespace (and therefore key prefix) for a session.
pub const DEFAULT_NAMESPACE: &str = "raus";

const BROADCAST_SUFFIX: &str = ":broadcast";

/// Post-acquire errors are rare one-shot events; a small buffer decouples
/// the reporting task from the caller.
const ERROR_STREAM_CAPACITY: usize = 8;

/// Timing and tuning knobs for a session.
///
/// The defaults match the protocol constants: a 60 s lock TTL against a 1 s
/// heartbeat leaves a 60x margin for transient store unavailability, and
/// the 3 s discovery window trades startup latency against claim
/// collisions.
#[derive(Debug, Clone)]
pub struct RausConfig {
    /// TTL applied to the lock key on claim and on every refresh.
    pub lock_ttl: Duration,
    /// Period of the renewal publisher. Must stay well below `lock_ttl`.
    pub heartbeat_interval: Duration,
    /// Wall-clock bound on the discovery listening phase.
    pub discovery_window: Duration,
    /// Maximum free candidates collected per claim attempt.
    pub max_candidates: usize,
}

impl Default for RausConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(1),
            discovery_window: Duration::from_secs(3),
            max_candidates: 10,
        }
    }
}

impl RausConfig {
    fn validate(&self) -> Result<(), RausError> {
        ensure!(
            !self.heartbeat_interval.is_zero(),
            InvalidConfigSnafu {
                reason: "heartbeat_interval must be nonzero",
            }
        );
        ensure!(
            self.lock_ttl > self.heartbeat_interval,
            InvalidConfigSnafu {
                reason: format!(
                    "lock_ttl ({:?}) must exceed heartbeat_interval ({:?})",
                    self.lock_ttl, self.heartbeat_interval
                ),
            }
        );
        ensure!(
            !self.discovery_window.is_zero(),
            InvalidConfigSnafu {
                reason: "discovery_window must be nonzero",
            }
        );
        ensure!(
            self.max_candidates > 0,
            InvalidConfigSnafu {
                reason: "max_candidates must be at least 1",
            }
        );
        Ok(())
    }
}

/// Lifecycle of a session, observable through [`RausHandle::state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Listening on the broadcast channel for peer advertisements.
    Discovering,
    /// Attempting conditional lock creation on candidate ids.
    Claiming,
    /// Holding an id, renewing it and watching for duplicates.
    Owning {
        /// The owned id.
        id: u32,
    },
    /// The cancellation token fired; background activities have stopped.
    Canceled,
    /// A terminal error stopped the protocol.
    Failed,
}

impl SessionState {
    fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Canceled | SessionState::Failed)
    }
}

/// Per-acquire state shared by the background activities.
pub(crate) struct SessionShared {
    pub nonce: String,
    pub min: u32,
    pub max: u32,
    pub namespace: String,
    pub broadcast_channel: String,
    pub config: RausConfig,
    pub store: Arc<dyn IdStore>,
    pub state_tx: watch::Sender<SessionState>,
}

impl SessionShared {
    pub fn lock_key(&self, id: u32) -> String {
        format!("{}:id:{id}", self.namespace)
    }

    /// Move the published state forward; terminal states are never left.
    pub fn transition(&self, next: SessionState) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            debug!(from = ?state, to = ?next, "session state change");
            *state = next;
            true
        });
    }
}

/// A ranged-unique-id session.
///
/// One session per process instance; multiple independent sessions in the
/// same process are supported. Construction mints the instance nonce;
/// [`Raus::acquire`] runs the assignment protocol and hands back a
/// [`RausHandle`] for the lifetime of the ownership.
pub struct Raus {
    nonce: String,
    min: u32,
    max: u32,
    namespace: String,
    config: RausConfig,
    store: Arc<dyn IdStore>,
}

impl std::fmt::Debug for Raus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Raus")
            .field("nonce", &self.nonce)
            .field("min", &self.min)
            .field("max", &self.max)
            .field("namespace", &self.namespace)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Raus {
    /// Create a session against the Redis server at `addr` (`host:port` or
    /// a `redis://` URL).
    ///
    /// Fails with [`RausError::InvalidRange`] unless `min < max`.
    pub fn new(addr: &str, min: u32, max: u32) -> Result<Self, RausError> {
        let store = RedisStore::open(addr).context(StoreSnafu)?;
        Self::with_store(Arc::new(store), min, max)
    }

    /// Create a session over any [`IdStore`] backend.
    pub fn with_store(store: Arc<dyn IdStore>, min: u32, max: u32) -> Result<Self, RausError> {
        ensure!(min < max, InvalidRangeSnafu { min, max });
        Ok(Self {
            nonce: Uuid::new_v4().to_string(),
            min,
            max,
            namespace: DEFAULT_NAMESPACE.to_string(),
            config: RausConfig::default(),
            store,
        })
    }

    /// Replace the key namespace, and thereby the broadcast channel name
    /// and lock key prefix. Call before [`Raus::acquire`].
    pub fn set_namespace(&mut self, namespace: impl Into<String>) {
        self.namespace = namespace.into();
    }

    /// Replace the timing configuration. Call before [`Raus::acquire`].
    pub fn set_config(&mut self, config: RausConfig) -> Result<(), RausError> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// The instance nonce advertised on the broadcast channel.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Inclusive range floor.
    pub fn min(&self) -> u32 {
        self.min
    }

    /// Inclusive range ceiling.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Broadcast channel name under the current namespace.
    pub fn broadcast_channel(&self) -> String {
        format!("{}{BROADCAST_SUFFIX}", self.namespace)
    }

    /// Lock key for `id` under the current namespace.
    pub fn lock_key(&self, id: u32) -> String {
        format!("{}:id:{id}", self.namespace)
    }

    /// Run the assignment protocol to completion.
    ///
    /// Blocks until an id is claimed or a terminal error occurs. On success
    /// two background activities keep running until `cancel` fires: the
    /// duplicate watcher and the renewal publisher. Cancellation while
    /// owning releases the lock key best-effort; cancellation before that
    /// resolves this call with [`RausError::Canceled`].
    pub async fn acquire(self, cancel: CancellationToken) -> Result<RausHandle, RausError> {
        self.config.validate()?;

        let broadcast_channel = self.broadcast_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Discovering);
        let (handshake_tx, handshake_rx) = oneshot::channel();
        let (error_tx, error_rx) = mpsc::channel(ERROR_STREAM_CAPACITY);

        let shared = Arc::new(SessionShared {
            nonce: self.nonce.clone(),
            min: self.min,
            max: self.max,
            namespace: self.namespace,
            broadcast_channel,
            config: self.config,
            store: self.store,
            state_tx,
        });

        tokio::spawn(acquire::run(
            shared.clone(),
            cancel.clone(),
            handshake_tx,
            error_tx,
        ));

        let id = match handshake_rx.await {
            Ok(Ok(id)) => id,
            Ok(Err(err)) => return Err(err),
            // The protocol task stopped without reporting; treat as
            // cancellation.
            Err(_) => return Err(RausError::Canceled),
        };

        tokio::spawn(heartbeat::run(shared.clone(), cancel, id));

        info!(id, nonce = %shared.nonce, "acquired unique id");
        Ok(RausHandle {
            id,
            nonce: self.nonce,
            errors: error_rx,
            state_rx,
        })
    }
}

/// Handle to a successfully acquired id.
///
/// Dropping the handle does not stop the background activities; cancel the
/// token passed to [`Raus::acquire`] for that.
#[derive(Debug)]
pub struct RausHandle {
    id: u32,
    nonce: String,
    errors: mpsc::Receiver<RausError>,
    state_rx: watch::Receiver<SessionState>,
}

impl RausHandle {
    /// The assigned id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The nonce under which the id is held.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state_rx.borrow().clone()
    }

    /// Watch receiver notified on lifecycle changes.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Next asynchronous error, or `None` once the duplicate watcher has
    /// terminated.
    ///
    /// [`RausError::DuplicateId`] here means a peer is advertising our id;
    /// the caller decides whether to shut down or re-acquire.
    pub async fn next_error(&mut self) -> Option<RausError> {
        self.errors.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn rejects_equal_bounds() {
        let err = Raus::with_store(MemoryStore::new(), 3, 3).unwrap_err();
        assert!(matches!(err, RausError::InvalidRange { min: 3, max: 3 }));
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = Raus::with_store(MemoryStore::new(), 10, 2).unwrap_err();
        assert!(matches!(err, RausError::InvalidRange { .. }));
    }

    #[test]
    fn default_namespace_shapes_keys() {
        let session = Raus::with_store(MemoryStore::new(), 0, 10).unwrap();
        assert_eq!(session.broadcast_channel(), "raus:broadcast");
        assert_eq!(session.lock_key(7), "raus:id:7");
    }

    #[test]
    fn namespace_change_renames_channel_and_keys() {
        let mut session = Raus::with_store(MemoryStore::new(), 0, 10).unwrap();
        session.set_namespace("workers");
        assert_eq!(session.broadcast_channel(), "workers:broadcast");
        assert_eq!(session.lock_key(3), "workers:id:3");
    }

    #[test]
    fn rejects_heartbeat_at_or_above_ttl() {
        let mut session = Raus::with_store(MemoryStore::new(), 0, 10).unwrap();
        let err = session
            .set_config(RausConfig {
                lock_ttl: Duration::from_secs(1),
                heartbeat_interval: Duration::from_secs(1),
                ..RausConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, RausError::InvalidConfig { .. }));
    }

    #[test]
    fn rejects_zero_candidates() {
        let mut session = Raus::with_store(MemoryStore::new(), 0, 10).unwrap();
        let err = session
            .set_config(RausConfig {
                max_candidates: 0,
                ..RausConfig::default()
            })
            .unwrap_err();
        assert!(matches!(err, RausError::InvalidConfig { .. }));
    }

    #[test]
    fn sessions_mint_distinct_nonces() {
        let store = MemoryStore::new();
        let a = Raus::with_store(store.clone(), 0, 10).unwrap();
        let b = Raus::with_store(store, 0, 10).unwrap();
        assert_ne!(a.nonce(), b.nonce());
    }
}
