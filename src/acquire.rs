//! Subscriber side of the protocol: discovery, claim, duplicate watching.
//!
//! A single task walks the whole arc. It listens for peer heartbeats to
//! seed the used-id set, claims a free id by conditional create, resolves
//! the caller's handshake, then keeps watching the broadcast channel for a
//! peer advertising the same id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{DuplicateNonceSnafu, ExhaustedSnafu, RausError, StoreSnafu};
use crate::payload::Heartbeat;
use crate::session::{SessionShared, SessionState};

/// Pause after a failed watcher receive so an unhealthy subscription does
/// not spin.
const RECV_RETRY_PAUSE: Duration = Duration::from_millis(100);

pub(crate) async fn run(
    session: Arc<SessionShared>,
    cancel: CancellationToken,
    handshake: oneshot::Sender<Result<u32, RausError>>,
    errors: mpsc::Sender<RausError>,
) {
    let used = match discover(&session, &cancel).await {
        Ok(used) => used,
        Err(err) => {
            session.transition(terminal_state(&err));
            let _ = handshake.send(Err(err));
            return;
        }
    };

    session.transition(SessionState::Claiming);
    let id = match claim(&session, used).await {
        Ok(id) => id,
        Err(err) => {
            session.transition(terminal_state(&err));
            let _ = handshake.send(Err(err));
            return;
        }
    };

    session.transition(SessionState::Owning { id });
    if handshake.send(Ok(id)).is_err() {
        // Caller went away between claim and resolution; give the id back.
        warn!(id, "acquire abandoned after claim, releasing lock");
        if let Err(err) = session.store.del(&session.lock_key(id)).await {
            warn!(id, error = %err, "failed to release abandoned lock");
        }
        session.transition(SessionState::Canceled);
        return;
    }

    watch_for_duplicates(&session, &cancel, id, errors).await;
}

fn terminal_state(err: &RausError) -> SessionState {
    match err {
        RausError::Canceled => SessionState::Canceled,
        _ => SessionState::Failed,
    }
}

/// Listen on the broadcast channel for up to the discovery window,
/// collecting ids advertised by peers.
///
/// Peer knowledge is an optimization: the conditional create in [`claim`]
/// stays authoritative, so a receive failure or an expired window simply
/// ends discovery. The subscription is dropped before claiming begins.
async fn discover(
    session: &SessionShared,
    cancel: &CancellationToken,
) -> Result<HashSet<u32>, RausError> {
    let mut sub = session
        .store
        .subscribe(&session.broadcast_channel)
        .await
        .context(StoreSnafu)?;

    let mut used = HashSet::new();
    let deadline = Instant::now() + session.config.discovery_window;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let remaining = deadline - now;

        let payload = tokio::select! {
            _ = cancel.cancelled() => return Err(RausError::Canceled),
            received = sub.recv_timeout(remaining) => match received {
                Ok(Some(payload)) => payload,
                // Deadline and receive failure both just end the window.
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "discovery receive failed, ending window");
                    break;
                }
            },
        };

        let Some(heartbeat) = Heartbeat::parse(&payload) else {
            warn!(payload = %payload, "malformed broadcast payload");
            continue;
        };
        if heartbeat.nonce == session.nonce {
            return DuplicateNonceSnafu {
                nonce: session.nonce.clone(),
            }
            .fail();
        }
        debug!(peer = %heartbeat.nonce, id = heartbeat.id, "peer advertisement");
        used.insert(heartbeat.id);
    }

    if cancel.is_cancelled() {
        return Err(RausError::Canceled);
    }
    debug!(peers = used.len(), "discovery window closed");
    Ok(used)
}

/// Claim a free id by conditional create, retrying until the range is
/// exhausted.
///
/// The uniform random pick among the first free candidates breaks
/// synchronized startup herds without a global sequence.
async fn claim(session: &SessionShared, mut used: HashSet<u32>) -> Result<u32, RausError> {
    loop {
        let candidates: Vec<u32> = (session.min..=session.max)
            .filter(|id| !used.contains(id))
            .take(session.config.max_candidates)
            .collect();
        if candidates.is_empty() {
            return ExhaustedSnafu {
                min: session.min,
                max: session.max,
            }
            .fail();
        }
        debug!(?candidates, "claim candidates");

        let pick = candidates[rand::rng().random_range(0..candidates.len())];
        let key = session.lock_key(pick);
        let won = session
            .store
            .set_nx(&key, &session.nonce, session.config.lock_ttl)
            .await
            .context(StoreSnafu)?;
        if won {
            info!(id = pick, key = %key, "lock acquired");
            return Ok(pick);
        }
        debug!(id = pick, "lock already held by a peer");
        used.insert(pick);
    }
}

/// Watch the broadcast channel for a foreign nonce advertising our id.
///
/// The watcher reports; it never deletes the lock or arbitrates ownership.
async fn watch_for_duplicates(
    session: &SessionShared,
    cancel: &CancellationToken,
    id: u32,
    errors: mpsc::Sender<RausError>,
) {
    let mut sub = match session.store.subscribe(&session.broadcast_channel).await {
        Ok(sub) => sub,
        Err(err) => {
            warn!(error = %err, "duplicate watcher could not subscribe");
            let _ = errors.send(RausError::Store { source: err }).await;
            return;
        }
    };

    loop {
        let payload = tokio::select! {
            _ = cancel.cancelled() => {
                session.transition(SessionState::Canceled);
                return;
            }
            received = sub.recv() => match received {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "watcher receive failed");
                    tokio::time::sleep(RECV_RETRY_PAUSE).await;
                    continue;
                }
            },
        };

        let Some(heartbeat) = Heartbeat::parse(&payload) else {
            warn!(payload = %payload, "malformed broadcast payload");
            continue;
        };
        if heartbeat.id == id && heartbeat.nonce != session.nonce {
            warn!(id, peer = %heartbeat.nonce, "duplicate id advertised by peer");
            session.transition(SessionState::Failed);
            let _ = errors
                .send(RausError::DuplicateId {
                    id,
                    holder: heartbeat.nonce.to_string(),
                })
                .await;
            return;
        }
    }
}
