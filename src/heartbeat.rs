//! Renewal publisher: the owner's periodic heartbeat.
//!
//! Each tick advertises `(nonce, id)` on the broadcast channel and then
//! refreshes the lock key TTL. Failures here are transient and only logged;
//! the duplicate watcher is the authority on lost ownership. On
//! cancellation the lock key is deleted best-effort so the id frees up
//! without waiting out the TTL.

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::payload::Heartbeat;
use crate::session::{SessionShared, SessionState};

pub(crate) async fn run(session: Arc<SessionShared>, cancel: CancellationToken, id: u32) {
    let payload = Heartbeat::encode(&session.nonce, id);
    let lock_key = session.lock_key(id);
    // The first tick fires immediately, which narrows the window between
    // the claim and the first advertisement.
    let mut ticker = interval(session.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Best-effort release; the TTL reclaims the id if this fails.
                match session.store.del(&lock_key).await {
                    Ok(()) => info!(id, key = %lock_key, "released lock on shutdown"),
                    Err(err) => warn!(id, key = %lock_key, error = %err, "lock release failed"),
                }
                session.transition(SessionState::Canceled);
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = session
                    .store
                    .publish(&session.broadcast_channel, &payload)
                    .await
                {
                    warn!(id, error = %err, "heartbeat publish failed");
                    continue;
                }
                if let Err(err) = session
                    .store
                    .set(&lock_key, &session.nonce, session.config.lock_ttl)
                    .await
                {
                    warn!(id, error = %err, "lock refresh failed");
                    continue;
                }
                debug!(id, "heartbeat published, lock refreshed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::watch;

    use super::*;
    use crate::session::RausConfig;
    use crate::store::{IdStore, MemoryStore};

    fn shared(store: Arc<MemoryStore>) -> Arc<SessionShared> {
        Arc::new(SessionShared {
            nonce: "hb-nonce".to_string(),
            min: 1,
            max: 10,
            namespace: "raus".to_string(),
            broadcast_channel: "raus:broadcast".to_string(),
            config: RausConfig {
                lock_ttl: Duration::from_secs(5),
                heartbeat_interval: Duration::from_millis(10),
                ..RausConfig::default()
            },
            store,
            state_tx: watch::channel(SessionState::Owning { id: 4 }).0,
        })
    }

    #[tokio::test]
    async fn publishes_heartbeats_and_refreshes_lock() {
        let store = MemoryStore::new();
        let session = shared(store.clone());
        let cancel = CancellationToken::new();

        let mut sub = store.subscribe("raus:broadcast").await.unwrap();
        let task = tokio::spawn(run(session, cancel.clone(), 4));

        let payload = sub
            .recv_timeout(Duration::from_millis(500))
            .await
            .unwrap()
            .expect("heartbeat within the window");
        assert_eq!(payload, "hb-nonce:4");
        assert_eq!(store.get("raus:id:4").await.as_deref(), Some("hb-nonce"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_deletes_lock_key() {
        let store = MemoryStore::new();
        let session = shared(store.clone());
        let cancel = CancellationToken::new();

        store
            .set("raus:id:4", "hb-nonce", Duration::from_secs(5))
            .await
            .unwrap();
        let task = tokio::spawn(run(session, cancel.clone(), 4));
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(store.get("raus:id:4").await, None);
    }
}
