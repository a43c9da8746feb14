//! Deterministic in-memory store.
//!
//! Mirrors the production backend's semantics (conditional create, TTL
//! expiry, pub/sub fan-out) without network or disk I/O, for unit tests and
//! single-process deployments. Expired keys are dropped lazily on access.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};

use super::{IdStore, StoreError, Subscription};

/// Buffered messages per channel before a slow subscriber starts lagging.
const CHANNEL_CAPACITY: usize = 64;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-memory [`IdStore`] with TTL tracking and pub/sub fan-out.
///
/// A conditional create against an expired key behaves as if the key were
/// absent, matching the production backend.
#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Read the live (unexpired) value under `key`.
    pub async fn get(&self, key: &str) -> Option<String> {
        let keys = self.keys.lock().await;
        keys.get(key)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.value.clone())
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl IdStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock().await;
        if keys.get(key).is_some_and(|entry| !entry.is_expired()) {
            return Ok(false);
        }
        keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut keys = self.keys.lock().await;
        keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.keys.lock().await.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        // No current subscribers is not an error; fan-out is best-effort.
        let _ = self.sender(channel).await.send(payload.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        let rx = self.sender(channel).await.subscribe();
        Ok(Box::new(MemorySubscription { rx }))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<String, StoreError> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(payload),
                // A lagged subscriber resumes at the oldest retained message.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(StoreError::SubscriptionClosed)
                }
            }
        }
    }

    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<String>, StoreError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(received) => received.map(Some),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn conditional_create_wins_once() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_nx("k", "first", ttl).await.unwrap());
        assert!(!store.set_nx("k", "second", ttl).await.unwrap());
        assert_eq!(store.get("k").await.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn expired_key_can_be_reclaimed() {
        let store = MemoryStore::new();

        assert!(store
            .set_nx("k", "first", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("k").await, None);
        assert!(store
            .set_nx("k", "second", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn set_overwrites_and_refreshes() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.set_nx("k", "owner", Duration::from_millis(10)).await.unwrap());
        store.set("k", "owner", ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The refresh extended the lifetime past the first, short TTL.
        assert_eq!(store.get("k").await.as_deref(), Some("owner"));
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = MemoryStore::new();

        store.set("k", "v", Duration::from_secs(60)).await.unwrap();
        store.del("k").await.unwrap();
        assert_eq!(store.get("k").await, None);

        // Deleting an absent key is fine.
        store.del("k").await.unwrap();
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let store = MemoryStore::new();

        let mut sub = store.subscribe("chan").await.unwrap();
        store.publish("chan", "hello").await.unwrap();

        let payload = sub
            .recv_timeout(Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, "hello");
    }

    #[tokio::test]
    async fn subscriber_misses_earlier_messages() {
        let store = MemoryStore::new();

        store.publish("chan", "before").await.unwrap();
        let mut sub = store.subscribe("chan").await.unwrap();
        store.publish("chan", "after").await.unwrap();

        let payload = sub
            .recv_timeout(Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, "after");
    }

    #[tokio::test]
    async fn recv_timeout_expires_without_messages() {
        let store = MemoryStore::new();

        let mut sub = store.subscribe("chan").await.unwrap();
        let received = sub.recv_timeout(Duration::from_millis(20)).await.unwrap();
        assert_eq!(received, None);
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let store = MemoryStore::new();
        store.publish("chan", "nobody listening").await.unwrap();
    }
}
