//! Redis-backed store.
//!
//! Commands run over a shared auto-reconnecting multiplexed connection.
//! Every subscription opens its own dedicated pub/sub connection and closes
//! it on drop, so a wedged subscriber never blocks command traffic.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, RedisError};
use tokio::sync::Mutex;

use super::{IdStore, StoreError, Subscription};

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Backend {
            message: err.to_string(),
        }
    }
}

/// [`IdStore`] backed by a Redis server.
pub struct RedisStore {
    client: Client,
    manager: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Create a store for the server at `addr` (`host:port`, or a full
    /// `redis://` URL). Connections are established lazily on first use.
    pub fn open(addr: &str) -> Result<Self, StoreError> {
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{addr}")
        };
        let client = Client::open(url)?;
        Ok(Self {
            client,
            manager: Mutex::new(None),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, StoreError> {
        let mut guard = self.manager.lock().await;
        if let Some(manager) = guard.as_ref() {
            return Ok(manager.clone());
        }
        let manager = self.client.get_connection_manager().await?;
        *guard = Some(manager.clone());
        Ok(manager)
    }
}

/// Redis EX takes whole seconds; a sub-second TTL still needs to expire.
fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl IdStore for RedisStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let _: () = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        Ok(Box::new(RedisSubscription { pubsub }))
    }
}

struct RedisSubscription {
    pubsub: PubSub,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> Result<String, StoreError> {
        let message = self
            .pubsub
            .on_message()
            .next()
            .await
            .ok_or(StoreError::SubscriptionClosed)?;
        Ok(message.get_payload()?)
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

    #[test]
    fn open_accepts_bare_address() {
        assert!(RedisStore::open("127.0.0.1:6379").is_ok());
    }

    #[test]
    fn open_accepts_url() {
        assert!(RedisStore::open("redis://127.0.0.1:6379/0").is_ok());
    }

    #[test]
    fn sub_second_ttl_rounds_up() {
        assert_eq!(ttl_seconds(Duration::from_millis(200)), 1);
        assert_eq!(ttl_seconds(Duration::from_secs(60)), 60);
    }
}
