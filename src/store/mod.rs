//! Store abstraction: the coordination medium.
//!
//! The assignment protocol needs exactly five capabilities from the shared
//! store: conditional create with TTL, unconditional write with TTL, delete,
//! publish, and subscribe. [`IdStore`] captures those; everything else about
//! the store is a black box. [`RedisStore`] is the production backend;
//! [`MemoryStore`] provides the same semantics in-process for tests and
//! single-node deployments.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

/// Errors surfaced by store backends.
#[derive(Debug, Snafu)]
pub enum StoreError {
    /// The backend failed to execute a command or lost its connection.
    #[snafu(display("store backend error: {message}"))]
    Backend {
        /// Backend-specific failure description.
        message: String,
    },

    /// The pub/sub subscription is closed and will deliver no more messages.
    #[snafu(display("subscription closed"))]
    SubscriptionClosed,
}

/// The key/value and pub/sub capabilities the protocol requires.
#[async_trait]
pub trait IdStore: Send + Sync {
    /// Conditional create: write `value` under `key` with `ttl`, only if the
    /// key does not already exist. Returns whether the write won.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Unconditional write of `value` under `key`, refreshing the TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Fan-out publish to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Open a fresh subscription to `channel`. The subscription observes
    /// only messages published after this call returns.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>, StoreError>;
}

/// A live pub/sub subscription. Dropping it closes the subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Receive the next message, waiting indefinitely.
    async fn recv(&mut self) -> Result<String, StoreError>;

    /// Receive the next message, waiting at most `timeout`. Returns
    /// `Ok(None)` when the deadline passes without a message.
    async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<String>, StoreError>;
}
