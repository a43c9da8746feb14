//! raus — ranged unique id supplier.
//!
//! Assigns each participating process a unique integer id from an inclusive
//! `[min, max]` range, coordinating only through a shared key/value store
//! with atomic conditional writes and pub/sub messaging (Redis in
//! production). A process calls [`Raus::acquire`] once at startup; the
//! returned [`RausHandle`] carries the id and a stream of asynchronous
//! errors, while background activities advertise the assignment and watch
//! for duplicates until the caller cancels.
//!
//! # Protocol
//!
//! 1. **Discovery** — listen on `<namespace>:broadcast` for a bounded
//!    window, collecting the ids peers advertise.
//! 2. **Claim** — pick a random free candidate and take
//!    `<namespace>:id:<i>` by conditional create with a TTL, so at most one
//!    holder exists per id and a crashed holder's id frees up within the
//!    TTL.
//! 3. **Heartbeat** — publish `"<nonce>:<id>"` every second and refresh the
//!    lock TTL.
//! 4. **Watch** — keep reading the broadcast; a foreign nonce advertising
//!    our id surfaces [`RausError::DuplicateId`] for the caller to act on.
//!
//! # Example
//!
//! ```ignore
//! use raus::Raus;
//! use tokio_util::sync::CancellationToken;
//!
//! let mut session = Raus::new("127.0.0.1:6379", 0, 1023)?;
//! session.set_namespace("workers");
//!
//! let cancel = CancellationToken::new();
//! let mut handle = session.acquire(cancel.clone()).await?;
//! println!("assigned id {}", handle.id());
//!
//! // ... run with the id; watch handle.next_error() for DuplicateId ...
//!
//! cancel.cancel();
//! ```

#![warn(missing_docs)]

mod acquire;
mod error;
mod heartbeat;
mod payload;
mod session;
mod store;

pub use error::RausError;
pub use session::{Raus, RausConfig, RausHandle, SessionState, DEFAULT_NAMESPACE};
pub use store::{IdStore, MemoryStore, RedisStore, StoreError, Subscription};
