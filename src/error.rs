//! Error taxonomy for the assignment protocol.

use snafu::Snafu;

use crate::store::StoreError;

/// Errors produced by session construction and the acquire protocol.
///
/// Construction and configuration errors are returned synchronously.
/// Acquire-phase errors resolve the [`crate::Raus::acquire`] call itself.
/// Post-acquire errors arrive on the handle's asynchronous error stream;
/// the library reports them and never retries or self-heals.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum RausError {
    /// The configured range is invalid: `min` must be strictly below `max`.
    #[snafu(display("invalid id range [{min}, {max}]: min must be less than max"))]
    InvalidRange {
        /// Configured range floor.
        min: u32,
        /// Configured range ceiling.
        max: u32,
    },

    /// The session configuration is internally inconsistent.
    #[snafu(display("invalid configuration: {reason}"))]
    InvalidConfig {
        /// What is wrong with the configuration.
        reason: String,
    },

    /// The cancellation token fired before an id was acquired.
    #[snafu(display("acquire canceled"))]
    Canceled,

    /// Our own nonce arrived on the broadcast channel during discovery:
    /// either the nonce generator collided or two sessions share a nonce.
    #[snafu(display("own nonce {nonce} observed on broadcast"))]
    DuplicateNonce {
        /// The colliding nonce.
        nonce: String,
    },

    /// A store operation failed at a point where the protocol cannot
    /// continue.
    #[snafu(display("store operation failed: {source}"))]
    Store {
        /// The backend failure.
        source: StoreError,
    },

    /// Every id in the configured range is currently claimed.
    #[snafu(display("no free id left in [{min}, {max}]"))]
    Exhausted {
        /// Configured range floor.
        min: u32,
        /// Configured range ceiling.
        max: u32,
    },

    /// A peer advertised our id under a different nonce. The caller must
    /// decide whether to shut down or re-acquire.
    #[snafu(display("id {id} is also claimed by {holder}"))]
    DuplicateId {
        /// The contested id.
        id: u32,
        /// The peer's nonce.
        holder: String,
    },
}
