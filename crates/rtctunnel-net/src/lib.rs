//! Network abstractions for rtctunnel
//!
//! Defines the three seams the rest of the system is built on:
//! - [`PacketNetwork`]: an authenticated, best-effort datagram service keyed
//!   by public keys, the "signal" used to exchange session descriptions
//! - [`StreamNetwork`]: a connection-oriented accept/open service
//! - [`Stream`]: a reliable, ordered, full-duplex byte stream
//!
//! Implementations:
//! - [`memory`]: in-memory doubles for tests and simulation
//! - [`apprtc`]: the production signal client speaking the rendezvous wire
//!
//! Cancellation follows the usual async convention: every blocking operation
//! is a future, and dropping it (via `tokio::select!` or
//! `tokio::time::timeout`) abandons the operation. Closing a component wakes
//! all of its pending operations with [`NetError::Closed`].

use async_trait::async_trait;
use rtctunnel_crypt::{CryptError, PrivateKey, PublicKey};
use std::sync::Arc;
use thiserror::Error;

pub mod apprtc;
pub mod backoff;
pub mod memory;
pub mod wspool;

/// Errors from network operations
#[derive(Debug, Clone, Error)]
pub enum NetError {
    /// The owning resource has been shut down. Never retried.
    #[error("closed")]
    Closed,
    #[error("operation timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("crypt error: {0}")]
    Crypt(#[from] CryptError),
}

/// An authenticated, best-effort, ordered-per-sender datagram service keyed
/// by public keys.
///
/// Delivery is at-least-once; duplicates must be benign to the consumer. No
/// ordering is guaranteed between different senders.
#[async_trait]
pub trait PacketNetwork: Send + Sync {
    /// Receive the next datagram addressed to `local`, returning the
    /// authenticated sender and the plaintext.
    async fn recv(&self, local: &PrivateKey) -> Result<(PublicKey, Vec<u8>), NetError>;

    /// Send `data` to `remote`, authenticated as `local`.
    async fn send(&self, local: &PrivateKey, remote: &PublicKey, data: &[u8])
        -> Result<(), NetError>;

    /// Shut down. Idempotent; pending operations return [`NetError::Closed`].
    async fn close(&self);
}

/// A connection-oriented byte stream multiplexed per logical port.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Read up to `dst.len()` bytes, returning how many were read.
    async fn read(&self, dst: &mut [u8]) -> Result<usize, NetError>;

    /// Write all of `src`, returning `src.len()` on success.
    async fn write(&self, src: &[u8]) -> Result<usize, NetError>;

    /// Close both directions. Idempotent.
    async fn close(&self);
}

/// A network that supports accepting and opening [`Stream`]s between keys.
#[async_trait]
pub trait StreamNetwork: Send + Sync {
    /// Wait for an inbound stream to `local`, returning the remote key, the
    /// logical port it targets, and the stream.
    async fn accept(
        &self,
        local: &PrivateKey,
    ) -> Result<(PublicKey, u16, Arc<dyn Stream>), NetError>;

    /// Open a stream from `local` to `remote` on the given logical port.
    async fn open(
        &self,
        local: &PrivateKey,
        remote: &PublicKey,
        port: u16,
    ) -> Result<Arc<dyn Stream>, NetError>;
}

#[async_trait]
impl<T: PacketNetwork + ?Sized> PacketNetwork for Arc<T> {
    async fn recv(&self, local: &PrivateKey) -> Result<(PublicKey, Vec<u8>), NetError> {
        (**self).recv(local).await
    }

    async fn send(
        &self,
        local: &PrivateKey,
        remote: &PublicKey,
        data: &[u8],
    ) -> Result<(), NetError> {
        (**self).send(local, remote, data).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

#[async_trait]
impl<T: Stream + ?Sized> Stream for Arc<T> {
    async fn read(&self, dst: &mut [u8]) -> Result<usize, NetError> {
        (**self).read(dst).await
    }

    async fn write(&self, src: &[u8]) -> Result<usize, NetError> {
        (**self).write(src).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

/// Read exactly `dst.len()` bytes from `stream`.
pub async fn read_full(stream: &dyn Stream, dst: &mut [u8]) -> Result<(), NetError> {
    let mut filled = 0;
    while filled < dst.len() {
        let n = stream.read(&mut dst[filled..]).await?;
        filled += n;
    }
    Ok(())
}
