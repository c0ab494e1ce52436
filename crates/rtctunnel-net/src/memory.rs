//! In-memory network doubles for testing and simulation
//!
//! Provides a [`MemoryPacketNetwork`] that rendezvous datagrams by public key
//! and a [`MemoryStreamNetwork`] whose streams are cross-wired in-process
//! byte pipes. Both honor cancellation and report [`NetError::Closed`] once
//! shut down.

use crate::{NetError, PacketNetwork, Stream, StreamNetwork};
use async_trait::async_trait;
use rtctunnel_crypt::{PrivateKey, PublicKey};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as SyncMutex;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Packet network
// ============================================================================

type Datagram = (PublicKey, Vec<u8>);

struct Mailbox {
    tx: mpsc::Sender<Datagram>,
    rx: Arc<Mutex<mpsc::Receiver<Datagram>>>,
}

impl Mailbox {
    fn new() -> Self {
        // capacity 1: senders block until the previous datagram is consumed
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Sends datagrams between peers in-memory.
///
/// Each destination key owns a single-slot mailbox: `send` blocks while the
/// slot is occupied and `recv` blocks until a datagram arrives.
pub struct MemoryPacketNetwork {
    mailboxes: SyncMutex<HashMap<PublicKey, Mailbox>>,
    closed: CancellationToken,
}

impl MemoryPacketNetwork {
    pub fn new() -> Self {
        Self {
            mailboxes: SyncMutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    fn mailbox_rx(&self, key: &PublicKey) -> Arc<Mutex<mpsc::Receiver<Datagram>>> {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        mailboxes.entry(*key).or_insert_with(Mailbox::new).rx.clone()
    }

    fn mailbox_tx(&self, key: &PublicKey) -> mpsc::Sender<Datagram> {
        let mut mailboxes = self.mailboxes.lock().unwrap();
        mailboxes.entry(*key).or_insert_with(Mailbox::new).tx.clone()
    }
}

impl Default for MemoryPacketNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PacketNetwork for MemoryPacketNetwork {
    async fn recv(&self, local: &PrivateKey) -> Result<(PublicKey, Vec<u8>), NetError> {
        let rx = self.mailbox_rx(&local.public());
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return Err(NetError::Closed),
            guard = rx.lock() => guard,
        };
        let (remote, data) = tokio::select! {
            _ = self.closed.cancelled() => return Err(NetError::Closed),
            msg = rx.recv() => msg.ok_or(NetError::Closed)?,
        };
        tracing::debug!(
            local = %local.public(),
            remote = %remote,
            size = data.len(),
            "memory packet recv"
        );
        Ok((remote, data))
    }

    async fn send(
        &self,
        local: &PrivateKey,
        remote: &PublicKey,
        data: &[u8],
    ) -> Result<(), NetError> {
        tracing::debug!(
            local = %local.public(),
            remote = %remote,
            size = data.len(),
            "memory packet send"
        );
        let tx = self.mailbox_tx(remote);
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::Closed),
            sent = tx.send((local.public(), data.to_vec())) => {
                sent.map_err(|_| NetError::Closed)
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

// ============================================================================
// Stream network
// ============================================================================

struct OpenRequest {
    client: PublicKey,
    port: u16,
    stream: Arc<MemoryStream>,
    // fires when an acceptor has taken the request, so open blocks until the
    // rendezvous actually happens
    accepted: oneshot::Sender<()>,
}

struct Listener {
    tx: mpsc::Sender<OpenRequest>,
    rx: Arc<Mutex<mpsc::Receiver<OpenRequest>>>,
}

impl Listener {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// Rendezvous accept/open keyed by the server's public key, backed by
/// in-memory byte pipes.
pub struct MemoryStreamNetwork {
    listeners: SyncMutex<HashMap<PublicKey, Listener>>,
    closed: CancellationToken,
}

impl MemoryStreamNetwork {
    pub fn new() -> Self {
        Self {
            listeners: SyncMutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Shut down. Streams already handed out are unaffected.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn listener_tx(&self, server: &PublicKey) -> mpsc::Sender<OpenRequest> {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.entry(*server).or_insert_with(Listener::new).tx.clone()
    }

    fn listener_rx(&self, server: &PublicKey) -> Arc<Mutex<mpsc::Receiver<OpenRequest>>> {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.entry(*server).or_insert_with(Listener::new).rx.clone()
    }
}

impl Default for MemoryStreamNetwork {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamNetwork for MemoryStreamNetwork {
    async fn accept(
        &self,
        local: &PrivateKey,
    ) -> Result<(PublicKey, u16, Arc<dyn Stream>), NetError> {
        let rx = self.listener_rx(&local.public());
        let mut rx = tokio::select! {
            _ = self.closed.cancelled() => return Err(NetError::Closed),
            guard = rx.lock() => guard,
        };
        let req = tokio::select! {
            _ = self.closed.cancelled() => return Err(NetError::Closed),
            req = rx.recv() => req.ok_or(NetError::Closed)?,
        };
        let _ = req.accepted.send(());
        Ok((req.client, req.port, req.stream as Arc<dyn Stream>))
    }

    async fn open(
        &self,
        local: &PrivateKey,
        remote: &PublicKey,
        port: u16,
    ) -> Result<Arc<dyn Stream>, NetError> {
        let (ours, theirs) = MemoryStream::pair();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let req = OpenRequest {
            client: local.public(),
            port,
            stream: theirs,
            accepted: accepted_tx,
        };

        let tx = self.listener_tx(remote);
        tokio::select! {
            _ = self.closed.cancelled() => return Err(NetError::Closed),
            sent = tx.send(req) => sent.map_err(|_| NetError::Closed)?,
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::Closed),
            taken = accepted_rx => {
                taken.map_err(|_| NetError::Closed)?;
                Ok(ours as Arc<dyn Stream>)
            }
        }
    }
}

// ============================================================================
// Stream
// ============================================================================

/// One end of a full-duplex, in-memory byte pipe.
///
/// Reads drain an internal buffer before blocking on the pipe; writes copy
/// the caller's bytes. Closing either end fails both directions of the pair
/// with [`NetError::Closed`].
pub struct MemoryStream {
    buf: Mutex<Vec<u8>>,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: CancellationToken,
}

impl MemoryStream {
    /// Create a connected pair of stream ends.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_a) = mpsc::channel(1);
        let (tx_b, rx_b) = mpsc::channel(1);
        let closed = CancellationToken::new();

        let a = Arc::new(Self {
            buf: Mutex::new(Vec::new()),
            tx: tx_b,
            rx: Mutex::new(rx_a),
            closed: closed.clone(),
        });
        let b = Arc::new(Self {
            buf: Mutex::new(Vec::new()),
            tx: tx_a,
            rx: Mutex::new(rx_b),
            closed,
        });
        (a, b)
    }
}

#[async_trait]
impl Stream for MemoryStream {
    async fn read(&self, dst: &mut [u8]) -> Result<usize, NetError> {
        if self.closed.is_cancelled() {
            return Err(NetError::Closed);
        }
        loop {
            {
                let mut buf = self.buf.lock().await;
                if !buf.is_empty() {
                    let n = dst.len().min(buf.len());
                    dst[..n].copy_from_slice(&buf[..n]);
                    buf.drain(..n);
                    return Ok(n);
                }
            }

            let data = tokio::select! {
                _ = self.closed.cancelled() => return Err(NetError::Closed),
                data = async { self.rx.lock().await.recv().await } => {
                    data.ok_or(NetError::Closed)?
                }
            };
            self.buf.lock().await.extend_from_slice(&data);
        }
    }

    async fn write(&self, src: &[u8]) -> Result<usize, NetError> {
        let data = src.to_vec();
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::Closed),
            sent = self.tx.send(data) => {
                sent.map_err(|_| NetError::Closed)?;
                Ok(src.len())
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
