//! Per-key multiplexer and the public network facade
//!
//! A [`KeyNetwork`] owns everything belonging to one local key: the map of
//! peer sessions, the bounded queue of newly-seen inbound peers, the signal
//! receiver loop, and the accept-policy supervisor that starts and stops the
//! receiver. [`Network`] maps local keys to their multiplexers and exposes
//! the accept/open/close surface.

use crate::config::NetworkConfig;
use crate::peer::{OnClose, PeerError, PeerSession};
use crate::types::SignalMessage;
use async_trait::async_trait;
use rtctunnel_crypt::{PrivateKey, PublicKey};
use rtctunnel_net::backoff::Backoff;
use rtctunnel_net::{NetError, PacketNetwork, Stream, StreamNetwork};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// How many newly-seen inbound peers may sit unaccepted before the newest is
/// dropped
const ACCEPT_QUEUE_CAPACITY: usize = 16;

struct KeyNetwork {
    local: PrivateKey,
    cfg: NetworkConfig,
    peers: RwLock<HashMap<PublicKey, Arc<PeerSession>>>,
    incoming_tx: mpsc::Sender<Arc<PeerSession>>,
    incoming: Mutex<mpsc::Receiver<Arc<PeerSession>>>,
    closed: CancellationToken,
    close_flag: AtomicBool,
}

impl KeyNetwork {
    fn new(local: PrivateKey, cfg: NetworkConfig) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(ACCEPT_QUEUE_CAPACITY);
        let knet = Arc::new(Self {
            local,
            cfg,
            peers: RwLock::new(HashMap::new()),
            incoming_tx,
            incoming: Mutex::new(incoming_rx),
            closed: CancellationToken::new(),
            close_flag: AtomicBool::new(false),
        });
        Self::spawn_supervisor(&knet);
        knet
    }

    /// Keeps the signal receiver running exactly while it is needed: always
    /// under accept-all, and under a static peer set until every expected
    /// peer is connected and no extras remain.
    fn spawn_supervisor(this: &Arc<Self>) {
        let knet = this.clone();
        tokio::spawn(async move {
            let mut receiver_stop: Option<CancellationToken> = None;
            Self::reconcile(&knet, &mut receiver_stop).await;

            if knet.cfg.accept_all_peers {
                // the receiver runs until the network closes
                return;
            }

            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = knet.closed.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                Self::reconcile(&knet, &mut receiver_stop).await;
            }
        });
    }

    async fn reconcile(this: &Arc<Self>, receiver_stop: &mut Option<CancellationToken>) {
        let satisfied = {
            let peers = this.peers.read().await;
            let mut seen = 0usize;
            let mut excess = 0usize;
            for key in peers.keys() {
                if this.cfg.accept_peers.contains(key) {
                    seen += 1;
                } else {
                    excess += 1;
                }
            }
            seen == this.cfg.accept_peers.len() && excess == 0
        };

        match receiver_stop {
            Some(stop) => {
                if !this.cfg.accept_all_peers && satisfied {
                    tracing::debug!(local = %this.local.public(), "expected peers established, stopping signal receiver");
                    stop.cancel();
                    *receiver_stop = None;
                }
            }
            None => {
                if this.cfg.accept_all_peers || !satisfied {
                    tracing::debug!(local = %this.local.public(), "starting signal receiver");
                    let stop = this.closed.child_token();
                    tokio::spawn(Self::run_receiver(this.clone(), stop.clone()));
                    *receiver_stop = Some(stop);
                }
            }
        }
    }

    async fn run_receiver(this: Arc<Self>, stop: CancellationToken) {
        let mut backoff = Backoff::default();
        loop {
            let result = tokio::select! {
                _ = stop.cancelled() => return,
                result = this.cfg.signal.recv(&this.local) => result,
            };
            let (remote, data) = match result {
                Ok(next) => next,
                Err(NetError::Closed) => return,
                Err(err) => {
                    tracing::error!(error = %err, "error receiving from signal");
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(backoff.next()) => {}
                    }
                    continue;
                }
            };

            // decode before touching the peer map: a malformed datagram must
            // not create or modify a session
            let msg: SignalMessage = match serde_json::from_slice(&data) {
                Ok(msg) => msg,
                Err(err) => {
                    tracing::warn!(remote = %remote, error = %err, "invalid message received from signal");
                    continue;
                }
            };

            let (peer, is_new) = match Self::peer_for(&this, remote).await {
                Ok(found) => found,
                Err(err) => {
                    tracing::error!(remote = %remote, error = %err, "error creating peer session");
                    tokio::select! {
                        _ = stop.cancelled() => return,
                        _ = tokio::time::sleep(backoff.next()) => {}
                    }
                    continue;
                }
            };
            backoff.reset();

            if let Err(err) = peer.handle(msg).await {
                tracing::warn!(remote = %remote, error = %err, "error handling signal message, closing peer session");
                peer.close().await;
                continue;
            }

            if is_new {
                match this.incoming_tx.try_send(peer.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(peer)) => {
                        tracing::warn!(remote = %remote, "accept queue is full, closing peer session");
                        peer.close().await;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        }
    }

    /// Look up or create the session for `remote`. The map holds at most one
    /// session per remote key; a concurrent loser is closed.
    async fn peer_for(
        this: &Arc<Self>,
        remote: PublicKey,
    ) -> Result<(Arc<PeerSession>, bool), PeerError> {
        if let Some(peer) = this.peers.read().await.get(&remote) {
            return Ok((peer.clone(), false));
        }

        let on_close: OnClose = {
            let knet = Arc::downgrade(this);
            Arc::new(move |remote, id| {
                if let Some(knet) = knet.upgrade() {
                    tokio::spawn(async move { knet.remove_peer(remote, id).await });
                }
            })
        };
        let peer = PeerSession::new(
            this.local.clone(),
            remote,
            this.cfg.signal.clone(),
            &this.cfg.ice_servers,
            on_close,
        )
        .await?;

        let mut peers = this.peers.write().await;
        match peers.entry(remote) {
            Entry::Occupied(existing) => {
                let existing = existing.get().clone();
                drop(peers);
                tokio::spawn(async move { peer.close().await });
                Ok((existing, false))
            }
            Entry::Vacant(slot) => {
                slot.insert(peer.clone());
                Ok((peer, true))
            }
        }
    }

    async fn remove_peer(&self, remote: PublicKey, id: u64) {
        let mut peers = self.peers.write().await;
        if let Some(existing) = peers.get(&remote) {
            if existing.id() == id {
                peers.remove(&remote);
            }
        }
    }

    async fn accept(&self) -> Result<(PublicKey, u16, Arc<dyn Stream>), NetError> {
        let peer = {
            let mut incoming = tokio::select! {
                _ = self.closed.cancelled() => return Err(NetError::Closed),
                guard = self.incoming.lock() => guard,
            };
            tokio::select! {
                _ = self.closed.cancelled() => return Err(NetError::Closed),
                peer = incoming.recv() => peer.ok_or(NetError::Closed)?,
            }
        };

        let (port, stream) = peer.accept().await?;
        Ok((peer.remote(), port, stream))
    }

    async fn open(
        this: &Arc<Self>,
        remote: PublicKey,
        port: u16,
    ) -> Result<Arc<dyn Stream>, NetError> {
        if this.closed.is_cancelled() {
            return Err(NetError::Closed);
        }
        let (peer, _) = Self::peer_for(this, remote).await?;
        Ok(PeerSession::open(&peer, port).await?)
    }

    async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    async fn close(&self) {
        if self.close_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        let peers: Vec<_> = self.peers.write().await.drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.close().await;
        }
        self.closed.cancel();
    }
}

/// Peer-to-peer stream network over WebRTC data channels.
///
/// Holds one multiplexer per local key, created lazily on first accept or
/// open against that key.
pub struct Network {
    cfg: NetworkConfig,
    networks: Mutex<HashMap<PublicKey, Arc<KeyNetwork>>>,
}

impl Network {
    pub fn new(cfg: NetworkConfig) -> Self {
        Self {
            cfg,
            networks: Mutex::new(HashMap::new()),
        }
    }

    async fn network_for(&self, local: &PrivateKey) -> Arc<KeyNetwork> {
        let mut networks = self.networks.lock().await;
        networks
            .entry(local.public())
            .or_insert_with(|| KeyNetwork::new(local.clone(), self.cfg.clone()))
            .clone()
    }

    /// Wait for an inbound stream to `local`, returning the remote key, the
    /// port it targets, and the stream.
    pub async fn accept(
        &self,
        local: &PrivateKey,
    ) -> Result<(PublicKey, u16, Arc<dyn Stream>), NetError> {
        self.network_for(local).await.accept().await
    }

    /// Open a stream from `local` to `remote` on the given port.
    pub async fn open(
        &self,
        local: &PrivateKey,
        remote: &PublicKey,
        port: u16,
    ) -> Result<Arc<dyn Stream>, NetError> {
        let knet = self.network_for(local).await;
        KeyNetwork::open(&knet, *remote, port).await
    }

    /// Number of live peer sessions for `local`.
    pub async fn peer_count(&self, local: &PublicKey) -> usize {
        let knet = self.networks.lock().await.get(local).cloned();
        match knet {
            Some(knet) => knet.peer_count().await,
            None => 0,
        }
    }

    /// Close every multiplexer and its peers. Idempotent.
    pub async fn close(&self) {
        let networks: Vec<_> = self.networks.lock().await.drain().map(|(_, n)| n).collect();
        for knet in networks {
            knet.close().await;
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}

#[async_trait]
impl StreamNetwork for Network {
    async fn accept(
        &self,
        local: &PrivateKey,
    ) -> Result<(PublicKey, u16, Arc<dyn Stream>), NetError> {
        Network::accept(self, local).await
    }

    async fn open(
        &self,
        local: &PrivateKey,
        remote: &PublicKey,
        port: u16,
    ) -> Result<Arc<dyn Stream>, NetError> {
        Network::open(self, local, remote, port).await
    }
}
