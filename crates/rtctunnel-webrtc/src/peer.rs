//! Per-peer session
//!
//! One [`PeerSession`] per (local key, remote key) pair. It owns the
//! transport peer connection and drives the offer/answer/ICE state machine:
//! messages routed in by the multiplexer, callbacks from the transport, and
//! open calls from the caller all converge here.

use crate::stream::DataStream;
use crate::types::{channel_label, parse_channel_label, MessageType, SignalMessage};
use rtctunnel_crypt::{PrivateKey, PublicKey};
use rtctunnel_net::{NetError, PacketNetwork, Stream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

/// Errors from peer session operations
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("peer connection was rejected")]
    Rejected,
    #[error("unexpected {message} message in signaling state {state}")]
    UnexpectedMessage {
        message: MessageType,
        state: String,
    },
}

impl From<PeerError> for NetError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Net(err) => err,
            other => NetError::Transport(other.to_string()),
        }
    }
}

/// Invoked exactly once when a session closes, with the session's remote key
/// and unique id, so the owner can drop its map entry without holding a
/// reference back to the session.
pub(crate) type OnClose = Arc<dyn Fn(PublicKey, u64) + Send + Sync>;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct PeerSession {
    id: u64,
    local: PrivateKey,
    remote: PublicKey,
    signal: Arc<dyn PacketNetwork>,
    pc: Arc<RTCPeerConnection>,
    incoming: Mutex<mpsc::Receiver<Arc<webrtc::data_channel::RTCDataChannel>>>,
    // appended by the transport's candidate callback, read after ice_ready
    candidates: Arc<Mutex<Vec<RTCIceCandidateInit>>>,
    ice_ready: CancellationToken,
    closed: CancellationToken,
    close_flag: Arc<AtomicBool>,
    on_close: OnClose,
}

impl PeerSession {
    pub(crate) async fn new(
        local: PrivateKey,
        remote: PublicKey,
        signal: Arc<dyn PacketNetwork>,
        ice_servers: &[String],
        on_close: OnClose,
    ) -> Result<Arc<Self>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: if ice_servers.is_empty() {
                Vec::new()
            } else {
                vec![RTCIceServer {
                    urls: ice_servers.to_vec(),
                    ..Default::default()
                }]
            },
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await?);
        let (incoming_tx, incoming_rx) = mpsc::channel(1);

        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            local,
            remote,
            signal,
            pc,
            incoming: Mutex::new(incoming_rx),
            candidates: Arc::new(Mutex::new(Vec::new())),
            ice_ready: CancellationToken::new(),
            closed: CancellationToken::new(),
            close_flag: Arc::new(AtomicBool::new(false)),
            on_close,
        });
        Self::register_callbacks(&session, incoming_tx);
        Ok(session)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn remote(&self) -> PublicKey {
        self.remote
    }

    fn register_callbacks(
        this: &Arc<Self>,
        incoming_tx: mpsc::Sender<Arc<webrtc::data_channel::RTCDataChannel>>,
    ) {
        let local = this.local.public();
        let remote = this.remote;

        {
            // weak: the connection must not keep its own session alive
            let session = Arc::downgrade(this);
            this.pc
                .on_peer_connection_state_change(Box::new(move |state| {
                    let session = session.clone();
                    Box::pin(async move {
                        tracing::debug!(local = %local, remote = %remote, ?state, "connection state changed");
                        if state == RTCPeerConnectionState::Closed {
                            if let Some(session) = session.upgrade() {
                                tokio::spawn(async move { session.close().await });
                            }
                        }
                    })
                }));
        }
        {
            this.pc.on_data_channel(Box::new(move |dc| {
                let incoming_tx = incoming_tx.clone();
                Box::pin(async move {
                    tracing::debug!(local = %local, remote = %remote, label = %dc.label(), "incoming data channel");
                    if let Err(mpsc::error::TrySendError::Full(dc)) = incoming_tx.try_send(dc) {
                        tracing::warn!(
                            local = %local,
                            remote = %remote,
                            "inbound channel queue is full, dropping data channel"
                        );
                        tokio::spawn(async move {
                            let _ = dc.close().await;
                        });
                    }
                })
            }));
        }
        {
            let candidates = this.candidates.clone();
            let ice_ready = this.ice_ready.clone();
            this.pc
                .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                    let candidates = candidates.clone();
                    let ice_ready = ice_ready.clone();
                    Box::pin(async move {
                        match candidate {
                            Some(candidate) => match candidate.to_json() {
                                Ok(init) => {
                                    tracing::debug!(local = %local, remote = %remote, candidate = %init.candidate, "gathered ice candidate");
                                    candidates.lock().await.push(init);
                                }
                                Err(err) => {
                                    tracing::warn!(local = %local, remote = %remote, error = %err, "failed to encode ice candidate");
                                }
                            },
                            None => ice_ready.cancel(),
                        }
                    })
                }));
        }
        this.pc
            .on_ice_connection_state_change(Box::new(move |state| {
                tracing::debug!(local = %local, remote = %remote, ?state, "ice connection state changed");
                Box::pin(async {})
            }));
        this.pc.on_signaling_state_change(Box::new(move |state| {
            tracing::debug!(local = %local, remote = %remote, ?state, "signaling state changed");
            Box::pin(async {})
        }));
    }

    /// Wait for the next inbound data channel and wrap it in a stream.
    /// Channels whose labels do not carry a port are closed and skipped.
    pub(crate) async fn accept(&self) -> Result<(u16, Arc<dyn Stream>), PeerError> {
        loop {
            let dc = {
                let mut incoming = tokio::select! {
                    _ = self.closed.cancelled() => return Err(NetError::Closed.into()),
                    guard = self.incoming.lock() => guard,
                };
                tokio::select! {
                    _ = self.closed.cancelled() => return Err(NetError::Closed.into()),
                    dc = incoming.recv() => dc.ok_or(NetError::Closed)?,
                }
            };

            match parse_channel_label(dc.label()) {
                Some(port) => return Ok((port, DataStream::new(dc) as Arc<dyn Stream>)),
                None => {
                    tracing::warn!(
                        local = %self.local.public(),
                        remote = %self.remote,
                        label = %dc.label(),
                        "rejecting data channel with invalid label"
                    );
                    let _ = dc.close().await;
                }
            }
        }
    }

    /// Open a data channel to the remote on the given port, driving the offer
    /// handshake if the connection is still fresh. A handshake abandoned
    /// mid-flight (the future dropped) closes the session so the owner's map
    /// entry is released.
    pub(crate) async fn open(this: &Arc<Self>, port: u16) -> Result<Arc<dyn Stream>, PeerError> {
        if this.closed.is_cancelled() {
            return Err(NetError::Closed.into());
        }

        let dc = this
            .pc
            .create_data_channel(&channel_label(port), None)
            .await?;

        if this.pc.connection_state() == RTCPeerConnectionState::New {
            let guard = CloseOnCancel {
                session: Some(this.clone()),
            };
            let result = this.begin_handshake().await;
            guard.disarm();
            if let Err(err) = result {
                this.close().await;
                return Err(err);
            }
        }

        Ok(DataStream::new(dc) as Arc<dyn Stream>)
    }

    /// Dispatch a signal message according to the current signaling state.
    pub(crate) async fn handle(&self, msg: SignalMessage) -> Result<(), PeerError> {
        match msg.typ {
            MessageType::Offer => self.handle_offer(msg).await,
            MessageType::Answer => self.handle_answer(msg).await,
            MessageType::Reject => Err(PeerError::Rejected),
        }
    }

    async fn handle_offer(&self, offer: SignalMessage) -> Result<(), PeerError> {
        let state = self.pc.signaling_state();
        if state != RTCSignalingState::Stable {
            return Err(PeerError::UnexpectedMessage {
                message: MessageType::Offer,
                state: state.to_string(),
            });
        }

        self.pc
            .set_remote_description(RTCSessionDescription::offer(offer.sdp)?)
            .await?;
        for candidate in offer.ice_candidates {
            self.pc.add_ice_candidate(candidate).await?;
        }

        let answer = self.pc.create_answer(None).await?;
        let sdp = answer.sdp.clone();
        self.pc.set_local_description(answer).await?;
        self.wait_ice_ready().await?;

        let ice_candidates = self.candidates.lock().await.clone();
        self.send(SignalMessage {
            typ: MessageType::Answer,
            sdp,
            ice_candidates,
        })
        .await
    }

    async fn handle_answer(&self, answer: SignalMessage) -> Result<(), PeerError> {
        let state = self.pc.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(PeerError::UnexpectedMessage {
                message: MessageType::Answer,
                state: state.to_string(),
            });
        }

        self.pc
            .set_remote_description(RTCSessionDescription::answer(answer.sdp)?)
            .await?;
        for candidate in answer.ice_candidates {
            self.pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn begin_handshake(&self) -> Result<(), PeerError> {
        let offer = self.pc.create_offer(None).await?;
        let sdp = offer.sdp.clone();
        self.pc.set_local_description(offer).await?;
        self.wait_ice_ready().await?;

        let ice_candidates = self.candidates.lock().await.clone();
        self.send(SignalMessage {
            typ: MessageType::Offer,
            sdp,
            ice_candidates,
        })
        .await
    }

    async fn wait_ice_ready(&self) -> Result<(), PeerError> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::Closed.into()),
            _ = self.ice_ready.cancelled() => Ok(()),
        }
    }

    /// Send a signal message to the remote; abandoned if the session closes
    /// while the send is in flight.
    async fn send(&self, msg: SignalMessage) -> Result<(), PeerError> {
        let data = serde_json::to_vec(&msg)?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::Closed.into()),
            sent = self.signal.send(&self.local, &self.remote, &data) => Ok(sent?),
        }
    }

    /// Close the session. Idempotent; notifies the owner exactly once.
    pub(crate) async fn close(&self) {
        if self.close_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(local = %self.local.public(), remote = %self.remote, "closing peer session");
        self.closed.cancel();
        let _ = self.pc.close().await;
        (self.on_close)(self.remote, self.id);
    }
}

/// Closes the session if dropped before being disarmed.
struct CloseOnCancel {
    session: Option<Arc<PeerSession>>,
}

impl CloseOnCancel {
    fn disarm(mut self) {
        self.session = None;
    }
}

impl Drop for CloseOnCancel {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            tokio::spawn(async move { session.close().await });
        }
    }
}
