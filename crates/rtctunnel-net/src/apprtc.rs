//! Rendezvous signal client
//!
//! Implements [`PacketNetwork`] against the public apprtc-style rendezvous
//! service:
//! - receive: a pooled WebSocket to `<base>/ws`, registered to a room named
//!   after the local public key, delivering `{"msg","error"}` JSON frames
//!   whose `msg` is the base58 of a sealed box
//! - send: HTTP POST of the base58 sealed box to `<base>/<remote>/$`
//!
//! Both paths retry transport failures with backoff. Malformed payloads are
//! dropped and the receive loop keeps going.

use crate::backoff::Backoff;
use crate::wspool::{PoolConfig, WebSocketPool};
use crate::{NetError, PacketNetwork};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rtctunnel_crypt::{PrivateKey, PublicKey};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

/// Configuration for an [`ApprtcNetwork`]
#[derive(Debug, Clone)]
pub struct ApprtcConfig {
    /// Base URL of the rendezvous service
    pub url: String,
}

impl Default for ApprtcConfig {
    fn default() -> Self {
        Self {
            url: "https://apprtc-ws.webrtc.org".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    error: String,
}

/// [`PacketNetwork`] implemented over the rendezvous service.
pub struct ApprtcNetwork {
    cfg: ApprtcConfig,
    pool: WebSocketPool,
    http: reqwest::Client,
    closed: CancellationToken,
}

impl ApprtcNetwork {
    pub fn new(cfg: ApprtcConfig) -> Self {
        Self {
            cfg,
            pool: WebSocketPool::new(PoolConfig::default()),
            http: reqwest::Client::new(),
            closed: CancellationToken::new(),
        }
    }

    /// One receive attempt: returns the base58 payload of the next frame.
    async fn recv_encoded(&self, url: &str, local: &PrivateKey) -> Result<String, NetError> {
        let mut sock = self.pool.acquire(url).await?;

        if sock.is_new() {
            let register = serde_json::json!({
                "cmd": "register",
                "roomid": local.public().to_string(),
                "clientid": local.public().to_string(),
            });
            let frame = WsMessage::Text(register.to_string());
            if let Err(err) = sock.conn().send(frame).await {
                sock.fail();
                return Err(NetError::Transport(format!(
                    "error registering rendezvous room: {err}"
                )));
            }
        }

        loop {
            let msg = match sock.conn().next().await {
                Some(Ok(msg)) => msg,
                Some(Err(err)) => {
                    sock.fail();
                    return Err(NetError::Transport(err.to_string()));
                }
                None => {
                    sock.fail();
                    return Err(NetError::Transport("websocket closed".to_string()));
                }
            };
            let text = match msg {
                WsMessage::Text(text) => text,
                WsMessage::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(err) => {
                        sock.fail();
                        return Err(NetError::Decode(err.to_string()));
                    }
                },
                // control frames are not payload
                _ => continue,
            };

            let frame: Frame = match serde_json::from_str(&text) {
                Ok(frame) => frame,
                Err(err) => {
                    sock.fail();
                    return Err(NetError::Decode(err.to_string()));
                }
            };
            if !frame.error.is_empty() {
                sock.fail();
                return Err(NetError::Transport(frame.error));
            }
            return Ok(frame.msg);
        }
    }
}

impl Default for ApprtcNetwork {
    fn default() -> Self {
        Self::new(ApprtcConfig::default())
    }
}

#[async_trait]
impl PacketNetwork for ApprtcNetwork {
    async fn recv(&self, local: &PrivateKey) -> Result<(PublicKey, Vec<u8>), NetError> {
        let mut backoff = Backoff::default();
        let url = format!("{}/ws", self.cfg.url);

        loop {
            let result = tokio::select! {
                _ = self.closed.cancelled() => return Err(NetError::Closed),
                result = self.recv_encoded(&url, local) => result,
            };

            let err = match result {
                Ok(encoded) => {
                    match decode_box(local, &encoded) {
                        Ok((remote, data)) => {
                            tracing::debug!(
                                url = %url,
                                local = %local.public(),
                                remote = %remote,
                                size = data.len(),
                                "rendezvous recv"
                            );
                            return Ok((remote, data));
                        }
                        // drop the packet, keep the connection
                        Err(err) => err,
                    }
                }
                Err(NetError::Closed) => return Err(NetError::Closed),
                Err(err) => err,
            };

            tracing::error!(url = %url, local = %local.public(), error = %err, "rendezvous recv failed");
            tokio::select! {
                _ = self.closed.cancelled() => return Err(NetError::Closed),
                _ = tokio::time::sleep(backoff.next()) => {}
            }
        }
    }

    async fn send(
        &self,
        local: &PrivateKey,
        remote: &PublicKey,
        data: &[u8],
    ) -> Result<(), NetError> {
        let mut backoff = Backoff::default();
        let encoded = bs58::encode(local.encrypt(remote, data)).into_string();
        let url = format!("{}/{}/$", self.cfg.url, remote);

        tracing::debug!(
            url = %url,
            local = %local.public(),
            remote = %remote,
            size = encoded.len(),
            "rendezvous send"
        );

        loop {
            // a fresh request per attempt: the body of a sent request is
            // consumed and cannot be replayed
            let attempt = self.http.post(&url).body(encoded.clone()).send();
            let result = tokio::select! {
                _ = self.closed.cancelled() => return Err(NetError::Closed),
                result = attempt => result,
            };
            match result {
                Ok(response) => {
                    // drain and discard; transport success is all that matters
                    let _ = response.bytes().await;
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(url = %url, error = %err, "rendezvous send failed");
                }
            }
            tokio::select! {
                _ = self.closed.cancelled() => return Err(NetError::Closed),
                _ = tokio::time::sleep(backoff.next()) => {}
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
        self.pool.close().await;
    }
}

fn decode_box(local: &PrivateKey, encoded: &str) -> Result<(PublicKey, Vec<u8>), NetError> {
    let sealed = bs58::decode(encoded)
        .into_vec()
        .map_err(|err| NetError::Decode(err.to_string()))?;
    let (remote, data) = local.decrypt(&sealed)?;
    Ok((remote, data))
}
