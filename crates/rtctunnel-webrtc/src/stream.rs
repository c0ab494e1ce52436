//! Stream over one WebRTC data channel
//!
//! Wraps an [`RTCDataChannel`] in the [`Stream`] contract: reads drain an
//! internal buffer before blocking on the incoming-message queue, writes wait
//! for the channel to open, and close is one-shot in both directions.

use async_trait::async_trait;
use bytes::Bytes;
use rtctunnel_net::{NetError, Stream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

// the remote's on_open handler can lag ours; give it a beat before the
// first send
const OPEN_SETTLE_DELAY: Duration = Duration::from_millis(100);

pub(crate) struct DataStream {
    dc: Arc<RTCDataChannel>,
    buf: Mutex<Vec<u8>>,
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    opened: CancellationToken,
    closed: CancellationToken,
    close_flag: Arc<AtomicBool>,
}

impl DataStream {
    pub(crate) fn new(dc: Arc<RTCDataChannel>) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::channel(1);
        let opened = CancellationToken::new();
        let closed = CancellationToken::new();
        let close_flag = Arc::new(AtomicBool::new(false));
        let label = dc.label().to_string();

        {
            let opened = opened.clone();
            let label = label.clone();
            dc.on_open(Box::new(move || {
                let opened = opened.clone();
                let label = label.clone();
                Box::pin(async move {
                    tracing::debug!(label = %label, "data channel open");
                    tokio::time::sleep(OPEN_SETTLE_DELAY).await;
                    opened.cancel();
                })
            }));
        }
        {
            let closed = closed.clone();
            dc.on_message(Box::new(move |msg: DataChannelMessage| {
                let closed = closed.clone();
                let incoming_tx = incoming_tx.clone();
                Box::pin(async move {
                    tokio::select! {
                        _ = closed.cancelled() => {}
                        _ = incoming_tx.send(msg.data.to_vec()) => {}
                    }
                })
            }));
        }
        {
            let closed = closed.clone();
            let close_flag = close_flag.clone();
            let label = label.clone();
            dc.on_close(Box::new(move || {
                let closed = closed.clone();
                let close_flag = close_flag.clone();
                let label = label.clone();
                Box::pin(async move {
                    tracing::debug!(label = %label, "data channel closed by transport");
                    shutdown(&Weak::new(), &closed, &close_flag);
                })
            }));
        }
        {
            // a weak handle: the channel must not keep itself alive through
            // its own error handler
            let dc_weak = Arc::downgrade(&dc);
            let closed = closed.clone();
            let close_flag = close_flag.clone();
            dc.on_error(Box::new(move |err| {
                let dc_weak = dc_weak.clone();
                let closed = closed.clone();
                let close_flag = close_flag.clone();
                let label = label.clone();
                Box::pin(async move {
                    tracing::debug!(label = %label, error = %err, "data channel error");
                    shutdown(&dc_weak, &closed, &close_flag);
                })
            }));
        }

        // the channel may have opened before we were handed it, in which
        // case on_open will never fire
        if dc.ready_state() == RTCDataChannelState::Open {
            opened.cancel();
        }

        Arc::new(Self {
            dc,
            buf: Mutex::new(Vec::new()),
            incoming: Mutex::new(incoming_rx),
            opened,
            closed,
            close_flag,
        })
    }
}

/// One-shot teardown shared by the transport callbacks.
fn shutdown(dc: &Weak<RTCDataChannel>, closed: &CancellationToken, close_flag: &Arc<AtomicBool>) {
    if close_flag.swap(true, Ordering::SeqCst) {
        return;
    }
    closed.cancel();
    if let Some(dc) = dc.upgrade() {
        tokio::spawn(async move {
            let _ = dc.close().await;
        });
    }
}

#[async_trait]
impl Stream for DataStream {
    async fn read(&self, dst: &mut [u8]) -> Result<usize, NetError> {
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
                data = async { self.incoming.lock().await.recv().await } => {
                    data.ok_or(NetError::Closed)?
                }
            };
            self.buf.lock().await.extend_from_slice(&data);
        }
    }

    async fn write(&self, src: &[u8]) -> Result<usize, NetError> {
        tokio::select! {
            _ = self.closed.cancelled() => return Err(NetError::Closed),
            _ = self.opened.cancelled() => {}
        }

        self.dc
            .send(&Bytes::copy_from_slice(src))
            .await
            .map_err(|err| NetError::Transport(err.to_string()))?;
        Ok(src.len())
    }

    async fn close(&self) {
        if self.close_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        let _ = self.dc.close().await;
    }
}
