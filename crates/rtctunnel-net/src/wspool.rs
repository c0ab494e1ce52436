//! Reference-counted, idle-reaped WebSocket connection pool
//!
//! The rendezvous server's WebSocket carries a long-lived registration, so
//! reopening it on every receive would lose the subscription. The pool keeps
//! one shared connection per URL, serializes holders, and a background reaper
//! closes connections that have been idle with no holders for longer than the
//! idle timeout.

use crate::NetError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, Weak};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

pub type WsConn = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for a [`WebSocketPool`]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long an entry with no holders may sit unused before its connection
    /// is closed and evicted
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
        }
    }
}

struct Entry {
    conn: Arc<Mutex<Option<WsConn>>>,
    active: AtomicUsize,
    last_access: SyncMutex<Instant>,
}

impl Entry {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            conn: Arc::new(Mutex::new(None)),
            active: AtomicUsize::new(0),
            last_access: SyncMutex::new(Instant::now()),
        })
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        *self.last_access.lock().unwrap() = Instant::now();
    }
}

struct PoolInner {
    cfg: PoolConfig,
    entries: SyncMutex<HashMap<String, Arc<Entry>>>,
    reaper_started: AtomicBool,
    closed: CancellationToken,
}

/// Pool of WebSocket connections keyed by canonicalized URL.
pub struct WebSocketPool {
    inner: Arc<PoolInner>,
}

impl WebSocketPool {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                cfg,
                entries: SyncMutex::new(HashMap::new()),
                reaper_started: AtomicBool::new(false),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Acquire exclusive access to the pooled connection for `url`, dialing
    /// it if there is none. The returned socket reports whether this holder
    /// is the first user of a fresh connection.
    pub async fn acquire(&self, url: &str) -> Result<PooledSocket, NetError> {
        let inner = &self.inner;
        if inner.closed.is_cancelled() {
            return Err(NetError::Closed);
        }
        if !inner.reaper_started.swap(true, Ordering::SeqCst) {
            spawn_reaper(inner);
        }

        let wsurl = canonical_ws_url(url);
        let entry = {
            let mut entries = inner.entries.lock().unwrap();
            entries.entry(wsurl.clone()).or_insert_with(Entry::new).clone()
        };
        entry.active.fetch_add(1, Ordering::SeqCst);

        // holders are mutually exclusive per URL
        let mut guard = tokio::select! {
            _ = inner.closed.cancelled() => {
                entry.release();
                return Err(NetError::Closed);
            }
            guard = entry.conn.clone().lock_owned() => guard,
        };

        let is_new = guard.is_none();
        if is_new {
            match dial(url, &wsurl).await {
                Ok(conn) => *guard = Some(conn),
                Err(err) => {
                    entry.release();
                    return Err(err);
                }
            }
        }

        Ok(PooledSocket {
            guard,
            entry,
            is_new,
            failed: false,
        })
    }

    /// Shut down the pool, closing every pooled connection. Idempotent.
    pub async fn close(&self) {
        self.inner.closed.cancel();
        let entries: Vec<_> = {
            let mut entries = self.inner.entries.lock().unwrap();
            entries.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            let mut guard = entry.conn.lock().await;
            if let Some(mut conn) = guard.take() {
                let _ = conn.close(None).await;
            }
        }
    }
}

fn spawn_reaper(inner: &Arc<PoolInner>) {
    let pool = Arc::downgrade(inner);
    let closed = inner.closed.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = closed.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(pool) = Weak::upgrade(&pool) else {
                return;
            };
            reap_idle(&pool).await;
        }
    });
}

async fn reap_idle(inner: &PoolInner) {
    let idle = inner.cfg.idle_timeout;
    let expired: Vec<_> = {
        let mut entries = inner.entries.lock().unwrap();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(_, e)| {
                e.active.load(Ordering::SeqCst) == 0
                    && e.last_access.lock().unwrap().elapsed() >= idle
            })
            .map(|(url, _)| url.clone())
            .collect();
        keys.into_iter().filter_map(|k| entries.remove(&k)).collect()
    };
    for entry in expired {
        let mut guard = entry.conn.lock().await;
        if let Some(mut conn) = guard.take() {
            tracing::debug!("closing idle pooled websocket");
            let _ = conn.close(None).await;
        }
    }
}

/// Exclusive access to one pooled connection.
///
/// Dropping the socket returns the connection to the pool and stamps its
/// last-access time. Call [`PooledSocket::fail`] first if the connection is
/// broken: the entry is discarded so the next acquirer re-dials.
pub struct PooledSocket {
    guard: OwnedMutexGuard<Option<WsConn>>,
    entry: Arc<Entry>,
    is_new: bool,
    failed: bool,
}

impl std::fmt::Debug for PooledSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSocket")
            .field("is_new", &self.is_new)
            .field("failed", &self.failed)
            .finish()
    }
}

impl PooledSocket {
    /// Whether this holder dialed a fresh connection.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn conn(&mut self) -> &mut WsConn {
        self.guard.as_mut().expect("acquired socket holds a connection")
    }

    /// Mark the connection broken so it is closed and discarded on drop.
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for PooledSocket {
    fn drop(&mut self) {
        if self.failed {
            if let Some(mut conn) = self.guard.take() {
                tokio::spawn(async move {
                    let _ = conn.close(None).await;
                });
            }
        }
        self.entry.release();
    }
}

async fn dial(origin: &str, wsurl: &str) -> Result<WsConn, NetError> {
    let mut request = wsurl
        .into_client_request()
        .map_err(|err| NetError::Transport(format!("invalid websocket url {wsurl}: {err}")))?;
    if let Ok(value) = HeaderValue::from_str(origin) {
        request.headers_mut().insert("Origin", value);
    }

    match connect_async(request).await {
        Ok((conn, _resp)) => Ok(conn),
        Err(WsError::Http(resp)) => {
            let status = resp.status();
            let body = resp
                .into_body()
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_default();
            Err(NetError::Transport(format!(
                "error connecting to websocket (url={wsurl} status={status} msg={body})"
            )))
        }
        Err(err) => Err(NetError::Transport(format!(
            "error connecting to websocket (url={wsurl}): {err}"
        ))),
    }
}

/// Rewrite an `http(s)` URL to the matching `ws(s)` URL.
pub fn canonical_ws_url(url: &str) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return url.to_string();
    };
    let scheme = match parsed.scheme() {
        "https" => "wss",
        "http" => "ws",
        _ => return url.to_string(),
    };
    if parsed.set_scheme(scheme).is_err() {
        return url.to_string();
    }
    parsed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_canonical_ws_url() {
        assert_eq!(canonical_ws_url("https://host/ws"), "wss://host/ws");
        assert_eq!(canonical_ws_url("http://host:8080/ws"), "ws://host:8080/ws");
        // default ports are normalized away
        assert_eq!(canonical_ws_url("http://host:80/ws"), "ws://host/ws");
        assert_eq!(canonical_ws_url("wss://host/ws"), "wss://host/ws");
        assert_eq!(canonical_ws_url("not a url"), "not a url");
    }

    /// Accepts websocket upgrades and discards every frame.
    async fn spawn_ws_sink() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                        while let Some(Ok(_)) = ws.next().await {}
                    }
                });
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_acquire_shares_a_connection() {
        let url = spawn_ws_sink().await;
        let pool = WebSocketPool::new(PoolConfig::default());

        let sock = pool.acquire(&url).await.unwrap();
        assert!(sock.is_new());
        drop(sock);

        let sock = pool.acquire(&url).await.unwrap();
        assert!(!sock.is_new());
        drop(sock);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_failed_connection_is_discarded() {
        let url = spawn_ws_sink().await;
        let pool = WebSocketPool::new(PoolConfig::default());

        let mut sock = pool.acquire(&url).await.unwrap();
        assert!(sock.is_new());
        sock.fail();
        drop(sock);

        let sock = pool.acquire(&url).await.unwrap();
        assert!(sock.is_new());
        drop(sock);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_idle_connections_are_reaped() {
        let url = spawn_ws_sink().await;
        let pool = WebSocketPool::new(PoolConfig {
            idle_timeout: Duration::from_millis(100),
        });

        drop(pool.acquire(&url).await.unwrap());
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let sock = pool.acquire(&url).await.unwrap();
        assert!(sock.is_new());
        drop(sock);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_acquire_after_close_fails() {
        let pool = WebSocketPool::new(PoolConfig::default());
        pool.close().await;
        assert!(matches!(
            pool.acquire("http://127.0.0.1:1/ws").await,
            Err(NetError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_reports_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = WebSocketPool::new(PoolConfig::default());
        let err = pool.acquire(&format!("http://{addr}/ws")).await.unwrap_err();
        assert!(matches!(err, NetError::Transport(_)));
        pool.close().await;
    }
}
