//! End-to-end tests over the in-memory signal
//!
//! These run two networks in one process with an in-memory packet network as
//! the signal and an empty ICE server list, so candidate gathering stays on
//! host candidates and the peer connections negotiate over loopback.

use rtctunnel_crypt::PrivateKey;
use rtctunnel_net::memory::MemoryPacketNetwork;
use rtctunnel_net::{read_full, NetError, PacketNetwork, Stream};
use rtctunnel_webrtc::{MessageType, Network, NetworkConfig, SignalMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(signal: &Arc<MemoryPacketNetwork>) -> NetworkConfig {
    NetworkConfig {
        signal: signal.clone(),
        accept_all_peers: false,
        accept_peers: Vec::new(),
        ice_servers: Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_end_to_end_over_memory_signal() {
    init_logging();

    let k1 = PrivateKey::generate();
    let k2 = PrivateKey::generate();
    let signal = Arc::new(MemoryPacketNetwork::new());

    let n1 = Arc::new(Network::new(config(&signal)));
    let n2 = Arc::new(Network::new(NetworkConfig {
        accept_peers: vec![k1.public()],
        ..config(&signal)
    }));

    let writer = {
        let n1 = n1.clone();
        let k1 = k1.clone();
        let k2_pub = k2.public();
        tokio::spawn(async move {
            let stream = n1.open(&k1, &k2_pub, 5000).await?;
            let n = stream.write(b"Hello World").await?;
            assert_eq!(n, 11);
            Ok::<_, NetError>(())
        })
    };

    let (remote, port, stream) = timeout(Duration::from_secs(30), n2.accept(&k2))
        .await
        .expect("accept timed out")
        .expect("accept failed");
    assert_eq!(remote, k1.public());
    assert_eq!(port, 5000);

    let mut buf = [0u8; 11];
    timeout(Duration::from_secs(30), read_full(stream.as_ref(), &mut buf))
        .await
        .expect("read timed out")
        .expect("read failed");
    assert_eq!(&buf, b"Hello World");

    timeout(Duration::from_secs(30), writer)
        .await
        .expect("write timed out")
        .unwrap()
        .unwrap();

    // the only expected peer is established, so n2's reconciliation stops
    // pulling from the signal
    assert_eq!(n2.peer_count(&k2.public()).await, 1);
    sleep(Duration::from_millis(2500)).await;

    let k3 = PrivateKey::generate();
    signal.send(&k3, &k2.public(), b"first fills the mailbox").await.unwrap();
    let second = timeout(
        Duration::from_millis(200),
        signal.send(&k3, &k2.public(), b"second has nowhere to go"),
    )
    .await;
    assert!(second.is_err(), "receiver still draining the signal");

    n1.close().await;
    n2.close().await;
    signal.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reject_tears_down_the_session() {
    init_logging();

    let k1 = PrivateKey::generate();
    let k2 = PrivateKey::generate();
    let signal = Arc::new(MemoryPacketNetwork::new());

    // drain everything addressed to k2 so offers never back up the mailbox
    let drainer = {
        let signal = signal.clone();
        let k2 = k2.clone();
        tokio::spawn(async move { while signal.recv(&k2).await.is_ok() {} })
    };

    let n1 = Arc::new(Network::new(config(&signal)));
    let _stream = timeout(Duration::from_secs(10), n1.open(&k1, &k2.public(), 80))
        .await
        .expect("open timed out")
        .expect("open failed");
    assert_eq!(n1.peer_count(&k1.public()).await, 1);

    let reject = serde_json::to_vec(&SignalMessage {
        typ: MessageType::Reject,
        sdp: String::new(),
        ice_candidates: Vec::new(),
    })
    .unwrap();
    signal.send(&k2, &k1.public(), &reject).await.unwrap();

    wait_for_peer_count(&n1, &k1, 0).await;

    // a subsequent open builds a fresh session
    let _stream = timeout(Duration::from_secs(10), n1.open(&k1, &k2.public(), 80))
        .await
        .expect("reopen timed out")
        .expect("reopen failed");
    assert_eq!(n1.peer_count(&k1.public()).await, 1);

    n1.close().await;
    signal.close().await;
    drainer.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_datagrams_create_no_sessions() {
    init_logging();

    let k1 = PrivateKey::generate();
    let k2 = PrivateKey::generate();
    let signal = Arc::new(MemoryPacketNetwork::new());

    let n1 = Arc::new(Network::new(NetworkConfig {
        accept_all_peers: true,
        ..config(&signal)
    }));

    // accept() instantiates the multiplexer and its receiver
    let acceptor = {
        let n1 = n1.clone();
        let k1 = k1.clone();
        tokio::spawn(async move { n1.accept(&k1).await })
    };

    for garbage in [&b"not json"[..], &b"{\"Type\":\"hello\"}"[..], &[0xff, 0xfe][..]] {
        signal.send(&k2, &k1.public(), garbage).await.unwrap();
    }
    sleep(Duration::from_millis(500)).await;
    assert_eq!(n1.peer_count(&k1.public()).await, 0);

    acceptor.abort();
    n1.close().await;
    signal.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_answer_in_stable_state_fails_the_session() {
    init_logging();

    let k1 = PrivateKey::generate();
    let k2 = PrivateKey::generate();
    let signal = Arc::new(MemoryPacketNetwork::new());

    let n1 = Arc::new(Network::new(NetworkConfig {
        accept_all_peers: true,
        ..config(&signal)
    }));
    let acceptor = {
        let n1 = n1.clone();
        let k1 = k1.clone();
        tokio::spawn(async move { n1.accept(&k1).await })
    };

    let answer = serde_json::to_vec(&SignalMessage {
        typ: MessageType::Answer,
        sdp: String::new(),
        ice_candidates: Vec::new(),
    })
    .unwrap();
    signal.send(&k2, &k1.public(), &answer).await.unwrap();

    // the session the answer spawned is failed and removed
    sleep(Duration::from_millis(500)).await;
    assert_eq!(n1.peer_count(&k1.public()).await, 0);

    acceptor.abort();
    n1.close().await;
    signal.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_accept_queue_overflow_closes_newest_peer() {
    init_logging();

    let server = PrivateKey::generate();
    let signal = Arc::new(MemoryPacketNetwork::new());

    let opener = Arc::new(Network::new(config(&signal)));
    let listener = Arc::new(Network::new(NetworkConfig {
        accept_all_peers: true,
        ..config(&signal)
    }));

    // instantiate the listener's multiplexer and receiver, but never drain
    // the accept queue
    let acceptor = {
        let listener = listener.clone();
        let server = server.clone();
        tokio::spawn(async move { listener.accept(&server).await })
    };
    sleep(Duration::from_millis(200)).await;
    acceptor.abort();

    // one more inbound peer than the accept queue holds
    let mut streams = Vec::new();
    for i in 0..17u16 {
        let client = PrivateKey::generate();
        let stream = timeout(
            Duration::from_secs(30),
            opener.open(&client, &server.public(), 4000 + i),
        )
        .await
        .expect("open timed out")
        .expect("open failed");
        streams.push(stream);
    }

    // the single-slot signal mailbox serializes delivery: once two junk
    // datagrams have been queued behind the last offer, the receiver has
    // finished processing all seventeen
    let probe = PrivateKey::generate();
    signal.send(&probe, &server.public(), b"junk").await.unwrap();
    signal.send(&probe, &server.public(), b"junk").await.unwrap();

    // the seventeenth session was closed on overflow; the queued sixteen
    // stay live
    wait_for_peer_count(&listener, &server, 16).await;

    opener.close().await;
    listener.close().await;
    signal.close().await;
}

async fn wait_for_peer_count(network: &Network, local: &PrivateKey, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if network.peer_count(&local.public()).await == expected {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "peer count never reached {expected}, still {}",
                network.peer_count(&local.public()).await
            );
        }
        sleep(Duration::from_millis(50)).await;
    }
}
