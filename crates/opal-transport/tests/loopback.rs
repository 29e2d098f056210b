//! End-to-end tests driving two endpoints over loopback UDP, with a small
//! in-process proxy for loss injection.

use bytes::Bytes;
use opal_transport::{
    Endpoint, FlowConfig, FrameMeta, SendOptions, SocketType, TransportError,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().expect("loopback address")
}

async fn bound_pair(cfg: FlowConfig) -> (Endpoint, Endpoint, SocketAddr) {
    let server = Endpoint::bind(loopback(), cfg.clone()).await.expect("bind server");
    server.listen();
    let server_addr = server.local_addr().expect("server addr");
    let client = Endpoint::bind(loopback(), cfg).await.expect("bind client");
    (server, client, server_addr)
}

/// Forwards datagrams between one client and a fixed server address.
/// Client-to-server data packets can be dropped (first transmission only),
/// and the whole path can be blackholed.
struct Proxy {
    addr: SocketAddr,
    blackhole: Arc<AtomicBool>,
}

async fn spawn_proxy(server: SocketAddr, drop_every: Option<u64>) -> Proxy {
    let socket = UdpSocket::bind(loopback()).await.expect("bind proxy");
    let addr = socket.local_addr().expect("proxy addr");
    let blackhole = Arc::new(AtomicBool::new(false));
    let hole = blackhole.clone();
    tokio::spawn(async move {
        let mut client: Option<SocketAddr> = None;
        let mut seen: HashSet<u32> = HashSet::new();
        let mut distinct = 0u64;
        let mut buf = vec![0u8; 65536];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                continue;
            };
            if hole.load(Ordering::SeqCst) {
                continue;
            }
            let data = &buf[..len];
            if from == server {
                if let Some(c) = client {
                    let _ = socket.send_to(data, c).await;
                }
                continue;
            }
            client = Some(from);
            if let Some(every) = drop_every {
                if len >= 4 {
                    let word0 = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    if word0 & 0x8000_0000 == 0 && seen.insert(word0) {
                        distinct += 1;
                        if distinct % every == 0 {
                            // First transmission of this sequence vanishes;
                            // the retransmission will pass through.
                            continue;
                        }
                    }
                }
            }
            let _ = socket.send_to(data, server).await;
        }
    });
    Proxy { addr, blackhole }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

async fn drain_exact(conn: &opal_transport::Connection, total: usize) -> Vec<u8> {
    let mut received = Vec::with_capacity(total);
    let mut buf = vec![0u8; 64 * 1024];
    while received.len() < total {
        let n = conn.recv(&mut buf).await.expect("recv");
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    received
}

#[tokio::test]
async fn stream_delivery_without_loss() {
    let (server, client, server_addr) = bound_pair(FlowConfig::default()).await;

    const TOTAL: usize = 512 * 1024;
    let sent = pattern(TOTAL);
    let payload = sent.clone();

    let conn_out = timeout(Duration::from_secs(10), client.connect(server_addr))
        .await
        .expect("connect deadline")
        .expect("connect");
    let conn_in = timeout(Duration::from_secs(10), server.accept())
        .await
        .expect("accept deadline")
        .expect("accept");

    let sender = tokio::spawn(async move {
        for chunk in payload.chunks(32 * 1024) {
            conn_out
                .send(Bytes::copy_from_slice(chunk))
                .await
                .expect("send");
        }
        conn_out.close().await.expect("close");
    });

    let received = timeout(Duration::from_secs(30), drain_exact(&conn_in, TOTAL))
        .await
        .expect("delivery deadline");
    sender.await.expect("sender task");

    assert_eq!(received.len(), TOTAL);
    assert_eq!(received, sent);
}

#[tokio::test]
async fn media_frame_metadata_travels_per_chunk() {
    let cfg = FlowConfig {
        socket_type: SocketType::Media,
        ..Default::default()
    };
    let (server, client, server_addr) = bound_pair(cfg).await;

    let conn_out = timeout(Duration::from_secs(10), client.connect(server_addr))
        .await
        .expect("connect deadline")
        .expect("connect");
    let conn_in = timeout(Duration::from_secs(10), server.accept())
        .await
        .expect("accept deadline")
        .expect("accept");

    const CHUNKS: u8 = 100;
    let sender = tokio::spawn(async move {
        for chunk_id in 0..CHUNKS {
            let meta = FrameMeta {
                frame_id: 0,
                chunk_id,
                total_chunks: CHUNKS,
                deadline_us: 16_000,
            };
            let body = Bytes::from(vec![chunk_id; 1200]);
            conn_out
                .send_with(body, SendOptions::frame(meta))
                .await
                .expect("send chunk");
        }
        conn_out.close().await.expect("close");
    });

    for expect_chunk in 0..CHUNKS {
        let msg = timeout(Duration::from_secs(15), conn_in.recv_msg())
            .await
            .expect("recv deadline")
            .expect("recv_msg")
            .expect("stream ended early");
        let meta = msg.frame.expect("chunk carries metadata");
        assert_eq!(meta.frame_id, 0);
        assert_eq!(meta.chunk_id, expect_chunk);
        assert_eq!(meta.total_chunks, CHUNKS);
        assert_eq!(meta.deadline_us, 16_000);
        assert_eq!(msg.data.len(), 1200);
        assert!(msg.data.iter().all(|&b| b == expect_chunk));
    }
    let eof = timeout(Duration::from_secs(15), conn_in.recv_msg())
        .await
        .expect("eof deadline")
        .expect("recv_msg at eof");
    assert!(eof.is_none());
    sender.await.expect("sender task");
}

#[tokio::test]
async fn recovers_from_injected_loss() {
    let (server, client, server_addr) = bound_pair(FlowConfig::default()).await;
    let proxy = spawn_proxy(server_addr, Some(7)).await;

    const TOTAL: usize = 200 * 1024;
    let sent = pattern(TOTAL);
    let payload = sent.clone();

    let conn_out = timeout(Duration::from_secs(10), client.connect(proxy.addr))
        .await
        .expect("connect deadline")
        .expect("connect through proxy");
    let conn_in = timeout(Duration::from_secs(10), server.accept())
        .await
        .expect("accept deadline")
        .expect("accept");

    let sender = tokio::spawn(async move {
        for chunk in payload.chunks(16 * 1024) {
            conn_out
                .send(Bytes::copy_from_slice(chunk))
                .await
                .expect("send");
        }
        // Keep the flow open until the receiver confirms everything; the
        // retransmission tail needs the connection alive.
        conn_out.close().await.expect("close");
    });

    let received = timeout(Duration::from_secs(60), drain_exact(&conn_in, TOTAL))
        .await
        .expect("recovery deadline");
    sender.await.expect("sender task");

    assert_eq!(received.len(), TOTAL, "bytes lost despite retransmission");
    assert_eq!(received, sent, "stream corrupted by loss recovery");

    let stats = conn_in.stats().await;
    assert!(stats.naks_sent > 0, "loss was never reported");
}

#[tokio::test]
async fn clean_shutdown_surfaces_end_of_stream() {
    let (server, client, server_addr) = bound_pair(FlowConfig::default()).await;

    let conn_out = timeout(Duration::from_secs(10), client.connect(server_addr))
        .await
        .expect("connect deadline")
        .expect("connect");
    let conn_in = timeout(Duration::from_secs(10), server.accept())
        .await
        .expect("accept deadline")
        .expect("accept");

    conn_out
        .send(Bytes::from_static(b"final words"))
        .await
        .expect("send");
    conn_out.close().await.expect("close");

    let mut buf = [0u8; 64];
    let mut collected = Vec::new();
    loop {
        let n = timeout(Duration::from_secs(15), conn_in.recv(&mut buf))
            .await
            .expect("recv deadline")
            .expect("recv");
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(&collected, b"final words");
}

#[tokio::test]
async fn connect_fails_against_silent_peer() {
    // A plain UDP socket that never answers.
    let sink = UdpSocket::bind(loopback()).await.expect("bind sink");
    let sink_addr = sink.local_addr().expect("sink addr");
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let _ = sink.recv_from(&mut buf).await;
        }
    });

    let client = Endpoint::bind(loopback(), FlowConfig::default())
        .await
        .expect("bind client");
    let started = Instant::now();
    let result = timeout(Duration::from_secs(30), client.connect(sink_addr))
        .await
        .expect("connect must give up before the deadline");
    assert!(matches!(result, Err(TransportError::Handshake(_))));
    assert!(
        started.elapsed() >= Duration::from_secs(1),
        "gave up without retrying"
    );
}

#[tokio::test]
async fn silenced_peer_breaks_flow() {
    let (server, client, server_addr) = bound_pair(FlowConfig::default()).await;
    let proxy = spawn_proxy(server_addr, None).await;

    let conn_out = timeout(Duration::from_secs(10), client.connect(proxy.addr))
        .await
        .expect("connect deadline")
        .expect("connect through proxy");
    let conn_in = timeout(Duration::from_secs(10), server.accept())
        .await
        .expect("accept deadline")
        .expect("accept");

    // One exchanged message proves the path, then the line goes dead.
    conn_out
        .send(Bytes::from_static(b"ping"))
        .await
        .expect("send");
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(10), conn_in.recv(&mut buf))
        .await
        .expect("recv deadline")
        .expect("recv");
    assert_eq!(&buf[..n], b"ping");

    proxy.blackhole.store(true, Ordering::SeqCst);

    let started = Instant::now();
    let err = timeout(Duration::from_secs(40), conn_in.recv(&mut buf))
        .await
        .expect("expiration must fire before the deadline")
        .expect_err("flow should break, not deliver");
    assert!(matches!(err, TransportError::ConnectionBroken));
    assert!(
        started.elapsed() >= Duration::from_secs(8),
        "broke suspiciously early: {:?}",
        started.elapsed()
    );
}
