//! Endpoint: one UDP socket shared by many flows.
//!
//! The endpoint owns the process-wide pieces: the demultiplexing task that
//! routes inbound datagrams by destination socket id, the handshake
//! exchanges that mint new flows, the accept queue, and the per-destination
//! path cache. Socket id 0 is reserved for connection-setup traffic.

use crate::cache::{DestCache, PathRecord};
use crate::channel::UdpChannel;
use crate::config::FlowConfig;
use crate::conn::{Connection, FlowShared, spawn_worker};
use crate::error::{Result, TransportError};
use crate::flow::{Flow, FlowParams};
use crate::protocol::{self, ControlInfo, ControlPacket, Handshake, VERSION, handshake_request};
use crate::seq::SEQ_MAX;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout_at;
use tracing::{debug, error, info, trace, warn};

const ACCEPT_BACKLOG: usize = 64;
const CONNECT_ATTEMPTS: u32 = 6;
const CONNECT_BACKOFF: Duration = Duration::from_millis(250);

pub(crate) struct EndpointInner {
    pub(crate) channel: UdpChannel,
    socket: Arc<UdpSocket>,
    pub(crate) cfg: FlowConfig,
    flows: DashMap<u32, Arc<FlowShared>>,
    /// (peer address, peer socket id) -> local socket id, for duplicate
    /// handshake detection.
    peer_index: DashMap<(SocketAddr, u32), u32>,
    /// In-progress connects awaiting handshake responses, by local id.
    pending: DashMap<u32, mpsc::Sender<(Handshake, SocketAddr)>>,
    /// In-progress rendezvous setups, by peer address.
    rdv_pending: DashMap<SocketAddr, mpsc::Sender<(Handshake, SocketAddr)>>,
    accept_tx: mpsc::Sender<Connection>,
    listening: AtomicBool,
    cache: StdMutex<DestCache>,
    /// Secret folded into handshake cookies.
    secret: u32,
}

/// A bound transport endpoint. Flows created through `connect`, `accept`,
/// or `rendezvous` all share its UDP socket.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    accept_rx: Mutex<mpsc::Receiver<Connection>>,
}

impl Endpoint {
    /// Binds the endpoint and starts its demultiplexing task.
    pub async fn bind(addr: SocketAddr, cfg: FlowConfig) -> Result<Endpoint> {
        cfg.validate()?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let inner = Arc::new(EndpointInner {
            channel: UdpChannel::new(socket.clone()),
            socket,
            cfg,
            flows: DashMap::new(),
            peer_index: DashMap::new(),
            pending: DashMap::new(),
            rdv_pending: DashMap::new(),
            accept_tx,
            listening: AtomicBool::new(false),
            cache: StdMutex::new(DestCache::new()),
            secret: rand::random(),
        });
        tokio::spawn(demux_loop(inner.clone()));
        info!("endpoint bound to {}", local);
        Ok(Endpoint {
            inner,
            accept_rx: Mutex::new(accept_rx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }

    /// Starts answering handshake requests.
    pub fn listen(&self) {
        self.inner.listening.store(true, Ordering::SeqCst);
    }

    /// Waits for the next inbound flow. `listen` must have been called.
    pub async fn accept(&self) -> Result<Connection> {
        if !self.inner.listening.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidConfig(
                "accept called before listen".into(),
            ));
        }
        self.accept_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    /// Opens a flow to a listening peer, retrying the handshake with
    /// backoff until it concludes or the attempts run out.
    pub async fn connect(&self, peer: SocketAddr) -> Result<Connection> {
        self.inner.clone().setup_flow(peer, false).await
    }

    /// Simultaneous open: both sides call `rendezvous` with each other's
    /// address and neither needs to listen.
    pub async fn rendezvous(&self, peer: SocketAddr) -> Result<Connection> {
        self.inner.clone().setup_flow(peer, true).await
    }
}

impl EndpointInner {
    /// Advertised flow window: bounded by what the receive buffer can hold.
    fn advertised_window(&self) -> u32 {
        (self.cfg.rcv_slots() as u32).min(self.cfg.flow_window)
    }

    fn alloc_id(&self) -> u32 {
        loop {
            let id: u32 = rand::random();
            if id != 0 && !self.flows.contains_key(&id) && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn cookie_at(&self, peer: SocketAddr, minute: u64) -> u32 {
        let mut h = self.secret ^ 0x9E37_79B9;
        match peer.ip() {
            std::net::IpAddr::V4(v4) => {
                h = h.wrapping_mul(31).wrapping_add(u32::from(v4));
            }
            std::net::IpAddr::V6(v6) => {
                for seg in v6.segments() {
                    h = h.wrapping_mul(31).wrapping_add(seg as u32);
                }
            }
        }
        h = h.wrapping_mul(31).wrapping_add(peer.port() as u32);
        h = h.wrapping_mul(31).wrapping_add(minute as u32);
        h | 1
    }

    fn current_minute() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() / 60)
            .unwrap_or(0)
    }

    fn cookie_valid(&self, peer: SocketAddr, cookie: u32) -> bool {
        let minute = Self::current_minute();
        cookie == self.cookie_at(peer, minute)
            || cookie == self.cookie_at(peer, minute.wrapping_sub(1))
    }

    /// Registers an established flow, spawns its worker, and hands back the
    /// application handle.
    fn install_flow(self: &Arc<Self>, params: FlowParams) -> Connection {
        let local_id = params.local_id;
        let peer = params.peer;
        let peer_id = params.peer_id;
        let snd_notify = Arc::new(tokio::sync::Notify::new());
        let rcv_notify = Arc::new(tokio::sync::Notify::new());
        let worker_notify = Arc::new(tokio::sync::Notify::new());
        let flow = Flow::new(
            params,
            snd_notify.clone(),
            rcv_notify.clone(),
            worker_notify.clone(),
        );
        let shared = Arc::new(FlowShared {
            peer,
            flow: Mutex::new(flow),
            snd_notify,
            rcv_notify,
            worker_notify,
        });
        self.flows.insert(local_id, shared.clone());
        self.peer_index.insert((peer, peer_id), local_id);
        spawn_worker(self.clone(), shared.clone());
        debug!(
            "flow {} established with {} (peer id {})",
            local_id, peer, peer_id
        );
        Connection {
            shared,
            endpoint: self.clone(),
            local_id,
        }
    }

    /// Removes a finished flow and records its path measurements.
    pub(crate) fn release(
        &self,
        local_id: u32,
        peer: SocketAddr,
        peer_id: u32,
        record: PathRecord,
    ) {
        self.flows.remove(&local_id);
        self.peer_index.remove(&(peer, peer_id));
        if let Ok(mut cache) = self.cache.lock() {
            cache.update(peer.ip(), record);
        }
        debug!("flow {} to {} released", local_id, peer);
    }

    /// Client side of connection setup, both directed (`connect`) and
    /// rendezvous.
    async fn setup_flow(self: Arc<Self>, peer: SocketAddr, rendezvous: bool) -> Result<Connection> {
        let local_id = self.alloc_id();
        let isn: u32 = rand::random::<u32>() & SEQ_MAX;
        let (tx, mut rx) = mpsc::channel(8);
        self.pending.insert(local_id, tx.clone());
        if rendezvous {
            self.rdv_pending.insert(peer, tx);
        }

        let request_type = if rendezvous { 0 } else { 1 };
        let result = self
            .handshake_loop(peer, local_id, isn, request_type, &mut rx)
            .await;

        self.pending.remove(&local_id);
        if rendezvous {
            self.rdv_pending.remove(&peer);
        }
        result
    }

    async fn handshake_loop(
        self: &Arc<Self>,
        peer: SocketAddr,
        local_id: u32,
        isn: u32,
        request_type: i32,
        rx: &mut mpsc::Receiver<(Handshake, SocketAddr)>,
    ) -> Result<Connection> {
        let mut cookie = 0u32;
        for attempt in 0..CONNECT_ATTEMPTS {
            let hs = handshake_request(
                self.cfg.socket_type,
                isn,
                self.cfg.mss as u32,
                self.advertised_window(),
                request_type,
                local_id,
                cookie,
                peer.ip(),
            );
            let pkt = ControlPacket {
                timestamp_us: 0,
                dest_id: 0,
                info: ControlInfo::Handshake(hs),
            };
            if let Err(e) = self.channel.send_ctrl(&pkt, peer).await {
                debug!("handshake send to {} failed: {}", peer, e);
            }

            let wait = CONNECT_BACKOFF * (attempt + 1);
            let deadline = tokio::time::Instant::now() + wait;
            loop {
                let Ok(received) = timeout_at(deadline, rx.recv()).await else {
                    break;
                };
                let Some((resp, from)) = received else {
                    return Err(TransportError::Handshake("endpoint torn down".into()));
                };
                if from != peer || resp.version != VERSION {
                    continue;
                }
                match resp.request_type {
                    -2 => {
                        // Challenge: repeat the request with the cookie.
                        cookie = resp.cookie;
                        break;
                    }
                    -1 => return self.conclude(peer, local_id, isn, &resp),
                    0 if request_type == 0 => {
                        // The rendezvous peer's own request doubles as its
                        // parameter announcement; conclude towards it.
                        let conn = self.conclude(peer, local_id, isn, &resp)?;
                        let reply = handshake_request(
                            resp.socket_type,
                            isn,
                            self.cfg.mss as u32,
                            self.advertised_window(),
                            -1,
                            local_id,
                            resp.cookie,
                            peer.ip(),
                        );
                        let pkt = ControlPacket {
                            timestamp_us: 0,
                            dest_id: resp.socket_id,
                            info: ControlInfo::Handshake(reply),
                        };
                        if let Err(e) = self.channel.send_ctrl(&pkt, peer).await {
                            debug!("rendezvous conclusion to {} failed: {}", peer, e);
                        }
                        return Ok(conn);
                    }
                    other => {
                        trace!("ignoring handshake type {} from {}", other, from);
                    }
                }
            }
        }
        Err(TransportError::Handshake(format!(
            "no response from {} after {} attempts",
            peer, CONNECT_ATTEMPTS
        )))
    }

    /// Builds the established flow from a handshake conclusion.
    fn conclude(
        self: &Arc<Self>,
        peer: SocketAddr,
        local_id: u32,
        isn: u32,
        resp: &Handshake,
    ) -> Result<Connection> {
        if resp.socket_type != self.cfg.socket_type {
            return Err(TransportError::Handshake(format!(
                "socket type mismatch: asked {:?}, peer runs {:?}",
                self.cfg.socket_type, resp.socket_type
            )));
        }
        let mss = (resp.mss as usize).min(self.cfg.mss);
        let seed = self.cache.lock().ok().and_then(|c| c.lookup(peer.ip()));
        let params = FlowParams {
            cfg: self.cfg.clone(),
            channel: self.channel.clone(),
            peer,
            local_id,
            peer_id: resp.socket_id,
            isn,
            peer_isn: resp.init_seq,
            mss,
            peer_flow_window: resp.flow_window,
            socket_type: resp.socket_type,
            seed,
        };
        Ok(self.install_flow(params))
    }

    /// Listener side: handshake requests arriving on socket id 0.
    async fn on_request(self: &Arc<Self>, hs: Handshake, from: SocketAddr) {
        if !self.cookie_valid(from, hs.cookie) {
            // Stateless challenge; the initiator repeats its request with
            // the cookie echoed back.
            let challenge = Handshake {
                request_type: -2,
                cookie: self.cookie_at(from, Self::current_minute()),
                socket_id: 0,
                peer_ip: Handshake::peer_addr_bytes(from.ip()),
                ..hs
            };
            let pkt = ControlPacket {
                timestamp_us: 0,
                dest_id: hs.socket_id,
                info: ControlInfo::Handshake(challenge),
            };
            if let Err(e) = self.channel.send_ctrl(&pkt, from).await {
                debug!("challenge to {} failed: {}", from, e);
            }
            return;
        }
        if !self.listening.load(Ordering::SeqCst) {
            trace!("request from {} while not listening", from);
            return;
        }
        if let Some(existing) = self.peer_index.get(&(from, hs.socket_id)) {
            // Duplicate request: the response was lost, repeat it.
            let local_id = *existing.value();
            drop(existing);
            if let Some(shared) = self.flows.get(&local_id).map(|e| e.value().clone()) {
                let response = shared.flow.lock().await.hs_response.clone();
                if let Some(response) = response {
                    if let Err(e) = self.channel.send_ctrl(&response, from).await {
                        debug!("handshake re-response to {} failed: {}", from, e);
                    }
                }
            }
            return;
        }

        let local_id = self.alloc_id();
        let isn: u32 = rand::random::<u32>() & SEQ_MAX;
        let mss = (hs.mss as usize).min(self.cfg.mss);
        let seed = self.cache.lock().ok().and_then(|c| c.lookup(from.ip()));
        let params = FlowParams {
            cfg: self.cfg.clone(),
            channel: self.channel.clone(),
            peer: from,
            local_id,
            peer_id: hs.socket_id,
            isn,
            peer_isn: hs.init_seq,
            mss,
            peer_flow_window: hs.flow_window,
            socket_type: hs.socket_type,
            seed,
        };
        let conn = self.install_flow(params);

        let response = ControlPacket {
            timestamp_us: 0,
            dest_id: hs.socket_id,
            info: ControlInfo::Handshake(Handshake {
                version: VERSION,
                socket_type: hs.socket_type,
                init_seq: isn,
                mss: mss as u32,
                flow_window: self.advertised_window(),
                request_type: -1,
                socket_id: local_id,
                cookie: hs.cookie,
                peer_ip: Handshake::peer_addr_bytes(from.ip()),
            }),
        };
        conn.shared.flow.lock().await.hs_response = Some(response.clone());
        if let Err(e) = self.channel.send_ctrl(&response, from).await {
            warn!("handshake response to {} failed: {}", from, e);
        }
        if let Err(e) = self.accept_tx.try_send(conn) {
            warn!("accept backlog full, refusing flow from {}", from);
            let (mpsc::error::TrySendError::Full(conn)
            | mpsc::error::TrySendError::Closed(conn)) = e;
            conn.shared.flow.lock().await.shutdown().await;
        }
    }

    async fn dispatch(self: &Arc<Self>, raw: Bytes, from: SocketAddr) {
        let Some(dest) = protocol::peek_dest_id(&raw) else {
            return;
        };
        if dest != 0 {
            if let Some(shared) = self.flows.get(&dest).map(|e| e.value().clone()) {
                if shared.peer != from {
                    warn!("datagram for flow {} from stranger {}", dest, from);
                    return;
                }
                shared.flow.lock().await.process_raw(raw).await;
                return;
            }
            // Maybe a handshake response for a connect in flight.
            if let Some(tx) = self.pending.get(&dest).map(|e| e.value().clone()) {
                if let Some(hs) = parse_handshake(raw) {
                    let _ = tx.send((hs, from)).await;
                }
                return;
            }
            trace!("datagram for unknown flow {} from {}", dest, from);
            return;
        }
        // Socket id 0: connection setup.
        let Some(hs) = parse_handshake(raw) else {
            return;
        };
        if hs.version != VERSION {
            debug!("peer {} speaks version {}", from, hs.version);
            return;
        }
        match hs.request_type {
            1 => self.on_request(hs, from).await,
            0 => {
                // Rendezvous request: forward to the local rendezvous loop.
                if let Some(tx) = self.rdv_pending.get(&from).map(|e| e.value().clone()) {
                    let _ = tx.send((hs, from)).await;
                } else {
                    trace!("unsolicited rendezvous request from {}", from);
                }
            }
            other => trace!("setup packet with request type {} from {}", other, from),
        }
    }
}

fn parse_handshake(raw: Bytes) -> Option<Handshake> {
    if !protocol::is_control(&raw) {
        return None;
    }
    let mut reader = raw;
    match ControlPacket::decode(&mut reader) {
        Ok(ControlPacket {
            info: ControlInfo::Handshake(hs),
            ..
        }) => Some(hs),
        Ok(_) => None,
        Err(e) => {
            trace!("undecodable setup packet: {}", e);
            None
        }
    }
}

/// Process-wide receive task: demultiplexes inbound datagrams by their
/// destination socket id.
async fn demux_loop(inner: Arc<EndpointInner>) {
    let mut buf = vec![0u8; 65536];
    loop {
        match inner.socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if len < protocol::HEADER_LEN {
                    trace!("runt datagram ({} bytes) from {}", len, from);
                    continue;
                }
                let raw = Bytes::copy_from_slice(&buf[..len]);
                inner.dispatch(raw, from).await;
            }
            Err(e) => {
                // UDP errors are transient (ICMP bursts and the like); keep
                // the endpoint alive.
                error!("receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}
