//! Per-flow transport engine: connection state, the packing and receiving
//! data paths, control-packet dispatch, and the four timer deadlines that
//! drive them.

use crate::buffer::{InsertOutcome, RecvBuffer, RetransRead, SendBuffer};
use crate::cache::PathRecord;
use crate::cc::{CongestionControl, SYN_INTERVAL_US};
use crate::channel::UdpChannel;
use crate::config::FlowConfig;
use crate::loss::LossList;
use crate::protocol::{
    AckDetail, AckInfo, ControlInfo, ControlPacket, DataPacket, Packet, SocketType, decode_loss,
    encode_loss,
};
use crate::seq;
use crate::window::{AckWindow, ArrivalWindow};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Engine tick and default acknowledgment cadence.
pub(crate) const SYN_INTERVAL: Duration = Duration::from_micros(SYN_INTERVAL_US);
/// Floor for the NAK re-issue interval.
const MIN_NAK_INTERVAL: Duration = Duration::from_millis(20);
/// Expiration firings before the flow can break.
const EXP_BREAK_COUNT: u32 = 16;
/// Peer silence required (with the firing count) to break the flow.
const EXP_BREAK_SILENCE: Duration = Duration::from_secs(10);
/// Upper bound on packets sent in one pass under the flow lock.
const SEND_BATCH: u32 = 64;
/// Most loss ranges carried in one NAK.
const NAK_MAX_RANGES: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Established,
    /// Peer silence or shutdown invalidated the flow.
    Broken,
    /// Locally closed.
    Closed,
}

/// Counters and gauges exposed through `Connection::stats`.
#[derive(Debug, Default, Clone)]
pub struct FlowStats {
    pub pkts_sent: u64,
    pub pkts_recv: u64,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub retransmits: u64,
    pub losses: u64,
    pub acks_sent: u64,
    pub acks_recv: u64,
    pub naks_sent: u64,
    pub naks_recv: u64,
    pub msgs_dropped: u64,
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub bandwidth_pps: u32,
    pub recv_rate_pps: u32,
    pub send_interval_us: f64,
    pub cwnd: f64,
}

/// Everything needed to construct an established flow after the handshake
/// has negotiated the shared parameters.
pub(crate) struct FlowParams {
    pub cfg: FlowConfig,
    pub channel: UdpChannel,
    pub peer: SocketAddr,
    pub local_id: u32,
    pub peer_id: u32,
    pub isn: u32,
    pub peer_isn: u32,
    /// Negotiated payload size: the minimum of both MSS values.
    pub mss: usize,
    pub peer_flow_window: u32,
    pub socket_type: SocketType,
    pub seed: Option<PathRecord>,
}

pub(crate) struct Flow {
    state: FlowState,
    peer: SocketAddr,
    local_id: u32,
    peer_id: u32,
    kind: SocketType,
    mss: usize,
    start: Instant,
    channel: UdpChannel,
    /// Listener-side copy of the handshake response, re-sent when the peer
    /// repeats its request.
    pub(crate) hs_response: Option<ControlPacket>,

    // Sender side.
    snd_buf: SendBuffer,
    snd_loss: LossList,
    /// First sequence not yet acknowledged by the peer.
    snd_last_ack: u32,
    /// Last sequence handed to the wire.
    cur_seq: u32,
    peer_flow_window: u32,
    cc: Box<dyn CongestionControl>,
    snd_interval_us: f64,
    cwnd: f64,
    max_bandwidth: u64,
    next_send: Instant,
    /// Nothing left to pace; the deadline is ignored until new work arrives.
    snd_idle: bool,
    peer_shutdown: bool,

    // Receiver side.
    rcv_buf: RecvBuffer,
    rcv_loss: LossList,
    /// Largest sequence seen from the peer.
    rcv_curr_seq: u32,
    /// Next expected sequence: the acknowledgment cursor.
    rcv_last_ack: u32,
    /// Last acknowledged sequence the peer confirmed via ACK-of-ACK.
    rcv_last_ack_ack: u32,
    ack_no: u32,
    ack_window: AckWindow,
    arrival: ArrivalWindow,

    // Path estimates.
    rtt_us: u32,
    rtt_var_us: u32,
    bandwidth_pps: u32,
    delivery_rate_pps: u32,

    // Timers.
    next_ack: Instant,
    ack_interval: Duration,
    next_nak: Instant,
    nak_interval: Duration,
    next_syn: Instant,
    next_exp: Instant,
    exp_count: u32,
    last_rsp: Instant,

    // Wakeups shared with the connection handle and worker.
    snd_notify: Arc<Notify>,
    rcv_notify: Arc<Notify>,
    worker_notify: Arc<Notify>,

    stats: FlowStats,
}

impl Flow {
    pub(crate) fn new(
        params: FlowParams,
        snd_notify: Arc<Notify>,
        rcv_notify: Arc<Notify>,
        worker_notify: Arc<Notify>,
    ) -> Self {
        let now = Instant::now();
        let FlowParams {
            cfg,
            channel,
            peer,
            local_id,
            peer_id,
            isn,
            peer_isn,
            mss,
            peer_flow_window,
            socket_type,
            seed,
        } = params;

        let mut cc = (cfg.cc)(local_id as u64);
        cc.init(mss, isn, peer_flow_window);

        let mut rtt_us = 10 * SYN_INTERVAL_US as u32;
        let mut rtt_var_us = rtt_us / 2;
        let mut bandwidth_pps = 1;
        if let Some(record) = seed {
            rtt_us = record.rtt_us.max(1);
            rtt_var_us = record.rtt_var_us;
            bandwidth_pps = record.bandwidth_pps.max(1);
            cc.set_rtt(rtt_us);
            cc.set_bandwidth(bandwidth_pps);
            debug!(
                "seeded flow {} from path cache: rtt {}us, bw {}pps",
                local_id, rtt_us, bandwidth_pps
            );
        }

        let snd_buf = SendBuffer::new(cfg.snd_blocks(), mss);
        let rcv_buf = RecvBuffer::new(cfg.rcv_slots());
        let snd_interval_us = cc.send_interval_us();
        let cwnd = cc.cwnd();
        let max_bandwidth = cfg.max_bandwidth;

        let mut flow = Self {
            state: FlowState::Established,
            peer,
            local_id,
            peer_id,
            kind: socket_type,
            mss,
            start: now,
            channel,
            hs_response: None,
            snd_buf,
            snd_loss: LossList::new(),
            snd_last_ack: isn,
            cur_seq: seq::dec(isn),
            peer_flow_window,
            cc,
            snd_interval_us,
            cwnd,
            max_bandwidth,
            next_send: now,
            snd_idle: true,
            peer_shutdown: false,
            rcv_buf,
            rcv_loss: LossList::new(),
            rcv_curr_seq: seq::dec(peer_isn),
            rcv_last_ack: peer_isn,
            rcv_last_ack_ack: peer_isn,
            ack_no: 0,
            ack_window: AckWindow::new(),
            arrival: ArrivalWindow::new(),
            rtt_us,
            rtt_var_us,
            bandwidth_pps,
            delivery_rate_pps: 0,
            next_ack: now + SYN_INTERVAL,
            ack_interval: SYN_INTERVAL,
            next_nak: now + MIN_NAK_INTERVAL,
            nak_interval: MIN_NAK_INTERVAL,
            next_syn: now + SYN_INTERVAL,
            next_exp: now + Duration::from_secs(1),
            exp_count: 1,
            last_rsp: now,
            snd_notify,
            rcv_notify,
            worker_notify,
            stats: FlowStats::default(),
        };
        flow.refresh_intervals();
        flow.reset_exp(now);
        flow
    }

    pub(crate) fn state(&self) -> FlowState {
        self.state
    }

    pub(crate) fn is_established(&self) -> bool {
        self.state == FlowState::Established
    }

    pub(crate) fn peer_shutdown(&self) -> bool {
        self.peer_shutdown
    }

    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn peer_id(&self) -> u32 {
        self.peer_id
    }

    pub(crate) fn rcv_buf_mut(&mut self) -> &mut RecvBuffer {
        &mut self.rcv_buf
    }

    pub(crate) fn set_max_bandwidth(&mut self, bytes_per_sec: u64) {
        self.max_bandwidth = bytes_per_sec;
        self.sync_cc();
    }

    /// Queues one application message. The caller has already verified that
    /// the buffer has room.
    pub(crate) fn queue_send(
        &mut self,
        data: Bytes,
        ttl: Option<Duration>,
        in_order: bool,
        frame: Option<crate::protocol::FrameMeta>,
    ) {
        self.snd_buf.push(data, ttl, in_order, frame);
        self.snd_idle = false;
        self.worker_notify.notify_one();
    }

    pub(crate) fn snd_free_blocks(&self) -> usize {
        self.snd_buf.free_blocks()
    }

    pub(crate) fn snd_blocks_for(&self, len: usize) -> usize {
        self.snd_buf.blocks_for(len)
    }

    pub(crate) fn snd_total_blocks(&self) -> usize {
        self.snd_buf.capacity()
    }

    pub(crate) fn snd_drained(&self) -> bool {
        self.snd_buf.is_empty()
    }

    pub(crate) fn rcv_drained(&self) -> bool {
        self.rcv_buf.is_drained()
    }

    pub(crate) fn stats(&mut self) -> FlowStats {
        self.stats.rtt_us = self.rtt_us;
        self.stats.rtt_var_us = self.rtt_var_us;
        self.stats.bandwidth_pps = self.bandwidth_pps;
        self.stats.recv_rate_pps = self.delivery_rate_pps;
        self.stats.send_interval_us = self.snd_interval_us;
        self.stats.cwnd = self.cwnd;
        self.stats.clone()
    }

    /// Final measurements written back to the destination cache.
    pub(crate) fn path_record(&self) -> PathRecord {
        let loss_rate = if self.stats.pkts_sent > 0 {
            self.stats.losses as f64 / self.stats.pkts_sent as f64
        } else {
            0.0
        };
        PathRecord {
            rtt_us: self.rtt_us,
            rtt_var_us: self.rtt_var_us,
            bandwidth_pps: self.bandwidth_pps,
            cwnd: self.cwnd,
            loss_rate,
            updated: Instant::now(),
        }
    }

    fn wake_all(&self) {
        self.snd_notify.notify_waiters();
        self.rcv_notify.notify_waiters();
        self.worker_notify.notify_one();
    }

    pub(crate) fn mark_broken(&mut self) {
        if self.state == FlowState::Established {
            warn!("flow {} to {} is broken", self.local_id, self.peer);
            self.state = FlowState::Broken;
            // No further ACK timer will run; whatever arrived contiguously
            // must still reach the application before end-of-stream.
            self.promote_readable();
            self.wake_all();
        }
    }

    /// Moves the ACK cursor over every contiguously received slot, making
    /// the data readable.
    fn promote_readable(&mut self) {
        let contiguous = self.rcv_buf.contiguous_from_ack();
        if contiguous > 0 {
            self.rcv_buf.advance_ack(contiguous);
            self.rcv_last_ack = seq::add(self.rcv_last_ack, contiguous as u32);
            self.rcv_notify.notify_waiters();
        }
    }

    /// Local close: emit a shutdown best-effort and stop all activity.
    pub(crate) async fn shutdown(&mut self) {
        if self.state == FlowState::Established {
            let pkt = self.ctrl(ControlInfo::Shutdown);
            if let Err(e) = self.channel.send_ctrl(&pkt, self.peer).await {
                debug!("shutdown notification to {} failed: {}", self.peer, e);
            }
            self.state = FlowState::Closed;
            self.wake_all();
        }
    }

    // ----- inbound -----

    /// Entry point for every datagram the demultiplexer routes here.
    pub(crate) async fn process_raw(&mut self, mut raw: Bytes) {
        if self.state != FlowState::Established {
            return;
        }
        let now = Instant::now();
        let packet = match Packet::decode(&mut raw, self.kind) {
            Ok(p) => p,
            Err(e) => {
                warn!("[{}] undecodable datagram: {}", self.peer, e);
                return;
            }
        };
        // Any traffic from the peer proves liveness.
        self.last_rsp = now;
        self.exp_count = 1;
        self.reset_exp(now);
        match packet {
            Packet::Data(pkt) => self.process_data(pkt, now).await,
            Packet::Control(pkt) => self.process_ctrl(pkt, now).await,
        }
    }

    async fn process_data(&mut self, pkt: DataPacket, now: Instant) {
        self.stats.pkts_recv += 1;
        self.stats.bytes_recv += pkt.payload.len() as u64;
        self.cc.on_pkt_received(pkt.seq);
        self.arrival.on_arrival(now);
        // Every 16th sequence opens a bandwidth probe pair.
        match pkt.seq & 0xF {
            0 => self.arrival.on_probe_first(now),
            1 => self.arrival.on_probe_second(now),
            _ => {}
        }

        let offset = seq::off(self.rcv_last_ack, pkt.seq);
        if offset < 0 {
            trace!("[{}] belated packet {}", self.peer, pkt.seq);
            return;
        }
        let seq_no = pkt.seq;
        match self.rcv_buf.insert(
            offset as usize,
            pkt.payload,
            pkt.msg_no,
            pkt.boundary,
            pkt.frame,
        ) {
            InsertOutcome::Stored => {}
            InsertOutcome::Duplicate => {
                trace!("[{}] duplicate packet {}", self.peer, seq_no);
                self.rcv_loss.remove(seq_no);
                return;
            }
            InsertOutcome::OutOfWindow => {
                warn!("[{}] packet {} beyond receive window", self.peer, seq_no);
                return;
            }
        }

        let expected = seq::inc(self.rcv_curr_seq);
        if seq::cmp(seq_no, expected) > 0 {
            // A gap opened: record it and fast-NAK exactly this range.
            let gap_end = seq::dec(seq_no);
            self.rcv_loss.insert(expected, gap_end);
            let lost = seq::len(expected, gap_end) as u64;
            self.stats.losses += lost;
            self.send_nak(&[(expected, gap_end)]).await;
        }
        if seq::cmp(seq_no, self.rcv_curr_seq) > 0 {
            self.rcv_curr_seq = seq_no;
        } else {
            // A retransmission filled (part of) a gap.
            self.rcv_loss.remove(seq_no);
        }
    }

    async fn process_ctrl(&mut self, pkt: ControlPacket, now: Instant) {
        match pkt.info {
            ControlInfo::Ack { ack_no, info } => self.on_ack(ack_no, info).await,
            ControlInfo::Ack2 { ack_no } => self.on_ack2(ack_no, now),
            ControlInfo::Nak(words) => self.on_nak(&words).await,
            ControlInfo::KeepAlive => {}
            ControlInfo::Shutdown => {
                debug!("[{}] peer shut down", self.peer);
                self.peer_shutdown = true;
                self.mark_broken();
            }
            ControlInfo::MsgDrop {
                msg_no,
                first_seq,
                last_seq,
            } => self.on_msg_drop(msg_no, first_seq, last_seq),
            ControlInfo::CongestionWarning => {
                debug!("[{}] congestion warning", self.peer);
                self.cc.on_warning();
                self.sync_cc();
            }
            ControlInfo::PeerError { code } => {
                warn!("[{}] peer reported error {}", self.peer, code);
            }
            ControlInfo::Handshake(_) => {
                // The peer lost our handshake response; repeat it.
                if let Some(response) = self.hs_response.clone() {
                    if let Err(e) = self.channel.send_ctrl(&response, self.peer).await {
                        debug!("handshake re-response failed: {}", e);
                    }
                }
            }
        }
    }

    async fn on_ack(&mut self, ack_no: u32, info: AckInfo) {
        self.stats.acks_recv += 1;
        if info.detail.is_some() {
            // First sight of this acknowledgment sub-sequence: answer it so
            // the peer can measure RTT.
            let reply = self.ctrl(ControlInfo::Ack2 { ack_no });
            if let Err(e) = self.channel.send_ctrl(&reply, self.peer).await {
                debug!("ack2 send failed: {}", e);
            }
        }
        let ack = info.ack_seq;
        if seq::cmp(ack, seq::inc(self.cur_seq)) > 0 {
            warn!(
                "[{}] acknowledgment {} past last sent {}",
                self.peer, ack, self.cur_seq
            );
            self.mark_broken();
            return;
        }
        if let Some(detail) = info.detail {
            if detail.rtt_us > 0 {
                self.update_rtt(detail.rtt_us);
            }
            if detail.avail_window > 0 {
                self.peer_flow_window = detail.avail_window;
            }
            if let Some((rate, bandwidth)) = detail.rates {
                if rate > 0 {
                    self.delivery_rate_pps = (self.delivery_rate_pps * 7 + rate) / 8;
                    self.cc.set_recv_rate(self.delivery_rate_pps);
                }
                if bandwidth > 0 {
                    self.bandwidth_pps = (self.bandwidth_pps * 7 + bandwidth) / 8;
                    self.cc.set_bandwidth(self.bandwidth_pps);
                }
            }
        }
        let advanced = seq::off(self.snd_last_ack, ack);
        if advanced > 0 {
            self.snd_buf.ack_through(advanced as usize);
            self.snd_last_ack = ack;
            self.snd_loss.remove_below(ack);
            // The window just opened; let blocked senders and the pacer run.
            self.snd_idle = false;
            self.snd_notify.notify_waiters();
            self.worker_notify.notify_one();
        }
        self.cc.on_ack(ack);
        self.sync_cc();
    }

    fn on_ack2(&mut self, ack_no: u32, now: Instant) {
        if let Some((ack_seq, rtt)) = self.ack_window.acknowledge(ack_no, now) {
            self.update_rtt(rtt.as_micros() as u32);
            if seq::cmp(ack_seq, self.rcv_last_ack_ack) > 0 {
                self.rcv_last_ack_ack = ack_seq;
            }
        }
    }

    async fn on_nak(&mut self, words: &[u32]) {
        self.stats.naks_recv += 1;
        let ranges = match decode_loss(words) {
            Ok(r) => r,
            Err(e) => {
                // A malformed report is dropped rather than tearing the flow
                // down; a retransmission pass costs less than a reconnect.
                warn!("[{}] discarding malformed loss report: {}", self.peer, e);
                return;
            }
        };
        // Pacing reacts before any retransmission is queued.
        self.cc.on_loss(&ranges);
        self.sync_cc();
        for (mut a, mut b) in ranges {
            if seq::cmp(b, self.snd_last_ack) < 0 || seq::cmp(a, seq::inc(self.cur_seq)) > 0 {
                continue;
            }
            if seq::cmp(a, self.snd_last_ack) < 0 {
                a = self.snd_last_ack;
            }
            if seq::cmp(b, self.cur_seq) > 0 {
                b = self.cur_seq;
            }
            self.snd_loss.insert(a, b);
        }
        self.snd_idle = false;
        self.worker_notify.notify_one();
    }

    fn on_msg_drop(&mut self, msg_no: u32, first_seq: u32, last_seq: u32) {
        debug!(
            "[{}] peer dropped message {} ({}..={})",
            self.peer, msg_no, first_seq, last_seq
        );
        self.stats.msgs_dropped += 1;
        let first_off = seq::off(self.rcv_last_ack, first_seq) as isize;
        let last_off = seq::off(self.rcv_last_ack, last_seq) as isize;
        self.rcv_buf.drop_message(msg_no, first_off, last_off);
        self.rcv_loss.remove_range(first_seq, last_seq);
        if seq::cmp(last_seq, self.rcv_curr_seq) > 0 {
            self.rcv_curr_seq = last_seq;
        }
    }

    // ----- outbound -----

    fn ctrl(&self, info: ControlInfo) -> ControlPacket {
        ControlPacket {
            timestamp_us: seq::elapsed_us(self.start),
            dest_id: self.peer_id,
            info,
        }
    }

    async fn send_nak(&mut self, ranges: &[(u32, u32)]) {
        if ranges.is_empty() {
            return;
        }
        let pkt = self.ctrl(ControlInfo::Nak(encode_loss(ranges)));
        match self.channel.send_ctrl(&pkt, self.peer).await {
            Ok(()) => self.stats.naks_sent += 1,
            Err(e) => debug!("nak send failed: {}", e),
        }
    }

    /// Emits a full acknowledgment unless it would duplicate one the peer
    /// has already confirmed.
    async fn send_ack(&mut self, now: Instant) {
        self.promote_readable();
        let ack_seq = self.rcv_last_ack;
        if ack_seq == self.rcv_last_ack_ack {
            return;
        }
        self.ack_no = seq::inc(self.ack_no);
        let rates = if self.stats.acks_sent % 2 == 0 {
            Some((self.arrival.recv_rate_pps(), self.arrival.bandwidth_pps()))
        } else {
            None
        };
        let info = AckInfo {
            ack_seq,
            detail: Some(AckDetail {
                rtt_us: self.rtt_us,
                rtt_var_us: self.rtt_var_us,
                avail_window: self.rcv_buf.available() as u32,
                rates,
            }),
        };
        self.ack_window.store(self.ack_no, ack_seq, now);
        let pkt = self.ctrl(ControlInfo::Ack {
            ack_no: self.ack_no,
            info,
        });
        match self.channel.send_ctrl(&pkt, self.peer).await {
            Ok(()) => self.stats.acks_sent += 1,
            Err(e) => debug!("ack send failed: {}", e),
        }
    }

    /// Selects the next data packet: pending retransmissions first, then new
    /// data while the window allows.
    async fn pack_next(&mut self, now: Instant) -> Option<DataPacket> {
        // Retransmissions take priority over new data.
        while let Some(s) = self.snd_loss.pop_first() {
            let offset = seq::off(self.snd_last_ack, s);
            if offset < 0 {
                continue;
            }
            match self.snd_buf.read_retrans(offset as usize, now) {
                RetransRead::Gone => continue,
                RetransRead::Expired {
                    msg_no,
                    first_seq,
                    last_seq,
                } => {
                    self.stats.msgs_dropped += 1;
                    self.snd_loss.remove_range(first_seq, last_seq);
                    let drop = self.ctrl(ControlInfo::MsgDrop {
                        msg_no,
                        first_seq,
                        last_seq,
                    });
                    if let Err(e) = self.channel.send_ctrl(&drop, self.peer).await {
                        debug!("drop notification failed: {}", e);
                    }
                    continue;
                }
                RetransRead::Data { payload, meta } => {
                    self.stats.retransmits += 1;
                    return Some(self.stamp(s, payload, meta));
                }
            }
        }

        let outstanding = seq::off(self.snd_last_ack, seq::inc(self.cur_seq)).max(0) as u32;
        let window = self.peer_flow_window.min(self.cwnd as u32);
        if outstanding >= window {
            return None;
        }
        let next_seq = seq::inc(self.cur_seq);
        let (payload, meta) = self.snd_buf.read_next(next_seq, now)?;
        self.cur_seq = next_seq;
        Some(self.stamp(next_seq, payload, meta))
    }

    fn stamp(
        &self,
        seq_no: u32,
        payload: Bytes,
        meta: crate::buffer::BlockMeta,
    ) -> DataPacket {
        DataPacket {
            seq: seq_no,
            boundary: meta.boundary,
            in_order: meta.in_order,
            msg_no: meta.msg_no,
            timestamp_us: seq::elapsed_us(self.start),
            dest_id: self.peer_id,
            frame: meta.frame,
            payload,
        }
    }

    /// Abandons messages whose TTL lapsed after partial transmission and
    /// advertises each drop to the peer. The fully-unsent case needs no
    /// advertisement and is handled inside the buffer's fresh-read path.
    async fn drop_expired_msgs(&mut self, now: Instant) {
        while let Some((msg_no, first_seq, last_seq)) = self.snd_buf.drop_expired(now) {
            self.stats.msgs_dropped += 1;
            self.snd_loss.remove_range(first_seq, last_seq);
            let drop = self.ctrl(ControlInfo::MsgDrop {
                msg_no,
                first_seq,
                last_seq,
            });
            if let Err(e) = self.channel.send_ctrl(&drop, self.peer).await {
                debug!("drop notification failed: {}", e);
            }
        }
    }

    /// Paces data onto the wire. Runs a bounded batch per invocation so the
    /// flow lock is never held long.
    pub(crate) async fn on_snd_tick(&mut self, now: Instant) {
        if self.state != FlowState::Established {
            return;
        }
        self.drop_expired_msgs(now).await;
        if self.snd_idle {
            return;
        }
        let mut budget = SEND_BATCH;
        while budget > 0 && now >= self.next_send {
            budget -= 1;
            let Some(pkt) = self.pack_next(now).await else {
                self.snd_idle = true;
                return;
            };
            let seq_no = pkt.seq;
            let wire_len = pkt.wire_len(self.kind) as u64;
            match self.channel.send_data(&pkt, self.kind, self.peer).await {
                Ok(()) => {
                    self.stats.pkts_sent += 1;
                    self.stats.bytes_sent += wire_len;
                    self.cc.on_pkt_sent(seq_no);
                }
                Err(e) => {
                    // Transient: requeue the sequence and retry next tick.
                    warn!("[{}] send failed, will retry: {}", self.peer, e);
                    self.snd_loss.insert(seq_no, seq_no);
                    self.next_send = now + SYN_INTERVAL;
                    return;
                }
            }
            if seq_no & 0xF == 0 {
                // Probe pair: the successor leaves back-to-back, giving the
                // receiver a capacity sample from the spacing.
                self.next_send = now;
            } else {
                let step = Duration::from_micros(self.snd_interval_us.max(0.0) as u64);
                let scheduled = self.next_send + step;
                // Never fall far behind schedule after an idle stretch.
                self.next_send = scheduled.max(now.checked_sub(SYN_INTERVAL).unwrap_or(now));
            }
        }
    }

    // ----- timers -----

    pub(crate) async fn on_timers(&mut self, now: Instant) {
        if self.state != FlowState::Established {
            return;
        }
        if now >= self.next_ack {
            self.send_ack(now).await;
            self.next_ack = now + self.ack_interval;
        }
        if now >= self.next_nak {
            if !self.rcv_loss.is_empty() {
                let ranges = self.rcv_loss.snapshot(NAK_MAX_RANGES);
                self.send_nak(&ranges).await;
            }
            self.next_nak = now + self.nak_interval;
        }
        if now >= self.next_exp {
            self.on_exp(now).await;
        }
        if now >= self.next_syn {
            self.refresh_intervals();
            self.next_syn = now + SYN_INTERVAL;
        }
    }

    async fn on_exp(&mut self, now: Instant) {
        let silence = now.duration_since(self.last_rsp);
        if self.exp_count >= EXP_BREAK_COUNT && silence >= EXP_BREAK_SILENCE {
            warn!(
                "[{}] peer silent for {:?} across {} expirations",
                self.peer, silence, self.exp_count
            );
            self.mark_broken();
            return;
        }
        // Assume everything in flight was lost and retransmit aggressively.
        if seq::off(self.snd_last_ack, seq::inc(self.cur_seq)) > 0 && self.snd_loss.is_empty() {
            self.snd_loss.insert(self.snd_last_ack, self.cur_seq);
            self.snd_idle = false;
        }
        let keepalive = self.ctrl(ControlInfo::KeepAlive);
        if let Err(e) = self.channel.send_ctrl(&keepalive, self.peer).await {
            debug!("keepalive failed: {}", e);
        }
        self.exp_count += 1;
        self.cc.on_timeout();
        self.sync_cc();
        self.reset_exp(now);
    }

    fn reset_exp(&mut self, now: Instant) {
        let step_us =
            (self.rtt_us as u64 + 4 * self.rtt_var_us as u64) * self.exp_count as u64
                + SYN_INTERVAL_US;
        let deadline = self.last_rsp + Duration::from_micros(step_us);
        self.next_exp = deadline.max(now + SYN_INTERVAL);
    }

    fn refresh_intervals(&mut self) {
        let cc_ack = self.cc.ack_interval_us();
        self.ack_interval = if cc_ack > 0 {
            Duration::from_micros(cc_ack as u64)
        } else {
            SYN_INTERVAL
        };
        let nak_us = (self.rtt_us as u64 + 4 * self.rtt_var_us as u64).max(
            MIN_NAK_INTERVAL.as_micros() as u64,
        );
        self.nak_interval = Duration::from_micros(nak_us);
    }

    fn update_rtt(&mut self, sample_us: u32) {
        let diff = self.rtt_us.abs_diff(sample_us);
        self.rtt_var_us = (3 * self.rtt_var_us + diff) / 4;
        self.rtt_us = (7 * self.rtt_us + sample_us) / 8;
        self.cc.set_rtt(self.rtt_us);
    }

    /// Pulls the controller's outputs and applies the configured bandwidth
    /// cap.
    fn sync_cc(&mut self) {
        let mut interval = self.cc.send_interval_us();
        if self.max_bandwidth > 0 {
            let floor = self.mss as f64 * 1_000_000.0 / self.max_bandwidth as f64;
            interval = interval.max(floor);
        }
        self.snd_interval_us = interval;
        self.cwnd = self.cc.cwnd();
    }

    /// Earliest instant any of the four timers (or the pacer) needs service.
    pub(crate) fn next_deadline(&self) -> Instant {
        let mut deadline = self.next_ack.min(self.next_exp).min(self.next_syn);
        if !self.rcv_loss.is_empty() {
            deadline = deadline.min(self.next_nak);
        }
        if !self.snd_idle {
            deadline = deadline.min(self.next_send);
        }
        deadline
    }
}
