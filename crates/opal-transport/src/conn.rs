//! Connection handle: the application-facing surface of one flow, plus the
//! worker task that drives its pacing and timers.

use crate::buffer::Message;
use crate::endpoint::EndpointInner;
use crate::error::{Result, TransportError};
use crate::flow::{Flow, FlowState, FlowStats};
use crate::protocol::FrameMeta;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Per-send options. Frame metadata rides with the message it was supplied
/// for; queuing depth between `send` calls and packetization cannot mix tags
/// up.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Drop the message if it has not left the sender within this budget.
    pub ttl: Option<Duration>,
    /// Deliver in submission order (the default for stream flows).
    pub in_order: bool,
    /// Frame tag for media flows.
    pub frame: Option<FrameMeta>,
    /// Fail with `WouldBlock` instead of waiting for buffer space.
    pub non_blocking: bool,
}

impl SendOptions {
    /// Options for one chunk of a tagged media frame.
    pub fn frame(frame: FrameMeta) -> Self {
        Self {
            frame: Some(frame),
            ..Default::default()
        }
    }
}

/// State shared between the connection handle, the worker task, and the
/// endpoint demultiplexer.
pub(crate) struct FlowShared {
    pub(crate) peer: SocketAddr,
    pub(crate) flow: Mutex<Flow>,
    pub(crate) snd_notify: Arc<Notify>,
    pub(crate) rcv_notify: Arc<Notify>,
    pub(crate) worker_notify: Arc<Notify>,
}

/// One established flow. Cheap to clone; all methods take `&self`.
#[derive(Clone)]
pub struct Connection {
    pub(crate) shared: Arc<FlowShared>,
    pub(crate) endpoint: Arc<EndpointInner>,
    pub(crate) local_id: u32,
}

impl Connection {
    pub fn peer(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn id(&self) -> u32 {
        self.local_id
    }

    /// Sends one message with default options, waiting for buffer space.
    pub async fn send(&self, data: Bytes) -> Result<()> {
        self.send_with(
            data,
            SendOptions {
                in_order: true,
                ..Default::default()
            },
        )
        .await
    }

    /// Sends one message. Blocks while the send buffer is full unless
    /// `non_blocking` is set.
    pub async fn send_with(&self, data: Bytes, opts: SendOptions) -> Result<()> {
        loop {
            let mut flow = self.shared.flow.lock().await;
            match flow.state() {
                FlowState::Established => {}
                FlowState::Broken => {
                    return Err(if flow.peer_shutdown() && !flow.snd_drained() {
                        TransportError::ConnectionReset
                    } else {
                        TransportError::ConnectionBroken
                    });
                }
                FlowState::Closed => return Err(TransportError::Closed),
            }
            let need = flow.snd_blocks_for(data.len());
            if need > flow.snd_total_blocks() {
                return Err(TransportError::InvalidConfig(format!(
                    "message of {} bytes exceeds the send buffer",
                    data.len()
                )));
            }
            if flow.snd_free_blocks() >= need {
                flow.queue_send(data, opts.ttl, opts.in_order, opts.frame);
                return Ok(());
            }
            if opts.non_blocking {
                return Err(TransportError::WouldBlock);
            }
            // Register interest before releasing the lock; notifiers take
            // the lock first, so no wakeup can slip through the gap.
            let space = self.shared.snd_notify.notified();
            tokio::pin!(space);
            space.as_mut().enable();
            drop(flow);
            space.await;
        }
    }

    /// Reads up to `out.len()` bytes of the ordered stream. Returns 0 at
    /// end-of-stream (peer shutdown, everything drained).
    pub async fn recv(&self, out: &mut [u8]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            let mut flow = self.shared.flow.lock().await;
            let n = flow.rcv_buf_mut().read(out);
            if n > 0 {
                return Ok(n);
            }
            match flow.state() {
                FlowState::Established => {}
                FlowState::Broken if flow.rcv_drained() => {
                    return if flow.peer_shutdown() {
                        Ok(0)
                    } else {
                        Err(TransportError::ConnectionBroken)
                    };
                }
                FlowState::Broken => {}
                FlowState::Closed => return Err(TransportError::Closed),
            }
            let data = self.shared.rcv_notify.notified();
            tokio::pin!(data);
            data.as_mut().enable();
            drop(flow);
            data.await;
        }
    }

    /// Reads one complete message with its frame metadata. Returns `None` at
    /// end-of-stream.
    pub async fn recv_msg(&self) -> Result<Option<Message>> {
        loop {
            let mut flow = self.shared.flow.lock().await;
            if let Some(msg) = flow.rcv_buf_mut().read_msg() {
                return Ok(Some(msg));
            }
            match flow.state() {
                FlowState::Established => {}
                FlowState::Broken if flow.rcv_drained() => {
                    return if flow.peer_shutdown() {
                        Ok(None)
                    } else {
                        Err(TransportError::ConnectionBroken)
                    };
                }
                FlowState::Broken => {}
                FlowState::Closed => return Err(TransportError::Closed),
            }
            let data = self.shared.rcv_notify.notified();
            tokio::pin!(data);
            data.as_mut().enable();
            drop(flow);
            data.await;
        }
    }

    /// Caps the outgoing rate; 0 removes the cap.
    pub async fn set_max_bandwidth(&self, bytes_per_sec: u64) {
        self.shared.flow.lock().await.set_max_bandwidth(bytes_per_sec);
    }

    pub async fn stats(&self) -> FlowStats {
        self.shared.flow.lock().await.stats()
    }

    /// Graceful close: waits up to the configured linger for queued data to
    /// drain, then notifies the peer and releases the flow.
    pub async fn close(&self) -> Result<()> {
        let linger = self.endpoint.cfg.linger;
        let deadline = Instant::now() + linger;
        loop {
            let flow = self.shared.flow.lock().await;
            if flow.state() != FlowState::Established || flow.snd_drained() {
                break;
            }
            if Instant::now() >= deadline {
                debug!("linger expired with data queued on flow {}", self.local_id);
                break;
            }
            let space = self.shared.snd_notify.notified();
            drop(flow);
            tokio::select! {
                _ = space => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        let mut flow = self.shared.flow.lock().await;
        flow.shutdown().await;
        Ok(())
    }
}

/// Drives one flow: fires due timers, paces data out, and releases endpoint
/// state once the flow leaves the established state.
pub(crate) fn spawn_worker(endpoint: Arc<EndpointInner>, shared: Arc<FlowShared>) {
    tokio::spawn(async move {
        loop {
            let mut flow = shared.flow.lock().await;
            if !flow.is_established() {
                let record = flow.path_record();
                let local_id = flow.local_id();
                let peer = flow.peer();
                let peer_id = flow.peer_id();
                drop(flow);
                endpoint.release(local_id, peer, peer_id, record);
                shared.snd_notify.notify_waiters();
                shared.rcv_notify.notify_waiters();
                break;
            }
            let now = Instant::now();
            flow.on_timers(now).await;
            flow.on_snd_tick(now).await;
            let deadline = flow.next_deadline();
            drop(flow);

            let wake = shared.worker_notify.notified();
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {}
                _ = wake => {}
            }
        }
    });
}
