//! Flow configuration.

use crate::cc::{AimdCc, CcFactory};
use crate::error::TransportError;
use crate::protocol::SocketType;
use std::fmt;
use std::time::Duration;

/// Per-flow tunables, fixed at connection setup.
#[derive(Clone)]
pub struct FlowConfig {
    /// Maximum payload bytes per data packet.
    pub mss: usize,
    /// Maximum unacknowledged packets this side is willing to accept;
    /// advertised to the peer in the handshake.
    pub flow_window: u32,
    /// Send buffer capacity in bytes.
    pub snd_buf_bytes: usize,
    /// Receive buffer capacity in bytes.
    pub rcv_buf_bytes: usize,
    /// Outgoing bandwidth cap in bytes/second; 0 means unlimited.
    pub max_bandwidth: u64,
    /// How long `close` waits for queued data to drain.
    pub linger: Duration,
    /// Stream or frame-aware media layout.
    pub socket_type: SocketType,
    /// Congestion-control factory, invoked once per flow.
    pub cc: CcFactory,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            mss: 1500,
            flow_window: 25_600,
            snd_buf_bytes: 12 * 1024 * 1024,
            rcv_buf_bytes: 12 * 1024 * 1024,
            max_bandwidth: 0,
            linger: Duration::from_secs(3),
            socket_type: SocketType::Stream,
            cc: AimdCc::factory(),
        }
    }
}

impl FlowConfig {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.mss < 64 || self.mss > 65_000 {
            return Err(TransportError::InvalidConfig(format!(
                "mss {} outside 64..=65000",
                self.mss
            )));
        }
        if self.flow_window == 0 {
            return Err(TransportError::InvalidConfig("flow window is zero".into()));
        }
        if self.snd_buf_bytes < self.mss || self.rcv_buf_bytes < self.mss {
            return Err(TransportError::InvalidConfig(
                "buffers must hold at least one packet".into(),
            ));
        }
        Ok(())
    }

    /// Send-buffer capacity in blocks.
    pub fn snd_blocks(&self) -> usize {
        (self.snd_buf_bytes / self.mss).max(1)
    }

    /// Receive-buffer capacity in slots.
    pub fn rcv_slots(&self) -> usize {
        (self.rcv_buf_bytes / self.mss).max(2)
    }
}

impl fmt::Debug for FlowConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowConfig")
            .field("mss", &self.mss)
            .field("flow_window", &self.flow_window)
            .field("snd_buf_bytes", &self.snd_buf_bytes)
            .field("rcv_buf_bytes", &self.rcv_buf_bytes)
            .field("max_bandwidth", &self.max_bandwidth)
            .field("linger", &self.linger)
            .field("socket_type", &self.socket_type)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(FlowConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_mss() {
        let cfg = FlowConfig {
            mss: 10,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_buffer_sizing() {
        let cfg = FlowConfig {
            mss: 1000,
            snd_buf_bytes: 10_000,
            rcv_buf_bytes: 5_000,
            ..Default::default()
        };
        assert_eq!(cfg.snd_blocks(), 10);
        assert_eq!(cfg.rcv_slots(), 5);
    }
}
