use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use cmux_frame::{dlci, FrameConfig};
use serde::Serialize;

use crate::error::{CmuxError, Result};

/// Multiplexer-level events delivered to [`CmuxConfig::callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CmuxEvent {
    /// The control channel is connected.
    Connected,
    /// The control channel went down (on request, on peer request, or
    /// because the transport closed).
    Disconnected,
    /// A connect attempt ended without a connection.
    ConnectFailed,
}

/// Callback receiving [`CmuxEvent`]s. Runs without internal locks held and
/// must not call blocking multiplexer APIs.
pub type CmuxCallback = Arc<dyn Fn(CmuxEvent) + Send + Sync>;

/// Configuration for a [`crate::Cmux`] instance.
#[derive(Clone)]
pub struct CmuxConfig {
    /// Frame format shared with the peer. Default: basic option, 127-byte
    /// information field.
    pub frame: FrameConfig,
    /// Capacity of the receive re-assembly buffer. Default: 512 bytes.
    pub receive_buf_size: usize,
    /// Capacity of the shared transmit buffer. Default: 1024 bytes.
    pub transmit_buf_size: usize,
    /// Number of DLCIs that can be registered. Default: 8.
    pub max_dlcis: usize,
    /// Acknowledgement timer (07.10 T1) for SABM on the control channel.
    /// Default: 300 ms.
    pub response_timeout: Duration,
    /// SABM retransmissions before a connect fails (07.10 N2). Default: 3.
    pub connect_retries: u32,
    /// Wait for the DISC acknowledgement on the control channel.
    /// Default: 300 ms.
    pub disconnect_timeout: Duration,
    /// Wait for the SABM acknowledgement on a DLCI. Default: 300 ms.
    pub dlci_open_timeout: Duration,
    /// Wait for the DISC acknowledgement on a DLCI. Default: 300 ms.
    pub dlci_close_timeout: Duration,
    /// Consecutive checksum errors tolerated while connected before the
    /// link is torn down. Default: unlimited.
    pub checksum_error_budget: Option<u32>,
    /// Link event callback.
    pub callback: Option<CmuxCallback>,
}

impl Default for CmuxConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            receive_buf_size: 512,
            transmit_buf_size: 1024,
            max_dlcis: 8,
            response_timeout: Duration::from_millis(300),
            connect_retries: 3,
            disconnect_timeout: Duration::from_millis(300),
            dlci_open_timeout: Duration::from_millis(300),
            dlci_close_timeout: Duration::from_millis(300),
            checksum_error_budget: None,
            callback: None,
        }
    }
}

impl CmuxConfig {
    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_buffers(mut self, receive_buf_size: usize, transmit_buf_size: usize) -> Self {
        self.receive_buf_size = receive_buf_size;
        self.transmit_buf_size = transmit_buf_size;
        self
    }

    pub fn with_max_dlcis(mut self, max_dlcis: usize) -> Self {
        self.max_dlcis = max_dlcis;
        self
    }

    /// Set T1 and N2 for the control channel handshake.
    pub fn with_retries(mut self, response_timeout: Duration, connect_retries: u32) -> Self {
        self.response_timeout = response_timeout;
        self.connect_retries = connect_retries;
        self
    }

    /// Use the same timeout for disconnect and DLCI open/close.
    pub fn with_timeouts(mut self, timeout: Duration) -> Self {
        self.disconnect_timeout = timeout;
        self.dlci_open_timeout = timeout;
        self.dlci_close_timeout = timeout;
        self
    }

    pub fn with_checksum_error_budget(mut self, budget: Option<u32>) -> Self {
        self.checksum_error_budget = budget;
        self
    }

    pub fn with_callback(mut self, callback: impl Fn(CmuxEvent) + Send + Sync + 'static) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Reject sizes the multiplexer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.frame.max_payload() == 0 {
            return Err(CmuxError::InvalidConfig(
                "frame.max_payload_size must be non-zero".to_string(),
            ));
        }
        if self.max_dlcis == 0 || self.max_dlcis > dlci::MAX_DLCI as usize {
            return Err(CmuxError::InvalidConfig(format!(
                "max_dlcis must be within 1..={}",
                dlci::MAX_DLCI
            )));
        }

        let frame_size = self.frame.max_wire_size();
        if self.receive_buf_size < frame_size {
            return Err(CmuxError::InvalidConfig(format!(
                "receive_buf_size {} cannot hold one {frame_size}-byte frame",
                self.receive_buf_size
            )));
        }
        if self.transmit_buf_size < frame_size {
            return Err(CmuxError::InvalidConfig(format!(
                "transmit_buf_size {} cannot hold one {frame_size}-byte frame",
                self.transmit_buf_size
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for CmuxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmuxConfig")
            .field("frame", &self.frame)
            .field("receive_buf_size", &self.receive_buf_size)
            .field("transmit_buf_size", &self.transmit_buf_size)
            .field("max_dlcis", &self.max_dlcis)
            .field("response_timeout", &self.response_timeout)
            .field("connect_retries", &self.connect_retries)
            .field("disconnect_timeout", &self.disconnect_timeout)
            .field("dlci_open_timeout", &self.dlci_open_timeout)
            .field("dlci_close_timeout", &self.dlci_close_timeout)
            .field("checksum_error_budget", &self.checksum_error_budget)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// How [`crate::DlciPipe`] transmit behaves when the shared transmit buffer
/// is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransmitMode {
    /// Return the number of bytes accepted, or `WouldBlock` if none were.
    #[default]
    NonBlocking,
    /// Wait up to the given time for space, then return what was accepted.
    Blocking(Duration),
}

/// Configuration for one DLCI.
#[derive(Debug, Clone)]
pub struct DlciConfig {
    /// DLCI address, 1..=63.
    pub address: u8,
    /// Capacity of the DLCI receive ring buffer. Default: 256 bytes.
    pub receive_buf_size: usize,
    pub transmit_mode: TransmitMode,
}

impl DlciConfig {
    pub fn new(address: u8) -> Self {
        Self {
            address,
            receive_buf_size: 256,
            transmit_mode: TransmitMode::NonBlocking,
        }
    }

    pub fn with_receive_buf_size(mut self, size: usize) -> Self {
        self.receive_buf_size = size;
        self
    }

    pub fn with_transmit_mode(mut self, mode: TransmitMode) -> Self {
        self.transmit_mode = mode;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !dlci::is_data(self.address) {
            return Err(CmuxError::InvalidDlci(self.address));
        }
        if self.receive_buf_size == 0 {
            return Err(CmuxError::InvalidConfig(format!(
                "DLCI {} receive_buf_size must be non-zero",
                self.address
            )));
        }
        Ok(())
    }
}
