use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use cmux_transport::CallbackSlot;
use serde::Serialize;

use crate::completion::Completion;
use crate::config::{DlciConfig, TransmitMode};

/// Lifecycle of one DLCI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DlciState {
    Closed,
    Opening,
    Open,
    Closing,
}

/// One entry of the DLCI table.
pub(crate) struct Dlci {
    pub address: u8,
    pub state: DlciState,
    pub transmit_mode: TransmitMode,
    pub callback: Arc<CallbackSlot>,
    /// Open/close acknowledgement deadline.
    pub timer: Option<Instant>,
    /// The peer asked us to stop sending (MSC FC bit).
    pub remote_fc: bool,
    /// A transmit was refused for lack of space; report `TransmitIdle` once
    /// space frees up.
    pub tx_blocked: bool,
    pub open_waiters: Vec<Arc<Completion>>,
    pub close_waiters: Vec<Arc<Completion>>,
    rx: VecDeque<u8>,
    rx_capacity: usize,
    tx: VecDeque<Bytes>,
    tx_bytes: usize,
}

impl Dlci {
    pub fn new(config: &DlciConfig) -> Self {
        Self {
            address: config.address,
            state: DlciState::Closed,
            transmit_mode: config.transmit_mode,
            callback: Arc::new(CallbackSlot::new()),
            timer: None,
            remote_fc: false,
            tx_blocked: false,
            open_waiters: Vec::new(),
            close_waiters: Vec::new(),
            rx: VecDeque::with_capacity(config.receive_buf_size),
            rx_capacity: config.receive_buf_size,
            tx: VecDeque::new(),
            tx_bytes: 0,
        }
    }

    /// Append received data; returns the number of bytes that did not fit.
    pub fn push_rx(&mut self, data: &[u8]) -> usize {
        let room = self.rx_capacity - self.rx.len();
        let accepted = room.min(data.len());
        self.rx.extend(&data[..accepted]);
        data.len() - accepted
    }

    /// Drain up to `buf.len()` received bytes.
    pub fn read_rx(&mut self, buf: &mut [u8]) -> usize {
        let n = self.rx.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *dst = src;
        }
        n
    }

    pub fn rx_len(&self) -> usize {
        self.rx.len()
    }

    /// Discard unread received data.
    pub fn flush_rx(&mut self) {
        self.rx.clear();
    }

    /// Queue one encoded data frame.
    pub fn push_tx(&mut self, frame: Bytes) {
        self.tx_bytes += frame.len();
        self.tx.push_back(frame);
    }

    pub fn pop_tx(&mut self) -> Option<Bytes> {
        let frame = self.tx.pop_front()?;
        self.tx_bytes -= frame.len();
        Some(frame)
    }

    pub fn peek_tx_len(&self) -> Option<usize> {
        self.tx.front().map(Bytes::len)
    }

    /// Encoded bytes waiting in the outbound queue.
    pub fn tx_bytes(&self) -> usize {
        self.tx_bytes
    }

    /// Drop queued frames; returns the number of bytes released.
    pub fn clear_tx(&mut self) -> usize {
        let released = self.tx_bytes;
        self.tx.clear();
        self.tx_bytes = 0;
        released
    }

    /// Whether queued frames may be moved to the transport.
    pub fn can_send(&self) -> bool {
        self.state == DlciState::Open && !self.remote_fc && !self.tx.is_empty()
    }
}
