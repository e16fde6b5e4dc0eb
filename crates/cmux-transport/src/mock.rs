//! In-memory transport for tests and demos.
//!
//! A [`MockPipe`] behaves like a UART backend: bytes injected with
//! [`MockPipe::put`] become receivable, bytes transmitted by the pipe owner
//! can be collected with [`MockPipe::get`]. Two mocks can be bridged so that
//! whatever one side transmits is received by the other, which is how two
//! multiplexer instances (DTE and DCE) are wired together in tests.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::{Result, TransportError};
use crate::traits::{CallbackSlot, ModemPipe, PipeCallback, PipeEvent};

/// Buffer sizing for a [`MockPipe`].
#[derive(Debug, Clone)]
pub struct MockPipeConfig {
    /// Capacity of the receive buffer. Bytes beyond it are refused.
    pub receive_buf_size: usize,
    /// Capacity of the transmit capture buffer (unbridged pipes only).
    pub transmit_buf_size: usize,
}

impl Default for MockPipeConfig {
    fn default() -> Self {
        Self {
            receive_buf_size: 4096,
            transmit_buf_size: 4096,
        }
    }
}

struct MockState {
    open: bool,
    rx: BytesMut,
    tx: BytesMut,
    transmit_limit: Option<usize>,
    peer: Option<Weak<MockPipe>>,
}

/// In-memory [`ModemPipe`] implementation.
pub struct MockPipe {
    state: Mutex<MockState>,
    callback: CallbackSlot,
    config: MockPipeConfig,
}

impl MockPipe {
    pub fn new(config: MockPipeConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                open: false,
                rx: BytesMut::with_capacity(config.receive_buf_size),
                tx: BytesMut::with_capacity(config.transmit_buf_size),
                transmit_limit: None,
                peer: None,
            }),
            callback: CallbackSlot::new(),
            config,
        })
    }

    /// Connect two mocks back to back.
    pub fn bridge(left: &Arc<MockPipe>, right: &Arc<MockPipe>) {
        left.lock().peer = Some(Arc::downgrade(right));
        right.lock().peer = Some(Arc::downgrade(left));
    }

    /// Inject bytes as if they arrived on the wire.
    ///
    /// Returns how many bytes fit into the receive buffer and fires
    /// [`PipeEvent::ReceiveReady`] when at least one was accepted.
    pub fn put(&self, data: &[u8]) -> usize {
        let accepted = {
            let mut state = self.lock();
            let room = self.config.receive_buf_size.saturating_sub(state.rx.len());
            let accepted = room.min(data.len());
            state.rx.extend_from_slice(&data[..accepted]);
            accepted
        };

        if accepted > 0 {
            self.callback.fire(PipeEvent::ReceiveReady);
        }
        accepted
    }

    /// Collect bytes the owner transmitted (unbridged pipes only).
    pub fn get(&self, buf: &mut [u8]) -> usize {
        let mut state = self.lock();
        let n = state.tx.len().min(buf.len());
        buf[..n].copy_from_slice(&state.tx[..n]);
        state.tx.advance(n);
        n
    }

    /// Collect every byte transmitted so far.
    pub fn take_transmitted(&self) -> Vec<u8> {
        let mut state = self.lock();
        let out = state.tx.to_vec();
        state.tx.clear();
        out
    }

    /// Cap the number of bytes a single `transmit` call accepts.
    ///
    /// `Some(0)` simulates a transmit path that is completely stalled.
    pub fn set_transmit_limit(&self, limit: Option<usize>) {
        self.lock().transmit_limit = limit;
    }

    /// Fire [`PipeEvent::TransmitIdle`], as a driver does once its
    /// transmit FIFO drains.
    pub fn signal_transmit_idle(&self) {
        self.callback.fire(PipeEvent::TransmitIdle);
    }

    /// Drop all buffered bytes in both directions.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.rx.clear();
        state.tx.clear();
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ModemPipe for MockPipe {
    fn open(&self, _timeout: Duration) -> Result<()> {
        self.open_async()
    }

    fn open_async(&self) -> Result<()> {
        self.lock().open = true;
        self.callback.fire(PipeEvent::Opened);
        Ok(())
    }

    fn close(&self, _timeout: Duration) -> Result<()> {
        self.close_async()
    }

    fn close_async(&self) -> Result<()> {
        self.lock().open = false;
        self.callback.fire(PipeEvent::Closed);
        Ok(())
    }

    fn transmit(&self, buf: &[u8]) -> Result<usize> {
        let (offered, peer) = {
            let mut state = self.lock();
            if !state.open {
                return Err(TransportError::NotOpen);
            }
            let offered = state
                .transmit_limit
                .map_or(buf.len(), |limit| limit.min(buf.len()));
            match state.peer.as_ref().and_then(Weak::upgrade) {
                Some(peer) => (offered, Some(peer)),
                None => {
                    let room = self
                        .config
                        .transmit_buf_size
                        .saturating_sub(state.tx.len());
                    let accepted = room.min(offered);
                    state.tx.extend_from_slice(&buf[..accepted]);
                    trace!(bytes = accepted, "mock pipe captured transmit");
                    return Ok(accepted);
                }
            }
        };

        // Deliver outside our own lock: the peer's callback may transmit back.
        let accepted = peer.map_or(0, |peer| peer.put(&buf[..offered]));
        trace!(bytes = accepted, "mock pipe bridged transmit");
        Ok(accepted)
    }

    fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.lock();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        let n = state.rx.len().min(buf.len());
        buf[..n].copy_from_slice(&state.rx[..n]);
        state.rx.advance(n);
        Ok(n)
    }

    fn attach(&self, callback: PipeCallback) {
        self.callback.set(callback);
    }

    fn release(&self) {
        self.callback.clear();
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }
}
