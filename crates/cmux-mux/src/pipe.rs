use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use cmux_transport::{ModemPipe, PipeCallback, Result};

use crate::dlci::DlciState;
use crate::error::CmuxError;
use crate::mux::Inner;

/// Virtual pipe bound to one DLCI.
///
/// Implements the same [`ModemPipe`] contract as the physical transport so
/// upper layers (AT command parsers, PPP) run unchanged on a DLCI. The pipe
/// holds a weak reference: once the [`crate::Cmux`] is dropped every call
/// fails with [`CmuxError::Released`].
///
/// Errors are reported as `TransportError`; use
/// [`crate::pipe_error_cause`] to recover the [`CmuxError`].
#[derive(Clone)]
pub struct DlciPipe {
    inner: Weak<Inner>,
    address: u8,
}

impl DlciPipe {
    pub(crate) fn new(inner: Weak<Inner>, address: u8) -> Self {
        Self { inner, address }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Current DLCI state, or `None` once the instance is gone.
    pub fn state(&self) -> Option<DlciState> {
        self.inner.upgrade()?.dlci_state(self.address)
    }

    fn inner(&self) -> std::result::Result<Arc<Inner>, CmuxError> {
        self.inner.upgrade().ok_or(CmuxError::Released)
    }
}

impl ModemPipe for DlciPipe {
    fn open(&self, timeout: Duration) -> Result<()> {
        Ok(self.inner()?.open_dlci(self.address, Some(timeout))?)
    }

    fn open_async(&self) -> Result<()> {
        Ok(self.inner()?.open_dlci(self.address, None)?)
    }

    fn close(&self, timeout: Duration) -> Result<()> {
        Ok(self.inner()?.close_dlci(self.address, Some(timeout))?)
    }

    fn close_async(&self) -> Result<()> {
        Ok(self.inner()?.close_dlci(self.address, None)?)
    }

    fn transmit(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.inner()?.transmit(self.address, buf)?)
    }

    fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.inner()?.receive_dlci(self.address, buf)?)
    }

    fn attach(&self, callback: PipeCallback) {
        if let Some(slot) = self
            .inner
            .upgrade()
            .and_then(|inner| inner.dlci_callback(self.address))
        {
            slot.set(callback);
        }
    }

    fn release(&self) {
        if let Some(slot) = self
            .inner
            .upgrade()
            .and_then(|inner| inner.dlci_callback(self.address))
        {
            slot.clear();
        }
    }

    fn is_open(&self) -> bool {
        self.state() == Some(DlciState::Open)
    }
}

impl fmt::Debug for DlciPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DlciPipe")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
