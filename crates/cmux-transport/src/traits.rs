use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::Result;

/// Events a pipe reports to its attached callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipeEvent {
    /// The pipe finished opening.
    Opened,
    /// The pipe closed, either on request or because the other end went away.
    Closed,
    /// New bytes are available through [`ModemPipe::receive`].
    ReceiveReady,
    /// The transmit path drained and can accept more bytes.
    TransmitIdle,
}

/// Callback invoked for every [`PipeEvent`].
///
/// Callbacks run in whatever context produced the event (a reader thread,
/// the caller of `transmit`, a multiplexer pump) and must not block on the
/// pipe that invoked them.
pub type PipeCallback = Arc<dyn Fn(PipeEvent) + Send + Sync>;

/// A byte-oriented, event-driven duplex pipe.
///
/// This is the contract shared by physical transports (a UART, a socket, an
/// in-memory mock) and by the virtual channels a multiplexer exposes on top
/// of them, so that protocol layers above are transport-agnostic.
pub trait ModemPipe: Send + Sync {
    /// Open the pipe and wait until it is open or `timeout` elapses.
    fn open(&self, timeout: Duration) -> Result<()>;

    /// Start opening the pipe; completion is reported as [`PipeEvent::Opened`].
    fn open_async(&self) -> Result<()>;

    /// Close the pipe and wait until it is closed or `timeout` elapses.
    fn close(&self, timeout: Duration) -> Result<()>;

    /// Start closing the pipe; completion is reported as [`PipeEvent::Closed`].
    fn close_async(&self) -> Result<()>;

    /// Queue bytes for transmission. Returns how many bytes were accepted,
    /// which may be fewer than offered.
    fn transmit(&self, buf: &[u8]) -> Result<usize>;

    /// Drain received bytes into `buf`. Never blocks; returns 0 when empty.
    fn receive(&self, buf: &mut [u8]) -> Result<usize>;

    /// Register the event callback, replacing any previous one.
    fn attach(&self, callback: PipeCallback);

    /// Remove the event callback.
    fn release(&self);

    /// Whether the pipe is currently open.
    fn is_open(&self) -> bool;
}

/// Holds at most one [`PipeCallback`] and fires it without holding a lock.
#[derive(Default)]
pub struct CallbackSlot {
    inner: Mutex<Option<PipeCallback>>,
}

impl CallbackSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `callback`, replacing the previous one.
    pub fn set(&self, callback: PipeCallback) {
        *self.lock() = Some(callback);
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Invoke the current callback, if any.
    ///
    /// The callback is cloned out first so it may re-enter the pipe (or
    /// re-attach) without deadlocking.
    pub fn fire(&self, event: PipeEvent) {
        let callback = self.lock().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<PipeCallback>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for CallbackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSlot")
            .field("attached", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn fire_without_callback_is_noop() {
        let slot = CallbackSlot::new();
        slot.fire(PipeEvent::ReceiveReady);
        assert!(!slot.is_set());
    }

    #[test]
    fn set_replaces_previous_callback() {
        let slot = CallbackSlot::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&first);
        slot.set(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        slot.fire(PipeEvent::Opened);

        let counter = Arc::clone(&second);
        slot.set(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        slot.fire(PipeEvent::Opened);
        slot.fire(PipeEvent::Closed);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_may_reattach_while_firing() {
        let slot = Arc::new(CallbackSlot::new());
        let inner = Arc::clone(&slot);
        slot.set(Arc::new(move |_| {
            inner.clear();
        }));

        slot.fire(PipeEvent::ReceiveReady);
        assert!(!slot.is_set());
    }
}
