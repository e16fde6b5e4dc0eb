use std::io::{ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::traits::{CallbackSlot, ModemPipe, PipeCallback, PipeEvent};

const READ_CHUNK_SIZE: usize = 1024;

/// Buffer sizing for a [`StreamPipe`].
#[derive(Debug, Clone)]
pub struct StreamPipeConfig {
    /// Receive buffer capacity. The reader thread stops reading from the
    /// socket while the buffer is full.
    pub receive_buf_size: usize,
}

impl Default for StreamPipeConfig {
    fn default() -> Self {
        Self {
            receive_buf_size: 4096,
        }
    }
}

struct StreamState {
    open: bool,
    rx: BytesMut,
}

struct StreamShared {
    stream: UnixStream,
    state: Mutex<StreamState>,
    space: Condvar,
    callback: CallbackSlot,
    config: StreamPipeConfig,
}

impl StreamShared {
    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_closed(&self) -> bool {
        let mut state = self.lock();
        let was_open = state.open;
        state.open = false;
        self.space.notify_all();
        was_open
    }
}

/// A [`ModemPipe`] over a connected Unix domain socket.
///
/// Opening the pipe starts a reader thread that moves socket bytes into a
/// bounded receive buffer and reports [`PipeEvent::ReceiveReady`]. End of
/// stream is reported as [`PipeEvent::Closed`].
pub struct StreamPipe {
    shared: Arc<StreamShared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamPipe {
    /// Wrap a connected stream with default configuration.
    pub fn unix(stream: UnixStream) -> Self {
        Self::with_config(stream, StreamPipeConfig::default())
    }

    /// Wrap a connected stream with explicit configuration.
    pub fn with_config(stream: UnixStream, config: StreamPipeConfig) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                stream,
                state: Mutex::new(StreamState {
                    open: false,
                    rx: BytesMut::with_capacity(config.receive_buf_size),
                }),
                space: Condvar::new(),
                callback: CallbackSlot::new(),
                config,
            }),
            reader: Mutex::new(None),
        }
    }

    fn spawn_reader(&self) -> Result<JoinHandle<()>> {
        let mut source = self.shared.stream.try_clone()?;
        let shared = Arc::clone(&self.shared);

        let handle = std::thread::Builder::new()
            .name("cmux-stream-rx".to_string())
            .spawn(move || {
                let mut chunk = [0u8; READ_CHUNK_SIZE];
                loop {
                    let read = match source.read(&mut chunk) {
                        Ok(n) => n,
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => {
                            warn!(error = %err, "stream pipe read failed");
                            0
                        }
                    };

                    if read == 0 {
                        if shared.mark_closed() {
                            debug!("stream pipe reached end of stream");
                            shared.callback.fire(PipeEvent::Closed);
                        }
                        return;
                    }

                    let mut offset = 0;
                    while offset < read {
                        let mut state = shared.lock();
                        while state.open && state.rx.len() >= shared.config.receive_buf_size {
                            state = shared
                                .space
                                .wait(state)
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                        }
                        if !state.open {
                            return;
                        }
                        let room = shared.config.receive_buf_size - state.rx.len();
                        let n = room.min(read - offset);
                        state.rx.extend_from_slice(&chunk[offset..offset + n]);
                        offset += n;
                        drop(state);
                        shared.callback.fire(PipeEvent::ReceiveReady);
                    }
                }
            })?;

        Ok(handle)
    }

    fn join_reader(&self) {
        let handle = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            // A callback running on the reader thread may close the pipe.
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("stream pipe reader thread panicked");
            }
        }
    }
}

impl ModemPipe for StreamPipe {
    fn open(&self, _timeout: Duration) -> Result<()> {
        self.open_async()
    }

    fn open_async(&self) -> Result<()> {
        {
            let mut state = self.shared.lock();
            if state.open {
                return Ok(());
            }
            state.open = true;
            state.rx.clear();
        }

        match self.spawn_reader() {
            Ok(handle) => {
                *self
                    .reader
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
            }
            Err(err) => {
                self.shared.mark_closed();
                return Err(err);
            }
        }

        debug!("stream pipe opened");
        self.shared.callback.fire(PipeEvent::Opened);
        Ok(())
    }

    fn close(&self, _timeout: Duration) -> Result<()> {
        self.close_async()
    }

    fn close_async(&self) -> Result<()> {
        let was_open = self.shared.mark_closed();
        // Unblocks the reader thread; the peer may already be gone.
        let _ = self.shared.stream.shutdown(Shutdown::Both);
        self.join_reader();

        if was_open {
            debug!("stream pipe closed");
            self.shared.callback.fire(PipeEvent::Closed);
        }
        Ok(())
    }

    fn transmit(&self, buf: &[u8]) -> Result<usize> {
        if !self.shared.lock().open {
            return Err(TransportError::NotOpen);
        }

        loop {
            match (&self.shared.stream).write(buf) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(0),
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.shared.lock();
        let n = state.rx.len().min(buf.len());
        buf[..n].copy_from_slice(&state.rx[..n]);
        state.rx.advance(n);
        if n > 0 {
            self.shared.space.notify_all();
        }
        Ok(n)
    }

    fn attach(&self, callback: PipeCallback) {
        self.shared.callback.set(callback);
    }

    fn release(&self) {
        self.shared.callback.clear();
    }

    fn is_open(&self) -> bool {
        self.shared.lock().open
    }
}

impl Drop for StreamPipe {
    fn drop(&mut self) {
        self.shared.mark_closed();
        let _ = self.shared.stream.shutdown(Shutdown::Both);
        self.join_reader();
    }
}

impl std::fmt::Debug for StreamPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipe")
            .field("type", &"unix")
            .field("open", &self.is_open())
            .finish()
    }
}
