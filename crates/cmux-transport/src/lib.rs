//! Byte-pipe transport contract for the CMUX multiplexer.
//!
//! Every layer of the stack speaks the same [`ModemPipe`] contract:
//! open/close (blocking or asynchronous), non-blocking transmit/receive, and a
//! single event callback. Physical transports implement it here:
//! - [`MockPipe`]: in-memory pipe with bridging, for tests and demos
//! - [`StreamPipe`]: connected Unix domain socket (unix only)
//!
//! The multiplexer's virtual channels implement the same trait on top.

pub mod error;
pub mod mock;
#[cfg(unix)]
pub mod stream;
pub mod traits;
#[cfg(unix)]
pub mod uds;

pub use error::{Result, TransportError};
pub use mock::{MockPipe, MockPipeConfig};
#[cfg(unix)]
pub use stream::{StreamPipe, StreamPipeConfig};
pub use traits::{CallbackSlot, ModemPipe, PipeCallback, PipeEvent};
#[cfg(unix)]
pub use uds::UnixDomainSocket;
