//! GSM 07.10 (CMUX) multiplexer core.
//!
//! One [`Cmux`] instance runs the 07.10 basic-mode protocol over a single
//! byte transport implementing [`ModemPipe`] and exposes each logical
//! channel (DLCI) as a [`DlciPipe`] implementing the same contract:
//!
//! ```text
//!   AT parser     PPP        GNSS
//!      │           │           │
//!  DlciPipe(1) DlciPipe(2) DlciPipe(3)
//!      └───────────┼───────────┘
//!                Cmux  (control channel, DLCI table, frame codec)
//!                  │
//!          transport ModemPipe (UART, socket, mock)
//! ```
//!
//! The control channel state machine (SABM/UA/DM/DISC on DLCI 0, CLD, MSC,
//! flow control, Test) and the per-DLCI open/close handshakes run inside the
//! transport callback and the callers of the API; there is no background
//! thread.

mod completion;
pub mod config;
mod dlci;
pub mod error;
mod link;
mod mux;
mod pipe;

pub use cmux_transport::{ModemPipe, PipeCallback, PipeEvent};
pub use config::{CmuxCallback, CmuxConfig, CmuxEvent, DlciConfig, TransmitMode};
pub use dlci::DlciState;
pub use error::{pipe_error_cause, CmuxError, Result};
pub use link::{CmuxStats, LinkState};
pub use mux::Cmux;
pub use pipe::DlciPipe;
