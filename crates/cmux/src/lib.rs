//! GSM 07.10 (CMUX) multiplexer for cellular modem links.
//!
//! cmux runs several logical channels (DLCIs) over one serial byte stream,
//! the way modems expose an AT command port, a PPP data port and a GNSS port
//! over a single UART after `AT+CMUX=0`.
//!
//! # Crate Structure
//!
//! - [`transport`]: Byte-pipe contract and transports (in-memory mock, Unix sockets)
//! - [`frame`]: 07.10 frame codec, control-channel messages, incremental decoder
//! - [`mux`]: Multiplexer instance, DLCI manager and virtual pipes
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use cmux::mux::{Cmux, CmuxConfig, DlciConfig, ModemPipe};
//! use cmux::transport::UnixDomainSocket;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let uart = std::sync::Arc::new(UnixDomainSocket::connect("/tmp/modem.sock")?);
//! uart.open(Duration::from_secs(1))?;
//!
//! let cmux = Cmux::new(CmuxConfig::default())?;
//! let at = cmux.dlci_init(DlciConfig::new(2))?;
//! cmux.attach(uart)?;
//! cmux.connect(Duration::from_secs(1))?;
//! at.open(Duration::from_secs(1))?;
//! at.transmit(b"AT\r\n")?;
//! # Ok(())
//! # }
//! ```

/// Re-export transport types.
pub mod transport {
    pub use cmux_transport::*;
}

/// Re-export frame codec types.
pub mod frame {
    pub use cmux_frame::*;
}

/// Re-export multiplexer types.
pub mod mux {
    pub use cmux_mux::*;
}
