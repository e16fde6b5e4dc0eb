use std::io;

use cmux_transport::TransportError;

/// Errors that can occur in multiplexer operations.
#[derive(Debug, thiserror::Error)]
pub enum CmuxError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] cmux_frame::FrameError),

    /// No transport is attached to the multiplexer.
    #[error("no transport attached")]
    NotAttached,

    /// A transport is already attached and the link is in use.
    #[error("a transport is already attached")]
    AlreadyAttached,

    /// The control channel is not connected.
    #[error("multiplexer not connected")]
    NotConnected,

    /// The DLCI is not open.
    #[error("DLCI {0} is not open")]
    NotOpen(u8),

    /// The address is not a valid data DLCI (1..=63).
    #[error("invalid DLCI address {0}")]
    InvalidDlci(u8),

    /// The address is already registered on this instance.
    #[error("DLCI {0} already registered")]
    DlciInUse(u8),

    /// Every slot of the DLCI table is taken.
    #[error("DLCI table full ({0} entries)")]
    DlciTableFull(usize),

    /// The operation is not valid in the current state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The peer did not acknowledge SABM on the control channel.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The peer did not acknowledge SABM on the DLCI.
    #[error("open of DLCI {0} timed out")]
    OpenTimeout(u8),

    /// The peer did not acknowledge DISC on the DLCI.
    #[error("close of DLCI {0} timed out")]
    CloseTimeout(u8),

    /// The peer did not acknowledge DISC on the control channel.
    #[error("disconnect timed out")]
    DisconnectTimeout,

    /// The peer answered with DM (0 = the control channel).
    #[error("rejected by peer (DLCI {0})")]
    Rejected(u8),

    /// The shared transmit buffer is full.
    #[error("transmit buffer full")]
    WouldBlock,

    /// The transport closed while the operation was pending.
    #[error("transport closed")]
    TransportClosed,

    /// The multiplexer instance was dropped or released.
    #[error("multiplexer released")]
    Released,

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CmuxError {
    /// Whether retrying the same call may succeed without code changes.
    ///
    /// Timeouts leave the state machine in a retry-eligible state and
    /// backpressure clears as the transport drains. Misuse errors do not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CmuxError::ConnectTimeout
                | CmuxError::OpenTimeout(_)
                | CmuxError::CloseTimeout(_)
                | CmuxError::DisconnectTimeout
                | CmuxError::WouldBlock
                | CmuxError::Rejected(_)
                | CmuxError::TransportClosed
        )
    }
}

/// Map multiplexer errors onto the pipe contract used by [`crate::DlciPipe`].
///
/// Errors without a transport counterpart are wrapped in an I/O error of a
/// fitting kind; the original is available through `get_ref()`.
impl From<CmuxError> for TransportError {
    fn from(err: CmuxError) -> Self {
        let kind = match err {
            CmuxError::Transport(inner) => return inner,
            CmuxError::NotOpen(_) => return TransportError::NotOpen,
            CmuxError::WouldBlock => io::ErrorKind::WouldBlock,
            CmuxError::ConnectTimeout
            | CmuxError::OpenTimeout(_)
            | CmuxError::CloseTimeout(_)
            | CmuxError::DisconnectTimeout => io::ErrorKind::TimedOut,
            CmuxError::NotConnected | CmuxError::TransportClosed => io::ErrorKind::NotConnected,
            CmuxError::Rejected(_) => io::ErrorKind::ConnectionRefused,
            CmuxError::InvalidDlci(_) | CmuxError::InvalidConfig(_) => io::ErrorKind::InvalidInput,
            _ => io::ErrorKind::Other,
        };
        TransportError::Io(io::Error::new(kind, err))
    }
}

/// Recover the multiplexer error carried by a pipe error, if any.
pub fn pipe_error_cause(err: &TransportError) -> Option<&CmuxError> {
    match err {
        TransportError::Io(io) => io.get_ref()?.downcast_ref::<CmuxError>(),
        _ => None,
    }
}

pub type Result<T> = std::result::Result<T, CmuxError>;
