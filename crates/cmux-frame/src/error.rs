/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The information field exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The frame check sequence did not match the received header.
    #[error("frame checksum mismatch (received 0x{received:02x})")]
    Checksum { received: u8 },

    /// The address octet is malformed (EA bit clear).
    #[error("invalid address octet 0x{0:02x}")]
    InvalidAddress(u8),

    /// The control octet does not name a supported frame type.
    #[error("unknown frame type (control octet 0x{0:02x})")]
    UnknownFrameType(u8),

    /// The byte following the frame check sequence is not a flag.
    #[error("missing closing flag")]
    MissingEndFlag,

    /// Fewer bytes than a minimal frame between two flags.
    #[error("truncated frame ({0} bytes between flags)")]
    Truncated(usize),

    /// DLCI outside 0..=63.
    #[error("invalid DLCI {0}")]
    InvalidDlci(u8),

    /// A control-channel message could not be parsed.
    #[error("invalid control message: {0}")]
    InvalidControl(&'static str),

    /// The re-assembly buffer overflowed and buffered bytes were discarded.
    #[error("receive buffer overflow ({dropped} bytes discarded)")]
    BufferOverflow { dropped: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FrameError {
    /// Whether decoding can continue after this error.
    ///
    /// Corrupt or unexpected frames are dropped and the decoder resynchronises
    /// on the next flag; only I/O failures end a session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
