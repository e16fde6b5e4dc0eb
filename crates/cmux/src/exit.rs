use std::fmt;
use std::io;

use cmux_frame::FrameError;
use cmux_mux::{pipe_error_cause, CmuxError};
use cmux_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => TRANSPORT_ERROR,
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => DATA_INVALID,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

/// Map an error returned by a transport or a DLCI pipe.
pub fn transport_error(context: &str, err: TransportError) -> CliError {
    if let Some(cause) = pipe_error_cause(&err) {
        return cmux_error_ref(context, cause);
    }
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        TransportError::PathTooLong { .. } => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::InvalidDlci(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}

pub fn cmux_error(context: &str, err: CmuxError) -> CliError {
    match err {
        CmuxError::Transport(err) => transport_error(context, err),
        CmuxError::Frame(err) => frame_error(context, err),
        other => cmux_error_ref(context, &other),
    }
}

fn cmux_error_ref(context: &str, err: &CmuxError) -> CliError {
    let code = match err {
        CmuxError::ConnectTimeout
        | CmuxError::OpenTimeout(_)
        | CmuxError::CloseTimeout(_)
        | CmuxError::DisconnectTimeout
        | CmuxError::WouldBlock => TIMEOUT,
        CmuxError::Transport(_)
        | CmuxError::NotAttached
        | CmuxError::NotConnected
        | CmuxError::NotOpen(_)
        | CmuxError::TransportClosed => TRANSPORT_ERROR,
        CmuxError::InvalidDlci(_)
        | CmuxError::DlciInUse(_)
        | CmuxError::DlciTableFull(_)
        | CmuxError::InvalidConfig(_) => USAGE,
        CmuxError::Frame(_) => DATA_INVALID,
        CmuxError::Rejected(_) => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_map_to_124() {
        assert_eq!(cmux_error("connect", CmuxError::ConnectTimeout).code, TIMEOUT);
        assert_eq!(
            cmux_error("open", CmuxError::OpenTimeout(2)).code,
            TIMEOUT
        );
    }

    #[test]
    fn pipe_errors_keep_their_cause() {
        let err: TransportError = CmuxError::Rejected(3).into();
        let mapped = transport_error("open", err);
        assert_eq!(mapped.code, FAILURE);
        assert!(mapped.message.contains("DLCI 3"));
    }

    #[test]
    fn missing_socket_is_a_transport_error() {
        let err = TransportError::Connect {
            path: "/tmp/missing.sock".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert_eq!(transport_error("connect", err).code, TRANSPORT_ERROR);
    }

    #[test]
    fn bad_capture_is_data_invalid() {
        assert_eq!(
            frame_error("decode", FrameError::Checksum { received: 0 }).code,
            DATA_INVALID
        );
    }
}
