use std::fs;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cmux_frame::dlci;
use cmux_mux::{Cmux, CmuxConfig, DlciConfig, ModemPipe, PipeEvent, TransmitMode};
use cmux_transport::UnixDomainSocket;
use tracing::debug;

use crate::cmd::channel::{drain, write_all, Activity};
use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{cmux_error, transport_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{parse_hex, print_data, OutputFormat};

const POLL: Duration = Duration::from_millis(50);

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    if !dlci::is_data(args.dlci) {
        return Err(CliError::new(
            USAGE,
            format!("invalid DLCI {} (1..=63)", args.dlci),
        ));
    }
    let payload = resolve_payload(&args)?;
    let timeout = parse_duration(&args.timeout)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;

    let transport = Arc::new(
        UnixDomainSocket::connect(&args.path)
            .map_err(|err| transport_error("connect failed", err))?,
    );
    transport
        .open(timeout)
        .map_err(|err| transport_error("open failed", err))?;

    let cmux = Cmux::new(CmuxConfig::default())
        .map_err(|err| cmux_error("invalid configuration", err))?;
    let pipe = cmux
        .dlci_init(
            DlciConfig::new(args.dlci)
                .with_receive_buf_size(4096)
                .with_transmit_mode(TransmitMode::Blocking(timeout)),
        )
        .map_err(|err| cmux_error("DLCI registration failed", err))?;

    let (tx, rx) = mpsc::channel();
    let address = args.dlci;
    pipe.attach(Arc::new(move |event| {
        let _ = tx.send(Activity::Pipe(address, event));
    }));

    cmux.attach(transport)
        .map_err(|err| cmux_error("attach failed", err))?;
    cmux.connect(timeout)
        .map_err(|err| cmux_error("connect failed", err))?;
    pipe.open(timeout)
        .map_err(|err| transport_error("open DLCI failed", err))?;
    debug!(dlci = address, bytes = payload.len(), "channel open, sending");

    write_all(&pipe, &payload)?;

    if args.wait {
        let reply = wait_for_reply(&rx, &pipe, wait_timeout, || cmux.pump())?;
        print_data(address, &reply, format);
    }

    pipe.close(timeout)
        .map_err(|err| transport_error("close DLCI failed", err))?;
    cmux.disconnect(timeout)
        .map_err(|err| cmux_error("disconnect failed", err))?;
    cmux.release();

    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    let mut payload = if let Some(data) = &args.data {
        data.as_bytes().to_vec()
    } else if let Some(path) = &args.file {
        fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        })?
    } else if let Some(hex) = &args.hex {
        parse_hex(hex)?
    } else {
        Vec::new()
    };
    if args.crlf {
        payload.extend_from_slice(b"\r\n");
    }
    Ok(payload)
}

/// Block until `pipe` has data or `wait` elapses. `tick` runs whenever no
/// activity arrives within a poll interval so retransmission timers advance.
fn wait_for_reply(
    activity: &Receiver<Activity>,
    pipe: &dyn ModemPipe,
    wait: Duration,
    mut tick: impl FnMut(),
) -> CliResult<Vec<u8>> {
    let deadline = Instant::now() + wait;
    loop {
        let data = drain(pipe)?;
        if !data.is_empty() {
            return Ok(data);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CliError::new(
                TIMEOUT,
                format!("no reply within {}ms", wait.as_millis()),
            ));
        }
        match activity.recv_timeout(remaining.min(POLL)) {
            Ok(Activity::Pipe(_, PipeEvent::Closed)) => {
                return Err(CliError::new(
                    crate::exit::TRANSPORT_ERROR,
                    "channel closed before a reply arrived",
                ));
            }
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => tick(),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(CliError::new(
                    crate::exit::TRANSPORT_ERROR,
                    "channel released before a reply arrived",
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmux_transport::{MockPipe, MockPipeConfig};
    use std::path::PathBuf;

    fn args() -> SendArgs {
        SendArgs {
            path: PathBuf::from("/tmp/cmux.sock"),
            dlci: 1,
            data: None,
            file: None,
            hex: None,
            crlf: false,
            wait: false,
            wait_timeout: "5s".to_string(),
            timeout: "2s".to_string(),
        }
    }

    #[test]
    fn payload_from_data_with_crlf() {
        let args = SendArgs {
            data: Some("AT".to_string()),
            crlf: true,
            ..args()
        };
        assert_eq!(resolve_payload(&args).expect("payload should resolve"), b"AT\r\n");
    }

    #[test]
    fn payload_from_hex() {
        let args = SendArgs {
            hex: Some("41 54".to_string()),
            ..args()
        };
        assert_eq!(resolve_payload(&args).expect("payload should resolve"), b"AT");
    }

    #[test]
    fn missing_file_is_reported() {
        let args = SendArgs {
            file: Some(PathBuf::from("/nonexistent/cmux-payload.bin")),
            ..args()
        };
        let err = resolve_payload(&args).expect_err("missing file should fail");
        assert_eq!(err.code, crate::exit::TRANSPORT_ERROR);
    }

    #[test]
    fn wait_for_reply_returns_buffered_data() {
        let pipe = MockPipe::new(MockPipeConfig::default());
        pipe.open(Duration::from_millis(10)).expect("mock should open");
        let (tx, rx) = mpsc::channel();
        pipe.put(b"\r\nOK\r\n");
        tx.send(Activity::Pipe(1, PipeEvent::ReceiveReady))
            .expect("channel should accept");

        let reply = wait_for_reply(&rx, pipe.as_ref(), Duration::from_secs(1), || {})
            .expect("reply should arrive");
        assert_eq!(reply, b"\r\nOK\r\n");
    }

    #[test]
    fn wait_for_reply_times_out_and_ticks() {
        let pipe = MockPipe::new(MockPipeConfig::default());
        pipe.open(Duration::from_millis(10)).expect("mock should open");
        let (_tx, rx) = mpsc::channel();
        let mut ticks = 0;

        let err = wait_for_reply(&rx, pipe.as_ref(), Duration::from_millis(120), || ticks += 1)
            .expect_err("wait should time out");
        assert_eq!(err.code, TIMEOUT);
        assert!(ticks >= 1);
    }

    #[test]
    fn wait_for_reply_stops_when_channel_closes() {
        let pipe = MockPipe::new(MockPipeConfig::default());
        pipe.open(Duration::from_millis(10)).expect("mock should open");
        let (tx, rx) = mpsc::channel();
        tx.send(Activity::Pipe(1, PipeEvent::Closed))
            .expect("channel should accept");

        let err = wait_for_reply(&rx, pipe.as_ref(), Duration::from_secs(1), || {})
            .expect_err("closed channel should fail");
        assert_eq!(err.code, crate::exit::TRANSPORT_ERROR);
    }
}
