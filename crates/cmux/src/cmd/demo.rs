//! Two multiplexers wired back to back through bridged in-memory pipes: the
//! DTE connects, opens an AT channel and a data channel, sends one command,
//! and the DCE answers `OK`.

use std::sync::Arc;
use std::time::Duration;

use cmux_mux::{Cmux, CmuxConfig, DlciConfig, DlciPipe, ModemPipe, TransmitMode};
use cmux_transport::{MockPipe, MockPipeConfig};

use crate::cmd::channel::{drain, link_event_name, pipe_event_name, write_all};
use crate::cmd::DemoArgs;
use crate::exit::{cmux_error, transport_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_data, print_event, OutputFormat};

const TIMEOUT: Duration = Duration::from_secs(1);
const AT_DLCI: u8 = 1;
const DATA_DLCI: u8 = 2;

struct Side {
    cmux: Cmux,
    at: DlciPipe,
    data: DlciPipe,
}

fn side(name: &'static str, wire: Arc<MockPipe>, format: OutputFormat) -> CliResult<Side> {
    wire.open(TIMEOUT)
        .map_err(|err| transport_error("mock open failed", err))?;
    let cmux = Cmux::new(CmuxConfig::default().with_callback(move |event| {
        print_event(name, link_event_name(event), None, format);
    }))
    .map_err(|err| cmux_error("invalid configuration", err))?;

    let register = |address: u8| -> CliResult<DlciPipe> {
        let pipe = cmux
            .dlci_init(
                DlciConfig::new(address).with_transmit_mode(TransmitMode::Blocking(TIMEOUT)),
            )
            .map_err(|err| cmux_error("DLCI registration failed", err))?;
        pipe.attach(Arc::new(move |event| {
            print_event(name, pipe_event_name(event), Some(address), format);
        }));
        Ok(pipe)
    };
    let at = register(AT_DLCI)?;
    let data = register(DATA_DLCI)?;

    cmux.attach(wire)
        .map_err(|err| cmux_error("attach failed", err))?;
    Ok(Side { cmux, at, data })
}

pub fn run(args: DemoArgs, format: OutputFormat) -> CliResult<i32> {
    let dte_wire = MockPipe::new(MockPipeConfig::default());
    let dce_wire = MockPipe::new(MockPipeConfig::default());
    MockPipe::bridge(&dte_wire, &dce_wire);

    let dce = side("dce", dce_wire, format)?;
    let dte = side("dte", dte_wire, format)?;

    dte.cmux
        .connect(TIMEOUT)
        .map_err(|err| cmux_error("connect failed", err))?;
    for pipe in [&dte.at, &dte.data] {
        pipe.open(TIMEOUT)
            .map_err(|err| transport_error("open DLCI failed", err))?;
    }

    let mut command = args.command.into_bytes();
    command.extend_from_slice(b"\r\n");
    write_all(&dte.at, &command)?;

    let received = drain(&dce.at)?;
    if received.is_empty() {
        return Err(CliError::new(FAILURE, "DCE received nothing on the AT channel"));
    }
    print_data(AT_DLCI, &received, format);

    write_all(&dce.at, b"\r\nOK\r\n")?;
    let reply = drain(&dte.at)?;
    if reply.is_empty() {
        return Err(CliError::new(FAILURE, "DTE received no reply"));
    }
    print_data(AT_DLCI, &reply, format);

    for pipe in [&dte.at, &dte.data] {
        pipe.close(TIMEOUT)
            .map_err(|err| transport_error("close DLCI failed", err))?;
    }
    dte.cmux
        .disconnect(TIMEOUT)
        .map_err(|err| cmux_error("disconnect failed", err))?;
    dte.cmux.release();
    dce.cmux.release();

    Ok(SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_completes() {
        let args = DemoArgs {
            command: "AT".to_string(),
        };
        let code = run(args, OutputFormat::Raw).expect("demo should run");
        assert_eq!(code, SUCCESS);
    }
}
