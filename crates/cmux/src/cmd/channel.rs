//! Helpers shared by the commands that drive a DLCI pipe.

use cmux_mux::{CmuxEvent, ModemPipe, PipeEvent};

use crate::exit::{transport_error, CliResult};

/// What the callbacks report to a command's main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Link(CmuxEvent),
    Pipe(u8, PipeEvent),
}

/// Read everything currently buffered on `pipe`.
pub fn drain(pipe: &dyn ModemPipe) -> CliResult<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = pipe
            .receive(&mut buf)
            .map_err(|err| transport_error("receive failed", err))?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Transmit all of `data`; the pipe's transmit mode decides how long each
/// call may wait for space.
pub fn write_all(pipe: &dyn ModemPipe, data: &[u8]) -> CliResult<()> {
    let mut offset = 0;
    while offset < data.len() {
        offset += pipe
            .transmit(&data[offset..])
            .map_err(|err| transport_error("transmit failed", err))?;
    }
    Ok(())
}

pub fn link_event_name(event: CmuxEvent) -> &'static str {
    match event {
        CmuxEvent::Connected => "connected",
        CmuxEvent::Disconnected => "disconnected",
        CmuxEvent::ConnectFailed => "connect_failed",
    }
}

pub fn pipe_event_name(event: PipeEvent) -> &'static str {
    match event {
        PipeEvent::Opened => "opened",
        PipeEvent::Closed => "closed",
        PipeEvent::ReceiveReady => "receive_ready",
        PipeEvent::TransmitIdle => "transmit_idle",
    }
}
