//! An AT command exchange on one DLCI, with both ends in memory.
//!
//! Two bridged mock UARTs stand in for the serial line. Shows that code
//! written against [`ModemPipe`] (here a tiny line-based AT responder) runs
//! unchanged on a multiplexed channel, and how flow control surfaces as
//! `TransmitIdle` once the transport drains.
//!
//! Run with:
//!   cargo run --example at-channel

use std::sync::{Arc, Mutex};
use std::time::Duration;

use cmux::mux::{Cmux, CmuxConfig, DlciConfig, DlciPipe, ModemPipe, PipeEvent};
use cmux::transport::{MockPipe, MockPipeConfig};

const AT: u8 = 2;
const TIMEOUT: Duration = Duration::from_secs(1);

/// Answers each complete line received on `pipe`.
fn respond(pipe: &DlciPipe, pending: &Mutex<Vec<u8>>) {
    let mut buf = [0u8; 128];
    let mut pending = pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    while let Ok(n) = pipe.receive(&mut buf) {
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);
    }
    while let Some(end) = pending.windows(2).position(|w| w == b"\r\n") {
        let line: Vec<u8> = pending.drain(..end + 2).collect();
        let line = String::from_utf8_lossy(&line[..end]).into_owned();
        if line.is_empty() {
            continue;
        }
        let reply: &[u8] = if line.starts_with("AT") {
            b"\r\nOK\r\n"
        } else {
            b"\r\nERROR\r\n"
        };
        println!("dce: {line:?}");
        let _ = pipe.transmit(reply);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dte_uart = MockPipe::new(MockPipeConfig::default());
    let dce_uart = MockPipe::new(MockPipeConfig::default());
    MockPipe::bridge(&dte_uart, &dce_uart);
    dte_uart.open(TIMEOUT)?;
    dce_uart.open(TIMEOUT)?;

    let dce = Cmux::new(CmuxConfig::default())?;
    let dce_at = dce.dlci_init(DlciConfig::new(AT))?;
    let pending = Arc::new(Mutex::new(Vec::new()));
    {
        let pipe = dce_at.clone();
        let pending = Arc::clone(&pending);
        dce_at.attach(Arc::new(move |event| {
            if event == PipeEvent::ReceiveReady {
                respond(&pipe, &pending);
            }
        }));
    }
    dce.attach(dce_uart)?;

    let dte = Cmux::new(CmuxConfig::default())?;
    let dte_at = dte.dlci_init(DlciConfig::new(AT))?;
    dte_at.attach(Arc::new(|event| println!("dte: DLCI {AT} {event:?}")));
    dte.attach(dte_uart.clone())?;

    dte.connect(TIMEOUT)?;
    dte_at.open(TIMEOUT)?;

    for command in ["AT", "ATI", "+++"] {
        dte_at.transmit(format!("{command}\r\n").as_bytes())?;
        let mut buf = [0u8; 64];
        let n = dte_at.receive(&mut buf)?;
        println!("dte: {:?}", String::from_utf8_lossy(&buf[..n]));
    }

    // Throttle the line: the multiplexer holds frames until the UART drains.
    dte_uart.set_transmit_limit(Some(0));
    let queued = dte_at.transmit(b"AT+CSQ\r\n")?;
    println!("dte: queued {queued} bytes while the line is stalled");
    dte_uart.set_transmit_limit(None);
    dte_uart.signal_transmit_idle();

    dte_at.close(TIMEOUT)?;
    dte.disconnect(TIMEOUT)?;
    println!("dte: {:?}", dte.stats());
    Ok(())
}
