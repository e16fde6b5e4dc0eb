//! DTE and DCE multiplexers talking over a Unix domain socket.
//!
//! The DCE thread accepts the socket, registers DLCIs 1 and 2 and answers
//! every AT command with `OK`. The main thread plays the DTE: it brings the
//! link up, opens both channels and sends a command on DLCI 1.
//!
//! Run with:
//!   cargo run --example dte-dce

use std::fs;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cmux::mux::{Cmux, CmuxConfig, CmuxEvent, DlciConfig, ModemPipe, PipeEvent, TransmitMode};
use cmux::transport::UnixDomainSocket;

const TIMEOUT: Duration = Duration::from_secs(2);

enum Event {
    Link(CmuxEvent),
    At(PipeEvent),
}

fn read_available(pipe: &dyn ModemPipe) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        let n = pipe.receive(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

fn run_dce(listener: UnixDomainSocket) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let uart = Arc::new(listener.accept()?);
    uart.open(TIMEOUT)?;

    let (tx, rx) = mpsc::channel();
    let link_tx = tx.clone();
    let cmux = Cmux::new(CmuxConfig::default().with_callback(move |event| {
        let _ = link_tx.send(Event::Link(event));
    }))?;
    let at = cmux.dlci_init(
        DlciConfig::new(1).with_transmit_mode(TransmitMode::Blocking(TIMEOUT)),
    )?;
    let _data = cmux.dlci_init(DlciConfig::new(2))?;
    at.attach(Arc::new(move |event| {
        let _ = tx.send(Event::At(event));
    }));
    cmux.attach(uart)?;

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Event::At(PipeEvent::ReceiveReady)) => {
                let mut buf = [0u8; 256];
                let n = at.receive(&mut buf)?;
                if n > 0 {
                    eprintln!("dce <- {:?}", String::from_utf8_lossy(&buf[..n]));
                    at.transmit(b"\r\nOK\r\n")?;
                }
            }
            Ok(Event::Link(CmuxEvent::Disconnected)) => break,
            Ok(_) => {}
            Err(mpsc::RecvTimeoutError::Timeout) => cmux.pump(),
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    eprintln!("dce: link down");
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("cmux-dte-dce-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("modem.sock");
    let _ = fs::remove_file(&sock_path);

    let listener = UnixDomainSocket::bind(&sock_path)?;
    let dce = thread::Builder::new()
        .name("dce".to_string())
        .spawn(move || run_dce(listener).map_err(|err| err.to_string()))?;

    let uart = Arc::new(UnixDomainSocket::connect(&sock_path)?);
    uart.open(TIMEOUT)?;

    let cmux = Cmux::new(CmuxConfig::default().with_callback(|event| {
        eprintln!("dte: {event:?}");
    }))?;
    let at = cmux.dlci_init(DlciConfig::new(1))?;
    let data = cmux.dlci_init(DlciConfig::new(2))?;
    cmux.attach(uart)?;

    cmux.connect(TIMEOUT)?;
    at.open(TIMEOUT)?;
    data.open(TIMEOUT)?;
    eprintln!("dte: DLCI 1 {:?}, DLCI 2 {:?}", at.state(), data.state());

    at.transmit(b"AT+CGDCONT=1,\"IP\",\"trackunit.m2m\"\r\n")?;
    let mut reply = Vec::new();
    for _ in 0..20 {
        thread::sleep(Duration::from_millis(50));
        reply.extend(read_available(&at)?);
        if reply.ends_with(b"OK\r\n") {
            break;
        }
    }
    eprintln!("dte <- {:?}", String::from_utf8_lossy(&reply));

    data.close(TIMEOUT)?;
    at.close(TIMEOUT)?;
    cmux.disconnect(TIMEOUT)?;
    eprintln!("dte: {:?}", cmux.stats());

    match dce.join() {
        Ok(result) => result?,
        Err(_) => eprintln!("dce thread panicked"),
    }
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
