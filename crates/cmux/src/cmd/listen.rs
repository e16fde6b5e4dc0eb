use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cmux_frame::dlci;
use cmux_mux::{
    Cmux, CmuxConfig, CmuxEvent, DlciConfig, DlciPipe, ModemPipe, PipeEvent, TransmitMode,
};
use cmux_transport::UnixDomainSocket;
use tracing::{debug, info};

use crate::cmd::channel::{drain, write_all, Activity};
use crate::cmd::ListenArgs;
use crate::exit::{cmux_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_data, OutputFormat};

/// Longest sleep between timer checks.
const POLL: Duration = Duration::from_millis(100);
/// How long to wait for the peer to hang up once `--count` is reached.
const LINGER: Duration = Duration::from_secs(1);

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    if let Some(bad) = args.dlcis.iter().find(|&&address| !dlci::is_data(address)) {
        return Err(CliError::new(USAGE, format!("invalid DLCI {bad} (1..=63)")));
    }

    let socket =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        let transport = Arc::new(
            socket
                .accept()
                .map_err(|err| transport_error("accept failed", err))?,
        );
        transport
            .open(POLL)
            .map_err(|err| transport_error("open failed", err))?;

        let (tx, rx) = mpsc::channel();
        let link_tx = tx.clone();
        let cmux = Cmux::new(CmuxConfig::default().with_callback(move |event| {
            let _ = link_tx.send(Activity::Link(event));
        }))
        .map_err(|err| cmux_error("invalid configuration", err))?;

        let mut pipes = Vec::with_capacity(args.dlcis.len());
        for &address in &args.dlcis {
            let pipe = cmux
                .dlci_init(
                    DlciConfig::new(address)
                        .with_receive_buf_size(4096)
                        .with_transmit_mode(TransmitMode::Blocking(Duration::from_secs(1))),
                )
                .map_err(|err| cmux_error("DLCI registration failed", err))?;
            let pipe_tx = tx.clone();
            pipe.attach(Arc::new(move |event| {
                let _ = pipe_tx.send(Activity::Pipe(address, event));
            }));
            pipes.push(pipe);
        }
        drop(tx);

        cmux.attach(transport)
            .map_err(|err| cmux_error("attach failed", err))?;
        info!(path = %args.path.display(), "peer connected, waiting for multiplexer");

        let mut linger_until: Option<Instant> = None;
        loop {
            if !running.load(Ordering::SeqCst) {
                cmux.release();
                return Ok(SUCCESS);
            }
            if linger_until.is_some_and(|deadline| Instant::now() >= deadline) {
                cmux.release();
                return Ok(SUCCESS);
            }

            match rx.recv_timeout(poll_interval(&cmux)) {
                Ok(Activity::Pipe(address, PipeEvent::ReceiveReady)) => {
                    let Some(pipe) = pipes.iter().find(|pipe| pipe.address() == address) else {
                        continue;
                    };
                    let data = drain(pipe)?;
                    if data.is_empty() {
                        continue;
                    }
                    print_data(address, &data, format);
                    if args.echo {
                        write_all(pipe, &data)?;
                    }
                    printed = printed.saturating_add(1);
                    if args.count.is_some_and(|count| printed >= count) && linger_until.is_none()
                    {
                        linger_until = Some(Instant::now() + LINGER);
                    }
                }
                Ok(Activity::Link(CmuxEvent::Disconnected)) => {
                    debug!("peer disconnected");
                    if linger_until.is_some() {
                        return Ok(SUCCESS);
                    }
                    break;
                }
                Ok(activity) => debug!(?activity, "activity"),
                Err(RecvTimeoutError::Timeout) => cmux.pump(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        detach_all(&pipes);
        cmux.release();
    }

    Ok(SUCCESS)
}

fn poll_interval(cmux: &Cmux) -> Duration {
    cmux.next_deadline()
        .map(|deadline| deadline.saturating_duration_since(Instant::now()))
        .map_or(POLL, |wait| wait.min(POLL))
        .max(Duration::from_millis(1))
}

fn detach_all(pipes: &[DlciPipe]) {
    for pipe in pipes {
        pipe.release();
    }
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
