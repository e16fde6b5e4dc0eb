//! Protocol state of one multiplexer instance.
//!
//! Everything here runs under the instance lock. Handlers never call the
//! transport or user callbacks directly: frames are queued for the pump and
//! notifications are collected in [`Effects`] and fired after unlocking.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use cmux_frame::{
    decode_control, encode_frame, ControlMessage, ControlType, Frame, FrameDecoder, FrameError,
    FrameType, ModemStatus, CONTROL_DLCI,
};
use cmux_transport::{CallbackSlot, ModemPipe, PipeEvent, TransportError};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::completion::{complete_all, Completion};
use crate::config::{CmuxConfig, CmuxEvent, DlciConfig};
use crate::dlci::{Dlci, DlciState};
use crate::error::{CmuxError, Result};

/// State of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl LinkState {
    /// Whether a new connect may start from this state.
    pub fn is_down(self) -> bool {
        matches!(self, LinkState::Idle | LinkState::Disconnected)
    }
}

/// Counters reported by [`crate::Cmux::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CmuxStats {
    pub frames_received: u64,
    pub frames_transmitted: u64,
    pub checksum_errors: u64,
    pub decode_errors: u64,
    /// Bytes discarded by the frame decoder (noise, overflow).
    pub dropped_bytes: u64,
    /// Payload bytes dropped because a DLCI receive buffer was full.
    pub rx_overruns: u64,
}

pub(crate) enum Notification {
    Link(CmuxEvent),
    Pipe(Arc<CallbackSlot>, PipeEvent),
}

/// Side effects collected under the lock.
#[derive(Default)]
pub(crate) struct Effects {
    pub notifications: Vec<Notification>,
    /// Transmit space was released or a DLCI changed state.
    pub tx_space: bool,
}

impl Effects {
    fn link(&mut self, event: CmuxEvent) {
        self.notifications.push(Notification::Link(event));
    }

    fn pipe(&mut self, dlci: &Dlci, event: PipeEvent) {
        self.notifications
            .push(Notification::Pipe(Arc::clone(&dlci.callback), event));
    }
}

struct Outstanding {
    kind: ControlType,
    value: Bytes,
    deadline: Instant,
}

pub(crate) struct MuxState {
    pub config: CmuxConfig,
    pub link: LinkState,
    /// This side sent SABM on DLCI 0.
    pub initiator: bool,
    pub transport: Option<Arc<dyn ModemPipe>>,
    pub decoder: FrameDecoder,
    pub dlcis: Vec<Dlci>,
    /// Encoded bytes handed to the transport next.
    pub tx_buf: BytesMut,
    /// Bumped whenever transmit space is released.
    pub tx_generation: u64,
    pub connect_waiters: Vec<Arc<Completion>>,
    pub disconnect_waiters: Vec<Arc<Completion>>,
    control_queue: VecDeque<Bytes>,
    control_bytes: usize,
    rr_cursor: usize,
    link_timer: Option<Instant>,
    retries_left: u32,
    outstanding: Vec<Outstanding>,
    flow_stopped: bool,
    checksum_run: u32,
    frames_transmitted: u64,
    rx_overruns: u64,
}

impl MuxState {
    pub fn new(config: CmuxConfig) -> Self {
        let decoder = FrameDecoder::new(config.frame.clone(), config.receive_buf_size);
        Self {
            link: LinkState::Idle,
            initiator: false,
            transport: None,
            decoder,
            dlcis: Vec::with_capacity(config.max_dlcis),
            tx_buf: BytesMut::with_capacity(config.transmit_buf_size),
            tx_generation: 0,
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            control_queue: VecDeque::new(),
            control_bytes: 0,
            rr_cursor: 0,
            link_timer: None,
            retries_left: 0,
            outstanding: Vec::new(),
            flow_stopped: false,
            checksum_run: 0,
            frames_transmitted: 0,
            rx_overruns: 0,
            config,
        }
    }

    pub fn stats(&self) -> CmuxStats {
        let decoder = self.decoder.stats();
        CmuxStats {
            frames_received: decoder.frames,
            frames_transmitted: self.frames_transmitted,
            checksum_errors: decoder.checksum_errors,
            decode_errors: decoder.decode_errors,
            dropped_bytes: decoder.dropped_bytes,
            rx_overruns: self.rx_overruns,
        }
    }

    pub fn find(&self, address: u8) -> Option<usize> {
        self.dlcis.iter().position(|dlci| dlci.address == address)
    }

    pub fn dlci_index(&self, address: u8) -> Result<usize> {
        self.find(address).ok_or(CmuxError::InvalidDlci(address))
    }

    pub fn register(&mut self, config: &DlciConfig) -> Result<()> {
        config.validate()?;
        if self.find(config.address).is_some() {
            return Err(CmuxError::DlciInUse(config.address));
        }
        if self.dlcis.len() >= self.config.max_dlcis {
            return Err(CmuxError::DlciTableFull(self.config.max_dlcis));
        }
        self.dlcis.push(Dlci::new(config));
        debug!(dlci = config.address, "DLCI registered");
        Ok(())
    }

    /// Earliest armed timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.dlcis
            .iter()
            .filter_map(|dlci| dlci.timer)
            .chain(self.link_timer)
            .chain(self.outstanding.iter().map(|o| o.deadline))
            .min()
    }

    /// Reset buffers when a transport is (re)attached.
    pub fn reset_buffers(&mut self) {
        self.decoder.clear();
        self.control_queue.clear();
        self.control_bytes = 0;
        self.tx_buf.clear();
    }

    // ---- outbound ----

    /// C/R bit for a frame this side sends.
    fn cr(&self, command: bool) -> bool {
        command == self.initiator
    }

    fn encode(&self, frame: &Frame) -> std::result::Result<Bytes, FrameError> {
        let mut buf = BytesMut::new();
        encode_frame(frame, &self.config.frame, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Queue a handshake frame (SABM, UA, DM, DISC).
    fn send_control_frame(&mut self, frame: Frame) {
        self.queue_control(frame, false);
    }

    /// Encode and queue a frame ahead of data. A `bounded` frame is dropped
    /// when it does not fit the transmit budget; returns whether it was queued.
    fn queue_control(&mut self, frame: Frame, bounded: bool) -> bool {
        let command = frame.frame_type.is_command().unwrap_or(true);
        let frame = frame.with_cr(self.cr(command));
        let bytes = match self.encode(&frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(dlci = frame.dlci, error = %err, "failed to encode control frame");
                return false;
            }
        };
        if bounded && self.tx_used() + bytes.len() > self.config.transmit_buf_size {
            warn!(
                dlci = frame.dlci,
                queued = self.control_bytes,
                "transmit buffer full, dropping control message"
            );
            return false;
        }
        debug!(
            dlci = frame.dlci,
            frame = frame.frame_type.name(),
            cr = frame.cr,
            "queue control frame"
        );
        self.push_control(bytes);
        true
    }

    fn send_message(&mut self, message: ControlMessage) {
        let payload = match message.to_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(kind = message.kind.name(), error = %err, "failed to encode control message");
                return;
            }
        };
        debug!(
            kind = message.kind.name(),
            command = message.command,
            "queue control message"
        );
        if self.queue_control(Frame::uih(CONTROL_DLCI, payload), true) && message.command {
            self.outstanding.push(Outstanding {
                kind: message.kind,
                value: message.value,
                deadline: Instant::now() + self.config.response_timeout,
            });
        }
    }

    /// Bytes counted against `transmit_buf_size`.
    fn tx_used(&self) -> usize {
        self.tx_buf.len()
            + self.control_bytes
            + self.dlcis.iter().map(Dlci::tx_bytes).sum::<usize>()
    }

    fn push_control(&mut self, frame: Bytes) {
        self.control_bytes += frame.len();
        self.control_queue.push_back(frame);
    }

    /// Queue as much of `data` as the transmit budget allows.
    pub fn transmit(&mut self, idx: usize, data: &[u8]) -> Result<usize> {
        let address = self.dlcis[idx].address;
        if self.dlcis[idx].state != DlciState::Open {
            return Err(CmuxError::NotOpen(address));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let cr = self.cr(true);
        let max = self.config.frame.max_payload();
        let mut accepted = 0;
        for chunk in data.chunks(max) {
            let frame = Frame::uih(address, Bytes::copy_from_slice(chunk)).with_cr(cr);
            let bytes = self.encode(&frame)?;
            if self.tx_used() + bytes.len() > self.config.transmit_buf_size {
                break;
            }
            self.dlcis[idx].push_tx(bytes);
            accepted += chunk.len();
        }

        trace!(dlci = address, offered = data.len(), accepted, "transmit queued");
        if accepted < data.len() {
            self.dlcis[idx].tx_blocked = true;
        }
        if accepted == 0 {
            return Err(CmuxError::WouldBlock);
        }
        Ok(accepted)
    }

    /// Refill the transmit buffer once the transport has taken all of it:
    /// control frames first, then one data frame per DLCI, starting after
    /// the DLCI that sent last.
    pub fn fill_tx_buf(&mut self) {
        if !self.tx_buf.is_empty() {
            return;
        }

        let cap = self.config.transmit_buf_size;
        while let Some(len) = self.control_queue.front().map(Bytes::len) {
            if !self.tx_buf.is_empty() && self.tx_buf.len() + len > cap {
                return;
            }
            if let Some(frame) = self.control_queue.pop_front() {
                self.control_bytes -= frame.len();
                self.tx_buf.extend_from_slice(&frame);
                self.frames_transmitted += 1;
            }
        }

        if self.flow_stopped || self.dlcis.is_empty() {
            return;
        }

        let n = self.dlcis.len();
        let start = self.rr_cursor % n;
        for step in 0..n {
            let idx = (start + step) % n;
            let dlci = &mut self.dlcis[idx];
            if !dlci.can_send() {
                continue;
            }
            let len = dlci.peek_tx_len().unwrap_or(0);
            if !self.tx_buf.is_empty() && self.tx_buf.len() + len > cap {
                break;
            }
            if let Some(frame) = dlci.pop_tx() {
                self.tx_buf.extend_from_slice(&frame);
                self.frames_transmitted += 1;
                self.rr_cursor = idx + 1;
            }
        }
    }

    /// Account for bytes the transport accepted.
    pub fn consume_tx(&mut self, n: usize, fx: &mut Effects) {
        let _ = self.tx_buf.split_to(n);
        self.tx_generation += 1;
        fx.tx_space = true;
        for dlci in &mut self.dlcis {
            if dlci.tx_blocked && dlci.state == DlciState::Open {
                dlci.tx_blocked = false;
                fx.pipe(dlci, PipeEvent::TransmitIdle);
            }
        }
    }

    // ---- control channel requests ----

    pub fn connect(&mut self, waiter: Option<Arc<Completion>>) -> Result<()> {
        match self.link {
            LinkState::Connected => {
                if let Some(waiter) = waiter {
                    waiter.complete(Ok(()));
                }
                return Ok(());
            }
            LinkState::Connecting => {}
            LinkState::Disconnecting => {
                return Err(CmuxError::InvalidState("disconnect in progress"))
            }
            LinkState::Idle | LinkState::Disconnected => {
                let transport = self.transport.as_ref().ok_or(CmuxError::NotAttached)?;
                if !transport.is_open() {
                    return Err(TransportError::NotOpen.into());
                }
                info!("connecting multiplexer");
                self.initiator = true;
                self.link = LinkState::Connecting;
                self.retries_left = self.config.connect_retries;
                self.link_timer = Some(Instant::now() + self.config.response_timeout);
                self.send_control_frame(Frame::sabm(CONTROL_DLCI));
            }
        }
        self.connect_waiters.extend(waiter);
        Ok(())
    }

    pub fn disconnect(&mut self, waiter: Option<Arc<Completion>>) -> Result<()> {
        match self.link {
            LinkState::Idle | LinkState::Disconnected => {
                if let Some(waiter) = waiter {
                    waiter.complete(Ok(()));
                }
                return Ok(());
            }
            LinkState::Disconnecting => {}
            LinkState::Connecting => return Err(CmuxError::InvalidState("connect in progress")),
            LinkState::Connected => self.begin_disconnect(),
        }
        self.disconnect_waiters.extend(waiter);
        Ok(())
    }

    fn begin_disconnect(&mut self) {
        info!("disconnecting multiplexer");
        self.link = LinkState::Disconnecting;
        self.link_timer = Some(Instant::now() + self.config.disconnect_timeout);
        self.send_control_frame(Frame::disc(CONTROL_DLCI));
    }

    /// A blocking connect gave up waiting.
    pub fn abort_connect(&mut self, fx: &mut Effects) {
        if self.link == LinkState::Connecting {
            self.fail_connect(fx, || CmuxError::ConnectTimeout);
        }
    }

    /// A blocking disconnect gave up waiting.
    pub fn abort_disconnect(&mut self, fx: &mut Effects) {
        if self.link == LinkState::Disconnecting {
            complete_all(&mut self.disconnect_waiters, || {
                Err(CmuxError::DisconnectTimeout)
            });
            self.finish_disconnect(fx);
        }
    }

    fn connected(&mut self, fx: &mut Effects) {
        info!(initiator = self.initiator, "multiplexer connected");
        self.link = LinkState::Connected;
        self.link_timer = None;
        self.flow_stopped = false;
        self.checksum_run = 0;
        complete_all(&mut self.connect_waiters, || Ok(()));
        fx.link(CmuxEvent::Connected);
    }

    fn fail_connect(&mut self, fx: &mut Effects, err: impl Fn() -> CmuxError) {
        warn!(error = %err(), "multiplexer connect failed");
        self.link = LinkState::Disconnected;
        self.link_timer = None;
        complete_all(&mut self.connect_waiters, || Err(err()));
        fx.link(CmuxEvent::ConnectFailed);
    }

    fn finish_disconnect(&mut self, fx: &mut Effects) {
        info!("multiplexer disconnected");
        self.link = LinkState::Disconnected;
        self.link_timer = None;
        self.outstanding.clear();
        self.flow_stopped = false;
        for idx in 0..self.dlcis.len() {
            self.force_close(idx, fx, || CmuxError::NotConnected);
        }
        complete_all(&mut self.disconnect_waiters, || Ok(()));
        fx.link(CmuxEvent::Disconnected);
    }

    /// The transport went away or the instance was released: everything
    /// drops to Closed/Disconnected and pending requests fail with `err`.
    pub fn teardown(&mut self, fx: &mut Effects, err: impl Fn() -> CmuxError + Copy) {
        self.reset_buffers();
        self.outstanding.clear();
        self.link_timer = None;
        self.flow_stopped = false;
        for idx in 0..self.dlcis.len() {
            self.force_close(idx, fx, err);
        }

        match self.link {
            LinkState::Idle | LinkState::Disconnected => {}
            LinkState::Connecting => {
                warn!(error = %err(), "transport lost while connecting");
                self.link = LinkState::Disconnected;
                complete_all(&mut self.connect_waiters, || Err(err()));
                fx.link(CmuxEvent::ConnectFailed);
            }
            LinkState::Connected | LinkState::Disconnecting => {
                warn!(error = %err(), "transport lost, multiplexer disconnected");
                self.link = LinkState::Disconnected;
                complete_all(&mut self.disconnect_waiters, || Ok(()));
                fx.link(CmuxEvent::Disconnected);
            }
        }
        fx.tx_space = true;
        self.tx_generation += 1;
    }

    // ---- DLCI requests ----

    pub fn open_dlci(&mut self, idx: usize, waiter: Option<Arc<Completion>>) -> Result<()> {
        if self.link != LinkState::Connected {
            return Err(CmuxError::NotConnected);
        }
        let address = self.dlcis[idx].address;
        let state = self.dlcis[idx].state;
        match state {
            DlciState::Open => {
                if let Some(waiter) = waiter {
                    waiter.complete(Ok(()));
                }
                return Ok(());
            }
            DlciState::Opening => {}
            DlciState::Closing => return Err(CmuxError::InvalidState("close in progress")),
            DlciState::Closed => {
                debug!(dlci = address, "opening DLCI");
                let dlci = &mut self.dlcis[idx];
                dlci.state = DlciState::Opening;
                dlci.timer = Some(Instant::now() + self.config.dlci_open_timeout);
                dlci.flush_rx();
                self.send_control_frame(Frame::sabm(address));
            }
        }
        self.dlcis[idx].open_waiters.extend(waiter);
        Ok(())
    }

    pub fn close_dlci(&mut self, idx: usize, waiter: Option<Arc<Completion>>) -> Result<()> {
        let address = self.dlcis[idx].address;
        let state = self.dlcis[idx].state;
        match state {
            DlciState::Closed => {
                if let Some(waiter) = waiter {
                    waiter.complete(Ok(()));
                }
                return Ok(());
            }
            _ if self.link != LinkState::Connected => return Err(CmuxError::NotConnected),
            DlciState::Closing => {}
            DlciState::Opening => return Err(CmuxError::InvalidState("open in progress")),
            DlciState::Open => {
                debug!(dlci = address, "closing DLCI");
                let dlci = &mut self.dlcis[idx];
                dlci.state = DlciState::Closing;
                dlci.timer = Some(Instant::now() + self.config.dlci_close_timeout);
                dlci.flush_rx();
                // Data queued before the close still goes out ahead of DISC.
                let queued: Vec<Bytes> = std::iter::from_fn(|| dlci.pop_tx()).collect();
                for frame in queued {
                    self.push_control(frame);
                }
                self.send_control_frame(Frame::disc(address));
            }
        }
        self.dlcis[idx].close_waiters.extend(waiter);
        Ok(())
    }

    pub fn abort_open(&mut self, idx: usize, fx: &mut Effects) {
        if self.dlcis[idx].state == DlciState::Opening {
            let address = self.dlcis[idx].address;
            self.force_close(idx, fx, move || CmuxError::OpenTimeout(address));
        }
    }

    pub fn abort_close(&mut self, idx: usize, fx: &mut Effects) {
        if self.dlcis[idx].state == DlciState::Closing {
            let address = self.dlcis[idx].address;
            complete_all(&mut self.dlcis[idx].close_waiters, || {
                Err(CmuxError::CloseTimeout(address))
            });
            self.force_close(idx, fx, || CmuxError::NotConnected);
        }
    }

    fn become_open(&mut self, idx: usize, fx: &mut Effects, initiated: bool) {
        let dlci = &mut self.dlcis[idx];
        let address = dlci.address;
        info!(dlci = address, "DLCI open");
        dlci.state = DlciState::Open;
        dlci.timer = None;
        dlci.remote_fc = false;
        dlci.flush_rx();
        complete_all(&mut dlci.open_waiters, || Ok(()));
        fx.pipe(dlci, PipeEvent::Opened);

        if initiated {
            let status = ModemStatus::ready(address);
            self.send_message(ControlMessage::command(
                ControlType::Msc,
                status.to_value().to_vec(),
            ));
        }
    }

    /// Drop a DLCI to Closed. Pending opens fail with `open_err`, pending
    /// closes succeed.
    fn force_close(&mut self, idx: usize, fx: &mut Effects, open_err: impl Fn() -> CmuxError) {
        let dlci = &mut self.dlcis[idx];
        if dlci.state == DlciState::Closed {
            return;
        }
        info!(dlci = dlci.address, from = ?dlci.state, "DLCI closed");
        dlci.state = DlciState::Closed;
        dlci.timer = None;
        dlci.remote_fc = false;
        dlci.tx_blocked = false;
        dlci.flush_rx();
        dlci.clear_tx();
        complete_all(&mut dlci.open_waiters, || Err(open_err()));
        complete_all(&mut dlci.close_waiters, || Ok(()));
        fx.pipe(dlci, PipeEvent::Closed);
        fx.tx_space = true;
        self.tx_generation += 1;
    }

    // ---- inbound ----

    /// Feed received bytes through the decoder and dispatch every complete
    /// frame. DLCIs that received data are appended to `ready`.
    pub fn ingest(&mut self, data: &[u8], fx: &mut Effects, ready: &mut Vec<usize>) {
        if let Err(err) = self.decoder.push(data) {
            warn!(error = %err, "receive re-assembly overflow");
        }

        while let Some(result) = self.decoder.next_frame() {
            match result {
                Ok(frame) => {
                    self.checksum_run = 0;
                    self.handle_frame(frame, fx, ready);
                }
                Err(FrameError::Checksum { received }) => {
                    warn!(fcs = received, "dropping frame with bad checksum");
                    self.checksum_run += 1;
                    self.check_error_budget();
                }
                Err(err) => debug!(error = %err, "dropping undecodable frame"),
            }
        }
    }

    fn check_error_budget(&mut self) {
        let Some(budget) = self.config.checksum_error_budget else {
            return;
        };
        if self.link == LinkState::Connected && self.checksum_run >= budget {
            warn!(
                errors = self.checksum_run,
                budget, "checksum error budget exhausted, dropping link"
            );
            self.checksum_run = 0;
            self.begin_disconnect();
        }
    }

    /// Queue one `ReceiveReady` per DLCI that got data in this batch.
    pub fn notify_ready(&self, ready: &mut Vec<usize>, fx: &mut Effects) {
        ready.sort_unstable();
        ready.dedup();
        for idx in ready.drain(..) {
            let dlci = &self.dlcis[idx];
            if dlci.state == DlciState::Open && dlci.rx_len() > 0 {
                fx.pipe(dlci, PipeEvent::ReceiveReady);
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, fx: &mut Effects, ready: &mut Vec<usize>) {
        trace!(
            dlci = frame.dlci,
            frame = frame.frame_type.name(),
            cr = frame.cr,
            len = frame.payload.len(),
            "received frame"
        );
        if frame.dlci == CONTROL_DLCI {
            self.handle_control_frame(frame, fx);
        } else {
            self.handle_dlci_frame(frame, fx, ready);
        }
    }

    fn handle_control_frame(&mut self, frame: Frame, fx: &mut Effects) {
        match frame.frame_type {
            FrameType::Sabm => match self.link {
                LinkState::Idle | LinkState::Disconnected => {
                    self.initiator = false;
                    self.send_control_frame(Frame::ua(CONTROL_DLCI));
                    self.connected(fx);
                }
                LinkState::Connecting => {
                    self.send_control_frame(Frame::ua(CONTROL_DLCI));
                    self.connected(fx);
                }
                // Our UA got lost; acknowledge again.
                LinkState::Connected => self.send_control_frame(Frame::ua(CONTROL_DLCI)),
                LinkState::Disconnecting => self.send_control_frame(Frame::dm(CONTROL_DLCI)),
            },
            FrameType::Ua => match self.link {
                LinkState::Connecting => self.connected(fx),
                LinkState::Disconnecting => self.finish_disconnect(fx),
                state => debug!(?state, "ignoring unsolicited UA on control channel"),
            },
            FrameType::Dm => match self.link {
                LinkState::Connecting => self.fail_connect(fx, || CmuxError::Rejected(CONTROL_DLCI)),
                LinkState::Disconnecting => self.finish_disconnect(fx),
                state => debug!(?state, "ignoring DM on control channel"),
            },
            FrameType::Disc => match self.link {
                LinkState::Connected | LinkState::Disconnecting => {
                    self.send_control_frame(Frame::ua(CONTROL_DLCI));
                    self.finish_disconnect(fx);
                }
                _ => self.send_control_frame(Frame::dm(CONTROL_DLCI)),
            },
            FrameType::Uih | FrameType::Ui => self.handle_control_messages(&frame.payload, fx),
        }
    }

    fn handle_control_messages(&mut self, payload: &Bytes, fx: &mut Effects) {
        let messages = match decode_control(payload) {
            Ok(messages) => messages,
            Err(err) => {
                warn!(error = %err, "dropping malformed control message");
                return;
            }
        };

        for message in messages {
            // Some peers echo the command bit in responses: a command that
            // repeats an outstanding request of ours is taken as its answer.
            // A different value is the peer's own request (e.g. its MSC).
            let pending = self.outstanding.iter().position(|o| {
                o.kind == message.kind && (!message.command || o.value == message.value)
            });
            if !message.command || pending.is_some() {
                if let Some(pos) = pending {
                    self.outstanding.remove(pos);
                }
                self.on_control_response(message, fx);
            } else {
                self.on_control_command(message, fx);
            }
        }
    }

    fn on_control_response(&mut self, message: ControlMessage, fx: &mut Effects) {
        match message.kind {
            ControlType::Cld if self.link == LinkState::Disconnecting => {
                self.finish_disconnect(fx)
            }
            ControlType::Nsc => warn!(
                type_octet = ?message.value.first(),
                "peer does not support control message"
            ),
            kind => debug!(kind = kind.name(), "control response"),
        }
    }

    fn on_control_command(&mut self, message: ControlMessage, fx: &mut Effects) {
        debug!(kind = message.kind.name(), "control command");
        match message.kind {
            ControlType::Cld => {
                self.send_message(message.echo_response());
                if self.link != LinkState::Disconnected {
                    self.finish_disconnect(fx);
                }
            }
            ControlType::Msc => {
                match ModemStatus::from_value(&message.value) {
                    Ok(status) => {
                        if let Some(idx) = self.find(status.dlci) {
                            let dlci = &mut self.dlcis[idx];
                            if dlci.remote_fc != status.fc {
                                debug!(dlci = status.dlci, stop = status.fc, "peer flow control");
                            }
                            dlci.remote_fc = status.fc;
                        }
                    }
                    Err(err) => warn!(error = %err, "malformed MSC"),
                }
                self.send_message(message.echo_response());
            }
            ControlType::FcOff => {
                info!("peer stopped data flow");
                self.flow_stopped = true;
                self.send_message(message.echo_response());
            }
            ControlType::FcOn => {
                info!("peer resumed data flow");
                self.flow_stopped = false;
                self.send_message(message.echo_response());
            }
            ControlType::Nsc => {}
            ControlType::Test
            | ControlType::Psc
            | ControlType::Pn
            | ControlType::Rpn
            | ControlType::Rls
            | ControlType::Snc => self.send_message(message.echo_response()),
            ControlType::Unknown(_) => {
                let octet = message.kind.octet(true);
                warn!(type_octet = octet, "unsupported control command");
                self.send_message(ControlMessage::not_supported(octet));
            }
        }
    }

    fn handle_dlci_frame(&mut self, frame: Frame, fx: &mut Effects, ready: &mut Vec<usize>) {
        let address = frame.dlci;
        let Some(idx) = self.find(address) else {
            match frame.frame_type {
                FrameType::Sabm | FrameType::Disc => {
                    debug!(dlci = address, "refusing unknown DLCI");
                    self.send_control_frame(Frame::dm(address));
                }
                _ => trace!(dlci = address, "dropping frame for unknown DLCI"),
            }
            return;
        };

        let state = self.dlcis[idx].state;
        match frame.frame_type {
            FrameType::Sabm => {
                if self.link != LinkState::Connected || state == DlciState::Closing {
                    self.send_control_frame(Frame::dm(address));
                    return;
                }
                self.send_control_frame(Frame::ua(address));
                if state != DlciState::Open {
                    self.become_open(idx, fx, false);
                }
            }
            FrameType::Ua => match state {
                DlciState::Opening => self.become_open(idx, fx, true),
                DlciState::Closing => self.force_close(idx, fx, || CmuxError::NotConnected),
                _ => debug!(dlci = address, ?state, "ignoring unsolicited UA"),
            },
            FrameType::Dm => match state {
                DlciState::Closed => {}
                DlciState::Opening => {
                    warn!(dlci = address, "peer refused DLCI");
                    self.force_close(idx, fx, move || CmuxError::Rejected(address));
                }
                _ => self.force_close(idx, fx, || CmuxError::NotConnected),
            },
            FrameType::Disc => {
                if state == DlciState::Closed {
                    self.send_control_frame(Frame::dm(address));
                } else {
                    self.send_control_frame(Frame::ua(address));
                    self.force_close(idx, fx, move || CmuxError::Rejected(address));
                }
            }
            FrameType::Uih | FrameType::Ui => {
                if state != DlciState::Open {
                    trace!(dlci = address, ?state, "dropping data for DLCI that is not open");
                    return;
                }
                let dropped = self.dlcis[idx].push_rx(&frame.payload);
                if dropped > 0 {
                    warn!(dlci = address, dropped, "DLCI receive buffer overrun");
                    self.rx_overruns += dropped as u64;
                }
                if dropped < frame.payload.len() {
                    ready.push(idx);
                }
            }
        }
    }

    // ---- timers ----

    pub fn service_timers(&mut self, now: Instant, fx: &mut Effects) {
        if self.link_timer.is_some_and(|deadline| now >= deadline) {
            match self.link {
                LinkState::Connecting if self.retries_left > 0 => {
                    self.retries_left -= 1;
                    debug!(retries_left = self.retries_left, "retransmitting SABM");
                    self.link_timer = Some(now + self.config.response_timeout);
                    self.send_control_frame(Frame::sabm(CONTROL_DLCI));
                }
                LinkState::Connecting => self.fail_connect(fx, || CmuxError::ConnectTimeout),
                LinkState::Disconnecting => {
                    warn!("DISC not acknowledged");
                    self.finish_disconnect(fx);
                }
                _ => self.link_timer = None,
            }
        }

        for idx in 0..self.dlcis.len() {
            let dlci = &self.dlcis[idx];
            if !dlci.timer.is_some_and(|deadline| now >= deadline) {
                continue;
            }
            let (address, state) = (dlci.address, dlci.state);
            match state {
                DlciState::Opening => {
                    warn!(dlci = address, "SABM not acknowledged");
                    self.force_close(idx, fx, move || CmuxError::OpenTimeout(address));
                }
                DlciState::Closing => {
                    warn!(dlci = address, "DISC not acknowledged");
                    self.force_close(idx, fx, || CmuxError::NotConnected);
                }
                _ => self.dlcis[idx].timer = None,
            }
        }

        self.outstanding.retain(|request| {
            if now >= request.deadline {
                warn!(kind = request.kind.name(), "control request not answered");
                false
            } else {
                true
            }
        });
    }
}
