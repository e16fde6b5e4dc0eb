use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use cmux_transport::{ModemPipe, PipeEvent, TransportError};
use tracing::{debug, warn};

use crate::completion::Completion;
use crate::config::{CmuxCallback, CmuxConfig, DlciConfig, TransmitMode};
use crate::dlci::DlciState;
use crate::error::{CmuxError, Result};
use crate::link::{CmuxStats, Effects, LinkState, MuxState, Notification};
use crate::pipe::DlciPipe;

const RECEIVE: u32 = 1 << 0;
const TRANSMIT: u32 = 1 << 1;
const TIMERS: u32 = 1 << 2;
const TRANSPORT_CLOSED: u32 = 1 << 3;

/// Smallest sleep of a blocking call between timer checks.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// A CMUX multiplexer instance.
///
/// Owns one transport (attached with [`Cmux::attach`]) and a fixed table of
/// DLCIs, each exposed as a [`DlciPipe`]. The instance has no thread of its
/// own: work runs in the caller of its methods and in the transport's event
/// callback. Owners that only use the `_async` methods should call
/// [`Cmux::pump`] once [`Cmux::next_deadline`] passes so timers fire.
///
/// Blocking methods (`connect`, `disconnect`, pipe `open`/`close`) must not be
/// called from event callbacks.
#[derive(Clone)]
pub struct Cmux {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    state: Mutex<MuxState>,
    tx_space: Condvar,
    pending: AtomicU32,
    pumping: AtomicBool,
    callback: Option<CmuxCallback>,
}

impl Cmux {
    /// Create an instance. Nothing is sent until a transport is attached and
    /// [`Cmux::connect`] is called (or the peer connects).
    pub fn new(config: CmuxConfig) -> Result<Self> {
        config.validate()?;
        let callback = config.callback.clone();
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(MuxState::new(config)),
                tx_space: Condvar::new(),
                pending: AtomicU32::new(0),
                pumping: AtomicBool::new(false),
                callback,
            }),
        })
    }

    /// Attach the transport carrying the multiplexed stream.
    ///
    /// The transport should already be open. Replacing a transport is only
    /// allowed while the link is down.
    pub fn attach(&self, transport: Arc<dyn ModemPipe>) -> Result<()> {
        let previous = {
            let mut state = self.inner.lock();
            if state.transport.is_some() && !state.link.is_down() {
                return Err(CmuxError::AlreadyAttached);
            }
            state.reset_buffers();
            state.transport.replace(Arc::clone(&transport))
        };
        if let Some(previous) = previous {
            previous.release();
        }

        let weak = Arc::downgrade(&self.inner);
        transport.attach(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_transport_event(event);
            }
        }));
        debug!("transport attached");

        // Bytes may have arrived before the callback was in place.
        self.inner.kick(RECEIVE | TRANSMIT);
        Ok(())
    }

    /// Detach the transport. Every DLCI is closed and the link drops to
    /// Disconnected; pending requests fail with `Released`.
    pub fn release(&self) {
        let transport = self.inner.update(|state, fx| {
            state.teardown(fx, || CmuxError::Released);
            state.transport.take()
        });
        if let Some(transport) = transport {
            transport.release();
            debug!("transport released");
        }
    }

    /// Start connecting the control channel. Completion is reported through
    /// [`crate::CmuxEvent`].
    pub fn connect_async(&self) -> Result<()> {
        self.inner.update(|state, _| state.connect(None))?;
        self.inner.kick(TRANSMIT);
        Ok(())
    }

    /// Connect the control channel, waiting up to `timeout`.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        let completion = Completion::new();
        self.inner
            .update(|state, _| state.connect(Some(Arc::clone(&completion))))?;
        self.inner.kick(TRANSMIT);
        self.inner.await_completion(
            &completion,
            timeout,
            |state, fx| state.abort_connect(fx),
            || CmuxError::ConnectTimeout,
        )
    }

    /// Start disconnecting the control channel.
    pub fn disconnect_async(&self) -> Result<()> {
        self.inner.update(|state, _| state.disconnect(None))?;
        self.inner.kick(TRANSMIT);
        Ok(())
    }

    /// Disconnect the control channel, waiting up to `timeout`.
    pub fn disconnect(&self, timeout: Duration) -> Result<()> {
        let completion = Completion::new();
        self.inner
            .update(|state, _| state.disconnect(Some(Arc::clone(&completion))))?;
        self.inner.kick(TRANSMIT);
        self.inner.await_completion(
            &completion,
            timeout,
            |state, fx| state.abort_disconnect(fx),
            || CmuxError::DisconnectTimeout,
        )
    }

    /// Register a DLCI and return its pipe.
    pub fn dlci_init(&self, config: DlciConfig) -> Result<DlciPipe> {
        self.inner.lock().register(&config)?;
        Ok(DlciPipe::new(Arc::downgrade(&self.inner), config.address))
    }

    /// Current state of the control channel.
    pub fn state(&self) -> LinkState {
        self.inner.lock().link
    }

    /// State of a registered DLCI.
    pub fn dlci_state(&self, address: u8) -> Option<DlciState> {
        let state = self.inner.lock();
        state.find(address).map(|idx| state.dlcis[idx].state)
    }

    /// Whether this side initiated the link (sent SABM on DLCI 0).
    pub fn is_initiator(&self) -> bool {
        self.inner.lock().initiator
    }

    /// Snapshot of the frame and buffer counters.
    pub fn stats(&self) -> CmuxStats {
        self.inner.lock().stats()
    }

    /// Earliest time at which [`Cmux::pump`] has timer work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().next_deadline()
    }

    /// Process received bytes, expired timers, and queued frames.
    pub fn pump(&self) {
        self.inner.kick(RECEIVE | TRANSMIT | TIMERS);
    }
}

impl Inner {
    pub(crate) fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` under the lock and fire the collected effects afterwards.
    fn update<R>(&self, f: impl FnOnce(&mut MuxState, &mut Effects) -> R) -> R {
        let mut fx = Effects::default();
        let result = {
            let mut state = self.lock();
            f(&mut state, &mut fx)
        };
        self.fire(fx);
        result
    }

    fn fire(&self, fx: Effects) {
        if fx.tx_space {
            self.tx_space.notify_all();
        }
        for notification in fx.notifications {
            match notification {
                Notification::Link(event) => {
                    if let Some(callback) = &self.callback {
                        callback(event);
                    }
                }
                Notification::Pipe(slot, event) => slot.fire(event),
            }
        }
    }

    fn on_transport_event(&self, event: PipeEvent) {
        let work = match event {
            PipeEvent::ReceiveReady => RECEIVE,
            PipeEvent::TransmitIdle | PipeEvent::Opened => TRANSMIT,
            PipeEvent::Closed => TRANSPORT_CLOSED,
        };
        self.kick(work);
    }

    /// Record pending work and pump unless another context is pumping; that
    /// context picks the work up before it returns.
    fn kick(&self, work: u32) {
        self.pending.fetch_or(work, Ordering::AcqRel);
        loop {
            if self
                .pumping
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            loop {
                let work = self.pending.swap(0, Ordering::AcqRel);
                if work == 0 {
                    break;
                }
                self.run(work);
            }
            self.pumping.store(false, Ordering::Release);
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
        }
    }

    fn run(&self, work: u32) {
        let mut fx = Effects::default();
        let transport = self.lock().transport.clone();

        if let Some(transport) = &transport {
            if work & TRANSPORT_CLOSED != 0 && !transport.is_open() {
                self.lock()
                    .teardown(&mut fx, || CmuxError::TransportClosed);
            }
            if work & RECEIVE != 0 {
                self.receive(transport.as_ref(), &mut fx);
            }
        }

        self.lock().service_timers(Instant::now(), &mut fx);

        if let Some(transport) = &transport {
            self.flush(transport.as_ref(), &mut fx);
        }
        self.fire(fx);
    }

    fn receive(&self, transport: &dyn ModemPipe, fx: &mut Effects) {
        let capacity = self.lock().config.receive_buf_size;
        let mut chunk = vec![0u8; capacity];
        let mut ready = Vec::new();

        loop {
            let free = self.lock().decoder.free_space();
            let want = if free == 0 { capacity } else { free };
            let n = match transport.receive(&mut chunk[..want]) {
                Ok(0) | Err(TransportError::NotOpen) => break,
                Ok(n) => n,
                Err(err) => {
                    warn!(error = %err, "transport receive failed");
                    break;
                }
            };
            self.lock().ingest(&chunk[..n], fx, &mut ready);
        }

        self.lock().notify_ready(&mut ready, fx);
    }

    fn flush(&self, transport: &dyn ModemPipe, fx: &mut Effects) {
        loop {
            let out = {
                let mut state = self.lock();
                state.fill_tx_buf();
                if state.tx_buf.is_empty() {
                    return;
                }
                state.tx_buf.clone().freeze()
            };

            match transport.transmit(&out) {
                Ok(0) => return,
                Ok(n) => self.lock().consume_tx(n, fx),
                Err(err) => {
                    warn!(error = %err, pending = out.len(), "transport transmit failed");
                    return;
                }
            }
        }
    }

    /// Block on `completion`, servicing timers while waiting. On timeout the
    /// pending operation is aborted with `abort`.
    fn await_completion(
        &self,
        completion: &Completion,
        timeout: Duration,
        abort: impl FnOnce(&mut MuxState, &mut Effects),
        timeout_err: impl FnOnce() -> CmuxError,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let wake = self
                .lock()
                .next_deadline()
                .map_or(deadline, |timer| timer.min(deadline))
                .max(Instant::now() + MIN_WAIT);
            if let Some(result) = completion.wait_until(wake.min(deadline)) {
                return result;
            }
            if Instant::now() >= deadline {
                break;
            }
            self.kick(TIMERS);
        }

        self.update(abort);
        completion
            .wait_until(Instant::now())
            .unwrap_or_else(|| Err(timeout_err()))
    }

    // ---- DLCI operations used by DlciPipe ----

    pub(crate) fn open_dlci(&self, address: u8, timeout: Option<Duration>) -> Result<()> {
        let completion = timeout.map(|_| Completion::new());
        self.update(|state, _| {
            let idx = state.dlci_index(address)?;
            state.open_dlci(idx, completion.clone())
        })?;
        self.kick(TRANSMIT);

        match (completion, timeout) {
            (Some(completion), Some(timeout)) => self.await_completion(
                &completion,
                timeout,
                |state, fx| {
                    if let Some(idx) = state.find(address) {
                        state.abort_open(idx, fx);
                    }
                },
                || CmuxError::OpenTimeout(address),
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn close_dlci(&self, address: u8, timeout: Option<Duration>) -> Result<()> {
        let completion = timeout.map(|_| Completion::new());
        self.update(|state, _| {
            let idx = state.dlci_index(address)?;
            state.close_dlci(idx, completion.clone())
        })?;
        self.kick(TRANSMIT);

        match (completion, timeout) {
            (Some(completion), Some(timeout)) => self.await_completion(
                &completion,
                timeout,
                |state, fx| {
                    if let Some(idx) = state.find(address) {
                        state.abort_close(idx, fx);
                    }
                },
                || CmuxError::CloseTimeout(address),
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn transmit(&self, address: u8, data: &[u8]) -> Result<usize> {
        let mode = {
            let state = self.lock();
            let idx = state.dlci_index(address)?;
            state.dlcis[idx].transmit_mode
        };
        let deadline = match mode {
            TransmitMode::NonBlocking => None,
            TransmitMode::Blocking(timeout) => Some(Instant::now() + timeout),
        };

        let mut total = 0;
        loop {
            let (result, generation) = self.update(|state, _| {
                let result = state
                    .dlci_index(address)
                    .and_then(|idx| state.transmit(idx, &data[total..]));
                (result, state.tx_generation)
            });
            match result {
                Ok(n) => total += n,
                Err(CmuxError::WouldBlock) => {}
                Err(err) if total == 0 => return Err(err),
                Err(_) => return Ok(total),
            }
            self.kick(TRANSMIT);

            if total == data.len() {
                return Ok(total);
            }
            let Some(deadline) = deadline else {
                break;
            };

            // Wait for the pump to release space (or for the DLCI to change
            // state), then try again.
            let mut state = self.lock();
            while state.tx_generation == generation {
                let now = Instant::now();
                if now >= deadline {
                    drop(state);
                    return if total > 0 {
                        Ok(total)
                    } else {
                        Err(CmuxError::WouldBlock)
                    };
                }
                state = match self.tx_space.wait_timeout(state, deadline - now) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
        }

        if total > 0 {
            Ok(total)
        } else {
            Err(CmuxError::WouldBlock)
        }
    }

    pub(crate) fn receive_dlci(&self, address: u8, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.lock();
        let idx = state.dlci_index(address)?;
        let dlci = &mut state.dlcis[idx];
        if dlci.state == DlciState::Closed {
            return Err(CmuxError::NotOpen(address));
        }
        Ok(dlci.read_rx(buf))
    }

    pub(crate) fn dlci_callback(&self, address: u8) -> Option<Arc<cmux_transport::CallbackSlot>> {
        let state = self.lock();
        state
            .find(address)
            .map(|idx| Arc::clone(&state.dlcis[idx].callback))
    }

    pub(crate) fn dlci_state(&self, address: u8) -> Option<DlciState> {
        let state = self.lock();
        state.find(address).map(|idx| state.dlcis[idx].state)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(transport) = state.transport.take() {
            transport.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::thread;

    use bytes::BytesMut;
    use cmux_frame::{
        decode_control, encode_frame, ControlMessage, ControlType, Frame, FrameConfig,
        FrameDecoder, FrameType, ModemStatus,
    };
    use cmux_transport::{MockPipe, MockPipeConfig};

    use super::*;
    use crate::config::CmuxEvent;
    use crate::error::pipe_error_cause;

    /// Instance attached to an unbridged mock; the test plays the peer.
    struct Harness {
        cmux: Cmux,
        wire: Arc<MockPipe>,
        events: Arc<StdMutex<Vec<CmuxEvent>>>,
        frame: FrameConfig,
    }

    impl Harness {
        fn new(config: CmuxConfig) -> Self {
            let events = Arc::new(StdMutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            let config = config.with_callback(move |event| sink.lock().unwrap().push(event));
            let frame = config.frame.clone();

            let wire = MockPipe::new(MockPipeConfig::default());
            wire.open_async().expect("mock should open");
            let cmux = Cmux::new(config).expect("config should be valid");
            cmux.attach(wire.clone()).expect("transport should attach");
            Self {
                cmux,
                wire,
                events,
                frame,
            }
        }

        /// Connected as initiator, with the wire drained.
        fn connected(config: CmuxConfig) -> Self {
            let harness = Self::new(config);
            harness.cmux.connect_async().expect("connect should start");
            harness.inject(Frame::ua(0));
            assert_eq!(harness.cmux.state(), LinkState::Connected);
            harness.sent();
            harness
        }

        fn open(&self, address: u8) -> DlciPipe {
            let pipe = self
                .cmux
                .dlci_init(DlciConfig::new(address))
                .expect("DLCI should register");
            pipe.open_async().expect("open should start");
            self.inject(Frame::ua(address));
            assert!(pipe.is_open());
            // Answer the MSC sent after the open.
            let status = ModemStatus::ready(address).to_value().to_vec();
            self.inject_message(ControlMessage::response(ControlType::Msc, status));
            self.sent();
            pipe
        }

        fn inject(&self, frame: Frame) {
            let mut buf = BytesMut::new();
            encode_frame(&frame, &self.frame, &mut buf).expect("frame should encode");
            self.wire.put(&buf);
        }

        fn inject_message(&self, message: ControlMessage) {
            let payload = message.to_bytes().expect("message should encode");
            self.inject(Frame::uih(0, payload));
        }

        /// Frames the instance put on the wire since the last call.
        fn sent(&self) -> Vec<Frame> {
            let mut decoder = FrameDecoder::new(self.frame.clone(), 8192);
            decoder
                .push(&self.wire.take_transmitted())
                .expect("capture should fit");
            decoder
                .map(|frame| frame.expect("sent frame should decode"))
                .collect()
        }

        fn events(&self) -> Vec<CmuxEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    fn messages(frame: &Frame) -> Vec<ControlMessage> {
        assert_eq!(frame.dlci, 0);
        decode_control(&frame.payload).expect("control payload should decode")
    }

    fn fast() -> CmuxConfig {
        CmuxConfig::default()
            .with_retries(Duration::from_millis(20), 2)
            .with_timeouts(Duration::from_millis(20))
    }

    #[test]
    fn connect_sends_sabm_and_completes_on_ua() {
        let harness = Harness::new(CmuxConfig::default());
        harness.cmux.connect_async().expect("connect should start");

        assert_eq!(
            harness.wire.take_transmitted(),
            vec![0xF9, 0x03, 0x3F, 0x01, 0x1C, 0xF9]
        );
        assert_eq!(harness.cmux.state(), LinkState::Connecting);
        assert!(harness.cmux.is_initiator());

        harness.inject(Frame::ua(0));
        assert_eq!(harness.cmux.state(), LinkState::Connected);
        assert_eq!(harness.events(), vec![CmuxEvent::Connected]);

        // Already connected: nothing new goes out.
        harness.cmux.connect_async().expect("connect should be a no-op");
        harness
            .cmux
            .connect(Duration::from_millis(10))
            .expect("blocking connect should return at once");
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn connect_retries_then_times_out() {
        let harness = Harness::new(fast());
        let err = harness
            .cmux
            .connect(Duration::from_secs(2))
            .expect_err("nobody answers");
        assert!(matches!(err, CmuxError::ConnectTimeout));

        let sent = harness.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent
            .iter()
            .all(|frame| frame.frame_type == FrameType::Sabm && frame.dlci == 0));
        assert_eq!(harness.cmux.state(), LinkState::Disconnected);
        assert_eq!(harness.events(), vec![CmuxEvent::ConnectFailed]);
    }

    #[test]
    fn connect_requires_open_transport() {
        let cmux = Cmux::new(CmuxConfig::default()).expect("config should be valid");
        assert!(matches!(cmux.connect_async(), Err(CmuxError::NotAttached)));

        let wire = MockPipe::new(MockPipeConfig::default());
        cmux.attach(wire).expect("transport should attach");
        assert!(matches!(
            cmux.connect_async(),
            Err(CmuxError::Transport(TransportError::NotOpen))
        ));
    }

    #[test]
    fn dm_rejects_connect() {
        let harness = Harness::new(CmuxConfig::default());
        harness.cmux.connect_async().expect("connect should start");
        harness.inject(Frame::dm(0));
        assert_eq!(harness.cmux.state(), LinkState::Disconnected);
        assert_eq!(harness.events(), vec![CmuxEvent::ConnectFailed]);
    }

    #[test]
    fn responder_acknowledges_sabm() {
        let harness = Harness::new(CmuxConfig::default());
        harness.inject(Frame::sabm(0));

        assert_eq!(
            harness.wire.take_transmitted(),
            vec![0xF9, 0x03, 0x73, 0x01, 0xD7, 0xF9]
        );
        assert_eq!(harness.cmux.state(), LinkState::Connected);
        assert!(!harness.cmux.is_initiator());
        assert_eq!(harness.events(), vec![CmuxEvent::Connected]);
    }

    #[test]
    fn command_response_bits_follow_role() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness
            .cmux
            .dlci_init(DlciConfig::new(1))
            .expect("DLCI should register");
        pipe.open_async().expect("open should start");

        let sabm = harness.sent();
        assert_eq!(sabm[0].frame_type, FrameType::Sabm);
        assert!(sabm[0].cr, "initiator commands carry C/R=1");

        harness.inject(Frame::ua(1));
        harness.sent();
        // The responder's SABM on another DLCI is answered with C/R=0.
        let _second = harness
            .cmux
            .dlci_init(DlciConfig::new(2))
            .expect("DLCI should register");
        harness.inject(Frame::sabm(2).with_cr(false));
        let ua = harness.sent();
        assert_eq!(ua[0].frame_type, FrameType::Ua);
        assert_eq!(ua[0].dlci, 2);
        assert!(!ua[0].cr, "initiator responses carry C/R=0");

        pipe.transmit(b"AT\r").expect("open DLCI should accept data");
        let data = harness.sent();
        assert_eq!(data[0].frame_type, FrameType::Uih);
        assert!(data[0].cr);
    }

    #[test]
    fn peer_disc_closes_everything() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness.open(1);

        harness.inject(Frame::disc(0));
        let sent = harness.sent();
        assert_eq!(sent[0].frame_type, FrameType::Ua);
        assert_eq!(sent[0].dlci, 0);
        assert_eq!(harness.cmux.state(), LinkState::Disconnected);
        assert_eq!(pipe.state(), Some(DlciState::Closed));
        assert_eq!(
            harness.events(),
            vec![CmuxEvent::Connected, CmuxEvent::Disconnected]
        );
    }

    #[test]
    fn unknown_dlci_is_refused() {
        let harness = Harness::connected(CmuxConfig::default());
        harness.inject(Frame::sabm(5));
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].frame_type, FrameType::Dm);
        assert_eq!(sent[0].dlci, 5);
    }

    #[test]
    fn test_command_is_echoed() {
        let harness = Harness::connected(CmuxConfig::default());
        harness.inject_message(ControlMessage::command(ControlType::Test, &b"ping"[..]));

        let sent = harness.sent();
        assert_eq!(
            messages(&sent[0]),
            vec![ControlMessage::response(ControlType::Test, &b"ping"[..])]
        );
    }

    #[test]
    fn unknown_command_gets_nsc() {
        let harness = Harness::connected(CmuxConfig::default());
        harness.inject_message(ControlMessage::command(
            ControlType::Unknown(0x04),
            Vec::new(),
        ));

        let sent = harness.sent();
        assert_eq!(
            messages(&sent[0]),
            vec![ControlMessage::not_supported(0x07)]
        );
    }

    #[test]
    fn echoed_command_bit_counts_as_response() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness
            .cmux
            .dlci_init(DlciConfig::new(1))
            .expect("DLCI should register");
        pipe.open_async().expect("open should start");
        harness.inject(Frame::ua(1));

        let sent = harness.sent();
        let msc = messages(&sent[1]);
        assert_eq!(msc[0].kind, ControlType::Msc);
        assert!(msc[0].command);

        // Answer with the command bit still set: matches our request.
        harness.inject_message(msc[0].clone());
        assert!(harness.sent().is_empty());

        // Nothing outstanding now, so the same message is a command.
        harness.inject_message(msc[0].clone());
        let sent = harness.sent();
        let reply = messages(&sent[0]);
        assert_eq!(reply[0].kind, ControlType::Msc);
        assert!(!reply[0].command);
    }

    #[test]
    fn fcoff_holds_data_until_fcon() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness.open(1);

        harness.inject_message(ControlMessage::command(ControlType::FcOff, Vec::new()));
        pipe.transmit(b"held").expect("data should queue");
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(messages(&sent[0])[0].kind, ControlType::FcOff);

        harness.inject_message(ControlMessage::command(ControlType::FcOn, Vec::new()));
        let sent = harness.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(messages(&sent[0])[0].kind, ControlType::FcOn);
        assert_eq!(sent[1].dlci, 1);
        assert_eq!(sent[1].payload.as_ref(), b"held");
    }

    #[test]
    fn msc_flow_control_is_per_dlci() {
        let harness = Harness::connected(CmuxConfig::default());
        let one = harness.open(1);
        let two = harness.open(2);

        let mut stop = ModemStatus::ready(1);
        stop.fc = true;
        harness.inject_message(ControlMessage::command(
            ControlType::Msc,
            stop.to_value().to_vec(),
        ));
        harness.sent();

        one.transmit(b"one").expect("data should queue");
        two.transmit(b"two").expect("data should queue");
        let sent = harness.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dlci, 2);

        harness.inject_message(ControlMessage::command(
            ControlType::Msc,
            ModemStatus::ready(1).to_value().to_vec(),
        ));
        let sent = harness.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].dlci, 1);
        assert_eq!(sent[1].payload.as_ref(), b"one");
    }

    #[test]
    fn transmit_alternates_between_dlcis() {
        let frame = FrameConfig {
            max_payload_size: 4,
            ..FrameConfig::default()
        };
        let harness = Harness::connected(CmuxConfig::default().with_frame(frame));
        let one = harness.open(1);
        let two = harness.open(2);

        harness.wire.set_transmit_limit(Some(0));
        assert_eq!(one.transmit(b"aaaabbbbcccc").expect("queued"), 12);
        assert_eq!(two.transmit(b"ddddeeeeffff").expect("queued"), 12);
        assert!(harness.sent().is_empty());

        harness.wire.set_transmit_limit(None);
        harness.wire.signal_transmit_idle();
        let sent = harness.sent();
        let order: Vec<u8> = sent.iter().map(|frame| frame.dlci).collect();
        assert_eq!(order, vec![1, 2, 1, 2, 1, 2]);
        let payloads: Vec<&[u8]> = sent.iter().map(|frame| frame.payload.as_ref()).collect();
        assert_eq!(
            payloads,
            vec![
                &b"aaaa"[..],
                &b"dddd"[..],
                &b"bbbb"[..],
                &b"eeee"[..],
                &b"cccc"[..],
                &b"ffff"[..]
            ]
        );
    }

    #[test]
    fn full_buffer_reports_would_block_then_idle() {
        let harness = Harness::connected(CmuxConfig::default().with_buffers(512, 200));
        let pipe = harness.open(1);
        let idle = Arc::new(StdMutex::new(0usize));
        let counter = Arc::clone(&idle);
        pipe.attach(Arc::new(move |event| {
            if event == PipeEvent::TransmitIdle {
                *counter.lock().unwrap() += 1;
            }
        }));

        harness.wire.set_transmit_limit(Some(0));
        assert_eq!(pipe.transmit(&[0x55; 300]).expect("one frame fits"), 127);
        let err = pipe.transmit(&[0x55; 127]).expect_err("buffer is full");
        assert!(matches!(
            pipe_error_cause(&err),
            Some(CmuxError::WouldBlock)
        ));

        harness.wire.set_transmit_limit(None);
        harness.wire.signal_transmit_idle();
        assert_eq!(*idle.lock().unwrap(), 1);
        assert_eq!(pipe.transmit(&[0x55; 127]).expect("space is back"), 127);
    }

    #[test]
    fn blocking_transmit_waits_for_space() {
        let harness = Harness::connected(CmuxConfig::default().with_buffers(512, 200));
        let pipe = harness
            .cmux
            .dlci_init(
                DlciConfig::new(1)
                    .with_transmit_mode(TransmitMode::Blocking(Duration::from_secs(2))),
            )
            .expect("DLCI should register");
        pipe.open_async().expect("open should start");
        harness.inject(Frame::ua(1));
        harness.sent();

        harness.wire.set_transmit_limit(Some(0));
        let wire = Arc::clone(&harness.wire);
        let unblock = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            wire.set_transmit_limit(None);
            wire.signal_transmit_idle();
        });

        assert_eq!(pipe.transmit(&[0xAA; 300]).expect("all bytes go out"), 300);
        unblock.join().expect("unblock thread should finish");

        let data: usize = harness
            .sent()
            .iter()
            .filter(|frame| frame.dlci == 1)
            .map(|frame| frame.payload.len())
            .sum();
        assert_eq!(data, 300);
    }

    #[test]
    fn blocking_transmit_gives_up_at_deadline() {
        let harness = Harness::connected(CmuxConfig::default().with_buffers(512, 200));
        let pipe = harness
            .cmux
            .dlci_init(
                DlciConfig::new(1)
                    .with_transmit_mode(TransmitMode::Blocking(Duration::from_millis(30))),
            )
            .expect("DLCI should register");
        pipe.open_async().expect("open should start");
        harness.inject(Frame::ua(1));
        harness.sent();

        harness.wire.set_transmit_limit(Some(0));
        let start = Instant::now();
        assert_eq!(pipe.transmit(&[0xAA; 300]).expect("partial"), 127);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn checksum_budget_drops_link() {
        let harness = Harness::connected(
            CmuxConfig::default().with_checksum_error_budget(Some(2)),
        );

        let mut buf = BytesMut::new();
        encode_frame(&Frame::uih(1, &b"x"[..]), &harness.frame, &mut buf)
            .expect("frame should encode");
        let fcs = buf.len() - 2;
        buf[fcs] ^= 0xFF;

        harness.wire.put(&buf);
        assert!(harness.sent().is_empty());
        harness.wire.put(&buf);

        let sent = harness.sent();
        assert_eq!(sent[0].frame_type, FrameType::Disc);
        assert_eq!(sent[0].dlci, 0);
        assert_eq!(harness.cmux.state(), LinkState::Disconnecting);
        assert_eq!(harness.cmux.stats().checksum_errors, 2);
    }

    #[test]
    fn received_data_reaches_pipe() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness.open(1);
        let ready = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&ready);
        pipe.attach(Arc::new(move |event| sink.lock().unwrap().push(event)));

        harness.inject(Frame::uih(1, &b"OK\r\n"[..]).with_cr(false));
        assert_eq!(*ready.lock().unwrap(), vec![PipeEvent::ReceiveReady]);

        let mut buf = [0u8; 16];
        assert_eq!(pipe.receive(&mut buf).expect("data should be readable"), 4);
        assert_eq!(&buf[..4], b"OK\r\n");
        assert_eq!(pipe.receive(&mut buf).expect("empty read"), 0);
    }

    #[test]
    fn closed_dlci_is_not_open() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness
            .cmux
            .dlci_init(DlciConfig::new(1))
            .expect("DLCI should register");

        assert!(matches!(pipe.transmit(b"x"), Err(TransportError::NotOpen)));
        let mut buf = [0u8; 4];
        assert!(matches!(
            pipe.receive(&mut buf),
            Err(TransportError::NotOpen)
        ));

        pipe.open_async().expect("open should start");
        assert_eq!(pipe.state(), Some(DlciState::Opening));
        assert!(matches!(pipe.transmit(b"x"), Err(TransportError::NotOpen)));
    }

    #[test]
    fn open_requires_connected_link() {
        let harness = Harness::new(CmuxConfig::default());
        let pipe = harness
            .cmux
            .dlci_init(DlciConfig::new(1))
            .expect("DLCI should register");
        let err = pipe.open_async().expect_err("link is down");
        assert!(matches!(
            pipe_error_cause(&err),
            Some(CmuxError::NotConnected)
        ));
    }

    #[test]
    fn dlci_registration_is_validated() {
        let harness = Harness::new(CmuxConfig::default().with_max_dlcis(1));
        assert!(matches!(
            harness.cmux.dlci_init(DlciConfig::new(0)),
            Err(CmuxError::InvalidDlci(0))
        ));
        harness
            .cmux
            .dlci_init(DlciConfig::new(1))
            .expect("DLCI should register");
        assert!(matches!(
            harness.cmux.dlci_init(DlciConfig::new(1)),
            Err(CmuxError::DlciInUse(1))
        ));
        assert!(matches!(
            harness.cmux.dlci_init(DlciConfig::new(2)),
            Err(CmuxError::DlciTableFull(1))
        ));
    }

    #[test]
    fn peer_refusal_fails_blocking_open() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness
            .cmux
            .dlci_init(DlciConfig::new(3))
            .expect("DLCI should register");

        let wire = Arc::clone(&harness.wire);
        let frame = harness.frame.clone();
        let peer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let mut buf = BytesMut::new();
            encode_frame(&Frame::dm(3), &frame, &mut buf).expect("frame should encode");
            wire.put(&buf);
        });

        let err = pipe
            .open(Duration::from_secs(2))
            .expect_err("peer refuses");
        peer.join().expect("peer thread should finish");
        assert!(matches!(
            pipe_error_cause(&err),
            Some(CmuxError::Rejected(3))
        ));
        assert_eq!(pipe.state(), Some(DlciState::Closed));
    }

    #[test]
    fn open_times_out_without_ua() {
        let harness = Harness::connected(fast());
        let pipe = harness
            .cmux
            .dlci_init(DlciConfig::new(1))
            .expect("DLCI should register");
        let err = pipe
            .open(Duration::from_secs(2))
            .expect_err("nobody answers");
        assert!(matches!(
            pipe_error_cause(&err),
            Some(CmuxError::OpenTimeout(1))
        ));
        assert_eq!(pipe.state(), Some(DlciState::Closed));
    }

    #[test]
    fn close_sends_queued_data_before_disc() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness.open(1);

        harness.wire.set_transmit_limit(Some(0));
        pipe.transmit(b"first").expect("data should queue");
        pipe.transmit(b"second").expect("data should queue");
        pipe.close_async().expect("close should start");
        assert_eq!(pipe.state(), Some(DlciState::Closing));

        harness.wire.set_transmit_limit(None);
        harness.wire.signal_transmit_idle();
        let sent = harness.sent();
        let kinds: Vec<(u8, FrameType)> =
            sent.iter().map(|frame| (frame.dlci, frame.frame_type)).collect();
        assert_eq!(
            kinds,
            vec![
                (1, FrameType::Uih),
                (1, FrameType::Uih),
                (1, FrameType::Disc)
            ]
        );

        harness.inject(Frame::ua(1));
        assert_eq!(pipe.state(), Some(DlciState::Closed));
    }

    #[test]
    fn closing_dlci_refuses_transmit_and_drops_late_data() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness.open(1);

        harness.wire.set_transmit_limit(Some(0));
        pipe.close_async().expect("close should start");
        assert_eq!(pipe.state(), Some(DlciState::Closing));
        assert!(matches!(pipe.transmit(b"x"), Err(TransportError::NotOpen)));

        harness.inject(Frame::uih(1, &b"late"[..]).with_cr(false));
        harness.wire.set_transmit_limit(None);
        harness.wire.signal_transmit_idle();
        harness.inject(Frame::ua(1));
        assert_eq!(pipe.state(), Some(DlciState::Closed));

        harness.inject(Frame::uih(1, &b"after"[..]).with_cr(false));
        harness.sent();

        pipe.open_async().expect("reopen should start");
        harness.inject(Frame::ua(1));
        assert!(pipe.is_open());
        let mut buf = [0u8; 16];
        assert_eq!(pipe.receive(&mut buf).expect("empty read"), 0);
    }

    #[test]
    fn peer_msc_is_answered_while_ours_is_pending() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness
            .cmux
            .dlci_init(DlciConfig::new(1))
            .expect("DLCI should register");
        pipe.open_async().expect("open should start");
        harness.inject(Frame::ua(1));
        let sent = harness.sent();
        let ours = messages(&sent[1])[0].clone();
        assert_eq!(ours.kind, ControlType::Msc);

        // The modem announces its own status for the same DLCI.
        let mut theirs = ModemStatus::ready(1);
        theirs.fc = true;
        let value = theirs.to_value().to_vec();
        harness.inject_message(ControlMessage::command(ControlType::Msc, value.clone()));
        let sent = harness.sent();
        assert_eq!(
            messages(&sent[0]),
            vec![ControlMessage::response(ControlType::Msc, value)]
        );

        // Our request is still outstanding: an exact echo answers it.
        harness.inject_message(ours);
        assert!(harness.sent().is_empty());
    }

    #[test]
    fn control_replies_are_bounded_while_the_wire_is_stalled() {
        let harness = Harness::connected(CmuxConfig::default());
        harness.wire.set_transmit_limit(Some(0));
        for _ in 0..50 {
            harness.inject_message(ControlMessage::command(ControlType::Test, vec![0x55; 100]));
        }

        harness.wire.set_transmit_limit(None);
        harness.wire.signal_transmit_idle();
        let sent = harness.sent();
        // 100-byte Test value: 2 + 100 payload bytes, 108 on the wire.
        assert!(!sent.is_empty());
        assert!(sent.len() <= 1024 / 108, "{} replies queued", sent.len());

        harness.inject_message(ControlMessage::command(ControlType::Test, &b"ping"[..]));
        let sent = harness.sent();
        assert_eq!(
            messages(&sent[0]),
            vec![ControlMessage::response(ControlType::Test, &b"ping"[..])]
        );
    }

    #[test]
    fn disconnect_completes_on_timer_when_unacknowledged() {
        let harness = Harness::connected(fast());
        harness
            .cmux
            .disconnect_async()
            .expect("disconnect should start");
        assert_eq!(harness.sent()[0].frame_type, FrameType::Disc);
        assert_eq!(harness.cmux.state(), LinkState::Disconnecting);

        thread::sleep(Duration::from_millis(30));
        harness.cmux.pump();
        assert_eq!(harness.cmux.state(), LinkState::Disconnected);
        assert!(harness.cmux.next_deadline().is_none());
    }

    #[test]
    fn transport_close_tears_down() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness.open(1);

        harness.wire.close_async().expect("mock should close");
        assert_eq!(harness.cmux.state(), LinkState::Disconnected);
        assert_eq!(pipe.state(), Some(DlciState::Closed));
        assert_eq!(
            harness.events(),
            vec![CmuxEvent::Connected, CmuxEvent::Disconnected]
        );
    }

    #[test]
    fn attach_refused_while_connected() {
        let harness = Harness::connected(CmuxConfig::default());
        let other = MockPipe::new(MockPipeConfig::default());
        assert!(matches!(
            harness.cmux.attach(other),
            Err(CmuxError::AlreadyAttached)
        ));

        harness.cmux.release();
        assert_eq!(harness.cmux.state(), LinkState::Disconnected);
        let other = MockPipe::new(MockPipeConfig::default());
        harness
            .cmux
            .attach(other)
            .expect("released instance accepts a new transport");
    }

    #[test]
    fn dropped_instance_releases_pipes() {
        let harness = Harness::connected(CmuxConfig::default());
        let pipe = harness.open(1);
        let Harness { cmux, wire, .. } = harness;
        drop(cmux);

        let err = pipe.transmit(b"x").expect_err("instance is gone");
        assert!(matches!(pipe_error_cause(&err), Some(CmuxError::Released)));
        assert!(pipe.state().is_none());
        // The transport callback is detached.
        wire.put(&[0xF9]);
    }
}
