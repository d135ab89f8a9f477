//! Stop-and-wait transfer driver.
//!
//! The device asks for data with `C`, asks for a resend with `NAK` and closes
//! the transfer with `EOT`. Only one frame is ever in flight: the cursor does
//! not move until the device requests the next frame.
//!
//! [`TransferSession`] is the pure state machine; [`run_transfer`] wires it to
//! a byte sink and the connection's read channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::data::TransferData;
use crate::error::{Error, ErrorCode, LinkError, ProtocolError};
use crate::packet::{FrameKind, Packet, PacketFramer};

/// "Send next" request byte.
pub const C: u8 = 0x4E;
/// "Resend current" byte.
pub const NAK: u8 = 0x52;
/// "All data received" byte.
pub const EOT: u8 = 0x44;

/// Consecutive NAKs tolerated before the transfer is aborted.
pub const MAX_ERRORS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Request,
    Nak,
    Eot,
}

impl Control {
    pub fn byte(self) -> u8 {
        match self {
            Self::Request => C,
            Self::Nak => NAK,
            Self::Eot => EOT,
        }
    }

    /// Find the control signal in a received byte run.
    ///
    /// The run may carry unrelated device chatter. The first control byte
    /// decides; anything after it in the same run is ignored.
    pub fn detect(run: &[u8]) -> Option<Control> {
        run.iter().find_map(|&b| match b {
            C => Some(Self::Request),
            NAK => Some(Self::Nak),
            EOT => Some(Self::Eot),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    AwaitingRequest,
    Sending,
    AwaitingAck,
    Retrying,
    Finishing,
    Done,
    Aborted,
}

/// What the driver must do after feeding the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Write this frame, then call [`TransferSession::frame_sent`].
    Send(Packet),
    Wait,
    Done,
}

/// Transfer progress reported to the front end.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Started {
        total_bytes: usize,
        total_packets: usize,
    },
    Progress {
        percent: f64,
        bytes: usize,
    },
    Success,
    Error {
        code: ErrorCode,
        message: String,
    },
}

/// Per-transfer cursor plus NAK bookkeeping.
pub struct TransferSession<'a> {
    framer: PacketFramer<'a>,
    state: TransferState,
    current: Option<Packet>,
    errors: u32,
}

impl<'a> TransferSession<'a> {
    pub fn new(kind: FrameKind, data: &'a dyn TransferData) -> Result<Self, Error> {
        Ok(TransferSession {
            framer: PacketFramer::new(kind, data)?,
            state: TransferState::Idle,
            current: None,
            errors: 0,
        })
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Consecutive NAKs for the current frame.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn framer(&self) -> &PacketFramer<'a> {
        &self.framer
    }

    pub fn start(&mut self) {
        if self.state == TransferState::Idle {
            self.state = TransferState::AwaitingRequest;
        }
    }

    pub fn abort(&mut self) {
        if self.state != TransferState::Done {
            self.state = TransferState::Aborted;
        }
    }

    /// Feed a raw byte run from the device.
    pub fn on_bytes(&mut self, run: &[u8]) -> Result<Step, Error> {
        match Control::detect(run) {
            Some(control) => self.on_control(control),
            None => {
                debug!("ignoring {} byte(s) without control byte", run.len());
                Ok(Step::Wait)
            }
        }
    }

    pub fn on_control(&mut self, control: Control) -> Result<Step, Error> {
        let result = self.transition(control);
        if result.is_err() {
            self.state = TransferState::Aborted;
        }
        result
    }

    fn transition(&mut self, control: Control) -> Result<Step, Error> {
        use TransferState::*;

        match (self.state, control) {
            (AwaitingRequest, Control::Request) => self.advance(),
            (AwaitingRequest, Control::Nak) => {
                debug!("NAK before first frame, waiting for request");
                Ok(Step::Wait)
            }
            (AwaitingAck, Control::Request) => {
                self.errors = 0;
                self.advance()
            }
            (AwaitingAck, Control::Nak) => {
                self.errors += 1;
                if self.errors >= MAX_ERRORS {
                    warn!(
                        "{} consecutive NAKs at packet {}, aborting",
                        self.errors,
                        self.framer.index()
                    );
                    return Err(ProtocolError::TooManyErrors {
                        count: self.errors,
                        index: self.framer.index(),
                    }
                    .into());
                }
                debug!("NAK {} for packet {}", self.errors, self.framer.index());
                self.state = Retrying;
                let frame = self.current.clone().ok_or(ProtocolError::UnexpectedControl {
                    control,
                    state: AwaitingAck,
                })?;
                Ok(Step::Send(frame))
            }
            (AwaitingAck, Control::Eot) if !self.framer.has_next_packet() => self.finish(),
            (Finishing, Control::Eot) => self.finish(),
            (Finishing, _) => Ok(Step::Wait),
            (Done, _) | (Aborted, _) => Ok(Step::Wait),
            (state, control) => Err(ProtocolError::UnexpectedControl { control, state }.into()),
        }
    }

    fn advance(&mut self) -> Result<Step, Error> {
        match self.framer.next_frame()? {
            Some(frame) => {
                self.state = TransferState::Sending;
                self.current = Some(frame.clone());
                Ok(Step::Send(frame))
            }
            None => {
                debug!("all {} packets sent", self.framer.total_packet_count());
                self.state = TransferState::Finishing;
                self.current = None;
                Ok(Step::Wait)
            }
        }
    }

    fn finish(&mut self) -> Result<Step, Error> {
        self.state = TransferState::Done;
        self.current = None;
        Ok(Step::Done)
    }

    /// The frame from the last `Step::Send` reached the link. Returns true
    /// when a progress event should be emitted.
    pub fn frame_sent(&mut self) -> bool {
        match self.state {
            TransferState::Sending => {
                self.state = TransferState::AwaitingAck;
                self.framer.invalidate_progress()
            }
            TransferState::Retrying => {
                self.state = TransferState::AwaitingAck;
                false
            }
            _ => false,
        }
    }
}

/// Destination for outgoing frames.
pub trait FrameSink {
    fn send_frame(&mut self, frame: &[u8]) -> Result<(), Error>;
}

/// Transfer settings.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    frame_kind: FrameKind,
    ack_timeout: Duration,
    poll_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self::new(FrameKind::StxA)
    }
}

impl TransferConfig {
    pub fn new(frame_kind: FrameKind) -> Self {
        TransferConfig {
            frame_kind,
            ack_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Longest silence from the device before the transfer fails.
    pub fn ack_timeout(self, ack_timeout: Duration) -> Self {
        TransferConfig {
            ack_timeout,
            ..self
        }
    }

    /// How often the stop flag is checked while waiting.
    pub fn poll_interval(self, poll_interval: Duration) -> Self {
        TransferConfig {
            poll_interval,
            ..self
        }
    }

    pub fn frame_kind(&self) -> FrameKind {
        self.frame_kind
    }
}

/// Drive one transfer to completion.
///
/// Every outcome is also reported on `events`; the returned state is `Done`
/// on success. `stop` aborts the transfer at the next poll.
pub fn run_transfer<S: FrameSink + ?Sized>(
    data: &dyn TransferData,
    config: &TransferConfig,
    sink: &mut S,
    incoming: &Receiver<Vec<u8>>,
    events: &Sender<TransferEvent>,
    stop: &AtomicBool,
) -> Result<TransferState, Error> {
    let mut session = match TransferSession::new(config.frame_kind, data) {
        Ok(session) => session,
        Err(err) => {
            report(events, &err);
            return Err(err);
        }
    };

    info!(
        "transfer of {} bytes as {} x {} started",
        data.total_len(),
        session.framer().total_packet_count(),
        config.frame_kind
    );
    events
        .send(TransferEvent::Started {
            total_bytes: data.total_len(),
            total_packets: session.framer().total_packet_count(),
        })
        .ok();

    session.start();
    match drive(&mut session, config, sink, incoming, events, stop) {
        Ok(()) => {
            info!("transfer finished");
            events.send(TransferEvent::Success).ok();
            Ok(session.state())
        }
        Err(err) => {
            session.abort();
            warn!("transfer aborted: {}", err);
            report(events, &err);
            Err(err)
        }
    }
}

fn drive<S: FrameSink + ?Sized>(
    session: &mut TransferSession<'_>,
    config: &TransferConfig,
    sink: &mut S,
    incoming: &Receiver<Vec<u8>>,
    events: &Sender<TransferEvent>,
    stop: &AtomicBool,
) -> Result<(), Error> {
    let mut last_answer = Instant::now();

    loop {
        if stop.load(Ordering::SeqCst) {
            return Err(ProtocolError::Stopped.into());
        }

        let control = match incoming.recv_timeout(config.poll_interval) {
            Ok(run) => {
                let control = Control::detect(&run);
                if control.is_none() {
                    debug!("ignoring {} byte(s) without control byte", run.len());
                }
                control
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => return Err(ProtocolError::ReadClosed.into()),
        };
        // Chatter without a control byte does not count as an answer.
        let Some(control) = control else {
            if last_answer.elapsed() >= config.ack_timeout {
                return Err(LinkError::Timeout(config.ack_timeout).into());
            }
            continue;
        };
        last_answer = Instant::now();

        match session.on_control(control)? {
            Step::Send(frame) => {
                sink.send_frame(frame.as_bytes())?;
                if session.frame_sent() {
                    let framer = session.framer();
                    events
                        .send(TransferEvent::Progress {
                            percent: framer.progress(),
                            bytes: framer.bytes_framed(),
                        })
                        .ok();
                }
            }
            Step::Wait => {}
            Step::Done => return Ok(()),
        }
    }
}

fn report(events: &Sender<TransferEvent>, err: &Error) {
    events
        .send(TransferEvent::Error {
            code: err.code(),
            message: err.to_string(),
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::OtaData;
    use crate::store::{test_store, PayloadStore};
    use std::sync::mpsc::channel;

    fn payload(store: &PayloadStore, len: usize) -> OtaData {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        OtaData::create(store, &bytes).unwrap()
    }

    fn sent(step: Step) -> Packet {
        match step {
            Step::Send(frame) => frame,
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[test]
    fn first_control_byte_wins() {
        assert_eq!(Control::detect(&[C]), Some(Control::Request));
        assert_eq!(Control::detect(b"xx\x4Eyy"), Some(Control::Request));
        assert_eq!(Control::detect(&[C, NAK]), Some(Control::Request));
        assert_eq!(Control::detect(&[NAK, C]), Some(Control::Nak));
        assert_eq!(Control::detect(&[NAK, EOT]), Some(Control::Nak));
        assert_eq!(Control::detect(&[0x00, EOT, C, NAK]), Some(Control::Eot));
        assert_eq!(Control::detect(&[0x00, 0x01]), None);
        assert_eq!(Control::detect(&[]), None);
    }

    #[test]
    fn nak_ahead_of_eot_resends() {
        let store = test_store();
        let data = payload(&store, 1000);
        let mut session = TransferSession::new(FrameKind::StxE, &data).unwrap();
        session.start();
        let first = sent(session.on_bytes(&[C]).unwrap());
        session.frame_sent();

        let again = sent(session.on_bytes(&[NAK, EOT]).unwrap());
        assert_eq!(again, first);
        assert_eq!(session.state(), TransferState::Retrying);
        assert_eq!(session.errors(), 1);
    }

    #[test]
    fn naks_below_limit_resend_same_frame() {
        let store = test_store();
        let data = payload(&store, 300);
        let mut session = TransferSession::new(FrameKind::StxE, &data).unwrap();
        session.start();

        let first = sent(session.on_control(Control::Request).unwrap());
        session.frame_sent();
        for n in 1..MAX_ERRORS {
            let again = sent(session.on_control(Control::Nak).unwrap());
            assert_eq!(again, first);
            assert_eq!(session.state(), TransferState::Retrying);
            session.frame_sent();
            assert_eq!(session.errors(), n);
        }

        let second = sent(session.on_control(Control::Request).unwrap());
        assert_ne!(second, first);
        assert_eq!(session.errors(), 0);
        assert_eq!(session.framer().index(), 1);
    }

    #[test]
    fn max_naks_abort() {
        let store = test_store();
        let data = payload(&store, 300);
        let mut session = TransferSession::new(FrameKind::StxE, &data).unwrap();
        session.start();
        sent(session.on_control(Control::Request).unwrap());
        session.frame_sent();

        for _ in 1..MAX_ERRORS {
            sent(session.on_control(Control::Nak).unwrap());
            session.frame_sent();
        }
        let err = session.on_control(Control::Nak).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::TooManyErrors { count: MAX_ERRORS, index: 0 })
        ));
        assert_eq!(err.code(), ErrorCode::DataTransfer);
        assert_eq!(session.state(), TransferState::Aborted);
        assert_eq!(session.on_control(Control::Request).unwrap(), Step::Wait);
    }

    #[test]
    fn finishes_on_eot_only() {
        let store = test_store();
        let data = payload(&store, 124);
        let mut session = TransferSession::new(FrameKind::StxE, &data).unwrap();
        session.start();
        sent(session.on_control(Control::Request).unwrap());
        session.frame_sent();

        assert_eq!(session.on_control(Control::Request).unwrap(), Step::Wait);
        assert_eq!(session.state(), TransferState::Finishing);
        assert_eq!(session.on_control(Control::Request).unwrap(), Step::Wait);
        assert_eq!(session.on_control(Control::Eot).unwrap(), Step::Done);
        assert_eq!(session.state(), TransferState::Done);
    }

    #[test]
    fn eot_after_last_frame_completes() {
        let store = test_store();
        let data = payload(&store, 10);
        let mut session = TransferSession::new(FrameKind::Soh, &data).unwrap();
        session.start();
        sent(session.on_bytes(&[0x00, C]).unwrap());
        session.frame_sent();
        assert_eq!(session.on_bytes(&[EOT]).unwrap(), Step::Done);
    }

    #[test]
    fn early_eot_is_a_protocol_error() {
        let store = test_store();
        let data = payload(&store, 300);
        let mut session = TransferSession::new(FrameKind::StxE, &data).unwrap();
        session.start();
        sent(session.on_control(Control::Request).unwrap());
        session.frame_sent();
        assert!(matches!(
            session.on_control(Control::Eot),
            Err(Error::Protocol(ProtocolError::UnexpectedControl {
                control: Control::Eot,
                state: TransferState::AwaitingAck,
            }))
        ));
    }

    struct Recorder(Vec<Vec<u8>>);

    impl FrameSink for Recorder {
        fn send_frame(&mut self, frame: &[u8]) -> Result<(), Error> {
            self.0.push(frame.to_vec());
            Ok(())
        }
    }

    #[test]
    fn run_reports_events() {
        let store = test_store();
        let data = payload(&store, 250);
        let (tx, rx) = channel();
        let (events_tx, events_rx) = channel();
        for run in [vec![C], vec![NAK], vec![C], vec![C], vec![C], vec![EOT]] {
            tx.send(run).unwrap();
        }

        let mut sink = Recorder(Vec::new());
        let stop = AtomicBool::new(false);
        let config = TransferConfig::new(FrameKind::StxE).poll_interval(Duration::from_millis(5));
        let state = run_transfer(&data, &config, &mut sink, &rx, &events_tx, &stop).unwrap();

        assert_eq!(state, TransferState::Done);
        assert_eq!(sink.0.len(), 4);
        assert_eq!(sink.0[0], sink.0[1]);

        let events: Vec<TransferEvent> = events_rx.try_iter().collect();
        assert_eq!(
            events.first(),
            Some(&TransferEvent::Started {
                total_bytes: 250,
                total_packets: 3
            })
        );
        assert_eq!(events.last(), Some(&TransferEvent::Success));
        assert!(events.contains(&TransferEvent::Progress {
            percent: 100.0,
            bytes: 250
        }));
    }

    #[test]
    fn silence_times_out() {
        let store = test_store();
        let data = payload(&store, 10);
        let (_tx, rx) = channel::<Vec<u8>>();
        let (events_tx, events_rx) = channel();
        let config = TransferConfig::new(FrameKind::Soh)
            .poll_interval(Duration::from_millis(5))
            .ack_timeout(Duration::from_millis(20));

        let err = run_transfer(
            &data,
            &config,
            &mut Recorder(Vec::new()),
            &rx,
            &events_tx,
            &AtomicBool::new(false),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Link(LinkError::Timeout(_))));
        assert!(matches!(
            events_rx.try_iter().last(),
            Some(TransferEvent::Error {
                code: ErrorCode::Link,
                ..
            })
        ));
    }

    #[test]
    fn chatter_does_not_hold_off_timeout() {
        let store = test_store();
        let data = payload(&store, 10);
        let (tx, rx) = channel::<Vec<u8>>();
        let (events_tx, _events_rx) = channel();
        let config = TransferConfig::new(FrameKind::Soh)
            .poll_interval(Duration::from_millis(5))
            .ack_timeout(Duration::from_millis(50));

        let noise = std::thread::spawn(move || {
            while tx.send(vec![0x00, 0x01]).is_ok() {
                std::thread::sleep(Duration::from_millis(1));
            }
        });
        let err = run_transfer(
            &data,
            &config,
            &mut Recorder(Vec::new()),
            &rx,
            &events_tx,
            &AtomicBool::new(false),
        )
        .unwrap_err();
        drop(rx);
        noise.join().unwrap();
        assert!(matches!(err, Error::Link(LinkError::Timeout(_))));
    }

    #[test]
    fn stop_flag_aborts() {
        let store = test_store();
        let data = payload(&store, 10);
        let (_tx, rx) = channel::<Vec<u8>>();
        let (events_tx, _events_rx) = channel();
        let stop = AtomicBool::new(true);
        let err = run_transfer(
            &data,
            &TransferConfig::new(FrameKind::Soh),
            &mut Recorder(Vec::new()),
            &rx,
            &events_tx,
            &stop,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::Stopped)));
    }
}
