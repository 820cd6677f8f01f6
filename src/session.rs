// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session ownership and the `step` byte pump.

use crate::config::Config;
use crate::escape::EscapeMap;
use crate::file::{FileContext, FileSpec};
use crate::header::{Encoding, Header, Parsed};
use crate::progress::{EventSink, NullSink, Snapshot, State, Tag};
use crate::recv::RecvSide;
use crate::send::SendSide;
use crate::subpacket::{self, Terminator};
use crate::{Error, CAN, ZPAD};
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

/// Ceiling on bytes queued per `step` so one call performs a bounded
/// amount of work.
pub(crate) const TX_BUDGET: usize = 16 * 1024;

/// Smallest data subpacket after downgrades.
pub(crate) const BLOCK_MIN: usize = 32;

/// Largest data subpacket.
pub(crate) const BLOCK_MAX: usize = 1024;

/// Subpackets in flight before an ACK is demanded, clean link.
pub(crate) const WINDOW_RELIABLE: u32 = 32;

/// Subpackets in flight before an ACK is demanded after any error.
pub(crate) const WINDOW_UNRELIABLE: u32 = 4;

/// Clean confirmed bytes past the last downgrade before the block size
/// doubles.
pub(crate) const UPGRADE_BYTES: u64 = 8 * 1024;

/// Consecutive raw CAN bytes that cancel the session.
const CAN_RUN_FATAL: u32 = 4;

/// Result of one [`Session::step`] call.
#[derive(Clone, Copy, Debug)]
pub struct Step {
    /// Input bytes the engine took.
    pub consumed: usize,
    /// Wire bytes placed into the caller's output buffer.
    pub produced: usize,
    /// Coarse session state after the call.
    pub state: State,
}

/// What the input scanner handed the state machine.
pub(crate) enum Intake {
    Frame(Header),
    Garbage,
    Nothing,
}

/// Mutable state shared by both roles.
pub(crate) struct Core {
    pub(crate) cfg: Config,
    pub(crate) escape: EscapeMap,
    /// Negotiated CRC mode; 32-bit only when both peers agree.
    pub(crate) crc32: bool,
    pub(crate) rx: Vec<u8>,
    tx: Vec<u8>,
    deadline: Instant,
    pub(crate) timeouts: u32,
    /// Consecutive errors; resets on every valid frame.
    pub(crate) errors_run: u32,
    can_run: u32,
    pub(crate) fatal: Option<Error>,
    pub(crate) snapshot: Snapshot,
    sink: Box<dyn EventSink>,
    pub(crate) file: Option<FileContext>,
    /// True until the first error; never recovers within a session.
    pub(crate) reliable: bool,
    pub(crate) block_size: usize,
}

impl Core {
    fn new(cfg: Config) -> Self {
        let escape = EscapeMap::new(cfg.escape_ctrl, cfg.escape_8bit);
        let crc32 = cfg.crc32;
        let deadline = Instant::now() + cfg.timeout;
        let snapshot = Snapshot {
            block_size: BLOCK_MAX,
            started: Some(SystemTime::now()),
            ..Snapshot::default()
        };
        Self {
            cfg,
            escape,
            crc32,
            rx: Vec::new(),
            tx: Vec::new(),
            deadline,
            timeouts: 0,
            errors_run: 0,
            can_run: 0,
            fatal: None,
            snapshot,
            sink: Box::new(NullSink),
            file: None,
            reliable: true,
            block_size: BLOCK_MAX,
        }
    }

    /// Subpackets allowed before an ACK is demanded.
    pub(crate) fn window(&self) -> u32 {
        if self.reliable {
            WINDOW_RELIABLE
        } else {
            WINDOW_UNRELIABLE
        }
    }

    pub(crate) fn alive(&self) -> bool {
        self.fatal.is_none() && self.snapshot.state != State::Complete
    }

    /// Header encoding for binary data frames under the negotiated CRC
    /// mode.
    pub(crate) fn data_encoding(&self) -> Encoding {
        if self.crc32 {
            Encoding::ZBIN32
        } else {
            Encoding::ZBIN
        }
    }

    pub(crate) fn arm_timer(&mut self) {
        self.deadline = Instant::now() + self.cfg.timeout;
    }

    pub(crate) fn emit_header(&mut self, header: Header) {
        log::debug!("tx {:?} arg={:#x}", header.frame(), header.arg());
        header.encode(&mut self.tx, &self.escape);
        self.arm_timer();
    }

    pub(crate) fn emit_subpacket(&mut self, payload: &[u8], terminator: Terminator) {
        let crc32 = self.crc32;
        subpacket::encode(&mut self.tx, payload, terminator, crc32, &self.escape);
        self.arm_timer();
    }

    pub(crate) fn emit_raw(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
        self.arm_timer();
    }

    pub(crate) fn tx_len(&self) -> usize {
        self.tx.len()
    }

    pub(crate) fn event(&mut self, tag: Tag, message: &str) {
        self.snapshot.message = message.to_string();
        self.sink.event(tag, message);
    }

    /// Absorbs one transient error. Trips the LINE NOISE budget only
    /// outside data streaming.
    pub(crate) fn soft_error(&mut self, in_data: bool, what: &str) {
        self.errors_run += 1;
        self.snapshot.errors += 1;
        log::debug!("line error: {what}");
        self.event(Tag::Error, what);
        if !in_data && self.errors_run >= self.cfg.max_errors {
            self.abort(Error::LineNoise);
        }
    }

    pub(crate) fn abort(&mut self, error: Error) {
        if !self.alive() {
            return;
        }
        log::error!("session aborted: {error}");
        let message = error.to_string();
        self.file = None;
        self.fatal = Some(error);
        self.snapshot.state = State::Aborted;
        self.snapshot.finished = Some(SystemTime::now());
        self.event(Tag::SessionEnd, &message);
    }

    pub(crate) fn complete(&mut self) {
        if !self.alive() {
            return;
        }
        self.snapshot.state = State::Complete;
        self.snapshot.finished = Some(SystemTime::now());
        self.event(Tag::SessionEnd, "transfer complete");
    }

    /// Pulls the next header out of the input buffer, discarding noise
    /// ahead of the first ZPAD.
    pub(crate) fn take_frame(&mut self) -> Intake {
        let Some(start) = self.rx.iter().position(|&b| b == ZPAD) else {
            self.rx.clear();
            return Intake::Nothing;
        };
        if start > 0 {
            self.rx.drain(..start);
        }
        match Header::parse(&self.rx) {
            Parsed::Incomplete => Intake::Nothing,
            Parsed::Garbage { used } => {
                self.rx.drain(..used);
                Intake::Garbage
            }
            Parsed::Frame { header, used } => {
                self.rx.drain(..used);
                self.timeouts = 0;
                self.errors_run = 0;
                log::debug!("rx {:?} arg={:#x}", header.frame(), header.arg());
                Intake::Frame(header)
            }
        }
    }

    fn drain(&mut self, output: &mut [u8]) -> usize {
        let n = self.tx.len().min(output.len());
        output[..n].copy_from_slice(&self.tx[..n]);
        self.tx.drain(..n);
        n
    }
}

enum Side {
    Sender(SendSide),
    Receiver(RecvSide),
}

/// One ZMODEM batch transfer, either role.
///
/// The session is a pure byte pump: create it with [`Session::send`] or
/// [`Session::receive`], then call [`Session::step`] whenever peer
/// bytes arrive or the output buffer has drained, until the reported
/// state is terminal. The engine never blocks; the only real resources
/// it touches are the active file and the download directory.
pub struct Session {
    core: Core,
    side: Side,
    started: bool,
}

impl Session {
    /// Creates the sender side of a batch transfer.
    ///
    /// # Errors
    ///
    /// Fails when the batch is empty.
    pub fn send(files: Vec<FileSpec>, cfg: Config) -> Result<Self, Error> {
        if files.is_empty() {
            return Err(Error::from(std::io::Error::from(
                std::io::ErrorKind::InvalidInput,
            )));
        }
        let mut core = Core::new(cfg);
        core.snapshot.batch_bytes = files.iter().map(|f| f.size).sum();
        Ok(Self {
            core,
            side: Side::Sender(SendSide::new(files)),
            started: false,
        })
    }

    /// Creates the receiver side of a batch transfer, downloading into
    /// `dir`.
    ///
    /// # Errors
    ///
    /// Fails when `dir` is not an existing directory.
    pub fn receive(dir: impl Into<PathBuf>, cfg: Config) -> Result<Self, Error> {
        let dir = dir.into();
        if !std::fs::metadata(&dir)?.is_dir() {
            return Err(Error::from(std::io::Error::from(
                std::io::ErrorKind::InvalidInput,
            )));
        }
        Ok(Self {
            core: Core::new(cfg),
            side: Side::Receiver(RecvSide::new(dir)),
            started: false,
        })
    }

    /// Installs a host log sink replacing the default discard sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.core.sink = sink;
        self
    }

    /// Coarse session state.
    #[must_use]
    pub fn state(&self) -> State {
        self.core.snapshot.state
    }

    /// Point-in-time statistics.
    #[must_use]
    pub fn stats(&self) -> Snapshot {
        self.core.snapshot.clone()
    }

    /// Consumes peer bytes, advances the protocol and fills `output`
    /// with pending wire bytes. Bytes that do not fit stay queued and
    /// drain on later calls before any further protocol work.
    pub fn step(&mut self, input: &[u8], output: &mut [u8]) -> Step {
        if !self.core.alive() {
            let produced = self.core.drain(output);
            return Step {
                consumed: 0,
                produced,
                state: self.core.snapshot.state,
            };
        }
        let consumed = input.len();
        if !input.is_empty() {
            for &value in input {
                if value == CAN {
                    self.core.can_run += 1;
                } else {
                    self.core.can_run = 0;
                }
            }
            self.core.rx.extend_from_slice(input);
            self.core.arm_timer();
            if self.core.can_run >= CAN_RUN_FATAL {
                let peer = match self.side {
                    Side::Sender(_) => "RECEIVER",
                    Side::Receiver(_) => "SENDER",
                };
                self.core.abort(Error::PeerCancel(peer));
                let produced = self.core.drain(output);
                return Step {
                    consumed,
                    produced,
                    state: self.core.snapshot.state,
                };
            }
        }
        self.run();
        if self.core.alive() && Instant::now() >= self.core.deadline {
            self.on_timeout();
        }
        let produced = self.core.drain(output);
        Step {
            consumed,
            produced,
            state: self.core.snapshot.state,
        }
    }

    /// Cancels the session. With `save_partial` the current download is
    /// flushed and kept; otherwise it is removed from disk. The peer is
    /// notified with a CAN run.
    pub fn stop(&mut self, save_partial: bool) {
        if !self.core.alive() {
            return;
        }
        self.core.emit_raw(&[CAN; 5]);
        if let Some(file) = self.core.file.take() {
            if let Side::Receiver(_) = self.side {
                let result = if save_partial {
                    file.finish_recv()
                } else {
                    file.discard_recv()
                };
                if let Err(error) = result {
                    log::error!("cleanup failed: {error}");
                }
            }
        }
        self.core.abort(Error::Stopped);
    }

    fn run(&mut self) {
        let Session {
            core,
            side,
            started,
        } = self;
        if !*started {
            *started = true;
            match side {
                Side::Sender(s) => s.start(core),
                Side::Receiver(r) => r.start(core),
            }
        }
        loop {
            if !core.alive() || core.tx_len() >= TX_BUDGET {
                break;
            }
            let progress = match side {
                Side::Sender(s) => {
                    let mut progress = match core.take_frame() {
                        Intake::Frame(header) => {
                            s.on_frame(core, &header);
                            true
                        }
                        Intake::Garbage => {
                            s.on_garbage(core);
                            true
                        }
                        Intake::Nothing => false,
                    };
                    if core.alive() {
                        progress |= s.pump(core);
                    }
                    progress
                }
                Side::Receiver(r) => {
                    if r.wants_raw() {
                        r.on_raw(core)
                    } else {
                        match core.take_frame() {
                            Intake::Frame(header) => {
                                r.on_frame(core, &header);
                                true
                            }
                            Intake::Garbage => {
                                r.on_garbage(core);
                                true
                            }
                            Intake::Nothing => false,
                        }
                    }
                }
            };
            if !progress {
                break;
            }
        }
    }

    fn on_timeout(&mut self) {
        let Session { core, side, .. } = self;
        core.timeouts += 1;
        log::debug!("inactivity timeout {}", core.timeouts);
        if core.timeouts >= core.cfg.max_timeouts {
            core.abort(Error::TooManyTimeouts);
            return;
        }
        match side {
            Side::Sender(s) => s.resend(core),
            Side::Receiver(r) => r.resend(core),
        }
        core.arm_timer();
    }
}
