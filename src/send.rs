// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sender state machine.

use crate::escape::EscapeMap;
use crate::file::{self, FileContext, FileSpec};
use crate::header::{Encoding, Frame, Header, Zrinit};
use crate::progress::{State, Tag};
use crate::session::{Core, BLOCK_MAX, BLOCK_MIN, TX_BUDGET, UPGRADE_BYTES};
use crate::subpacket::Terminator;
use crate::Error;
use core::fmt::Write as _;

/// ZSINIT flag demanding control-character escaping from the peer.
const TESCCTL: u8 = 0x40;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SendState {
    /// Nothing sent yet.
    Start,
    /// ZRQINIT out, waiting for the receiver's capabilities.
    RinitWait,
    /// ZSINIT out, waiting for its ZACK.
    SinitWait,
    /// ZFILE out, waiting for ZRPOS/ZSKIP/ZCRC.
    FileWait,
    /// Streaming data subpackets.
    Data,
    /// ZEOF out, waiting for the receiver's next ZRINIT.
    EofWait,
    /// ZFIN out, waiting for the echo before "OO".
    FinWait,
}

pub(crate) struct SendSide {
    state: SendState,
    files: Vec<FileSpec>,
    index: usize,
    /// ZCRCG subpackets still allowed before demanding an ACK.
    window_remaining: u32,
    waiting_ack: bool,
    /// The ZCRCW closing the file went out; ZEOF follows its ACK.
    eof_pending: bool,
    /// Bytes the receiver has confirmed.
    confirmed: u64,
    /// Confirmed-byte mark of the last block-size change.
    mark: u64,
    /// One rewind honored per streaming run; duplicates are dropped.
    zrpos_honored: bool,
}

impl SendSide {
    pub(crate) fn new(files: Vec<FileSpec>) -> Self {
        Self {
            state: SendState::Start,
            files,
            index: 0,
            window_remaining: 0,
            waiting_ack: false,
            eof_pending: false,
            confirmed: 0,
            mark: 0,
            zrpos_honored: false,
        }
    }

    pub(crate) fn start(&mut self, core: &mut Core) {
        // Conventional wakeup line so stock receivers auto-start.
        core.emit_raw(b"rz\r");
        core.emit_header(Header::new(Encoding::ZHEX, Frame::ZRQINIT, &[0; 4]));
        self.state = SendState::RinitWait;
    }

    pub(crate) fn on_garbage(&mut self, core: &mut Core) {
        core.soft_error(self.state == SendState::Data, "garbled header");
        if core.alive() {
            core.emit_header(Header::new(Encoding::ZHEX, Frame::ZNAK, &[0; 4]));
        }
    }

    pub(crate) fn on_frame(&mut self, core: &mut Core, header: &Header) {
        match header.frame() {
            Frame::ZABORT | Frame::ZFERR | Frame::ZCAN => {
                core.abort(Error::PeerCancel("RECEIVER"));
                return;
            }
            Frame::ZCOMMAND => {
                // Refused unconditionally; its payload is dropped as
                // line noise.
                core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZCOMPL, 1));
                return;
            }
            Frame::ZNAK => {
                core.soft_error(self.state == SendState::Data, "peer rejected last frame");
                if core.alive() {
                    self.resend(core);
                }
                return;
            }
            _ => {}
        }
        match (self.state, header.frame()) {
            (SendState::RinitWait, Frame::ZRINIT) => self.negotiate(core, header),
            (SendState::RinitWait, Frame::ZCHALLENGE) => {
                core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZACK, header.arg()));
            }
            (SendState::RinitWait, Frame::ZACK) => {
                core.emit_header(Header::new(Encoding::ZHEX, Frame::ZRQINIT, &[0; 4]));
            }
            (SendState::SinitWait, Frame::ZACK) => self.send_zfile(core),
            (SendState::SinitWait, Frame::ZRINIT) => {}
            (SendState::FileWait, Frame::ZRPOS) => self.begin_data(core, u64::from(header.arg())),
            (SendState::FileWait, Frame::ZSKIP) => {
                let name = core.snapshot.file_name.clone();
                core.event(Tag::FileSkip, &format!("skipped {name}"));
                self.advance(core);
            }
            (SendState::FileWait, Frame::ZCRC) => self.answer_zcrc(core, u64::from(header.arg())),
            (SendState::FileWait, Frame::ZRINIT) => self.emit_zfile(core),
            (SendState::FileWait, Frame::ZACK) => {}
            (SendState::Data, Frame::ZACK) => self.on_ack(core, u64::from(header.arg())),
            (SendState::Data, Frame::ZRPOS) => self.on_zrpos(core, u64::from(header.arg())),
            (SendState::Data, Frame::ZSKIP) => {
                let name = core.snapshot.file_name.clone();
                core.event(Tag::FileSkip, &format!("skipped {name}"));
                self.advance(core);
            }
            (SendState::EofWait, Frame::ZRINIT) => {
                core.snapshot.batch_done += core.snapshot.file_bytes;
                core.snapshot.state = State::FileDone;
                let name = core.snapshot.file_name.clone();
                core.event(Tag::FileEnd, &format!("sent {name}"));
                self.advance(core);
            }
            (SendState::EofWait, Frame::ZRPOS) => {
                core.soft_error(true, "receiver missed the file tail");
                if core.alive() {
                    self.begin_data(core, u64::from(header.arg()));
                }
            }
            (SendState::EofWait, Frame::ZACK) => {}
            (SendState::FinWait, Frame::ZFIN) => {
                core.emit_raw(b"OO");
                core.complete();
            }
            (SendState::FinWait, Frame::ZRINIT) => {
                core.emit_header(Header::new(Encoding::ZHEX, Frame::ZFIN, &[0; 4]));
            }
            (state, frame) => {
                log::error!("{frame:?} is not valid while the sender is in {state:?}");
                core.abort(Error::Protocol);
            }
        }
    }

    /// Streams data subpackets while the window and the output budget
    /// allow.
    pub(crate) fn pump(&mut self, core: &mut Core) -> bool {
        if self.state != SendState::Data || self.waiting_ack {
            return false;
        }
        let mut progress = false;
        while core.alive() && !self.waiting_ack && core.tx_len() < TX_BUDGET {
            let Some(file) = core.file.as_mut() else {
                break;
            };
            let mut buf = [0u8; BLOCK_MAX];
            let want = core.block_size.min(BLOCK_MAX);
            let got = match file.read_block(&mut buf[..want]) {
                Ok(n) => n,
                Err(error) => {
                    core.abort(error);
                    return progress;
                }
            };
            let position = file.position();
            let size = file.size();
            let last = got < want || position >= size;
            if last {
                core.emit_subpacket(&buf[..got], Terminator::ZCRCW);
                self.waiting_ack = true;
                self.eof_pending = true;
            } else if self.window_remaining == 0 {
                core.emit_subpacket(&buf[..got], Terminator::ZCRCQ);
                self.waiting_ack = true;
            } else {
                core.emit_subpacket(&buf[..got], Terminator::ZCRCG);
                self.window_remaining -= 1;
            }
            core.snapshot.blocks += 1;
            core.snapshot.file_bytes = position;
            core.snapshot.block_size = core.block_size;
            progress = true;
        }
        progress
    }

    pub(crate) fn resend(&mut self, core: &mut Core) {
        match self.state {
            SendState::Start => {}
            SendState::RinitWait => {
                core.emit_header(Header::new(Encoding::ZHEX, Frame::ZRQINIT, &[0; 4]));
            }
            SendState::SinitWait => self.emit_zsinit(core),
            SendState::FileWait => self.emit_zfile(core),
            SendState::Data => {
                // Re-anchor the stream at the last confirmed offset.
                let confirmed = self.confirmed;
                self.begin_data(core, confirmed);
            }
            SendState::EofWait => self.emit_zeof(core),
            SendState::FinWait => {
                core.emit_header(Header::new(Encoding::ZHEX, Frame::ZFIN, &[0; 4]));
            }
        }
    }

    fn negotiate(&mut self, core: &mut Core, header: &Header) {
        let peer = header.zrinit_flags();
        core.crc32 = core.cfg.crc32 && peer.contains(Zrinit::CANFC32);
        // Escape exactly the union of what the receiver asked for and
        // what this side requires.
        let escape_ctrl = core.cfg.escape_ctrl || peer.contains(Zrinit::ESCCTL);
        let escape_8bit = core.cfg.escape_8bit || peer.contains(Zrinit::ESC8);
        core.escape = EscapeMap::new(escape_ctrl, escape_8bit);
        log::debug!(
            "negotiated crc32={} escape_ctrl={escape_ctrl} escape_8bit={escape_8bit}",
            core.crc32
        );
        if core.cfg.escape_ctrl && !peer.contains(Zrinit::ESCCTL) {
            self.emit_zsinit(core);
            self.state = SendState::SinitWait;
        } else {
            self.send_zfile(core);
        }
    }

    fn emit_zsinit(&self, core: &mut Core) {
        core.emit_header(Header::new(
            Encoding::ZHEX,
            Frame::ZSINIT,
            &[0, 0, 0, TESCCTL],
        ));
        // Empty attention string.
        core.emit_subpacket(&[0], Terminator::ZCRCW);
    }

    /// Announces the current batch entry, or closes the batch when none
    /// remain.
    fn send_zfile(&mut self, core: &mut Core) {
        if self.index >= self.files.len() {
            core.emit_header(Header::new(Encoding::ZHEX, Frame::ZFIN, &[0; 4]));
            self.state = SendState::FinWait;
            return;
        }
        let spec = &self.files[self.index];
        core.snapshot.file_name = spec.name();
        core.snapshot.file_path = spec.path.clone();
        core.snapshot.file_size = spec.size;
        core.snapshot.file_bytes = 0;
        core.snapshot.blocks = 0;
        core.snapshot.state = State::Transferring;
        let name = spec.name();
        let size = spec.size;
        core.event(Tag::FileStart, &format!("sending {name} ({size} bytes)"));
        self.emit_zfile(core);
        self.state = SendState::FileWait;
    }

    fn emit_zfile(&self, core: &mut Core) {
        let spec = &self.files[self.index];
        let files_left = self.files.len() - self.index;
        let bytes_left: u64 = self.files[self.index..].iter().map(|f| f.size).sum();
        let mut meta: heapless::String<128> = heapless::String::new();
        let _ = write!(
            meta,
            "{} {:o} 0 0 {files_left} {bytes_left}",
            spec.size, spec.mtime
        );
        let mut payload = Vec::with_capacity(meta.len() + 64);
        payload.extend_from_slice(spec.name().as_bytes());
        payload.push(0);
        payload.extend_from_slice(meta.as_bytes());
        core.emit_header(Header::new(core.data_encoding(), Frame::ZFILE, &[0; 4]));
        core.emit_subpacket(&payload, Terminator::ZCRCW);
    }

    /// Answers the receiver's CRC probe over the first `len` bytes.
    fn answer_zcrc(&self, core: &mut Core, len: u64) {
        let path = self.files[self.index].path.clone();
        match file::prefix_crc32(&path, len) {
            Ok(crc) => {
                core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZCRC, crc));
            }
            Err(error) => core.abort(error),
        }
    }

    fn begin_data(&mut self, core: &mut Core, pos: u64) {
        if core.file.is_none() {
            match FileContext::open_send(&self.files[self.index]) {
                Ok(file) => core.file = Some(file),
                Err(error) => {
                    core.abort(error);
                    return;
                }
            }
        }
        let Some(file) = core.file.as_mut() else {
            return;
        };
        let size = file.size();
        self.waiting_ack = false;
        self.eof_pending = false;
        self.zrpos_honored = false;
        self.confirmed = pos.min(size);
        if pos >= size {
            if let Err(error) = file.seek(size) {
                core.abort(error);
                return;
            }
            self.emit_zeof(core);
            self.state = SendState::EofWait;
            return;
        }
        if let Err(error) = file.seek(pos) {
            core.abort(error);
            return;
        }
        core.emit_header(Header::with_arg(core.data_encoding(), Frame::ZDATA, pos as u32));
        self.state = SendState::Data;
        self.window_remaining = core.window();
        core.snapshot.state = State::Transferring;
        core.snapshot.file_bytes = pos;
        core.snapshot.block_size = core.block_size;
    }

    fn emit_zeof(&self, core: &mut Core) {
        let position = core.file.as_ref().map_or(0, FileContext::position);
        core.emit_header(Header::with_arg(
            core.data_encoding(),
            Frame::ZEOF,
            position as u32,
        ));
    }

    fn on_ack(&mut self, core: &mut Core, acked: u64) {
        if !self.waiting_ack {
            return;
        }
        self.waiting_ack = false;
        self.zrpos_honored = false;
        self.window_remaining = core.window();
        let Some(file) = core.file.as_ref() else {
            return;
        };
        let position = file.position();
        self.confirmed = acked;
        let outstanding = position.saturating_sub(acked) / core.block_size as u64;
        if outstanding >= 10 && core.block_size == BLOCK_MIN {
            core.abort(Error::LineNoise);
            return;
        }
        if outstanding >= 3 {
            core.reliable = false;
            core.block_size = (core.block_size / 2).max(BLOCK_MIN);
            self.mark = acked;
            core.soft_error(true, "receiver fell behind");
            if core.alive() {
                self.begin_data(core, acked);
            }
            return;
        }
        if acked < position {
            self.begin_data(core, acked);
            return;
        }
        if acked.saturating_sub(self.mark) > UPGRADE_BYTES && core.block_size < BLOCK_MAX {
            core.block_size *= 2;
            self.mark = acked;
        }
        if self.eof_pending {
            self.eof_pending = false;
            self.emit_zeof(core);
            self.state = SendState::EofWait;
        }
    }

    fn on_zrpos(&mut self, core: &mut Core, pos: u64) {
        if self.zrpos_honored {
            // Some peers repeat ZRPOS after a user-initiated skip while
            // the ZCRCW ACK is still pending.
            log::debug!("duplicate ZRPOS({pos}) dropped");
            return;
        }
        core.soft_error(true, "rewind requested");
        if !core.alive() {
            return;
        }
        core.reliable = false;
        core.block_size = (core.block_size / 2).max(BLOCK_MIN);
        self.mark = pos;
        self.begin_data(core, pos);
        self.zrpos_honored = true;
    }

    fn advance(&mut self, core: &mut Core) {
        core.file = None;
        self.index += 1;
        self.waiting_ack = false;
        self.eof_pending = false;
        self.send_zfile(core);
    }
}
