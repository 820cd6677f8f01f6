// SPDX-License-Identifier: MIT OR Apache-2.0
//! Receiver state machine.

use crate::file::{self, FileContext};
use crate::header::{Encoding, Frame, Header, Zrinit};
use crate::progress::{State, Tag};
use crate::session::Core;
use crate::subpacket::{Decoder, Output};
use crate::{Error, ZPAD};
use core::str::FromStr;
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RecvState {
    /// Nothing sent yet.
    Start,
    /// ZCHALLENGE out, waiting for the echo.
    ChallengeWait,
    /// ZRINIT out, waiting for ZFILE or ZFIN.
    RinitWait,
    /// Collecting the subpacket that follows a ZFILE header.
    FilePayload,
    /// Collecting the attention string after a ZSINIT header.
    SinitPayload,
    /// Collecting (and discarding) a ZCOMMAND payload.
    CommandPayload,
    /// ZCRC probe out, waiting for the sender's file CRC.
    CrcWait,
    /// Inside a file: ZDATA frames and their subpackets.
    Data,
    /// ZFIN exchanged, waiting for the sender's "OO".
    OoWait,
}

/// How the on-disk file relates to the announced one while a ZCRC probe
/// is in flight.
enum Query {
    /// Same length; a CRC match means the file is already here.
    Full,
    /// Shorter prefix of `n` bytes; a CRC match resumes at `n`.
    Prefix(u64),
}

/// A ZFILE announcement awaiting its open/resume/skip decision.
struct Pending {
    name: heapless::String<256>,
    size: u64,
    mtime: u64,
    bytes_left: u64,
    target: PathBuf,
    query: Option<Query>,
}

pub(crate) struct RecvSide {
    state: RecvState,
    dir: PathBuf,
    decoder: Decoder,
    /// Inside a ZDATA frame, consuming subpackets rather than headers.
    in_subpackets: bool,
    pending: Option<Pending>,
    challenge: Option<u32>,
    /// Consecutive 'O' bytes seen while waiting for the sign-off.
    oo: u8,
    /// Our opening advertisement is still in flight; a ZRQINIT that
    /// crossed it on the wire does not deserve another copy.
    just_sent_init: bool,
}

impl RecvSide {
    pub(crate) fn new(dir: PathBuf) -> Self {
        Self {
            state: RecvState::Start,
            dir,
            decoder: Decoder::new(true),
            in_subpackets: false,
            pending: None,
            challenge: None,
            oo: 0,
            just_sent_init: false,
        }
    }

    pub(crate) fn start(&mut self, core: &mut Core) {
        if core.cfg.zchallenge {
            let value: u32 = rand::random();
            self.challenge = Some(value);
            core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZCHALLENGE, value));
            self.state = RecvState::ChallengeWait;
        } else {
            self.emit_zrinit(core);
            self.state = RecvState::RinitWait;
        }
        self.just_sent_init = true;
    }

    /// Whether the next input bytes bypass header parsing.
    pub(crate) fn wants_raw(&self) -> bool {
        matches!(
            self.state,
            RecvState::FilePayload
                | RecvState::SinitPayload
                | RecvState::CommandPayload
                | RecvState::OoWait
        ) || (self.state == RecvState::Data && self.in_subpackets)
    }

    pub(crate) fn on_raw(&mut self, core: &mut Core) -> bool {
        if core.rx.is_empty() {
            return false;
        }
        match self.state {
            RecvState::OoWait => {
                let mut done = false;
                let mut fin_again = false;
                for &value in &core.rx {
                    if value == b'O' {
                        self.oo += 1;
                        if self.oo >= 2 {
                            done = true;
                            break;
                        }
                    } else {
                        self.oo = 0;
                        // A header here means the sender never saw our
                        // ZFIN.
                        fin_again |= value == ZPAD;
                    }
                }
                core.rx.clear();
                if done {
                    core.complete();
                } else if fin_again {
                    core.emit_header(Header::new(Encoding::ZHEX, Frame::ZFIN, &[0; 4]));
                }
                true
            }
            RecvState::Data => self.on_data_bytes(core),
            _ => self.on_payload_bytes(core),
        }
    }

    pub(crate) fn on_garbage(&mut self, core: &mut Core) {
        let in_data = self.state == RecvState::Data;
        core.soft_error(in_data, "garbled header");
        if !core.alive() {
            return;
        }
        if in_data {
            self.emit_zrpos(core);
        } else {
            core.emit_header(Header::new(Encoding::ZHEX, Frame::ZNAK, &[0; 4]));
        }
    }

    pub(crate) fn on_frame(&mut self, core: &mut Core, header: &Header) {
        let crossed = self.just_sent_init;
        self.just_sent_init = false;
        match header.frame() {
            Frame::ZABORT | Frame::ZFERR | Frame::ZCAN => {
                core.abort(Error::PeerCancel("SENDER"));
                return;
            }
            Frame::ZCOMMAND => {
                // Recognized only to be refused; drain the payload so
                // it is not mistaken for frames.
                self.decoder.reset();
                self.decoder
                    .set_crc32(header.encoding() == Encoding::ZBIN32);
                self.state = RecvState::CommandPayload;
                return;
            }
            Frame::ZFREECNT => {
                // Free space is not reported.
                core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZACK, 0));
                return;
            }
            Frame::ZNAK => {
                core.soft_error(self.state == RecvState::Data, "peer rejected last frame");
                if core.alive() {
                    self.resend(core);
                }
                return;
            }
            _ => {}
        }
        match (self.state, header.frame()) {
            (RecvState::ChallengeWait, Frame::ZACK) => {
                if Some(header.arg()) == self.challenge {
                    self.emit_zrinit(core);
                    self.state = RecvState::RinitWait;
                } else {
                    core.abort(Error::ChallengeMismatch);
                }
            }
            (RecvState::ChallengeWait, Frame::ZRQINIT) => match self.challenge {
                Some(value) if !crossed => {
                    core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZCHALLENGE, value));
                    self.just_sent_init = true;
                }
                _ => {}
            },
            (RecvState::RinitWait, Frame::ZRQINIT) => {
                if !crossed {
                    self.emit_zrinit(core);
                    self.just_sent_init = true;
                }
            }
            (RecvState::RinitWait, Frame::ZACK) => {}
            (RecvState::RinitWait, Frame::ZEOF | Frame::ZDATA) => self.emit_zrinit(core),
            (RecvState::RinitWait, Frame::ZFILE) => {
                self.decoder.reset();
                self.decoder
                    .set_crc32(header.encoding() == Encoding::ZBIN32);
                self.state = RecvState::FilePayload;
            }
            (RecvState::RinitWait, Frame::ZSINIT) => {
                self.decoder.reset();
                // The attention subpacket follows the session CRC mode
                // even though the ZSINIT header itself is hex.
                let crc32 = core.crc32;
                self.decoder.set_crc32(crc32);
                self.state = RecvState::SinitPayload;
            }
            (RecvState::RinitWait, Frame::ZFIN) => {
                core.emit_header(Header::new(Encoding::ZHEX, Frame::ZFIN, &[0; 4]));
                self.oo = 0;
                self.state = RecvState::OoWait;
            }
            (RecvState::CrcWait, Frame::ZCRC) => self.on_crc_answer(core, header.arg()),
            (RecvState::CrcWait, Frame::ZFILE) => {}
            (RecvState::Data, Frame::ZDATA) => {
                let pos = u64::from(header.arg());
                let position = core.file.as_ref().map_or(0, FileContext::position);
                if pos == position {
                    self.decoder.reset();
                    self.decoder
                        .set_crc32(header.encoding() == Encoding::ZBIN32);
                    self.in_subpackets = true;
                } else {
                    core.soft_error(true, "data offset mismatch");
                    if core.alive() {
                        self.emit_zrpos(core);
                    }
                }
            }
            (RecvState::Data, Frame::ZEOF) => {
                let pos = u64::from(header.arg());
                let position = core.file.as_ref().map_or(0, FileContext::position);
                if pos == position {
                    self.finish_file(core);
                } else {
                    // A fresh ZDATA for the missing span is on its way.
                    log::error!("ZEOF offset mismatch: frame({pos}) != recv({position})");
                }
            }
            (RecvState::Data, Frame::ZFILE) => self.emit_zrpos(core),
            (state, frame) => {
                log::error!("{frame:?} is not valid while the receiver is in {state:?}");
                core.abort(Error::Protocol);
            }
        }
    }

    pub(crate) fn resend(&mut self, core: &mut Core) {
        match self.state {
            RecvState::Start => {}
            RecvState::ChallengeWait => {
                if let Some(value) = self.challenge {
                    core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZCHALLENGE, value));
                }
            }
            RecvState::RinitWait => self.emit_zrinit(core),
            RecvState::FilePayload | RecvState::SinitPayload | RecvState::CommandPayload => {
                self.decoder.reset();
                self.state = RecvState::RinitWait;
                core.emit_header(Header::new(Encoding::ZHEX, Frame::ZNAK, &[0; 4]));
            }
            RecvState::CrcWait => {
                let len = match self.pending.as_ref().and_then(|p| p.query.as_ref()) {
                    Some(Query::Prefix(n)) => *n,
                    Some(Query::Full) => self.pending.as_ref().map_or(0, |p| p.size),
                    None => 0,
                };
                core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZCRC, len as u32));
            }
            RecvState::Data => {
                self.decoder.reset();
                self.in_subpackets = false;
                self.emit_zrpos(core);
            }
            // The transfer is fully acknowledged already; a lost "OO"
            // is not worth an abort.
            RecvState::OoWait => core.complete(),
        }
    }

    fn emit_zrinit(&mut self, core: &mut Core) {
        let mut flags = Zrinit::CANFDX | Zrinit::CANOVIO;
        if core.cfg.crc32 {
            flags |= Zrinit::CANFC32;
        }
        if core.cfg.escape_ctrl {
            flags |= Zrinit::ESCCTL;
        }
        if core.cfg.escape_8bit {
            flags |= Zrinit::ESC8;
        }
        core.emit_header(Header::zrinit(flags));
        self.in_subpackets = false;
    }

    fn emit_zrpos(&mut self, core: &mut Core) {
        let position = core.file.as_ref().map_or(0, FileContext::position);
        core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZRPOS, position as u32));
    }

    /// Feeds subpacket bytes of the active ZDATA frame to the decoder.
    fn on_data_bytes(&mut self, core: &mut Core) -> bool {
        let (used, output) = self.decoder.feed(&core.rx);
        core.rx.drain(..used);
        match output {
            Output::Pending => used > 0,
            Output::Frame(terminator) => {
                let Some(file) = core.file.as_mut() else {
                    self.in_subpackets = false;
                    return true;
                };
                let len = self.decoder.payload().len();
                if let Err(error) = file.write_block(self.decoder.payload()) {
                    core.abort(error);
                    return true;
                }
                let position = file.position();
                self.decoder.reset();
                core.timeouts = 0;
                core.errors_run = 0;
                core.snapshot.file_bytes = position;
                core.snapshot.blocks += 1;
                // A file's closing subpacket may run short; only full
                // blocks reflect the sender's current size.
                if len > 0 && !terminator.ends_frame() {
                    core.snapshot.block_size = len;
                }
                if terminator.wants_ack() {
                    core.emit_header(Header::with_arg(
                        Encoding::ZHEX,
                        Frame::ZACK,
                        position as u32,
                    ));
                }
                if terminator.ends_frame() {
                    self.in_subpackets = false;
                }
                true
            }
            Output::Malformed => {
                core.soft_error(true, "data subpacket failed validation");
                self.decoder.reset();
                self.in_subpackets = false;
                // Everything buffered behind the failure belongs to the
                // same dead burst; flush it before re-anchoring.
                core.rx.clear();
                if core.alive() {
                    self.emit_zrpos(core);
                }
                true
            }
        }
    }

    /// Feeds the subpacket that follows ZFILE, ZSINIT or ZCOMMAND.
    fn on_payload_bytes(&mut self, core: &mut Core) -> bool {
        let (used, output) = self.decoder.feed(&core.rx);
        core.rx.drain(..used);
        match output {
            Output::Pending => used > 0,
            Output::Frame(_) => {
                core.timeouts = 0;
                core.errors_run = 0;
                match self.state {
                    RecvState::FilePayload => self.on_zfile_payload(core),
                    RecvState::SinitPayload => {
                        self.decoder.reset();
                        core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZACK, 0));
                        self.state = RecvState::RinitWait;
                    }
                    _ => {
                        // ZCOMMAND is a remote-execution hole; answer
                        // "failed" and move on.
                        self.decoder.reset();
                        core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZCOMPL, 1));
                        self.state = RecvState::RinitWait;
                    }
                }
                true
            }
            Output::Malformed => {
                core.soft_error(false, "bad control subpacket");
                self.decoder.reset();
                self.state = RecvState::RinitWait;
                if core.alive() {
                    core.emit_header(Header::new(Encoding::ZHEX, Frame::ZNAK, &[0; 4]));
                }
                true
            }
        }
    }

    fn on_zfile_payload(&mut self, core: &mut Core) {
        let payload = self.decoder.payload().to_vec();
        self.decoder.reset();
        let Some(pending) = parse_zfile(&payload, &self.dir) else {
            core.soft_error(false, "unusable file announcement");
            self.state = RecvState::RinitWait;
            if core.alive() {
                core.emit_header(Header::new(Encoding::ZHEX, Frame::ZNAK, &[0; 4]));
            }
            return;
        };
        core.snapshot.file_name = pending.name.as_str().to_string();
        core.snapshot.file_path = pending.target.clone();
        core.snapshot.file_size = pending.size;
        core.snapshot.file_bytes = 0;
        core.snapshot.blocks = 0;
        core.snapshot.state = State::Transferring;
        if core.snapshot.batch_bytes == 0 {
            core.snapshot.batch_bytes = pending.bytes_left.max(pending.size);
        }
        let name = pending.name.as_str();
        let size = pending.size;
        core.event(Tag::FileStart, &format!("receiving {name} ({size} bytes)"));
        self.decide(core, pending);
    }

    /// The resume decision tree: open fresh, probe with ZCRC, or divert
    /// to a `.NNNN` sibling.
    fn decide(&mut self, core: &mut Core, mut pending: Pending) {
        match file::stat_len(&pending.target) {
            Err(error) => core.abort(error),
            Ok(None) | Ok(Some(0)) => {
                let target = pending.target.clone();
                self.open_at(core, &pending, target, 0);
            }
            Ok(Some(disk)) if disk > pending.size => {
                match file::collision_path(&self.dir, pending.name.as_str()) {
                    Ok(path) => self.open_at(core, &pending, path, 0),
                    Err(error) => core.abort(error),
                }
            }
            Ok(Some(disk)) => {
                pending.query = Some(if disk == pending.size {
                    Query::Full
                } else {
                    Query::Prefix(disk)
                });
                core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZCRC, disk as u32));
                self.pending = Some(pending);
                self.state = RecvState::CrcWait;
            }
        }
    }

    /// Handles the sender's CRC over the probed prefix.
    fn on_crc_answer(&mut self, core: &mut Core, remote: u32) {
        let Some(pending) = self.pending.take() else {
            core.abort(Error::Protocol);
            return;
        };
        let (len, whole_file) = match pending.query {
            Some(Query::Full) => (pending.size, true),
            Some(Query::Prefix(n)) => (n, false),
            None => {
                core.abort(Error::Protocol);
                return;
            }
        };
        let local = match file::prefix_crc32(&pending.target, len) {
            Ok(crc) => crc,
            Err(error) => {
                core.abort(error);
                return;
            }
        };
        if local == remote {
            if whole_file {
                let name = pending.name.as_str();
                core.snapshot.batch_done += pending.size;
                core.snapshot.file_bytes = pending.size;
                core.event(Tag::FileSkip, &format!("{name} is already here"));
                core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZSKIP, 0));
                self.state = RecvState::RinitWait;
            } else {
                // Crash recovery: the prefix matches, continue where
                // the previous session died.
                let target = pending.target.clone();
                self.open_at(core, &pending, target, len);
            }
        } else {
            match file::collision_path(&self.dir, pending.name.as_str()) {
                Ok(path) => self.open_at(core, &pending, path, 0),
                Err(error) => core.abort(error),
            }
        }
    }

    fn open_at(&mut self, core: &mut Core, pending: &Pending, path: PathBuf, pos: u64) {
        core.snapshot.file_path = path.clone();
        match FileContext::create_recv(path, pending.name.as_str(), pending.size, pending.mtime) {
            Ok(mut file) => {
                if let Err(error) = file.seek(pos) {
                    core.abort(error);
                    return;
                }
                core.file = Some(file);
                core.snapshot.file_bytes = pos;
                core.emit_header(Header::with_arg(Encoding::ZHEX, Frame::ZRPOS, pos as u32));
                self.decoder.reset();
                self.in_subpackets = false;
                self.state = RecvState::Data;
            }
            Err(error) => core.abort(error),
        }
    }

    fn finish_file(&mut self, core: &mut Core) {
        let Some(file) = core.file.take() else {
            return;
        };
        let name = file.name().to_string();
        if let Err(error) = file.finish_recv() {
            core.abort(error);
            return;
        }
        core.snapshot.batch_done += core.snapshot.file_bytes;
        core.snapshot.state = State::FileDone;
        core.event(Tag::FileEnd, &format!("received {name}"));
        self.emit_zrinit(core);
        self.state = RecvState::RinitWait;
    }
}

/// Splits a ZFILE payload into the announced name and its metadata
/// line.
fn parse_zfile(payload: &[u8], dir: &Path) -> Option<Pending> {
    let mut split = payload.splitn(2, |&b| b == 0);
    let name_bytes = split.next()?;
    if name_bytes.is_empty() || name_bytes.len() > 255 {
        return None;
    }
    let announced = core::str::from_utf8(name_bytes).ok()?;
    // Basename only; the announcement must not reach outside the
    // download directory.
    let name_str = announced.rsplit(['/', '\\']).next()?;
    if name_str.is_empty() {
        return None;
    }
    let name = heapless::String::from_str(name_str).ok()?;
    let meta = split.next().unwrap_or(&[]);
    let meta = core::str::from_utf8(meta).ok()?.trim_matches('\0');
    let mut fields = meta.split_ascii_whitespace();
    let size: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
    let mtime = fields
        .next()
        .and_then(|f| u64::from_str_radix(f, 8).ok())
        .unwrap_or(0);
    let _mode = fields.next();
    let _serial = fields.next();
    let _files_left = fields.next();
    let bytes_left: u64 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(size);
    Some(Pending {
        name,
        size,
        mtime,
        bytes_left,
        target: dir.join(name_str),
        query: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_zfile_fields() {
        let dir = Path::new("/tmp/downloads");
        let mut payload = b"a.bin\0".to_vec();
        payload.extend_from_slice(b"3072 17555143660 0 0 2 4096");
        let pending = parse_zfile(&payload, dir).unwrap();
        assert_eq!(pending.name.as_str(), "a.bin");
        assert_eq!(pending.size, 3072);
        assert_eq!(pending.mtime, 0o17_555_143_660);
        assert_eq!(pending.bytes_left, 4096);
        assert_eq!(pending.target, dir.join("a.bin"));
    }

    #[test]
    fn test_parse_zfile_strips_directories() {
        let dir = Path::new("/tmp/downloads");
        let payload = b"../../etc/passwd\0 16 0 0 0 1 16".to_vec();
        let pending = parse_zfile(&payload, dir).unwrap();
        assert_eq!(pending.name.as_str(), "passwd");
        assert_eq!(pending.target, dir.join("passwd"));
    }

    #[test]
    fn test_parse_zfile_tolerates_bare_name() {
        let pending = parse_zfile(b"notes.txt", Path::new(".")).unwrap();
        assert_eq!(pending.size, 0);
        assert_eq!(pending.bytes_left, 0);
    }

    #[test]
    fn test_parse_zfile_rejects_empty_name() {
        assert!(parse_zfile(b"\0 10 0 0 0 1 10", Path::new(".")).is_none());
    }
}
