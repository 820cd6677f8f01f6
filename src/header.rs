// SPDX-License-Identifier: MIT OR Apache-2.0
//! ZMODEM frame headers.

use crate::crc;
use crate::escape::{self, EscapeMap};
use crate::{XON, ZDLE, ZPAD};
use core::convert::TryFrom;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tinyvec::{array_vec, ArrayVec};

/// The ZMODEM frame encoding
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
pub enum Encoding {
    ZBIN = 0x41,
    ZHEX = 0x42,
    ZBIN32 = 0x43,
}

impl TryFrom<u8> for Encoding {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Encoding::iter().find(|e| value == *e as u8).ok_or(())
    }
}

/// Frame types
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
pub enum Frame {
    /// Request receive init
    ZRQINIT = 0,
    /// Receiver capabilities and packet size
    ZRINIT = 1,
    /// Send init sequence (optional)
    ZSINIT = 2,
    /// ACK to above
    ZACK = 3,
    /// File name from sender
    ZFILE = 4,
    /// To sender: skip this file
    ZSKIP = 5,
    /// Last packet was garbled
    ZNAK = 6,
    /// Abort batch transfers
    ZABORT = 7,
    /// Finish session
    ZFIN = 8,
    /// Resume data trans at this position
    ZRPOS = 9,
    /// Data packet(s) follow
    ZDATA = 10,
    /// End of file
    ZEOF = 11,
    /// Fatal Read or Write error Detected
    ZFERR = 12,
    /// Request for file CRC and response
    ZCRC = 13,
    /// Receiver's Challenge
    ZCHALLENGE = 14,
    /// Request is complete
    ZCOMPL = 15,
    /// Other end canned session with CAN*5
    ZCAN = 16,
    /// Request for free bytes on filesystem
    ZFREECNT = 17,
    /// Command from sending program, refused by this engine
    ZCOMMAND = 18,
}

impl TryFrom<u8> for Frame {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Frame::iter().find(|t| value == *t as u8).ok_or(())
    }
}

impl Frame {
    /// Frame types whose argument rides the wire little-endian. The
    /// split does not follow from any simpler rule; it is the set peer
    /// implementations agree on.
    pub const fn arg_little_endian(self) -> bool {
        matches!(
            self,
            Frame::ZRPOS
                | Frame::ZEOF
                | Frame::ZCRC
                | Frame::ZCOMPL
                | Frame::ZFREECNT
                | Frame::ZSINIT
        )
    }
}

bitflags::bitflags! {
   /// `ZRINIT` flags
   #[derive(Clone, Copy, Debug, PartialEq, Eq)]
   pub struct Zrinit: u8 {
        /// Can send and receive in full-duplex
        const CANFDX = 0x01;
        /// Can receive data in parallel with disk I/O
        const CANOVIO = 0x02;
        /// Can send a break signal
        const CANBRK = 0x04;
        /// Can decrypt
        const CANCRY = 0x08;
        /// Can uncompress
        const CANLZW = 0x10;
        /// Can use 32-bit frame check
        const CANFC32 = 0x20;
        /// Expects control characters to be escaped
        const ESCCTL = 0x40;
        /// Expects 8th bit to be escaped
        const ESC8 = 0x80;
    }
}

/// Outcome of scanning the input buffer for one header.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed {
    /// A complete, valid header and the bytes it consumed.
    Frame { header: Header, used: usize },
    /// The buffer ends mid-header; feed more input and retry.
    Incomplete,
    /// Framing or CRC failure; drop `used` bytes and count an error.
    Garbage { used: usize },
}

/// A ZMODEM header: the frame type plus its four flag/argument bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    encoding: Encoding,
    frame: Frame,
    flags: [u8; 4],
}

impl Header {
    #[must_use]
    pub const fn new(encoding: Encoding, frame: Frame, flags: &[u8; 4]) -> Self {
        Self {
            encoding,
            frame,
            flags: *flags,
        }
    }

    /// Creates a header carrying a 32-bit argument in the byte order the
    /// frame type demands.
    #[must_use]
    pub fn with_arg(encoding: Encoding, frame: Frame, arg: u32) -> Self {
        let flags = if frame.arg_little_endian() {
            arg.to_le_bytes()
        } else {
            arg.to_be_bytes()
        };
        Self {
            encoding,
            frame,
            flags,
        }
    }

    /// Creates the hex ZRINIT advertisement with the capability bits in
    /// their conventional slot.
    #[must_use]
    pub fn zrinit(flags: Zrinit) -> Self {
        Self::new(Encoding::ZHEX, Frame::ZRINIT, &[0, 0, 0, flags.bits()])
    }

    #[must_use]
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    #[must_use]
    pub const fn frame(&self) -> Frame {
        self.frame
    }

    #[must_use]
    pub const fn flags(&self) -> &[u8; 4] {
        &self.flags
    }

    /// The 32-bit argument, honoring the per-type byte order.
    #[must_use]
    pub fn arg(&self) -> u32 {
        if self.frame.arg_little_endian() {
            u32::from_le_bytes(self.flags)
        } else {
            u32::from_be_bytes(self.flags)
        }
    }

    /// Capability bits of a ZRINIT header.
    #[must_use]
    pub fn zrinit_flags(&self) -> Zrinit {
        Zrinit::from_bits_truncate(self.flags[3])
    }

    /// Serializes the header to the wire, escape-processing binary
    /// bodies with the session map.
    pub fn encode(&self, out: &mut Vec<u8>, escape: &EscapeMap) {
        out.push(ZPAD);
        if self.encoding == Encoding::ZHEX {
            out.push(ZPAD);
        }
        out.push(ZDLE);
        out.push(self.encoding as u8);
        let mut body: ArrayVec<[u8; 9]> = array_vec!();
        body.push(self.frame as u8);
        body.extend_from_slice(&self.flags);
        match self.encoding {
            Encoding::ZHEX => {
                let crc = crc::header_crc16(&body);
                body.extend_from_slice(&crc);
                let mut hexed = [0u8; 14];
                hex::encode_to_slice(&body, &mut hexed).unwrap();
                out.extend_from_slice(&hexed);
                // CR then LF with the high bit set; strict peers check
                // the 0x8A.
                out.push(0x0d);
                out.push(0x8a);
                if self.frame != Frame::ZACK && self.frame != Frame::ZFIN {
                    out.push(XON);
                }
            }
            Encoding::ZBIN => {
                let crc = crc::header_crc16(&body);
                body.extend_from_slice(&crc);
                escape.encode_into(&body, out);
            }
            Encoding::ZBIN32 => {
                let crc = crc::header_crc32(&body);
                body.extend_from_slice(&crc);
                escape.encode_into(&body, out);
            }
        }
    }

    /// Parses one header from `buf`, which must begin at a ZPAD.
    ///
    /// The parser strips the leading ZPAD run, accepts any of the three
    /// encodings, tolerates a plain 0x0A in place of the 0x8A hex
    /// trailer and leaves any trailing XON for the inter-frame scan.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Parsed {
        let mut i = 0;
        while i < buf.len() && buf[i] == ZPAD {
            i += 1;
        }
        if i >= buf.len() {
            return Parsed::Incomplete;
        }
        if buf[i] != ZDLE {
            return Parsed::Garbage { used: i + 1 };
        }
        i += 1;
        if i >= buf.len() {
            return Parsed::Incomplete;
        }
        let Ok(encoding) = Encoding::try_from(buf[i]) else {
            return Parsed::Garbage { used: i + 1 };
        };
        i += 1;
        match encoding {
            Encoding::ZHEX => Self::parse_hex(buf, i),
            Encoding::ZBIN | Encoding::ZBIN32 => Self::parse_binary(buf, i, encoding),
        }
    }

    fn parse_hex(buf: &[u8], mut i: usize) -> Parsed {
        if buf.len() < i + 14 {
            return Parsed::Incomplete;
        }
        let mut body = [0u8; 7];
        if hex::decode_to_slice(&buf[i..i + 14], &mut body).is_err() {
            return Parsed::Garbage { used: i + 1 };
        }
        i += 14;
        // CR/LF trailer, with or without the high bit.
        while i < buf.len() && matches!(buf[i] & 0x7f, 0x0d | 0x0a) {
            i += 1;
        }
        Self::finish(&body, Encoding::ZHEX, i)
    }

    fn parse_binary(buf: &[u8], mut i: usize, encoding: Encoding) -> Parsed {
        let need = if encoding == Encoding::ZBIN32 { 9 } else { 7 };
        let mut body: ArrayVec<[u8; 9]> = array_vec!();
        while body.len() < need {
            if i >= buf.len() {
                return Parsed::Incomplete;
            }
            let value = buf[i];
            i += 1;
            if value == ZDLE {
                if i >= buf.len() {
                    return Parsed::Incomplete;
                }
                body.push(escape::unescape(buf[i]));
                i += 1;
            } else {
                body.push(value);
            }
        }
        Self::finish(&body, encoding, i)
    }

    fn finish(body: &[u8], encoding: Encoding, used: usize) -> Parsed {
        let (fields, wire_crc) = body.split_at(5);
        let ok = match encoding {
            Encoding::ZBIN32 => crc::header_crc32(fields)[..] == *wire_crc,
            Encoding::ZBIN | Encoding::ZHEX => crc::header_crc16(fields)[..] == *wire_crc,
        };
        if !ok {
            return Parsed::Garbage { used };
        }
        let Ok(frame) = Frame::try_from(fields[0]) else {
            return Parsed::Garbage { used };
        };
        let mut flags = [0u8; 4];
        flags.copy_from_slice(&fields[1..5]);
        Parsed::Frame {
            header: Header::new(encoding, frame, &flags),
            used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear() -> EscapeMap {
        EscapeMap::new(false, false)
    }

    #[rstest::rstest]
    #[case(Encoding::ZBIN, Frame::ZRQINIT, &[0; 4], &[ZPAD, ZDLE, 0x41, 0, 0, 0, 0, 0, 0, 0])]
    #[case(Encoding::ZBIN32, Frame::ZRQINIT, &[0; 4], &[ZPAD, ZDLE, 0x43, 0, 0, 0, 0, 0, 29, 247, 34, 198])]
    #[case(Encoding::ZBIN, Frame::ZRQINIT, &[1; 4], &[ZPAD, ZDLE, 0x41, 0, 1, 1, 1, 1, 98, 148])]
    #[case(Encoding::ZHEX, Frame::ZRQINIT, &[1; 4], &[ZPAD, ZPAD, ZDLE, 0x42, b'0', b'0', b'0', b'1', b'0', b'1', b'0', b'1', b'0', b'1', b'6', b'2', b'9', b'4', 0x0d, 0x8a, XON])]
    fn test_encode(
        #[case] encoding: Encoding,
        #[case] frame: Frame,
        #[case] flags: &[u8; 4],
        #[case] expected: &[u8],
    ) {
        let mut out = Vec::new();
        Header::new(encoding, frame, flags).encode(&mut out, &clear());
        assert_eq!(out, expected);
    }

    #[test]
    fn test_encode_hex_ack_and_fin_omit_xon() {
        for frame in [Frame::ZACK, Frame::ZFIN] {
            let mut out = Vec::new();
            Header::new(Encoding::ZHEX, frame, &[0; 4]).encode(&mut out, &clear());
            assert_eq!(out[out.len() - 2..], [0x0d, 0x8a]);
        }
    }

    #[rstest::rstest]
    #[case(
        &[ZPAD, ZPAD, ZDLE, 0x42, b'0', b'1', b'0', b'1', b'0', b'2', b'0', b'3', b'0', b'4', b'a', b'7', b'5', b'2', 0x0d, 0x8a],
        Encoding::ZHEX, Frame::ZRINIT, &[0x1, 0x2, 0x3, 0x4], 20
    )]
    #[case(
        &[ZPAD, ZDLE, 0x41, 0x01, 0xa, 0xb, 0xc, 0xd, 0xa6, 0xcb],
        Encoding::ZBIN, Frame::ZRINIT, &[0xa, 0xb, 0xc, 0xd], 10
    )]
    #[case(
        &[ZPAD, ZDLE, 0x43, 0x01, 0xa, 0xb, 0xc, 0xd, 0x99, 0xe2, 0xae, 0x4a],
        Encoding::ZBIN32, Frame::ZRINIT, &[0xa, 0xb, 0xc, 0xd], 12
    )]
    #[case(
        &[ZPAD, ZDLE, 0x41, 0x01, 0xa, ZDLE, b'l', 0xd, ZDLE, b'm', 0x5e, 0x6f],
        Encoding::ZBIN, Frame::ZRINIT, &[0xa, 0x7f, 0xd, 0xff], 12
    )]
    fn test_parse(
        #[case] wire: &[u8],
        #[case] encoding: Encoding,
        #[case] frame: Frame,
        #[case] flags: &[u8; 4],
        #[case] used: usize,
    ) {
        assert_eq!(
            Header::parse(wire),
            Parsed::Frame {
                header: Header::new(encoding, frame, flags),
                used
            }
        );
    }

    #[test]
    fn test_parse_incomplete_prefixes() {
        let mut full = Vec::new();
        Header::with_arg(Encoding::ZBIN32, Frame::ZDATA, 1024).encode(&mut full, &clear());
        for len in 1..full.len() {
            assert_eq!(Header::parse(&full[..len]), Parsed::Incomplete);
        }
    }

    #[test]
    fn test_parse_bad_crc_is_garbage() {
        let mut wire = Vec::new();
        Header::with_arg(Encoding::ZBIN, Frame::ZRPOS, 7).encode(&mut wire, &clear());
        let last = wire.len() - 1;
        wire[last] ^= 0xff;
        assert!(matches!(Header::parse(&wire), Parsed::Garbage { .. }));
    }

    #[test]
    fn test_arg_endianness() {
        let le = Header::with_arg(Encoding::ZHEX, Frame::ZRPOS, 0x0102_0304);
        assert_eq!(le.flags(), &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(le.arg(), 0x0102_0304);

        let be = Header::with_arg(Encoding::ZHEX, Frame::ZACK, 0x0102_0304);
        assert_eq!(be.flags(), &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(be.arg(), 0x0102_0304);
    }

    #[test]
    fn test_round_trip_all_encodings_with_escaping() {
        let map = EscapeMap::new(true, false);
        for encoding in [Encoding::ZBIN, Encoding::ZBIN32, Encoding::ZHEX] {
            let header = Header::with_arg(encoding, Frame::ZACK, 0x0011_1318);
            let mut wire = Vec::new();
            header.encode(&mut wire, &map);
            match Header::parse(&wire) {
                Parsed::Frame { header: parsed, .. } => assert_eq!(parsed, header),
                other => panic!("unexpected parse result: {other:?}"),
            }
        }
    }
}
