// SPDX-License-Identifier: MIT OR Apache-2.0
//! Data subpackets.

use crate::crc;
use crate::escape::{self, EscapeMap};
use crate::{XON, ZDLE};
use core::convert::TryFrom;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;
use tinyvec::ArrayVec;

/// Largest payload a single subpacket may carry.
pub const MAX_PAYLOAD: usize = 1024;

/// The CRC-escape byte closing a data subpacket.
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, EnumIter, PartialEq, Eq)]
pub enum Terminator {
    /// End of frame, no response expected
    ZCRCE = 0x68,
    /// Frame continues, no response expected
    ZCRCG = 0x69,
    /// Frame continues, ZACK expected
    ZCRCQ = 0x6a,
    /// End of frame, ZACK expected
    ZCRCW = 0x6b,
}

impl TryFrom<u8> for Terminator {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Terminator::iter().find(|t| value == *t as u8).ok_or(())
    }
}

impl Terminator {
    /// Whether the ZDATA frame ends with this subpacket, requiring a
    /// fresh header before further data.
    #[must_use]
    pub const fn ends_frame(self) -> bool {
        matches!(self, Terminator::ZCRCE | Terminator::ZCRCW)
    }

    /// Whether the peer must answer with ZACK.
    #[must_use]
    pub const fn wants_ack(self) -> bool {
        matches!(self, Terminator::ZCRCQ | Terminator::ZCRCW)
    }
}

/// Serializes one subpacket: escaped payload, `ZDLE <terminator>`, the
/// escaped CRC, and the XON rider after ZCRCW.
pub fn encode(
    out: &mut Vec<u8>,
    payload: &[u8],
    terminator: Terminator,
    crc32: bool,
    escape: &EscapeMap,
) {
    escape.encode_into(payload, out);
    out.push(ZDLE);
    out.push(terminator as u8);
    if crc32 {
        escape.encode_into(&crc::subpacket_crc32(payload, terminator as u8), out);
    } else {
        escape.encode_into(&crc::subpacket_crc16(payload, terminator as u8), out);
    }
    if terminator == Terminator::ZCRCW {
        out.push(XON);
    }
}

/// What a call to [`Decoder::feed`] produced.
#[derive(Debug, PartialEq, Eq)]
pub enum Output {
    /// The subpacket is still in flight.
    Pending,
    /// A complete subpacket validated; the payload is in the decoder.
    Frame(Terminator),
    /// Framing or CRC failure; the receiver should re-anchor.
    Malformed,
}

enum Phase {
    Payload,
    Crc(Terminator),
}

/// Streaming subpacket decoder.
///
/// Survives arbitrary input fragmentation: payload bytes are unescaped
/// into an internal buffer until the terminator escape switches the
/// decoder into CRC collection, and the CRC is validated once enough
/// bytes arrive. A second CRC-escape letter inside the CRC trailer
/// rejects the subpacket.
pub struct Decoder {
    payload: Vec<u8>,
    trailer: ArrayVec<[u8; 4]>,
    phase: Phase,
    pending_zdle: bool,
    crc32: bool,
}

impl Decoder {
    #[must_use]
    pub fn new(crc32: bool) -> Self {
        Self {
            payload: Vec::with_capacity(MAX_PAYLOAD),
            trailer: ArrayVec::new(),
            phase: Phase::Payload,
            pending_zdle: false,
            crc32,
        }
    }

    pub fn set_crc32(&mut self, crc32: bool) {
        self.crc32 = crc32;
    }

    /// Discards any partial subpacket and starts over.
    pub fn reset(&mut self) {
        self.payload.clear();
        self.trailer.clear();
        self.phase = Phase::Payload;
        self.pending_zdle = false;
    }

    /// The validated payload of the last [`Output::Frame`].
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes input until a subpacket completes, fails, or the input
    /// runs out. Returns how many bytes were used.
    pub fn feed(&mut self, input: &[u8]) -> (usize, Output) {
        for (i, &value) in input.iter().enumerate() {
            let output = self.push(value);
            if output != Output::Pending {
                return (i + 1, output);
            }
        }
        (input.len(), Output::Pending)
    }

    fn push(&mut self, value: u8) -> Output {
        if !self.pending_zdle && value == ZDLE {
            self.pending_zdle = true;
            return Output::Pending;
        }
        let escaped = self.pending_zdle;
        self.pending_zdle = false;
        match self.phase {
            Phase::Payload => {
                if escaped {
                    if let Ok(terminator) = Terminator::try_from(value) {
                        self.phase = Phase::Crc(terminator);
                        return Output::Pending;
                    }
                    self.push_payload(escape::unescape(value))
                } else {
                    self.push_payload(value)
                }
            }
            Phase::Crc(terminator) => {
                if escaped && Terminator::try_from(value).is_ok() {
                    self.reset();
                    return Output::Malformed;
                }
                let byte = if escaped { escape::unescape(value) } else { value };
                self.trailer.push(byte);
                let want = if self.crc32 { 4 } else { 2 };
                if self.trailer.len() < want {
                    return Output::Pending;
                }
                let ok = if self.crc32 {
                    crc::subpacket_crc32(&self.payload, terminator as u8)[..] == self.trailer[..]
                } else {
                    crc::subpacket_crc16(&self.payload, terminator as u8)[..] == self.trailer[..]
                };
                self.trailer.clear();
                self.phase = Phase::Payload;
                if ok {
                    Output::Frame(terminator)
                } else {
                    self.payload.clear();
                    Output::Malformed
                }
            }
        }
    }

    fn push_payload(&mut self, value: u8) -> Output {
        if self.payload.len() == MAX_PAYLOAD {
            self.reset();
            return Output::Malformed;
        }
        self.payload.push(value);
        Output::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escape::EscapeMap;

    fn decode_all(wire: &[u8], crc32: bool) -> (Vec<u8>, Output, usize) {
        let mut decoder = Decoder::new(crc32);
        let (used, output) = decoder.feed(wire);
        (decoder.payload().to_vec(), output, used)
    }

    #[rstest::rstest]
    #[case(Terminator::ZCRCE, false, &[][..])]
    #[case(Terminator::ZCRCW, false, &[0x00][..])]
    #[case(Terminator::ZCRCQ, true, &[0, 1, 2, 3, 4, 0x60, 0x60][..])]
    #[case(Terminator::ZCRCG, true, &[0x18, 0x11, 0x13, 0x7f, 0xff][..])]
    fn test_round_trip(
        #[case] terminator: Terminator,
        #[case] crc32: bool,
        #[case] payload: &[u8],
    ) {
        let map = EscapeMap::new(true, false);
        let mut wire = Vec::new();
        encode(&mut wire, payload, terminator, crc32, &map);
        let (decoded, output, _) = decode_all(&wire, crc32);
        assert_eq!(output, Output::Frame(terminator));
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_round_trip_survives_fragmentation() {
        let map = EscapeMap::new(true, false);
        let payload: Vec<u8> = (0..=255u8).collect();
        let mut wire = Vec::new();
        encode(&mut wire, &payload, Terminator::ZCRCQ, true, &map);

        let mut decoder = Decoder::new(true);
        let mut result = None;
        for chunk in wire.chunks(3) {
            match decoder.feed(chunk) {
                (_, Output::Pending) => {}
                (_, output) => result = Some(output),
            }
        }
        assert_eq!(result, Some(Output::Frame(Terminator::ZCRCQ)));
        assert_eq!(decoder.payload(), &payload[..]);
    }

    #[test]
    fn test_bit_flip_is_malformed() {
        let map = EscapeMap::new(false, false);
        let mut wire = Vec::new();
        encode(&mut wire, b"payload bytes", Terminator::ZCRCG, true, &map);
        wire[3] ^= 0x01;
        let (_, output, _) = decode_all(&wire, true);
        assert_eq!(output, Output::Malformed);
    }

    #[test]
    fn test_second_escape_in_trailer_is_malformed() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"abc");
        wire.extend_from_slice(&[ZDLE, Terminator::ZCRCE as u8]);
        // Another terminator escape where the CRC belongs.
        wire.extend_from_slice(&[ZDLE, Terminator::ZCRCW as u8]);
        let (_, output, _) = decode_all(&wire, false);
        assert_eq!(output, Output::Malformed);
    }

    #[test]
    fn test_zcrcw_carries_xon_rider() {
        let map = EscapeMap::new(false, false);
        let mut wire = Vec::new();
        encode(&mut wire, b"x", Terminator::ZCRCW, true, &map);
        assert_eq!(*wire.last().unwrap(), XON);
        // The decoder stops at the CRC and leaves the XON unconsumed.
        let (decoded, output, used) = decode_all(&wire, true);
        assert_eq!(output, Output::Frame(Terminator::ZCRCW));
        assert_eq!(decoded, b"x");
        assert_eq!(used, wire.len() - 1);
    }

    #[test]
    fn test_oversize_payload_is_malformed() {
        let map = EscapeMap::new(false, false);
        let mut wire = Vec::new();
        wire.extend_from_slice(&[b'a'; MAX_PAYLOAD + 1]);
        wire.extend_from_slice(&[ZDLE, Terminator::ZCRCE as u8, 0, 0]);
        let (_, output, _) = decode_all(&wire, false);
        assert_eq!(output, Output::Malformed);
    }
}
