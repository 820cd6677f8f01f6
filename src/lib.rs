// SPDX-License-Identifier: MIT OR Apache-2.0
//! ZMODEM batch file-transfer engine. The engine is a pure byte pump
//! driven by the host: create a [`Session`] with [`Session::send`] or
//! [`Session::receive`], then call [`Session::step`] with whatever
//! peer bytes have arrived and an output buffer to fill, until the
//! reported state is [`State::Complete`] or [`State::Aborted`].
//!
//! The usage can be described in the high level with the following
//! flow:
//!
//! 1. Create a `Session` for one role of the transfer.
//! 2. Call `Session::step`, transmit the produced bytes in order.
//! 3. If the returned state is not terminal, go back to step 2.
//!
//! The engine owns all mutable protocol state, never blocks, and only
//! touches real resources through the active file and the download
//! directory. Everything else about the transfer is observable through
//! [`Session::stats`].

#![deny(clippy::all)]

mod config;
mod file;
mod progress;
mod recv;
mod send;
mod session;

pub mod crc;
pub mod escape;
pub mod header;
pub mod subpacket;

pub use config::Config;
pub use escape::EscapeMap;
pub use file::FileSpec;
pub use header::{Encoding, Frame, Header, Zrinit};
pub use progress::{EventSink, NullSink, Snapshot, State, Tag};
pub use session::{Session, Step};
pub use subpacket::Terminator;

use thiserror::Error as ThisError;

/// Pad byte opening every frame.
pub(crate) const ZPAD: u8 = b'*';
/// Escape byte; also the cancel byte when repeated in the clear.
pub(crate) const ZDLE: u8 = 0x18;
/// Alias of [`ZDLE`] in its cancel role.
pub(crate) const CAN: u8 = 0x18;
pub(crate) const XON: u8 = 0x11;
pub(crate) const XOFF: u8 = 0x13;

/// Fatal session failures.
///
/// Transient line problems (garbled headers, CRC mismatches, ZNAKs,
/// single timeouts) are absorbed by the state machine and only show up
/// as counters and messages in the [`Snapshot`]; this type covers the
/// conditions that end the session. The display strings are the lines
/// hosts historically printed for these conditions.
#[derive(Debug, ThisError)]
pub enum Error {
    /// File open, read, write or stat failed.
    #[error("DISK I/O ERROR")]
    Disk(#[from] std::io::Error),
    /// The consecutive inactivity budget ran out.
    #[error("TOO MANY TIMEOUTS, TRANSFER CANCELLED")]
    TooManyTimeouts,
    /// The consecutive error budget ran out, or the line degraded past
    /// the smallest block size.
    #[error("LINE NOISE")]
    LineNoise,
    /// The peer cancelled with a CAN run, ZABORT or ZFERR.
    #[error("TRANSFER CANCELLED BY {0}")]
    PeerCancel(&'static str),
    /// The host cancelled through [`Session::stop`].
    #[error("TRANSFER CANCELLED")]
    Stopped,
    /// The ZACK echo did not match the ZCHALLENGE value.
    #[error("CHALLENGE MISMATCH")]
    ChallengeMismatch,
    /// A frame type arrived that is never valid in the current state.
    #[error("PROTOCOL VIOLATION")]
    Protocol,
}
