// SPDX-License-Identifier: MIT OR Apache-2.0
//! Progress reporting and the host event surface.

use std::path::PathBuf;
use std::time::SystemTime;

/// Coarse session state as reported to the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum State {
    /// Bytes are moving (or the handshake is in progress).
    #[default]
    Transferring,
    /// A file just completed; the batch continues.
    FileDone,
    /// The closing handshake finished cleanly.
    Complete,
    /// The session is dead; see the last message.
    Aborted,
}

/// Classifies lines handed to the [`EventSink`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tag {
    /// A file transfer began.
    FileStart,
    /// A file transfer finished.
    FileEnd,
    /// A file was skipped.
    FileSkip,
    /// The session ended, cleanly or not.
    SessionEnd,
    /// A recoverable protocol error was absorbed.
    Error,
}

/// Host-provided log sink. Lines arrive at file start, file end and
/// terminal events; implementations may route them anywhere or drop
/// them.
pub trait EventSink {
    fn event(&mut self, tag: Tag, message: &str);
}

/// Sink that discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn event(&mut self, _tag: Tag, _message: &str) {}
}

/// Point-in-time view of the transfer, readable at any moment through
/// [`crate::Session::stats`].
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Coarse session state.
    pub state: State,
    /// Basename of the active (or last) file.
    pub file_name: String,
    /// Full path of the active (or last) file.
    pub file_path: PathBuf,
    /// Advertised size of the active file.
    pub file_size: u64,
    /// Bytes of the active file moved so far.
    pub file_bytes: u64,
    /// Current data subpacket length.
    pub block_size: usize,
    /// Subpackets moved for the active file.
    pub blocks: u64,
    /// Cumulative error count for the session.
    pub errors: u32,
    /// Last human-readable status line.
    pub message: String,
    /// Total bytes announced for the batch.
    pub batch_bytes: u64,
    /// Bytes of the batch fully transferred.
    pub batch_done: u64,
    /// When the session started.
    pub started: Option<SystemTime>,
    /// When the session completed or aborted.
    pub finished: Option<SystemTime>,
}

impl Snapshot {
    /// Percentage of the active file already moved.
    #[must_use]
    pub fn percent(&self) -> f32 {
        if self.file_size == 0 {
            0.0
        } else {
            (self.file_bytes as f32 / self.file_size as f32) * 100.0
        }
    }
}
