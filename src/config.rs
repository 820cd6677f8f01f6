// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session tuning knobs.

use std::time::Duration;

/// Session configuration.
///
/// The defaults match what deployed peers expect; hosts normally only
/// touch `timeout` and the escape flags.
#[derive(Clone, Debug)]
pub struct Config {
    /// Demand that the peer escape all C0 control bytes.
    pub escape_ctrl: bool,
    /// Escape bytes with the high bit set (7-bit paths).
    pub escape_8bit: bool,
    /// Receiver issues ZCHALLENGE before ZRINIT.
    pub zchallenge: bool,
    /// Use 32-bit CRCs when both peers agree.
    pub crc32: bool,
    /// Per-state inactivity timeout.
    pub timeout: Duration,
    /// Consecutive timeouts tolerated before the session aborts.
    pub max_timeouts: u32,
    /// Consecutive errors tolerated outside data streaming.
    pub max_errors: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            escape_ctrl: true,
            escape_8bit: false,
            zchallenge: false,
            crc32: true,
            timeout: Duration::from_secs(10),
            max_timeouts: 5,
            max_errors: 15,
        }
    }
}
