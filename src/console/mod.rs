//! Text console channels into guest VMs.
//!
//! The install driver talks to a guest exclusively through its serial
//! console: wait for a prompt, type a response, repeat. This module
//! defines the channel abstraction and the process-backed implementation
//! used by the hypervisor drivers. Everything above it is hypervisor
//! agnostic.

use std::time::Duration;

use thiserror::Error;

mod ansi;
mod process;

pub use ansi::strip_ansi;
pub use process::ProcessConsole;

/// Failure modes of a console channel operation.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The pattern did not show up in console output before the timeout.
    #[error("no {pattern:?} on console after {elapsed:?}")]
    Timeout { pattern: String, elapsed: Duration },

    /// The peer went away: process exited, EOF on the pipe, or the
    /// channel was closed locally.
    #[error("console channel closed")]
    Closed,

    /// Write-side I/O failure.
    #[error("console I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// True when the channel cannot be used again.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ChannelError::Timeout { .. })
    }
}

/// Duplex text channel to one VM console.
///
/// Matching is plain substring search over output with terminal escape
/// sequences already stripped, so callers write patterns exactly as a
/// human would read them on screen. `expect` blocks only the calling
/// thread.
pub trait ConsoleChannel: Send {
    /// Send one line of input. A line terminator is appended; an empty
    /// `text` therefore sends a bare Enter.
    fn send_line(&mut self, text: &str) -> Result<(), ChannelError>;

    /// Block until `pattern` appears in console output or `timeout`
    /// elapses. On success returns everything observed since the last
    /// match, up to and including the matching text; output after the
    /// match is kept for the next call.
    fn expect(&mut self, pattern: &str, timeout: Duration) -> Result<String, ChannelError>;

    /// Close the channel. Idempotent, so cleanup paths can call it
    /// unconditionally. Operations after close fail with [`ChannelError::Closed`].
    fn close(&mut self);

    /// Every console line seen so far, oldest first.
    fn transcript(&self) -> &[String];
}
