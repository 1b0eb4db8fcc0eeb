//! Crate-wide error type.

use sezatsc_protocol::ProtocolError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the appliance driver.
///
/// Transport-layer failures ([`Error::Protocol`], [`Error::Timeout`]) are
/// fatal to the current operation but leave the endpoint usable; hardware
/// checks abort `open`. PSIP section errors never appear here: the stream is
/// a repeating broadcast, so those are logged and swallowed where they occur.
#[derive(Error, Debug)]
pub enum Error {
    /// Socket or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame-level failure on the control connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The appliance did not answer a control request within the deadline.
    #[error("control request timed out")]
    Timeout,

    /// Bad channel index, TV channel, or call ordering; no side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The hardware failed a sanity check (firmware too old, register
    /// read-back mismatch).
    #[error("hardware check failed: {0}")]
    HardwareCheck(String),

    /// An OS interface call failed.
    #[error("system call failed: {0}")]
    Sys(#[from] nix::errno::Errno),
}
