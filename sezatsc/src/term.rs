//! Non-blocking single-key polling for interactive aborts.

use std::io::{self, Read};
use std::os::fd::AsFd;

use nix::sys::termios::{self, LocalFlags, SetArg, SpecialCharacterIndices};

use crate::error::Result;

/// Poll standard input for one keypress without blocking or echoing.
///
/// Returns `Ok(None)` when no key is pending. The terminal is restored
/// before the result is examined, so a failure mid-read still leaves the
/// terminal usable.
pub fn poll_key() -> Result<Option<u8>> {
    let stdin = io::stdin();
    let original = termios::tcgetattr(stdin.as_fd())?;

    let mut raw = original.clone();
    raw.local_flags.remove(LocalFlags::ECHO | LocalFlags::ICANON);
    raw.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    raw.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
    termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;

    let mut byte = [0u8; 1];
    let read = stdin.lock().read(&mut byte);

    // restore before looking at what the read returned
    termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &original)?;

    match read {
        Ok(0) => Ok(None),
        Ok(_) => Ok(Some(byte[0])),
        Err(e) => Err(e.into()),
    }
}
