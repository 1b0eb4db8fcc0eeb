//! Error types for the appliance wire protocol.

use thiserror::Error;

/// Protocol-level errors that can occur while framing or unframing packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame trailer CRC does not match the computed CRC.
    #[error("frame CRC mismatch: computed {computed:08x}, frame carries {carried:08x}")]
    FrameCorrupt { computed: u32, carried: u32 },

    /// Frame length field disagrees with the number of bytes received.
    #[error("frame length mismatch: header claims {claimed} bytes, got {actual}")]
    FrameLength { claimed: usize, actual: usize },

    /// A control request was answered with the wrong packet type.
    #[error("unexpected response packet type 0x{0:02x}")]
    UnexpectedResponse(u8),

    /// Frame body exceeds the wire limit.
    #[error("frame body too large: {0} bytes (max {1})")]
    BodyTooLarge(usize, usize),

    /// A reply body has the wrong shape for the request that produced it.
    #[error("reply body is {actual} bytes, expected {expected}")]
    ReplyShape { expected: usize, actual: usize },
}
