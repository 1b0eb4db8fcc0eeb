//! Frame envelope shared by discovery (UDP) and control (TCP) traffic.
//!
//! Frame format:
//! ```text
//! +------+--------+------------+--------------+----------+
//! | 0x00 | type   | body_len   |     body     |  crc32   |
//! |      | u8     | u16 BE     |  (variable)  |  u32 LE  |
//! +------+--------+------------+--------------+----------+
//! | 1    | 1 byte | 2 bytes    | body_len     | 4 bytes  |
//! +------+--------+------------+--------------+----------+
//! ```
//!
//! `body_len` counts only the body: the 4-byte header and 4-byte trailer are
//! excluded. The CRC covers everything from the first header byte through the
//! last body byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::crc32_frame;
use crate::error::ProtocolError;

/// TCP and UDP port the appliance listens on.
pub const CONTROL_PORT: u16 = 65001;

/// Header size: zero byte + packet type + 2-byte body length.
pub const HEADER_SIZE: usize = 4;

/// Trailer size: little-endian CRC-32.
pub const TRAILER_SIZE: usize = 4;

/// Largest body either side ever sends.
pub const MAX_BODY_SIZE: usize = 4096;

/// Packet type tags carried in the frame header.
pub mod packet_type {
    /// Host-to-appliance discovery broadcast.
    pub const DISCOVER_REQUEST: u8 = 0x02;
    /// Appliance discovery reply (any CRC-valid 22-byte reply is accepted).
    pub const DISCOVER_REPLY: u8 = 0x03;
    /// Host-to-appliance control request.
    pub const CONTROL_REQUEST: u8 = 0x0c;
    /// Appliance control reply.
    pub const CONTROL_REPLY: u8 = 0x0d;
}

/// Stripped discovery-reply body length: the reply frame carries 20 body
/// bytes, the last six of which are the appliance MAC.
const DISCOVER_REPLY_BODY: usize = 20;

/// Encode a frame around `body`.
pub fn encode_frame(packet_type: u8, body: &[u8]) -> Result<Bytes, ProtocolError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(ProtocolError::BodyTooLarge(body.len(), MAX_BODY_SIZE));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + body.len() + TRAILER_SIZE);
    frame.put_u8(0);
    frame.put_u8(packet_type);
    frame.put_u16(body.len() as u16);
    frame.put_slice(body);
    let crc = crc32_frame(&frame);
    frame.put_u32_le(crc);
    Ok(frame.freeze())
}

/// Body length claimed by a frame header.
pub fn body_len(header: &[u8; HEADER_SIZE]) -> usize {
    usize::from(u16::from_be_bytes([header[2], header[3]]))
}

/// Validate a complete frame and return its packet type and body.
pub fn decode_frame(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if frame.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(ProtocolError::FrameLength {
            claimed: HEADER_SIZE + TRAILER_SIZE,
            actual: frame.len(),
        });
    }

    let claimed = usize::from(u16::from_be_bytes([frame[2], frame[3]]));
    if frame.len() != claimed + HEADER_SIZE + TRAILER_SIZE {
        return Err(ProtocolError::FrameLength {
            claimed: claimed + HEADER_SIZE + TRAILER_SIZE,
            actual: frame.len(),
        });
    }

    let crc_at = frame.len() - TRAILER_SIZE;
    let computed = crc32_frame(&frame[..crc_at]);
    let carried = u32::from_le_bytes([
        frame[crc_at],
        frame[crc_at + 1],
        frame[crc_at + 2],
        frame[crc_at + 3],
    ]);
    if computed != carried {
        return Err(ProtocolError::FrameCorrupt { computed, carried });
    }

    Ok((frame[1], &frame[HEADER_SIZE..crc_at]))
}

/// Build the discovery broadcast frame.
///
/// The body is two tag-length-value pairs: tag 2 ("device ID") with the
/// wildcard 0xffffffff, and tag 1 ("device type") selecting type 2, the
/// dual-channel tuner.
pub fn discover_request() -> Bytes {
    const BODY: [u8; 12] = [
        2, 4, 0xff, 0xff, 0xff, 0xff, // device ID: any
        1, 4, 0x00, 0x00, 0x00, 0x02, // device type: tuner
    ];
    encode_frame(packet_type::DISCOVER_REQUEST, &BODY).expect("discovery body is fixed size")
}

/// Extract the appliance MAC from a discovery-reply body.
///
/// The reply's IPv4 address comes from the datagram source address, not the
/// body; the body only identifies the hardware.
pub fn parse_discover_reply(body: &[u8]) -> Result<[u8; 6], ProtocolError> {
    if body.len() != DISCOVER_REPLY_BODY {
        return Err(ProtocolError::ReplyShape {
            expected: DISCOVER_REPLY_BODY,
            actual: body.len(),
        });
    }
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&body[14..20]);
    Ok(mac)
}
