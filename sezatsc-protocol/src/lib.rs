//! Wire protocol for Sezmi networked dual-channel ATSC tuner appliances.
//!
//! This crate defines the binary framing shared by appliance discovery (UDP
//! broadcast) and tuner control (TCP), plus the typed request bodies the
//! appliance understands. It is purely a codec: sockets and timeouts live in
//! the `sezatsc` crate.
//!
//! # Frame Format
//!
//! ```text
//! +------+--------+------------+--------------+----------+
//! | 0x00 | type   | body_len   |     body     |  crc32   |
//! |      | u8     | u16 BE     |  (variable)  |  u32 LE  |
//! +------+--------+------------+--------------+----------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use sezatsc_protocol::{decode_frame, ControlRequest, packet_type};
//!
//! let req = ControlRequest::GpioGet;
//! let frame = req.encode().unwrap();
//!
//! let (ptype, body) = decode_frame(&frame).unwrap();
//! assert_eq!(ptype, packet_type::CONTROL_REQUEST);
//! assert_eq!(body, [0x0f, 0xf3, 2, 4]);
//! ```

pub mod control;
pub mod crc;
pub mod error;
pub mod frame;

pub use control::ControlRequest;
pub use crc::crc32_frame;
pub use error::ProtocolError;
pub use frame::{
    body_len, decode_frame, discover_request, encode_frame, packet_type, parse_discover_reply,
    CONTROL_PORT, HEADER_SIZE, MAX_BODY_SIZE, TRAILER_SIZE,
};
