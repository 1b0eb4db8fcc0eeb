//! Control-request bodies understood by the appliance.
//!
//! Every request targets one of three buses behind the appliance CPU:
//!
//! - the CPU bus itself (`0x0f 0xf2` write / `0x0f 0xf3` read) for GPIO,
//!   string queries, and streaming configuration;
//! - the demodulator register bus (`ch 0xb2` write / `ch 0xb3` read), one
//!   LG DT3305 instance per channel;
//! - the tuner front-end i2c address (`ch 0xc2`) for PLL programming.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::frame::{encode_frame, packet_type};

const CPU_WRITE: u8 = 0xf2;
const CPU_READ: u8 = 0xf3;
const CPU_BUS: u8 = 0x0f;
const DEMOD_WRITE: u8 = 0xb2;
const DEMOD_READ: u8 = 0xb3;
const TUNER_I2C: u8 = 0xc2;

/// A typed control request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Read the 16-bit GPIO word.
    GpioGet,
    /// Write the 16-bit GPIO word.
    GpioSet { value: u16 },
    /// Read string `index` (0 = firmware version), up to `max_len` bytes.
    StringGet { index: u8, max_len: u8 },
    /// Read `len` bytes starting at a demodulator register.
    DemodRead { channel: u8, addr: u16, len: u8 },
    /// Write bytes starting at a demodulator register.
    DemodWrite { channel: u8, addr: u16, data: Vec<u8> },
    /// Program the front-end PLL divider and band switch.
    PllWrite { channel: u8, divider: u16, bandswitch: u8 },
    /// Route a demodulator onto its streaming output ("PID bypass").
    StreamOutput { channel: u8 },
    /// Point a streaming output at a UDP destination; a zeroed address and
    /// port stops the stream.
    StreamDestination { channel: u8, addr: Ipv4Addr, port: u16 },
}

impl ControlRequest {
    /// Encode just the frame body.
    pub fn encode_body(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            ControlRequest::GpioGet => {
                body.put_slice(&[CPU_BUS, CPU_READ, 2, 4]);
            }
            ControlRequest::GpioSet { value } => {
                body.put_slice(&[CPU_BUS, CPU_WRITE, 4]);
                body.put_u16(*value);
            }
            ControlRequest::StringGet { index, max_len } => {
                body.put_slice(&[CPU_BUS, CPU_READ, *max_len, 1, index + 1]);
            }
            ControlRequest::DemodRead { channel, addr, len } => {
                body.put_slice(&[*channel, DEMOD_READ, *len]);
                body.put_u16(*addr);
            }
            ControlRequest::DemodWrite { channel, addr, data } => {
                body.put_slice(&[*channel, DEMOD_WRITE]);
                body.put_u16(*addr);
                body.put_slice(data);
            }
            ControlRequest::PllWrite {
                channel,
                divider,
                bandswitch,
            } => {
                body.put_slice(&[
                    *channel,
                    TUNER_I2C,
                    ((divider >> 8) as u8) & 0x7f,
                    *divider as u8,
                    0x86, // control register 1
                    *bandswitch,
                    0x50, // AGC register
                ]);
            }
            ControlRequest::StreamOutput { channel } => {
                body.put_slice(&[CPU_BUS, CPU_WRITE, 6, *channel, *channel]);
            }
            ControlRequest::StreamDestination { channel, addr, port } => {
                body.put_slice(&[CPU_BUS, CPU_WRITE, 3, *channel]);
                body.put_slice(&addr.octets());
                body.put_u16(*port);
            }
        }
        body.freeze()
    }

    /// Encode the complete control frame.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode_frame(packet_type::CONTROL_REQUEST, &self.encode_body())
    }

    /// Exact reply-body length this request produces, or `None` when the
    /// reply is variable-length (string queries).
    pub fn expected_reply_len(&self) -> Option<usize> {
        match self {
            ControlRequest::GpioGet => Some(2),
            ControlRequest::StringGet { .. } => None,
            ControlRequest::DemodRead { len, .. } => Some(usize::from(*len)),
            _ => Some(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_encodings() {
        let cases: Vec<(ControlRequest, Vec<u8>)> = vec![
            (ControlRequest::GpioGet, vec![0x0f, 0xf3, 2, 4]),
            (
                ControlRequest::GpioSet { value: 0x1234 },
                vec![0x0f, 0xf2, 4, 0x12, 0x34],
            ),
            (
                ControlRequest::StringGet { index: 0, max_len: 12 },
                vec![0x0f, 0xf3, 12, 1, 1],
            ),
            (
                ControlRequest::DemodRead { channel: 1, addr: 0x11d, len: 1 },
                vec![1, 0xb3, 1, 0x01, 0x1d],
            ),
            (
                ControlRequest::DemodWrite {
                    channel: 0,
                    addr: 0x50e,
                    data: vec![0x20],
                },
                vec![0, 0xb2, 0x05, 0x0e, 0x20],
            ),
            (
                ControlRequest::StreamOutput { channel: 1 },
                vec![0x0f, 0xf2, 6, 1, 1],
            ),
            (
                ControlRequest::StreamDestination {
                    channel: 1,
                    addr: Ipv4Addr::new(169, 254, 1, 2),
                    port: 0x138a,
                },
                vec![0x0f, 0xf2, 3, 1, 169, 254, 1, 2, 0x13, 0x8a],
            ),
        ];

        for (req, want) in cases {
            assert_eq!(req.encode_body(), want.as_slice(), "{req:?}");
        }
    }

    #[test]
    fn pll_encoding_channel_7() {
        // 177 MHz: divider (177 << 4) + 704 = 0x0dd0, VHF-high band P1
        let req = ControlRequest::PllWrite {
            channel: 0,
            divider: (177 << 4) + 704,
            bandswitch: 1 << 1,
        };
        assert_eq!(
            req.encode_body(),
            [0, 0xc2, 0x0d, 0xd0, 0x86, 0x02, 0x50].as_slice()
        );
    }

    #[test]
    fn pll_top_bit_cleared() {
        let req = ControlRequest::PllWrite {
            channel: 1,
            divider: 0x8dd0,
            bandswitch: 1 << 2,
        };
        assert_eq!(req.encode_body()[2], 0x0d);
    }

    #[test]
    fn reply_lengths() {
        assert_eq!(ControlRequest::GpioGet.expected_reply_len(), Some(2));
        assert_eq!(
            ControlRequest::DemodRead { channel: 0, addr: 0x413, len: 8 }.expected_reply_len(),
            Some(8)
        );
        assert_eq!(
            ControlRequest::GpioSet { value: 0 }.expected_reply_len(),
            Some(0)
        );
        assert_eq!(
            ControlRequest::StringGet { index: 0, max_len: 12 }.expected_reply_len(),
            None
        );
    }
}
