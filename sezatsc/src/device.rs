//! Typed register accessors for the appliance CPU bus and the two LG DT3305
//! demodulators behind it.

use std::thread;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use sezatsc_protocol::{ControlRequest, ProtocolError};

use crate::error::{Error, Result};
use crate::transport::ControlSocket;

/// Firmware builds at or before this date wire the GPIOs differently; driving
/// the amplifier selects on them is not safe.
const MIN_FIRMWARE: u64 = 20081010;

/// Recommended demodulator reset dwell.
pub const RESET_MS: u64 = 20;

fn check_channel(ch: u8) -> Result<()> {
    if ch > 2 {
        return Err(Error::InvalidArgument(format!(
            "demodulator channel {ch} out of range"
        )));
    }
    Ok(())
}

impl ControlSocket {
    /// Issue a request and validate the reply against the shape the request
    /// promises; variable-length replies pass through unchecked.
    fn request(&mut self, req: &ControlRequest) -> Result<Bytes> {
        let body = self.roundtrip(req)?;
        if let Some(expected) = req.expected_reply_len() {
            if body.len() != expected {
                return Err(ProtocolError::ReplyShape {
                    expected,
                    actual: body.len(),
                }
                .into());
            }
        }
        Ok(body)
    }

    /// Issue a request whose reply must be an empty acknowledgement.
    pub(crate) fn request_ack(&mut self, req: &ControlRequest) -> Result<()> {
        self.request(req).map(|_| ())
    }

    pub fn get_gpio(&mut self) -> Result<u16> {
        let body = self.request(&ControlRequest::GpioGet)?;
        Ok(u16::from_be_bytes([body[0], body[1]]))
    }

    pub fn set_gpio(&mut self, value: u16) -> Result<()> {
        self.request_ack(&ControlRequest::GpioSet { value })
    }

    pub fn get_demod8(&mut self, ch: u8, addr: u16) -> Result<u8> {
        check_channel(ch)?;
        let body = self.request(&ControlRequest::DemodRead { channel: ch, addr, len: 1 })?;
        Ok(body[0])
    }

    pub fn set_demod8(&mut self, ch: u8, addr: u16, value: u8) -> Result<()> {
        check_channel(ch)?;
        self.request_ack(&ControlRequest::DemodWrite {
            channel: ch,
            addr,
            data: vec![value],
        })
    }

    pub fn get_demod16(&mut self, ch: u8, addr: u16) -> Result<u16> {
        check_channel(ch)?;
        let body = self.request(&ControlRequest::DemodRead { channel: ch, addr, len: 2 })?;
        Ok(u16::from_be_bytes([body[0], body[1]]))
    }

    pub fn set_demod16(&mut self, ch: u8, addr: u16, value: u16) -> Result<()> {
        check_channel(ch)?;
        self.request_ack(&ControlRequest::DemodWrite {
            channel: ch,
            addr,
            data: value.to_be_bytes().to_vec(),
        })
    }

    pub fn get_demod24(&mut self, ch: u8, addr: u16) -> Result<u32> {
        check_channel(ch)?;
        let body = self.request(&ControlRequest::DemodRead { channel: ch, addr, len: 3 })?;
        Ok(u32::from(body[0]) << 16 | u32::from(body[1]) << 8 | u32::from(body[2]))
    }

    pub fn set_demod24(&mut self, ch: u8, addr: u16, value: u32) -> Result<()> {
        check_channel(ch)?;
        if value > 0xff_ffff {
            return Err(Error::InvalidArgument(format!(
                "value {value:#x} does not fit a 24-bit register"
            )));
        }
        self.request_ack(&ControlRequest::DemodWrite {
            channel: ch,
            addr,
            data: value.to_be_bytes()[1..].to_vec(),
        })
    }

    pub fn get_demod32(&mut self, ch: u8, addr: u16) -> Result<u32> {
        check_channel(ch)?;
        let body = self.request(&ControlRequest::DemodRead { channel: ch, addr, len: 4 })?;
        Ok(u32::from_be_bytes([body[0], body[1], body[2], body[3]]))
    }

    pub fn set_demod32(&mut self, ch: u8, addr: u16, value: u32) -> Result<()> {
        check_channel(ch)?;
        self.request_ack(&ControlRequest::DemodWrite {
            channel: ch,
            addr,
            data: value.to_be_bytes().to_vec(),
        })
    }

    pub fn get_demod_n(&mut self, ch: u8, addr: u16, len: u8) -> Result<Bytes> {
        check_channel(ch)?;
        if len == 0 {
            return Err(Error::InvalidArgument("zero-length register read".into()));
        }
        self.request(&ControlRequest::DemodRead { channel: ch, addr, len })
    }

    pub fn set_demod_n(&mut self, ch: u8, addr: u16, data: &[u8]) -> Result<()> {
        check_channel(ch)?;
        if data.is_empty() {
            return Err(Error::InvalidArgument("zero-length register write".into()));
        }
        self.request_ack(&ControlRequest::DemodWrite {
            channel: ch,
            addr,
            data: data.to_vec(),
        })
    }

    /// Pulse the demodulator reset line: register 2 bit 0 low for `reset_ms`
    /// milliseconds, then high again.
    pub fn reset_demod(&mut self, ch: u8, reset_ms: u64) -> Result<()> {
        check_channel(ch)?;
        let ctl = self.get_demod8(ch, 2)?;
        self.set_demod8(ch, 2, ctl & !1)?;
        thread::sleep(Duration::from_millis(reset_ms));
        self.set_demod8(ch, 2, ctl | 1)?;
        Ok(())
    }

    /// Read appliance string `idx`. Strings above index 2 read back as 0xff
    /// filler, so the index is capped there.
    pub fn get_str(&mut self, idx: u8, max_len: u8) -> Result<String> {
        if idx > 2 {
            return Err(Error::InvalidArgument(format!("string index {idx} out of range")));
        }
        let body = self.roundtrip(&ControlRequest::StringGet { index: idx, max_len })?;
        if body.len() > usize::from(max_len) {
            return Err(ProtocolError::ReplyShape {
                expected: usize::from(max_len),
                actual: body.len(),
            }
            .into());
        }
        let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
        Ok(String::from_utf8_lossy(&body[..end]).into_owned())
    }

    /// Read and validate the firmware version (string 0, decimal date).
    pub fn get_version(&mut self) -> Result<u64> {
        let raw = self.get_str(0, 12)?;
        let digits: String = raw.chars().take_while(|c| c.is_ascii_digit()).collect();
        let version: u64 = digits.parse().map_err(|_| {
            Error::HardwareCheck(format!("unable to parse firmware version {raw:?}"))
        })?;
        if version <= MIN_FIRMWARE {
            return Err(Error::HardwareCheck(format!(
                "firmware {version} predates the GPIO rework; refusing to drive amplifiers"
            )));
        }
        debug!("appliance firmware {version}");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sezatsc_protocol::{encode_frame, packet_type};
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener, TcpStream};
    use std::thread;

    fn appliance_with_replies(bodies: Vec<Vec<u8>>) -> (ControlSocket, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            for body in bodies {
                let mut header = [0u8; 4];
                conn.read_exact(&mut header).unwrap();
                let len = sezatsc_protocol::body_len(&header);
                let mut rest = vec![0u8; len + 4];
                conn.read_exact(&mut rest).unwrap();
                let reply = encode_frame(packet_type::CONTROL_REPLY, &body).unwrap();
                conn.write_all(&reply).unwrap();
            }
        });
        let stream = TcpStream::connect(addr).unwrap();
        let sock = ControlSocket::from_stream(
            stream,
            Ipv4Addr::new(169, 254, 1, 1),
            Ipv4Addr::new(169, 254, 1, 2),
        );
        (sock, handle)
    }

    #[test]
    fn gpio_read() {
        let (mut sock, appliance) = appliance_with_replies(vec![vec![0x12, 0x34]]);
        assert_eq!(sock.get_gpio().unwrap(), 0x1234);
        appliance.join().unwrap();
    }

    #[test]
    fn demod_write_acked() {
        let (mut sock, appliance) = appliance_with_replies(vec![vec![]]);
        sock.set_demod8(0, 0x12a, 0x40).unwrap();
        appliance.join().unwrap();
    }

    #[test]
    fn short_read_rejected() {
        // demod16 read answered with a single byte
        let (mut sock, appliance) = appliance_with_replies(vec![vec![0x55]]);
        let err = sock.get_demod16(0, 0x413).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ReplyShape { expected: 2, actual: 1 })
        ));
        appliance.join().unwrap();
    }

    #[test]
    fn version_gate() {
        let (mut sock, appliance) =
            appliance_with_replies(vec![b"20081010\0\0\0\0".to_vec()]);
        let err = sock.get_version().unwrap_err();
        assert!(matches!(err, Error::HardwareCheck(_)));
        appliance.join().unwrap();

        let (mut sock, appliance) = appliance_with_replies(vec![b"20090321\0\0\0\0".to_vec()]);
        assert_eq!(sock.get_version().unwrap(), 20090321);
        appliance.join().unwrap();
    }

    #[test]
    fn channel_validation_is_local() {
        // no appliance behind this socket: the call must fail before any I/O
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut sock = ControlSocket::from_stream(
            stream,
            Ipv4Addr::new(169, 254, 1, 1),
            Ipv4Addr::new(169, 254, 1, 2),
        );
        assert!(matches!(
            sock.get_demod8(3, 0),
            Err(Error::InvalidArgument(_))
        ));
    }
}
