//! Appliance transport: UDP discovery broadcast and the TCP control channel.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream, UdpSocket};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, warn};
use sezatsc_protocol::{
    body_len, decode_frame, discover_request, packet_type, ControlRequest, ProtocolError,
    CONTROL_PORT, HEADER_SIZE, TRAILER_SIZE,
};

use crate::error::{Error, Result};
use crate::iface::{self, LinkLocalIf};

/// How long each interface is polled for discovery replies.
const DISCOVER_POLL: Duration = Duration::from_millis(50);

/// Deadline for a single control request/response exchange.
const CONTROL_TIMEOUT: Duration = Duration::from_millis(400);

/// An appliance that answered the discovery broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Appliance IPv4 address (datagram source).
    pub addr: Ipv4Addr,
    /// Appliance MAC, from the reply body.
    pub mac: [u8; 6],
    /// Host address on the interface the appliance answered on; streaming
    /// sockets must bind here.
    pub host_addr: Ipv4Addr,
}

impl DiscoveredDevice {
    pub fn mac_string(&self) -> String {
        let m = self.mac;
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Broadcast on every link-local interface and collect every appliance that
/// replies within the poll window.
pub fn discover() -> Result<Vec<DiscoveredDevice>> {
    let interfaces = iface::link_local_interfaces()?;
    if interfaces.is_empty() {
        return Err(Error::InvalidArgument(
            "no interface carries a 169.254.0.0/16 address".into(),
        ));
    }

    let mut devices = Vec::new();
    for li in &interfaces {
        check_host_mac(li);
        discover_on(li, &mut devices)?;
    }
    Ok(devices)
}

/// Appliances only stream video to hosts whose MAC starts with the Sezmi
/// OUI 00:21:33.
fn check_host_mac(li: &LinkLocalIf) {
    match iface::hw_addr(&li.name) {
        Ok(mac) if mac[..3] == [0x00, 0x21, 0x33] => {}
        Ok(mac) => {
            warn!(
                "{}: hardware address {:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x} is outside the 00:21:33 OUI",
                li.name, mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
            );
            warn!(
                "tuners will only send video after \"sudo ifconfig {} hw ether 00:21:33:{:02x}:{:02x}:{:02x}\"",
                li.name, mac[3], mac[4], mac[5]
            );
        }
        Err(e) => warn!("{}: hardware address lookup failed: {e}", li.name),
    }
}

fn discover_on(li: &LinkLocalIf, out: &mut Vec<DiscoveredDevice>) -> Result<()> {
    let sock = UdpSocket::bind((li.addr, 0))?;
    sock.set_broadcast(true)?;
    sock.set_read_timeout(Some(DISCOVER_POLL))?;

    let frame = discover_request();
    sock.send_to(&frame, (li.broadcast(), CONTROL_PORT))?;

    let mut buf = [0u8; 4096];
    loop {
        let (n, peer) = match sock.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                return Ok(())
            }
            Err(e) => return Err(e.into()),
        };

        let body = match decode_frame(&buf[..n]) {
            Ok((_, body)) => body,
            Err(e) => {
                warn!("discovery reply from {peer}: {e}");
                continue;
            }
        };
        let mac = match sezatsc_protocol::parse_discover_reply(body) {
            Ok(mac) => mac,
            Err(e) => {
                warn!("discovery reply from {peer}: {e}");
                continue;
            }
        };
        let IpAddr::V4(peer4) = peer.ip() else { continue };
        debug!("{}: appliance at {peer4}", li.name);
        out.push(DiscoveredDevice {
            addr: peer4,
            mac,
            host_addr: li.addr,
        });
    }
}

/// TCP control channel to one appliance.
///
/// The socket is owned exclusively by the controller thread; streaming
/// reception happens on separate UDP sockets.
pub struct ControlSocket {
    stream: TcpStream,
    peer: Ipv4Addr,
    host: Ipv4Addr,
}

impl ControlSocket {
    pub fn connect(device: Ipv4Addr, host: Ipv4Addr) -> Result<Self> {
        let stream = TcpStream::connect((device, CONTROL_PORT))?;
        Ok(Self::from_stream(stream, device, host))
    }

    pub(crate) fn from_stream(stream: TcpStream, peer: Ipv4Addr, host: Ipv4Addr) -> Self {
        Self { stream, peer, host }
    }

    /// Appliance address.
    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    /// Host address streaming sockets must bind to.
    pub fn host(&self) -> Ipv4Addr {
        self.host
    }

    /// Send one control request and read back the reply body.
    ///
    /// The reply must arrive within [`CONTROL_TIMEOUT`], carry a valid CRC,
    /// and be tagged as a control reply; anything else fails the call without
    /// poisoning the connection.
    pub fn roundtrip(&mut self, req: &ControlRequest) -> Result<Bytes> {
        let frame = req.encode()?;
        self.stream.write_all(&frame)?;

        let deadline = Instant::now() + CONTROL_TIMEOUT;
        let mut header = [0u8; HEADER_SIZE];
        self.read_until(&mut header, deadline)?;

        let mut rest = vec![0u8; body_len(&header) + TRAILER_SIZE];
        self.read_until(&mut rest, deadline)?;

        let mut full = Vec::with_capacity(HEADER_SIZE + rest.len());
        full.extend_from_slice(&header);
        full.extend_from_slice(&rest);

        let (ptype, body) = decode_frame(&full)?;
        if ptype != packet_type::CONTROL_REPLY {
            return Err(ProtocolError::UnexpectedResponse(ptype).into());
        }
        Ok(Bytes::copy_from_slice(body))
    }

    fn read_until(&mut self, buf: &mut [u8], deadline: Instant) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let left = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(Error::Timeout)?;
            self.stream.set_read_timeout(Some(left))?;
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "control connection closed",
                    )))
                }
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(Error::Timeout)
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sezatsc_protocol::encode_frame;
    use std::net::TcpListener;
    use std::thread;

    fn fake_appliance(
        replies: Vec<Vec<u8>>,
    ) -> (ControlSocket, thread::JoinHandle<Vec<Vec<u8>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for reply in replies {
                let mut header = [0u8; HEADER_SIZE];
                conn.read_exact(&mut header).unwrap();
                let mut rest = vec![0u8; body_len(&header) + TRAILER_SIZE];
                conn.read_exact(&mut rest).unwrap();
                let mut full = header.to_vec();
                full.extend_from_slice(&rest);
                let (_, body) = decode_frame(&full).unwrap();
                seen.push(body.to_vec());
                conn.write_all(&reply).unwrap();
            }
            seen
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
    fn roundtrip_returns_reply_body() {
        let reply = encode_frame(packet_type::CONTROL_REPLY, &[0x12, 0x34])
            .unwrap()
            .to_vec();
        let (mut sock, appliance) = fake_appliance(vec![reply]);

        let body = sock.roundtrip(&ControlRequest::GpioGet).unwrap();
        assert_eq!(&body[..], &[0x12, 0x34]);

        let seen = appliance.join().unwrap();
        assert_eq!(seen, vec![vec![0x0f, 0xf3, 2, 4]]);
    }

    #[test]
    fn wrong_reply_type_rejected() {
        let reply = encode_frame(packet_type::DISCOVER_REPLY, &[]).unwrap().to_vec();
        let (mut sock, appliance) = fake_appliance(vec![reply]);

        let err = sock.roundtrip(&ControlRequest::GpioGet).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::UnexpectedResponse(0x03))
        ));
        appliance.join().unwrap();
    }

    #[test]
    fn corrupt_reply_rejected() {
        let mut reply = encode_frame(packet_type::CONTROL_REPLY, &[0x12, 0x34])
            .unwrap()
            .to_vec();
        let last = reply.len() - 1;
        reply[last] ^= 0xff;
        let (mut sock, appliance) = fake_appliance(vec![reply]);

        let err = sock.roundtrip(&ControlRequest::GpioGet).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::FrameCorrupt { .. })
        ));
        appliance.join().unwrap();
    }

    #[test]
    fn silent_appliance_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let holder = thread::spawn(move || listener.accept().unwrap());

        let stream = TcpStream::connect(addr).unwrap();
        let mut sock = ControlSocket::from_stream(
            stream,
            Ipv4Addr::new(169, 254, 1, 1),
            Ipv4Addr::new(169, 254, 1, 2),
        );
        let started = Instant::now();
        let err = sock.roundtrip(&ControlRequest::GpioGet).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert!(started.elapsed() >= Duration::from_millis(350));
        drop(holder.join().unwrap());
    }
}
