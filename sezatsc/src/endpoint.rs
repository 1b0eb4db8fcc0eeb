//! A discovered appliance, opened: the TCP control channel, two streaming
//! UDP sockets, and the receiver thread that demultiplexes TS bursts.

use std::net::UdpSocket;
use std::os::fd::AsFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::psip::{PsipState, TS_PACKET_SIZE};
use crate::transport::{ControlSocket, DiscoveredDevice};
use crate::tuner::{Antenna, ScanProgress, SignalStatus, Tuner, NUM_CHANNELS};

/// Receiver select timeout; also the granularity of reset and stop handling.
const RECV_POLL_MS: u8 = 100;

/// How long the controller waits for the receiver to acknowledge a reset.
const RESET_ACK_TIMEOUT: Duration = Duration::from_millis(300);

/// Streaming datagram: a 12-byte appliance header followed by seven TS
/// packets.
const BURST_HEADER: usize = 12;
const BURST_LEN: usize = BURST_HEADER + 7 * TS_PACKET_SIZE;

/// Ask the receiver to reinitialize one channel's demux state before a
/// retune; the ack send marks everything it wrote as happened-before.
struct ResetRequest {
    channel: usize,
    ack: mpsc::SyncSender<()>,
}

/// An opened appliance endpoint.
///
/// The caller thread owns all TCP control traffic through [`Tuner`]; the
/// receiver thread owns both UDP sockets. The two meet only at the shared
/// [`PsipState`] locks and the reset channel.
pub struct Endpoint {
    device: DiscoveredDevice,
    tuner: Tuner,
    udp_port: [u16; NUM_CHANNELS],
    psip: [Arc<Mutex<PsipState>>; NUM_CHANNELS],
    reset_tx: mpsc::Sender<ResetRequest>,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
}

impl Endpoint {
    /// Connect, initialize the tuner, bind the streaming sockets, and start
    /// the receiver thread.
    pub fn open(device: DiscoveredDevice) -> Result<Endpoint> {
        let sock = ControlSocket::connect(device.addr, device.host_addr)?;
        let mut tuner = Tuner::new(sock);
        tuner.init()?;

        let mut sockets = Vec::with_capacity(NUM_CHANNELS);
        let mut udp_port = [0u16; NUM_CHANNELS];
        for port in udp_port.iter_mut() {
            let socket = UdpSocket::bind((device.host_addr, 0))?;
            *port = socket.local_addr()?.port();
            sockets.push(socket);
        }

        let psip: [Arc<Mutex<PsipState>>; NUM_CHANNELS] = [
            Arc::new(Mutex::new(PsipState::new())),
            Arc::new(Mutex::new(PsipState::new())),
        ];
        let (reset_tx, reset_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));

        let thread_psip = psip.clone();
        let thread_stop = Arc::clone(&stop);
        let receiver = thread::Builder::new()
            .name("sezatsc-rx".into())
            .spawn(move || receiver_loop(&sockets, &thread_psip, &reset_rx, &thread_stop))?;

        Ok(Endpoint {
            device,
            tuner,
            udp_port,
            psip,
            reset_tx,
            stop,
            receiver: Some(receiver),
        })
    }

    pub fn device(&self) -> &DiscoveredDevice {
        &self.device
    }

    pub fn antenna(&self) -> Antenna {
        self.tuner.antenna()
    }

    pub fn set_antenna(&mut self, ant: Antenna) -> Result<()> {
        self.tuner.set_antenna(ant)
    }

    pub fn freq(&self, ch: u8) -> Option<u32> {
        self.tuner.freq(ch)
    }

    pub fn set_freq(&mut self, ch: u8, tvch: u32) -> Result<()> {
        self.tuner.set_freq(ch, tvch, crate::device::RESET_MS)
    }

    pub fn scan(&mut self, progress: Option<ScanProgress>, cr_ms: u64) -> Result<Vec<u32>> {
        self.tuner.scan(progress, cr_ms)
    }

    pub fn get_mse(&mut self, ch: u8) -> Result<SignalStatus> {
        self.tuner.get_mse(ch)
    }

    /// Reset the channel's demux state, stamp it with the tuned carrier,
    /// and tell the appliance to start streaming at this host.
    pub fn start_ts(&mut self, ch: u8) -> Result<()> {
        let channel = usize::from(ch);
        if channel >= NUM_CHANNELS {
            return Err(Error::InvalidArgument(format!("channel {ch} out of range")));
        }
        let tvch = self.tuner.freq(ch).ok_or_else(|| {
            Error::InvalidArgument(format!("channel {ch} is not tuned to a carrier"))
        })?;

        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        self.reset_tx
            .send(ResetRequest { channel, ack: ack_tx })
            .map_err(|_| Error::InvalidArgument("receiver thread is gone".into()))?;
        ack_rx
            .recv_timeout(RESET_ACK_TIMEOUT)
            .map_err(|_| Error::Timeout)?;

        self.psip[channel].lock().tvch = tvch;
        self.tuner.start_ts(ch, self.udp_port[channel])
    }

    /// Clear the appliance's UDP destination for this channel.
    pub fn stop_ts(&mut self, ch: u8) -> Result<()> {
        self.tuner.stop_ts(ch)
    }

    /// Snapshot of the channel directory decoded so far, if any VCT has
    /// been seen. Safe to read after the reset rendezvous.
    pub fn vct(&self, ch: u8) -> Option<String> {
        let state = self.psip.get(usize::from(ch))?.lock();
        state.vct().map(str::to_owned)
    }

    /// Capture the channel's raw TS to a file; call before `start_ts` so the
    /// retune reset leaves the fresh file in place.
    pub fn open_dump(&self, ch: u8, path: &Path) -> Result<()> {
        let state = self.psip.get(usize::from(ch)).ok_or_else(|| {
            Error::InvalidArgument(format!("channel {ch} out of range"))
        })?;
        state.lock().open_dump(path)
    }

    /// Park the antenna and stop the receiver. Called automatically on drop.
    pub fn close(&mut self) {
        if let Err(e) = self.tuner.park() {
            warn!("{}: failed to park the antenna: {e}", self.device.addr);
        }
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                error!("{}: receiver thread panicked", self.device.addr);
            }
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.close();
        }
    }
}

fn receiver_loop(
    sockets: &[UdpSocket],
    psip: &[Arc<Mutex<PsipState>>; NUM_CHANNELS],
    resets: &mpsc::Receiver<ResetRequest>,
    stop: &AtomicBool,
) {
    let mut buf = [0u8; 4096];
    while !stop.load(Ordering::Relaxed) {
        let mut fds = [
            PollFd::new(sockets[0].as_fd(), PollFlags::POLLIN),
            PollFd::new(sockets[1].as_fd(), PollFlags::POLLIN),
        ];
        let ready = match poll(&mut fds, PollTimeout::from(RECV_POLL_MS)) {
            Ok(n) => n,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                error!("receiver poll failed: {e}");
                return;
            }
        };

        let readable: Vec<bool> = fds
            .iter()
            .map(|fd| {
                fd.revents()
                    .unwrap_or_else(PollFlags::empty)
                    .contains(PollFlags::POLLIN)
            })
            .collect();
        drop(fds);

        // consume pending retunes before touching any more packets
        while let Ok(req) = resets.try_recv() {
            psip[req.channel].lock().reset();
            let _ = req.ack.send(()); // controller may have given up already
        }

        if ready == 0 {
            continue;
        }
        for (i, socket) in sockets.iter().enumerate() {
            if !readable[i] {
                continue;
            }
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => demux_burst(&mut psip[i].lock(), i, &buf[..len]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    error!("stream {i}: recv failed: {e}");
                    return;
                }
            }
        }
    }
}

/// Split one streaming datagram into TS packets and demultiplex them.
fn demux_burst(state: &mut PsipState, channel: usize, datagram: &[u8]) {
    if datagram.len() != BURST_LEN {
        warn!(
            "stream {channel}: {} byte datagram (expected {BURST_LEN})",
            datagram.len()
        );
        return;
    }
    for pkt in datagram[BURST_HEADER..].chunks_exact(TS_PACKET_SIZE) {
        state.demux(pkt);
    }
}
