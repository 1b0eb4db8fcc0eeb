//! Dual-demodulator tuner engine: antenna and amplifier routing, VSB
//! initialization, PLL programming, signal-quality readout, and the parallel
//! spectrum scan.

use std::thread;
use std::time::Duration;

use log::{debug, warn};
use sezatsc_protocol::ControlRequest;

use crate::device::RESET_MS;
use crate::error::{Error, Result};
use crate::transport::ControlSocket;

/// Demodulator channels per appliance.
pub const NUM_CHANNELS: usize = 2;

/// Lowest broadcast TV channel.
pub const TVCH_MIN: u32 = 2;

/// Highest broadcast TV channel (the 2008 spectrum auction removed 52-69).
pub const TVCH_MAX: u32 = 51;

/// Default carrier-recovery dwell for scans, in milliseconds.
pub const DEFAULT_CR_MS: u64 = 20;

/// Carrier frequency in MHz per TV channel, indexed from [`TVCH_MIN`].
/// Low VHF 2-6, high VHF 7-13, UHF 14-51.
pub const CH_FREQ: [u32; (TVCH_MAX - TVCH_MIN + 1) as usize] = [
    57, 63, 69, 79, 85, // 2-6
    177, 183, 189, 195, 201, 207, 213, // 7-13
    473, 479, 485, 491, 497, 503, 509, 515, 521, 527, 533, 539, 545, 551, 557, 563, 569, 575,
    581, 587, 593, 599, 605, 611, 617, 623, 629, 635, 641, 647, 653, 659, 665, 671, 677, 683,
    689, 695, // 14-51
];

/// Carrier frequency for a TV channel, if it is in range.
pub fn carrier_mhz(tvch: u32) -> Option<u32> {
    if !(TVCH_MIN..=TVCH_MAX).contains(&tvch) {
        return None;
    }
    Some(CH_FREQ[(tvch - TVCH_MIN) as usize])
}

/// PLL divider in 62.5 kHz steps; 704 is the 44 MHz IF offset at that scale.
pub fn pll_divider(mhz: u32) -> u16 {
    ((mhz << 4) + 704) as u16
}

/// RF inputs on the appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Antenna {
    /// Disconnected; `set_freq` is rejected until an antenna is chosen.
    Nc,
    /// Proprietary antenna connector 1.
    Ant1,
    /// Proprietary antenna connector 2.
    Ant2,
    /// External coax F connector.
    Coax,
}

impl Antenna {
    /// Next antenna the auto-detecting scan tries; `None` after coax.
    pub fn next(self) -> Option<Antenna> {
        match self {
            Antenna::Nc => Some(Antenna::Ant1),
            Antenna::Ant1 => Some(Antenna::Ant2),
            Antenna::Ant2 => Some(Antenna::Coax),
            Antenna::Coax => None,
        }
    }

    /// Number used by the `-a` command-line flag.
    pub fn cli_index(self) -> u8 {
        match self {
            Antenna::Nc => 0,
            Antenna::Ant1 => 1,
            Antenna::Ant2 => 2,
            Antenna::Coax => 3,
        }
    }
}

/// Front-end amplifier input selection per demodulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmpInput {
    Off,
    Vhf1,
    Vhf2,
    Uhf1,
    Uhf2,
    External,
}

impl AmpInput {
    /// Amp enable bit contributed to the shared GPIO word. Turning on an amp
    /// powers it for both demodulators, so the word ORs both channels.
    fn amp_enable(self) -> u16 {
        match self {
            AmpInput::Off | AmpInput::External => 0,
            AmpInput::Vhf1 => 1,
            AmpInput::Vhf2 => 4,
            AmpInput::Uhf1 => 2,
            AmpInput::Uhf2 => 8,
        }
    }

    /// 3-bit filter selector for demodulator 0.
    fn filter_ch0(self) -> u16 {
        match self {
            AmpInput::Off => 4,
            AmpInput::Vhf1 => 3,
            AmpInput::Vhf2 => 1,
            AmpInput::Uhf1 => 5,
            AmpInput::Uhf2 => 2,
            AmpInput::External => 0,
        }
    }

    /// 3-bit filter selector for demodulator 1.
    fn filter_ch1(self) -> u16 {
        match self {
            AmpInput::Off => 0,
            AmpInput::Vhf1 => 3,
            AmpInput::Vhf2 => 1,
            AmpInput::Uhf1 => 4,
            AmpInput::Uhf2 => 2,
            AmpInput::External => 5,
        }
    }

    /// Antenna-2 variant of an antenna-1 band selection.
    fn on_ant2(self) -> AmpInput {
        match self {
            AmpInput::Vhf1 => AmpInput::Vhf2,
            AmpInput::Uhf1 => AmpInput::Uhf2,
            other => other,
        }
    }
}

/// Demodulator operating modes. Only VSB is installed; the QAM values are
/// reserved for cable variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Modulation {
    Qam64 = 0,
    Qam256 = 1,
    Vsb = 3,
}

/// GPIO bits owned by the appliance firmware; never cleared by amp updates.
const GPIO_RESERVED: u16 = 0x80f0;

/// VSB initialization sequence for the DT3305: digital SAW filter, AGC loop
/// parameters, PED thresholds for carrier recovery, equalizer convergence
/// thresholds, and finally the QAM lock detector turned off.
const VSB_INIT: [(u16, u8); 27] = [
    (0x00d, 0x63), // digital SAW filter on
    (0x00e, 0x02), // sync confidence count
    (0x012, 0x32), // DAGC reference, high byte
    (0x013, 0xc4), // DAGC reference, low byte
    (0x106, 0x00), // IF frequency left at the TUA6034 default
    (0x107, 0x00),
    (0x108, 0x00),
    (0x109, 0x00),
    (0x112, 0x17), // PED output threshold
    (0x113, 0x15), // average PED low threshold
    (0x114, 0x18), // average PED mid threshold
    (0x115, 0xff), // average PED high threshold
    (0x116, 0x3c), // low-resolution SNR threshold at 11 dB
    (0x214, 0x27), // timing recovery at half bandwidth
    (0x424, 0x8d), // CST threshold
    (0x427, 0x12), // equalizer convergence threshold, high byte
    (0x428, 0x4f), // equalizer convergence threshold, low byte
    (0x302, 0x04), // RF AGC loop delay, high byte
    (0x303, 0xc0), // RF AGC loop delay, low byte
    (0x306, 0x80), // RF AGC loop filter bandwidth
    (0x307, 0x00),
    (0x308, 0x80), // IF AGC loop bandwidth
    (0x309, 0x00),
    (0x30c, 0x31), // DC remover bandwidth 1/4x
    (0x30d, 0x00), // AGC loops enabled
    (0x30e, 0x1c), // inner AGC loop on, QAM no-signal detector off
    (0x314, 0xe1), // QAM lock detector off
];

/// Per-demodulator tuning state.
#[derive(Debug, Clone, Copy)]
struct ChState {
    amp: AmpInput,
    tvch: Option<u32>,
}

/// Signal quality snapshot from one demodulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalStatus {
    /// Bit 0: carrier lock. Bit 1: in-lock. Bit 2: sync lock. Bit 3: SNR
    /// above threshold-of-visibility. Bit 4: Viterbi ok.
    pub status: u8,
    /// 24-bit phase-tracker mean square error.
    pub phase_mse: u32,
    /// 24-bit equalizer mean square error.
    pub eq_mse: u32,
}

impl SignalStatus {
    /// Carrier recovery has locked.
    pub fn carrier_lock(&self) -> bool {
        self.status & 1 != 0
    }

    /// Strong enough to try pulling a transport stream.
    pub fn is_strong(&self) -> bool {
        self.status > 3
    }

    /// Every lock stage is up; streaming will produce usable TS.
    pub fn all_locks(&self) -> bool {
        self.status & 0xf == 0xf
    }
}

/// Scan sweep stride: each demodulator steps by two channels per batch.
const CH_STEP: u32 = 2;

/// The interleaved scan schedule. Each element is `(raw_index, batch)` where
/// the batch assigns one TV channel per demodulator. Even grid offsets are
/// swept first, then the sweep restarts on the odd offsets, which keeps the
/// two concurrently-programmed carriers four channels apart.
pub(crate) fn scan_batches() -> Vec<(u32, Vec<(u8, u32)>)> {
    let n = CH_FREQ.len() as u32;
    let mut batches = Vec::new();
    let mut i = 0u32;
    loop {
        if i >= n {
            if i & 1 == 1 {
                break;
            }
            i = 1; // restart on the odd offsets
            continue;
        }
        let mut batch = Vec::new();
        for ch in 0..NUM_CHANNELS as u32 {
            let idx = i + ch * CH_STEP;
            if idx < n {
                batch.push((ch as u8, idx + TVCH_MIN));
            }
        }
        batches.push((i, batch));
        i += NUM_CHANNELS as u32 * CH_STEP;
    }
    batches
}

/// Map a raw interleave index onto a sequential progress point.
fn progress_point(raw: u32, ant: Antenna, auto_detect: bool) -> (u32, u32) {
    const BATCHES: u32 = (CH_FREQ.len() as u32 + 1) / CH_STEP;
    let mut idx = raw;
    if idx != 0 {
        let i = idx - 1;
        idx = i / (CH_STEP * 2) + (i & 1) * ((BATCHES + 1) / 2) + 1;
    }
    let mut max = BATCHES;
    if auto_detect {
        max *= 3;
        match ant {
            Antenna::Ant2 => idx += BATCHES,
            Antenna::Coax => idx += 2 * BATCHES,
            _ => {}
        }
    }
    (idx, max + 1)
}

/// Progress sink for [`Tuner::scan`].
pub type ScanProgress<'a> = &'a mut dyn FnMut(u32, u32);

/// Owns the control connection and both demodulator channels of one
/// appliance.
pub struct Tuner {
    sock: ControlSocket,
    cur_gpio: u16,
    active_ant: Antenna,
    ch_state: [ChState; NUM_CHANNELS],
}

impl Tuner {
    pub fn new(sock: ControlSocket) -> Self {
        Self {
            sock,
            cur_gpio: 0,
            active_ant: Antenna::Nc,
            ch_state: [ChState { amp: AmpInput::Off, tvch: None }; NUM_CHANNELS],
        }
    }

    pub fn antenna(&self) -> Antenna {
        self.active_ant
    }

    /// TV channel a demodulator is tuned to, or `None` while its amp is off.
    pub fn freq(&self, ch: u8) -> Option<u32> {
        let state = self.ch_state.get(usize::from(ch))?;
        if state.amp == AmpInput::Off {
            return None;
        }
        state.tvch
    }

    fn check_channel(ch: u8) -> Result<()> {
        if usize::from(ch) >= NUM_CHANNELS {
            return Err(Error::InvalidArgument(format!(
                "tuner channel {ch} out of range"
            )));
        }
        Ok(())
    }

    /// Verify the firmware, then park both amps and install VSB mode.
    pub fn init(&mut self) -> Result<()> {
        self.sock.get_version()?;
        for ch in 0..NUM_CHANNELS as u8 {
            // fake a changed amp state so the first set_amp writes the GPIO
            self.ch_state[usize::from(ch)].amp = AmpInput::Vhf1;
            self.set_amp(ch, AmpInput::Off)?;
            self.set_modulation(ch, Modulation::Vsb)?;
        }
        Ok(())
    }

    /// Park the antenna before the control socket goes away.
    pub fn park(&mut self) -> Result<()> {
        self.set_antenna(Antenna::Nc)
    }

    fn set_modulation(&mut self, ch: u8, mode: Modulation) -> Result<()> {
        Self::check_channel(ch)?;

        // confirm a live DT3305 is behind the register bus before blasting
        // the init sequence at it
        let gen_ctrl2 = self.sock.get_demod8(ch, 1)?;
        if gen_ctrl2 == 0 {
            return Err(Error::HardwareCheck("GEN CTRL 2 reads zero".into()));
        }
        self.sock.set_demod8(ch, 0x808, 0x80)?;
        let bert = self.sock.get_demod8(ch, 0x808)?;
        if bert != 0x80 {
            return Err(Error::HardwareCheck(format!(
                "BERT register holds {bert:02x} after writing 80"
            )));
        }
        self.sock.set_demod8(ch, 0x808, 0)?;

        let top = self.sock.get_demod8(ch, 0)?;
        self.sock.set_demod8(ch, 0, (top & !3) | mode as u8)?;

        match mode {
            Modulation::Vsb => {
                for &(addr, value) in VSB_INIT.iter() {
                    self.sock.set_demod8(ch, addr, value)?;
                }
                self.sock.reset_demod(ch, RESET_MS)?;
                // serial TS output toward the appliance CPU
                let tp = self.sock.get_demod8(ch, 0x50e)?;
                self.sock.set_demod8(ch, 0x50e, tp | 0x20)?;
                self.sock.reset_demod(ch, RESET_MS)?;
            }
            _ => warn!("modulation {mode:?} is not installed on this hardware"),
        }
        Ok(())
    }

    /// GPIO word for a pair of amp selections, on top of the reserved bits.
    fn gpio_word(reserved: u16, amps: [AmpInput; NUM_CHANNELS]) -> u16 {
        let mut gpio = reserved & GPIO_RESERVED;
        for amp in amps {
            gpio |= amp.amp_enable();
        }
        gpio |= amps[0].filter_ch0() << 8;
        gpio |= amps[1].filter_ch1() << 11;
        gpio
    }

    fn set_amp(&mut self, ch: u8, state: AmpInput) -> Result<()> {
        Self::check_channel(ch)?;
        if state == self.ch_state[usize::from(ch)].amp {
            return Ok(());
        }

        let mut amps = [self.ch_state[0].amp, self.ch_state[1].amp];
        amps[usize::from(ch)] = state;
        let gpio = Self::gpio_word(self.cur_gpio, amps);
        self.sock.set_gpio(gpio)?;

        // commit only after the write went through
        self.cur_gpio = gpio;
        self.ch_state[usize::from(ch)].amp = state;
        Ok(())
    }

    /// Route both demodulators to `ant`, re-deriving each channel's band
    /// amp from its tuned frequency where needed.
    pub fn set_antenna(&mut self, ant: Antenna) -> Result<()> {
        self.active_ant = ant;
        for ch in 0..NUM_CHANNELS as u8 {
            let mut amp = match self.ch_state[usize::from(ch)].amp {
                AmpInput::Off => continue,
                AmpInput::Vhf2 => AmpInput::Vhf1,
                AmpInput::Uhf2 => AmpInput::Uhf1,
                other => other,
            };
            if ant == Antenna::Nc {
                self.set_amp(ch, AmpInput::Off)?;
                continue;
            }
            if ant == Antenna::Coax {
                self.set_amp(ch, AmpInput::External)?;
                continue;
            }
            if amp == AmpInput::External {
                // coming off coax: recompute the band from the carrier
                match self.ch_state[usize::from(ch)].tvch {
                    Some(tvch) => self.set_freq(ch, tvch, RESET_MS)?,
                    None => self.set_amp(ch, AmpInput::Off)?,
                }
                continue;
            }
            if ant == Antenna::Ant2 {
                amp = amp.on_ant2();
            }
            match self.ch_state[usize::from(ch)].tvch {
                Some(_) => self.set_amp(ch, amp)?,
                None => warn!("channel {ch} has no tuned carrier, amp left alone"),
            }
        }
        Ok(())
    }

    /// Bandswitch bit and antenna-1 amp selection for a carrier frequency.
    pub fn band_select(mhz: u32) -> Result<(u8, AmpInput)> {
        if mhz < 158 {
            Ok((1 << 0, AmpInput::Vhf1)) // low VHF: P0
        } else if mhz < 452 {
            Ok((1 << 1, AmpInput::Vhf1)) // high VHF: P1
        } else if mhz < 862 {
            Ok((1 << 2, AmpInput::Uhf1)) // UHF: P2 (P3 kills UHF reception)
        } else {
            Err(Error::InvalidArgument(format!("{mhz} MHz is out of range")))
        }
    }

    /// Tune one demodulator to a TV channel.
    pub fn set_freq(&mut self, ch: u8, tvch: u32, reset_ms: u64) -> Result<()> {
        Self::check_channel(ch)?;
        let mhz = carrier_mhz(tvch)
            .ok_or_else(|| Error::InvalidArgument(format!("TV channel {tvch} out of range")))?;
        if self.active_ant == Antenna::Nc {
            return Err(Error::InvalidArgument(
                "set_freq requires an antenna; call set_antenna or scan first".into(),
            ));
        }

        let (bandswitch, mut amp) = Self::band_select(mhz)?;
        match self.active_ant {
            Antenna::Ant2 => amp = amp.on_ant2(),
            Antenna::Coax => amp = AmpInput::External,
            _ => {}
        }
        self.set_amp(ch, amp)?;

        let req = ControlRequest::PllWrite {
            channel: ch,
            divider: pll_divider(mhz),
            bandswitch,
        };
        if let Err(e) = self.sock.request_ack(&req) {
            if let Err(off) = self.set_amp(ch, AmpInput::Off) {
                warn!("channel {ch}: failed to disable amp after PLL fault: {off}");
            }
            return Err(e);
        }

        if reset_ms > 0 {
            self.sock.reset_demod(ch, reset_ms)?;
        }
        self.ch_state[usize::from(ch)].tvch = Some(tvch);
        Ok(())
    }

    /// Read lock status and the equalizer / phase-tracker error figures.
    pub fn get_mse(&mut self, ch: u8) -> Result<SignalStatus> {
        Self::check_channel(ch)?;
        let lock = self.sock.get_demod8(ch, 0x11d)?; // carrier recovery lock
        if lock & 0x80 == 0 {
            return Ok(SignalStatus { status: 0, phase_mse: 0xfffff, eq_mse: 0xfffff });
        }

        let general = self.sock.get_demod8(ch, 3)?;
        let status = 1
            | (((general & 8) >> 2) ^ 2) // in-lock
            | (general & 4) // sync lock
            | ((general & 1) << 3) // SNR above TOV
            | ((general & 2) << 3); // Viterbi ok

        // EQ MSE at 0x413 and phase-tracker MSE at 0x417, one read for both
        let mse = self.sock.get_demod_n(ch, 0x413, 8)?;
        let eq_mse = u32::from(mse[0]) << 16 | u32::from(mse[1]) << 8 | u32::from(mse[2]);
        let phase_mse = u32::from(mse[4]) << 16 | u32::from(mse[5]) << 8 | u32::from(mse[6]);
        Ok(SignalStatus { status, phase_mse, eq_mse })
    }

    /// Sweep the spectrum with both demodulators in lockstep and return the
    /// carriers that showed lock, sorted ascending.
    ///
    /// With no antenna chosen, the scan elevates to antenna 1 and rotates
    /// through antenna 2 and coax until at least three carriers appear; the
    /// antenna stays wherever the sweep ended.
    pub fn scan(&mut self, mut progress: Option<ScanProgress>, cr_ms: u64) -> Result<Vec<u32>> {
        let auto_detect = self.active_ant == Antenna::Nc;
        let mut cr_ms = cr_ms;
        if auto_detect {
            if self.ch_state.iter().any(|s| s.amp != AmpInput::Off) {
                return Err(Error::InvalidArgument(
                    "auto-detecting scan requires both amps off".into(),
                ));
            }
            self.set_antenna(Antenna::Ant1)?;
            // antenna detection needs the full reset dwell
            cr_ms = cr_ms.max(DEFAULT_CR_MS);
        }

        // clear the FM dither bit so carrier recovery reflects the antenna,
        // restoring the old value on every exit path
        let mut saved_12a = [0u8; NUM_CHANNELS];
        for ch in 0..NUM_CHANNELS as u8 {
            let old = self.sock.get_demod8(ch, 0x12a)?;
            saved_12a[usize::from(ch)] = old;
            self.sock.set_demod8(ch, 0x12a, old & !0x20)?;
        }

        let swept = self.sweep(&mut progress, cr_ms, auto_detect);

        for ch in 0..NUM_CHANNELS as u8 {
            self.sock.set_demod8(ch, 0x12a, saved_12a[usize::from(ch)])?;
        }

        let mut found = swept?;
        found.sort_unstable();
        Ok(found)
    }

    fn sweep(
        &mut self,
        progress: &mut Option<ScanProgress>,
        cr_ms: u64,
        auto_detect: bool,
    ) -> Result<Vec<u32>> {
        let mut found = Vec::new();
        let batches = scan_batches();
        if let Some(cb) = progress.as_mut() {
            let (idx, max) = progress_point(0, self.active_ant, auto_detect);
            cb(idx, max);
        }

        loop {
            for (raw, batch) in &batches {
                if let Some(cb) = progress.as_mut() {
                    let (idx, max) = progress_point(raw + 1, self.active_ant, auto_detect);
                    cb(idx, max);
                }
                for &(ch, tvch) in batch {
                    let reset = if cr_ms <= DEFAULT_CR_MS { cr_ms } else { 0 };
                    self.set_freq(ch, tvch, reset)?;
                }
                if cr_ms > DEFAULT_CR_MS {
                    thread::sleep(Duration::from_millis(cr_ms - DEFAULT_CR_MS));
                }
                for &(ch, tvch) in batch {
                    let lock = self.sock.get_demod8(ch, 0x11d)?;
                    if lock & 0x80 != 0 {
                        found.push(tvch);
                    }
                }
            }

            if found.len() >= 3 || !auto_detect || self.active_ant == Antenna::Coax {
                break;
            }
            for ch in 0..NUM_CHANNELS as u8 {
                self.set_amp(ch, AmpInput::Off)?;
            }
            let next = self
                .active_ant
                .next()
                .expect("coax is handled by the break above");
            debug!("{} carriers on {:?}, trying {next:?}", found.len(), self.active_ant);
            self.set_antenna(next)?;
        }
        Ok(found)
    }

    /// Route a demodulator's TS onto UDP toward the host.
    pub fn start_ts(&mut self, ch: u8, udp_port: u16) -> Result<()> {
        Self::check_channel(ch)?;
        if ch != 0 {
            // the second demodulator needs explicit output routing first
            self.sock.request_ack(&ControlRequest::StreamOutput { channel: ch })?;
        }
        let host = self.sock.host();
        self.sock.request_ack(&ControlRequest::StreamDestination {
            channel: ch,
            addr: host,
            port: udp_port,
        })
    }

    /// Clear the UDP destination, stopping the stream at the appliance.
    pub fn stop_ts(&mut self, ch: u8) -> Result<()> {
        Self::check_channel(ch)?;
        self.sock.request_ack(&ControlRequest::StreamDestination {
            channel: ch,
            addr: std::net::Ipv4Addr::UNSPECIFIED,
            port: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carrier_table() {
        assert_eq!(carrier_mhz(2), Some(57));
        assert_eq!(carrier_mhz(7), Some(177));
        assert_eq!(carrier_mhz(14), Some(473));
        assert_eq!(carrier_mhz(51), Some(695));
        assert_eq!(carrier_mhz(1), None);
        assert_eq!(carrier_mhz(52), None);
    }

    #[test]
    fn pll_encoding() {
        // channel 7 at 177 MHz
        assert_eq!(pll_divider(177), 0x0dd0);
        let (bandswitch, amp) = Tuner::band_select(177).unwrap();
        assert_eq!(bandswitch, 0x02);
        assert_eq!(amp, AmpInput::Vhf1);
    }

    #[test]
    fn band_edges() {
        assert_eq!(Tuner::band_select(57).unwrap().0, 1 << 0);
        assert_eq!(Tuner::band_select(157).unwrap().0, 1 << 0);
        assert_eq!(Tuner::band_select(158).unwrap().0, 1 << 1);
        assert_eq!(Tuner::band_select(451).unwrap().0, 1 << 1);
        assert_eq!(Tuner::band_select(452).unwrap().0, 1 << 2);
        assert_eq!(Tuner::band_select(861).unwrap().0, 1 << 2);
        assert!(Tuner::band_select(862).is_err());
    }

    #[test]
    fn scan_interleave_order() {
        let batches = scan_batches();
        let tvchs: Vec<Vec<u32>> = batches
            .iter()
            .map(|(_, b)| b.iter().map(|&(_, tvch)| tvch).collect())
            .collect();

        // evens first: (2,4), (6,8), ... ending with the lone 50
        assert_eq!(tvchs[0], vec![2, 4]);
        assert_eq!(tvchs[1], vec![6, 8]);
        assert_eq!(tvchs[12], vec![50]);
        // then odds: (3,5), (7,9), ... ending with the lone 51
        assert_eq!(tvchs[13], vec![3, 5]);
        assert_eq!(tvchs[14], vec![7, 9]);
        assert_eq!(tvchs[25], vec![51]);
        assert_eq!(batches.len(), 26);

        // every channel is visited exactly once
        let mut all: Vec<u32> = tvchs.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, (TVCH_MIN..=TVCH_MAX).collect::<Vec<_>>());
    }

    #[test]
    fn batch_demod_assignment() {
        let batches = scan_batches();
        // within a batch the demods sit two channels apart
        for (_, batch) in &batches {
            if batch.len() == 2 {
                assert_eq!(batch[0].0, 0);
                assert_eq!(batch[1].0, 1);
                assert_eq!(batch[1].1 - batch[0].1, CH_STEP);
            }
        }
    }

    #[test]
    fn antenna_rotation() {
        // auto-detection tries ant1, ant2, coax and then gives up
        assert_eq!(Antenna::Nc.next(), Some(Antenna::Ant1));
        assert_eq!(Antenna::Ant1.next(), Some(Antenna::Ant2));
        assert_eq!(Antenna::Ant2.next(), Some(Antenna::Coax));
        assert_eq!(Antenna::Coax.next(), None);
    }

    #[test]
    fn gpio_word_composition() {
        // both off: only the ch0 "off" filter code shows up
        assert_eq!(
            Tuner::gpio_word(0, [AmpInput::Off, AmpInput::Off]),
            4 << 8
        );
        // vhf1 + uhf2: amp enables 1|8, filters 3<<8 and 2<<11
        assert_eq!(
            Tuner::gpio_word(0, [AmpInput::Vhf1, AmpInput::Uhf2]),
            (1 | 8) | (3 << 8) | (2 << 11)
        );
        // reserved bits ride through untouched
        assert_eq!(
            Tuner::gpio_word(0xffff, [AmpInput::Off, AmpInput::Off]),
            GPIO_RESERVED | (4 << 8)
        );
    }

    #[test]
    fn progress_sequentializes_interleave() {
        // fixed antenna: 26 batches map onto 1..=26 in carrier order
        let mut seen = Vec::new();
        for (raw, _) in scan_batches() {
            let (idx, max) = progress_point(raw + 1, Antenna::Ant1, false);
            assert_eq!(max, 26);
            seen.push(idx);
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (1..=26).collect::<Vec<_>>());

        // auto-detect spans three antennas
        let (idx, max) = progress_point(1, Antenna::Coax, true);
        assert_eq!(max, 76);
        assert_eq!(idx, 51);
    }

    #[test]
    fn signal_status_predicates() {
        let unlocked = SignalStatus { status: 0, phase_mse: 0xfffff, eq_mse: 0xfffff };
        assert!(!unlocked.carrier_lock());
        assert!(!unlocked.is_strong());

        let strong = SignalStatus { status: 0x7, phase_mse: 0x100, eq_mse: 0x100 };
        assert!(strong.carrier_lock());
        assert!(strong.is_strong());
        assert!(!strong.all_locks());

        let done = SignalStatus { status: 0xf, phase_mse: 0x10, eq_mse: 0x10 };
        assert!(done.all_locks());
    }
}
