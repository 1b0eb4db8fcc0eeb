//! MPEG-TS demultiplexer and ATSC PSIP table decoder.
//!
//! One [`PsipState`] exists per demodulator channel. The receiver thread
//! feeds it 188-byte TS packets; it reassembles PSI sections per PID,
//! validates them, and accumulates the human-readable channel directory
//! recovered from the virtual channel tables.

mod section;
mod tables;

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

pub use section::{crc32_mpeg2, SectionError, MAX_SECTION_LEN, NO_VERSION};

/// One MPEG transport stream packet.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;

/// PID carrying ATSC PSIP tables.
pub const PSIP_PID: u16 = 0x1ffb;

/// Null PID used for padding.
pub const NULL_PID: u16 = 0x1fff;

/// Optional raw TS capture. On reset the file is closed only once bytes have
/// been written, so a capture opened right before streaming starts survives
/// the retune reset.
struct DumpFile {
    path: PathBuf,
    file: File,
    written: u64,
}

/// Per-demodulator section reassembler and table decoder.
pub struct PsipState {
    /// Per-PID section buffers. Only a handful of PIDs are ever active, so
    /// the map stays small and `reset` is a capacity-preserving clear.
    sections: HashMap<u16, Vec<u8>>,
    /// Scratch buffer a completed section is copied into for parsing.
    scratch: Vec<u8>,

    pub(crate) pat_curver: u8,
    pub(crate) pmt_curver: u8,
    pub(crate) mgt_curver: u8,
    pub(crate) vct_curver: u8,

    pub(crate) pat_tsid: u16,
    pub(crate) pmt_pid: u16,
    pub(crate) pcr_pid: u16,
    /// Dense program -> child PID map from the PAT.
    pub(crate) pat: Vec<u16>,
    /// Accumulated channel-directory text from the latest VCT.
    pub(crate) vct: String,

    /// Carrier TV channel, stamped by the endpoint when streaming starts;
    /// leads every directory line.
    pub tvch: u32,

    dump: Option<DumpFile>,
}

impl Default for PsipState {
    fn default() -> Self {
        Self::new()
    }
}

impl PsipState {
    pub fn new() -> Self {
        Self {
            sections: HashMap::new(),
            scratch: Vec::new(),
            pat_curver: NO_VERSION,
            pmt_curver: NO_VERSION,
            mgt_curver: NO_VERSION,
            vct_curver: NO_VERSION,
            pat_tsid: 0,
            pmt_pid: 0,
            pcr_pid: 0,
            pat: Vec::new(),
            vct: String::new(),
            tvch: 0,
            dump: None,
        }
    }

    /// Forget everything about the current stream. Buffer allocations are
    /// kept for the next one.
    pub fn reset(&mut self) {
        for buffer in self.sections.values_mut() {
            buffer.clear();
        }
        self.pat_curver = NO_VERSION;
        self.pmt_curver = NO_VERSION;
        self.mgt_curver = NO_VERSION;
        self.vct_curver = NO_VERSION;
        self.pat_tsid = 0;
        self.pmt_pid = 0;
        self.pcr_pid = 0;
        self.pat.clear();
        self.vct.clear();

        // a capture that already has data belongs to the previous stream
        if self.dump.as_ref().is_some_and(|d| d.written > 0) {
            self.dump = None;
        }
    }

    /// Channel directory text, once at least one VCT has been accepted.
    pub fn vct(&self) -> Option<&str> {
        (self.vct_curver != NO_VERSION).then_some(self.vct.as_str())
    }

    /// Transport stream ID from the PAT.
    pub fn tsid(&self) -> u16 {
        self.pat_tsid
    }

    /// PCR PID from the PMT, 0 until one is seen.
    pub fn pcr_pid(&self) -> u16 {
        self.pcr_pid
    }

    /// Start capturing raw TS packets to `path`.
    pub fn open_dump(&mut self, path: &Path) -> crate::error::Result<()> {
        let file = File::create(path)?;
        info!("capturing TS to {}", path.display());
        self.dump = Some(DumpFile { path: path.to_owned(), file, written: 0 });
        Ok(())
    }

    fn dump_packet(&mut self, pkt: &[u8]) {
        if let Some(dump) = self.dump.as_mut() {
            match dump.file.write_all(pkt) {
                Ok(()) => dump.written += pkt.len() as u64,
                Err(e) => {
                    warn!("TS capture {} failed: {e}", dump.path.display());
                    self.dump = None;
                }
            }
        }
    }

    /// Feed one 188-byte TS packet through the demultiplexer.
    ///
    /// Packets without sync, with the transport-error flag, or with a
    /// malformed adaptation field are dropped; a completed section is parsed
    /// in place and any section-level failure is logged and swallowed.
    pub fn demux(&mut self, pkt: &[u8]) {
        if pkt.len() != TS_PACKET_SIZE || pkt[0] != SYNC_BYTE {
            warn!(
                "dropping packet without TS sync (lead byte {:#04x})",
                pkt.first().copied().unwrap_or(0)
            );
            return;
        }
        if pkt[1] & 0x80 != 0 {
            return; // transport error indicator: FEC gave up on this packet
        }
        self.dump_packet(pkt);

        let pid = u16::from(pkt[1] & 0x1f) << 8 | u16::from(pkt[2]);
        let mut pos = 4usize;

        if pkt[3] & 0x20 != 0 {
            if pid == 0 {
                debug!("PAT packet with adaptation field, length {}", pkt[4]);
            }
            pos += usize::from(pkt[pos]) + 1;
            if pos > TS_PACKET_SIZE {
                warn!("adaptation field overruns the packet (pid {pid:#x})");
                return;
            }
            if pos == TS_PACKET_SIZE {
                return; // adaptation data only
            }
        }

        if pkt[1] & 0x40 != 0 {
            // payload unit start: anything partial on this PID is dead
            if self.sections.get(&pid).is_some_and(|b| !b.is_empty()) {
                self.warn_partial(pid);
            }
            pos += usize::from(pkt[pos]) + 1; // pointer_field
            if pos >= TS_PACKET_SIZE {
                warn!("pointer field overruns the packet (pid {pid:#x})");
                if let Some(buffer) = self.sections.get_mut(&pid) {
                    buffer.clear();
                }
                return;
            }
            let buffer = self
                .sections
                .entry(pid)
                .or_insert_with(|| Vec::with_capacity(MAX_SECTION_LEN));
            buffer.clear();
            buffer.extend_from_slice(&pkt[pos..]);
        } else if let Some(buffer) = self.sections.get_mut(&pid) {
            if buffer.is_empty() {
                return; // still waiting for a payload unit start
            }
            let mut take = TS_PACKET_SIZE - pos;
            if buffer.len() + take >= MAX_SECTION_LEN {
                warn!("section on pid {pid:#x} exceeds {MAX_SECTION_LEN} bytes");
                take = MAX_SECTION_LEN - buffer.len();
                if take == 0 {
                    return;
                }
            }
            buffer.extend_from_slice(&pkt[pos..pos + take]);
        } else {
            return; // PID never started a section
        }

        self.try_complete(pid);
    }

    /// Parse the PID's buffer if it now holds a full section.
    fn try_complete(&mut self, pid: u16) {
        let Some(buffer) = self.sections.get(&pid) else { return };
        if buffer.len() < 3 {
            return; // section_length not in hand yet
        }
        let slen = ((usize::from(buffer[1]) << 8 | usize::from(buffer[2])) & 0xfff) + 3;
        if buffer.len() < slen {
            return;
        }

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        scratch.extend_from_slice(&buffer[..slen]);

        if let Err(e) = self.parse_tbl(&scratch, pid) {
            warn!("pid {pid:#x}: {e}");
            debug!("pid {pid:#x} section bytes: {:02x?}", &scratch[..]);
        }
        self.scratch = scratch;

        // trailing bytes are discarded until the next payload unit start
        if let Some(buffer) = self.sections.get_mut(&pid) {
            buffer.clear();
        }
    }

    /// A payload unit start arrived while a partial section was pending.
    /// Known data-carousel PIDs do this routinely and stay quiet.
    fn warn_partial(&self, pid: u16) {
        if matches!(pid, 8..=0x65 | 0x1000..=0x1e7f | 0x1408 | 0x1ffa) {
            return;
        }
        if pid == PSIP_PID {
            let table = self.sections.get(&pid).and_then(|b| b.first().copied());
            match table {
                Some(t) if (0xc8..=0xca).contains(&t) => {}
                Some(t) => warn!("pid {pid:#x} table {t:#x} never reached full length"),
                None => {}
            }
            return;
        }
        warn!("pid {pid:#x} section never reached full length");
    }
}

#[cfg(test)]
mod tests {
    use super::section::test_support::build_section;
    use super::*;

    /// Wrap a section into TS packets on `pid`, with a given adaptation
    /// field length on each packet (None = no adaptation field).
    fn packetize(pid: u16, section: &[u8], adaptation: &[Option<u8>]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut remaining = section;
        let mut first = true;
        let mut continuity = 0u8;
        let mut adapt = adaptation.iter().copied().chain(std::iter::repeat(None));
        while !remaining.is_empty() {
            let mut pkt = vec![0xffu8; TS_PACKET_SIZE];
            pkt[0] = SYNC_BYTE;
            pkt[1] = (pid >> 8) as u8 & 0x1f;
            if first {
                pkt[1] |= 0x40;
            }
            pkt[2] = pid as u8;
            let af = adapt.next().unwrap();
            pkt[3] = if af.is_some() { 0x30 } else { 0x10 } | (continuity & 0x0f);
            continuity = continuity.wrapping_add(1);
            let mut pos = 4;
            if let Some(len) = af {
                pkt[4] = len;
                for b in &mut pkt[5..5 + usize::from(len)] {
                    *b = 0;
                }
                pos += usize::from(len) + 1;
            }
            if first {
                pkt[pos] = 0; // pointer_field
                pos += 1;
                first = false;
            }
            let take = remaining.len().min(TS_PACKET_SIZE - pos);
            pkt[pos..pos + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            packets.push(pkt);
        }
        packets
    }

    /// PAT body for `(program, pid)` pairs.
    fn pat_body(entries: &[(u16, u16)]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(prog, pid) in entries {
            body.extend_from_slice(&prog.to_be_bytes());
            body.extend_from_slice(&(0xe000 | pid).to_be_bytes());
        }
        body
    }

    #[test]
    fn single_packet_pat() {
        let section = build_section(0x00, 0x1234, 0, &pat_body(&[(3, 0x30)]));
        let mut state = PsipState::new();
        for pkt in packetize(0, &section, &[]) {
            state.demux(&pkt);
        }
        assert_eq!(state.pmt_pid, 0x30);
        assert_eq!(state.tsid(), 0x1234);
        assert_eq!(state.pat_curver, 0);
    }

    #[test]
    fn fragmented_section_reassembles() {
        // 60 programs: 8 + 240 + 4 = 252 bytes, spans two TS packets
        let entries: Vec<(u16, u16)> = (1..=60).map(|p| (p, 0x100 + p)).collect();
        let section = build_section(0x00, 0x0042, 0, &pat_body(&entries));
        assert!(section.len() > TS_PACKET_SIZE);

        // arbitrary adaptation fields on both packets
        let mut state = PsipState::new();
        for pkt in packetize(0, &section, &[Some(7), Some(30)]) {
            state.demux(&pkt);
        }
        assert_eq!(state.pmt_pid, 0x103);
        assert_eq!(state.pat.len(), 61);
        assert_eq!(state.pat[60], 0x13c);
    }

    #[test]
    fn transport_error_packets_do_not_contribute() {
        let entries: Vec<(u16, u16)> = (1..=60).map(|p| (p, 0x100 + p)).collect();
        let section = build_section(0x00, 0x0042, 0, &pat_body(&entries));
        let packets = packetize(0, &section, &[]);

        let mut state = PsipState::new();
        state.demux(&packets[0]);

        // an errored copy of the continuation must be ignored...
        let mut errored = packets[1].clone();
        errored[1] |= 0x80;
        state.demux(&errored);
        assert_eq!(state.pmt_pid, 0);

        // ...and a wrong-sync packet as well
        let mut desynced = packets[1].clone();
        desynced[0] = 0x48;
        state.demux(&desynced);
        assert_eq!(state.pmt_pid, 0);

        // the real continuation still completes the section
        state.demux(&packets[1]);
        assert_eq!(state.pmt_pid, 0x103);
    }

    #[test]
    fn continuation_without_start_is_dropped() {
        let entries: Vec<(u16, u16)> = (1..=60).map(|p| (p, 0x100 + p)).collect();
        let section = build_section(0x00, 0x0042, 0, &pat_body(&entries));
        let packets = packetize(0, &section, &[]);

        let mut state = PsipState::new();
        state.demux(&packets[1]); // continuation first: no unit start seen
        assert_eq!(state.pmt_pid, 0);

        state.demux(&packets[0]);
        state.demux(&packets[1]);
        assert_eq!(state.pmt_pid, 0x103);
    }

    #[test]
    fn new_unit_start_discards_partial() {
        let entries: Vec<(u16, u16)> = (1..=60).map(|p| (p, 0x100 + p)).collect();
        let long_section = build_section(0x00, 0x0042, 0, &pat_body(&entries));
        let long_packets = packetize(0, &long_section, &[]);
        let short_section = build_section(0x00, 0x0042, 0, &pat_body(&[(3, 0x77)]));

        let mut state = PsipState::new();
        state.demux(&long_packets[0]); // partial
        for pkt in packetize(0, &short_section, &[]) {
            state.demux(&pkt); // replaces the partial and completes
        }
        assert_eq!(state.pmt_pid, 0x77);
    }

    #[test]
    fn reset_clears_tables_and_keeps_buffers() {
        let section = build_section(0x00, 0x1234, 0, &pat_body(&[(3, 0x30)]));
        let mut state = PsipState::new();
        for pkt in packetize(0, &section, &[]) {
            state.demux(&pkt);
        }
        assert_eq!(state.pmt_pid, 0x30);

        state.reset();
        assert_eq!(state.pmt_pid, 0);
        assert_eq!(state.pat_curver, NO_VERSION);
        assert!(state.vct().is_none());
        assert!(state.sections.contains_key(&0)); // allocation survives

        // after reset the same version is accepted again
        for pkt in packetize(0, &section, &[]) {
            state.demux(&pkt);
        }
        assert_eq!(state.pmt_pid, 0x30);
    }

    #[test]
    fn duplicate_version_is_silently_dropped() {
        let v0 = build_section(0x00, 0x1234, 0, &pat_body(&[(3, 0x30)]));
        let v1 = build_section(0x00, 0x1234, 1, &pat_body(&[(3, 0x44)]));

        let mut state = PsipState::new();
        for pkt in packetize(0, &v0, &[]) {
            state.demux(&pkt);
        }
        for pkt in packetize(0, &v0, &[]) {
            state.demux(&pkt); // re-emission
        }
        assert_eq!(state.pmt_pid, 0x30);

        for pkt in packetize(0, &v1, &[]) {
            state.demux(&pkt); // next revision
        }
        assert_eq!(state.pmt_pid, 0x44);
    }
}
