// SPDX-License-Identifier: AGPL-3.0-only

//! PCIM write-path diagnostics
//!
//! The shell captures what it last put on its PCIM (host-memory master)
//! AXI port: the AW address, the W strobe, the BRESP it got back, the live
//! valid/ready bits, and running edge and handshake counters. Reading them
//! shows whether a result write left the FPGA and how the host answered.

use crate::channel::{SidebandChannel, SidebandPort};
use crate::error::Result;
use std::fmt;
use wd_chip::sideband::{edge, handshake, handshake_counter, Command, Function, STATUS_PAGE_LEN};

/// Valid/ready pair of one AXI channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxiSignals {
    /// Source asserts valid.
    pub valid: bool,
    /// Sink asserts ready.
    pub ready: bool,
}

impl AxiSignals {
    const fn from_bits(bits: u8) -> Self {
        Self {
            valid: bits & 0b10 != 0,
            ready: bits & 0b01 != 0,
        }
    }
}

impl fmt::Display for AxiSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{} r{}", u8::from(self.valid), u8::from(self.ready))
    }
}

/// Decoded PCIM handshake bitmap.
///
/// Bit layout, MSB first: ar_valid, ar_ready, r_valid, r_ready, aw_valid,
/// aw_ready, w_valid, w_ready.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeBits {
    /// Raw byte.
    pub raw: u8,
    /// Read address channel.
    pub ar: AxiSignals,
    /// Read data channel.
    pub r: AxiSignals,
    /// Write address channel.
    pub aw: AxiSignals,
    /// Write data channel.
    pub w: AxiSignals,
}

impl HandshakeBits {
    /// Decode the bitmap byte.
    pub const fn decode(raw: u8) -> Self {
        Self {
            raw,
            ar: AxiSignals::from_bits(raw >> 6),
            r: AxiSignals::from_bits(raw >> 4),
            aw: AxiSignals::from_bits(raw >> 2),
            w: AxiSignals::from_bits(raw),
        }
    }

    /// A write is stuck when valid is held without ready.
    pub const fn write_stalled(&self) -> bool {
        (self.aw.valid && !self.aw.ready) || (self.w.valid && !self.w.ready)
    }
}

impl fmt::Display for HandshakeBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#04x} (ar {} | r {} | aw {} | w {})",
            self.raw, self.ar, self.r, self.aw, self.w
        )
    }
}

/// Rising-edge counts of the write-path signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EdgeCounters {
    /// awvalid edges.
    pub awvalid: u32,
    /// awready edges.
    pub awready: u32,
    /// wvalid edges.
    pub wvalid: u32,
    /// wready edges.
    pub wready: u32,
}

/// Completed AW and W handshakes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandshakeCounters {
    /// AW handshakes.
    pub aw: u32,
    /// W handshakes.
    pub w: u32,
}

/// Everything the probe reads, in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcimReport {
    /// Status page bytes.
    pub status_page: [u8; STATUS_PAGE_LEN],
    /// Address of the last AW beat.
    pub aw_address: u64,
    /// Last BRESP, bits 1:0.
    pub bresp: u8,
    /// Live handshake bits.
    pub bits: HandshakeBits,
    /// Edge counters.
    pub edges: EdgeCounters,
    /// Handshake counters.
    pub handshakes: HandshakeCounters,
    /// Strobe of the last W beat.
    pub write_strobe: u64,
}

/// AXI response name.
pub const fn bresp_name(bresp: u8) -> &'static str {
    match bresp & handshake::BRESP_MASK {
        0 => "OKAY",
        1 => "EXOKAY",
        2 => "SLVERR",
        _ => "DECERR",
    }
}

impl fmt::Display for PcimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "status page:")?;
        write!(f, "{}", hexdump(&self.status_page))?;
        writeln!(f, "captured AW-address  : {:#018x}", self.aw_address)?;
        writeln!(
            f,
            "last BRESP           : {:#x} ({})",
            self.bresp,
            bresp_name(self.bresp)
        )?;
        writeln!(f, "PCIM handshake bits  : {}", self.bits)?;
        writeln!(f, "write strobe         : {:#018x}", self.write_strobe)?;
        writeln!(f)?;
        writeln!(f, "--- PCIM counters ---")?;
        writeln!(f, "  awvalid edges      : {:>10}", self.edges.awvalid)?;
        writeln!(f, "  awready edges      : {:>10}", self.edges.awready)?;
        writeln!(f, "  wvalid edges       : {:>10}", self.edges.wvalid)?;
        writeln!(f, "  wready edges       : {:>10}", self.edges.wready)?;
        writeln!(f, "  AW handshakes      : {:>10}", self.handshakes.aw)?;
        writeln!(f, "  W  handshakes      : {:>10}", self.handshakes.w)
    }
}

/// Sixteen lowercase hex bytes per line, space separated.
pub fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for line in bytes.chunks(16) {
        let hex: Vec<String> = line.iter().map(|b| format!("{b:02x}")).collect();
        out.push_str(&hex.join(" "));
        out.push('\n');
    }
    out
}

/// Reads the PCIM capture registers over a sideband channel.
#[derive(Debug)]
pub struct PcimProbe<'a, P> {
    channel: &'a SidebandChannel<P>,
}

impl<'a, P: SidebandPort> PcimProbe<'a, P> {
    /// Probe over `channel`.
    pub const fn new(channel: &'a SidebandChannel<P>) -> Self {
        Self { channel }
    }

    /// The sixteen status page bytes, read under one session.
    pub fn status_page(&self) -> [u8; STATUS_PAGE_LEN] {
        let mut session = self.channel.session();
        let mut page = [0u8; STATUS_PAGE_LEN];
        for (sel, byte) in (0u8..).zip(page.iter_mut()) {
            if let Some(cmd) = Command::new(Function::STATUS_PAGE, sel) {
                *byte = session.read_byte(cmd);
            }
        }
        page
    }

    /// Address of the last AW beat.
    ///
    /// # Errors
    ///
    /// Never fails for this function code; propagates assembler errors.
    pub fn captured_aw_address(&self) -> Result<u64> {
        self.channel.read_field64(Function::AW_ADDRESS)
    }

    /// Strobe of the last W beat.
    ///
    /// # Errors
    ///
    /// Never fails for this function code; propagates assembler errors.
    pub fn write_strobe(&self) -> Result<u64> {
        self.channel.read_field64(Function::WRITE_STROBE)
    }

    /// Last BRESP, masked to bits 1:0.
    pub fn last_bresp(&self) -> u8 {
        self.handshake_byte(handshake::BRESP) & handshake::BRESP_MASK
    }

    /// Live valid/ready bits.
    pub fn handshake_bits(&self) -> HandshakeBits {
        HandshakeBits::decode(self.handshake_byte(handshake::PCIM_BITS))
    }

    fn handshake_byte(&self, sel: u8) -> u8 {
        Command::new(Function::HANDSHAKE, sel).map_or(0, |cmd| self.channel.read_byte(cmd))
    }

    /// Edge counters.
    ///
    /// # Errors
    ///
    /// Never fails for these groups; propagates assembler errors.
    pub fn edge_counters(&self) -> Result<EdgeCounters> {
        let read = |group| self.channel.read_counter32(Function::EDGE_COUNTERS, group);
        Ok(EdgeCounters {
            awvalid: read(edge::AWVALID)?,
            awready: read(edge::AWREADY)?,
            wvalid: read(edge::WVALID)?,
            wready: read(edge::WREADY)?,
        })
    }

    /// Handshake counters.
    ///
    /// # Errors
    ///
    /// Never fails for these groups; propagates assembler errors.
    pub fn handshake_counters(&self) -> Result<HandshakeCounters> {
        let read = |group| self.channel.read_counter32(Function::HANDSHAKE_COUNTERS, group);
        Ok(HandshakeCounters {
            aw: read(handshake_counter::AW)?,
            w: read(handshake_counter::W)?,
        })
    }

    /// Full report.
    ///
    /// # Errors
    ///
    /// Propagates assembler errors.
    pub fn report(&self) -> Result<PcimReport> {
        let report = PcimReport {
            status_page: self.status_page(),
            aw_address: self.captured_aw_address()?,
            bresp: self.last_bresp(),
            bits: self.handshake_bits(),
            edges: self.edge_counters()?,
            handshakes: self.handshake_counters()?,
            write_strobe: self.write_strobe()?,
        };
        if report.bits.write_stalled() {
            tracing::warn!("PCIM write path stalled: {}", report.bits);
        }
        if report.bresp != 0 {
            tracing::warn!("Last PCIM write answered {}", bresp_name(report.bresp));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::MapPort;
    use crate::config::ChannelConfig;
    use std::time::Duration;

    fn channel(values: &[((u8, u8), u8)]) -> SidebandChannel<MapPort> {
        SidebandChannel::with_config(
            MapPort::with(values),
            ChannelConfig::default().with_poll_interval(Duration::ZERO),
        )
    }

    #[test]
    fn decodes_handshake_bits_msb_first() {
        let bits = HandshakeBits::decode(0b1000_1001);
        assert!(bits.ar.valid && !bits.ar.ready);
        assert_eq!(bits.r, AxiSignals::default());
        assert!(bits.aw.valid && !bits.aw.ready);
        assert!(!bits.w.valid && bits.w.ready);
        assert!(bits.write_stalled());
        assert!(!HandshakeBits::decode(0b0101_0101).write_stalled());
    }

    #[test]
    fn bresp_is_masked() {
        let ch = channel(&[((0xD, 0), 0xFE), ((0xD, 1), 0x0F)]);
        let probe = PcimProbe::new(&ch);
        assert_eq!(probe.last_bresp(), 2);
        assert_eq!(bresp_name(probe.last_bresp()), "SLVERR");
        assert_eq!(probe.handshake_bits().raw, 0x0F);
    }

    #[test]
    fn counters_use_grouped_selectors() {
        // wready (group 3) = 0x0102, W handshakes (group 1) = 7
        let ch = channel(&[((0xC, 12), 0x02), ((0xC, 13), 0x01), ((0xB, 4), 7)]);
        let probe = PcimProbe::new(&ch);
        let edges = probe.edge_counters().unwrap();
        assert_eq!(edges.wready, 0x0102);
        assert_eq!(edges.awvalid, 0);
        assert_eq!(probe.handshake_counters().unwrap(), HandshakeCounters { aw: 0, w: 7 });
    }

    #[test]
    fn status_page_reads_all_sixteen() {
        let values: Vec<_> = (0u8..16).map(|s| ((0x0, s), s * 3)).collect();
        let ch = channel(&values);
        let page = PcimProbe::new(&ch).status_page();
        assert_eq!(page[15], 45);
        assert_eq!(ch.into_inner().commands.len(), 16);
    }

    #[test]
    fn hexdump_lines_of_sixteen() {
        let bytes: Vec<u8> = (0..32).collect();
        let dump = hexdump(&bytes);
        let lines: Vec<_> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00 01 02"));
        assert!(lines[1].ends_with("1e 1f"));
        assert_eq!(hexdump(&[0xAB]), "ab\n");
    }

    #[test]
    fn report_renders() {
        let ch = channel(&[((0xE, 0), 0x20), ((0xD, 1), 0x55)]);
        let report = PcimProbe::new(&ch).report().unwrap();
        assert_eq!(report.aw_address, 0x20);
        let text = report.to_string();
        assert!(text.contains("captured AW-address  : 0x0000000000000020"));
        assert!(text.contains("OKAY"));
    }
}
