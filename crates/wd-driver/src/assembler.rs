// SPDX-License-Identifier: AGPL-3.0-only

//! Multi-byte values over the byte-wide sideband.
//!
//! A 32- or 64-bit hardware value is read as one addressed byte per
//! selector, least significant byte first, and OR-ed together in host order.
//! The selector for each byte follows the function's [`Layout`]:
//!
//! ```text
//! Flat     sel = byte_index              (AW address, write strobe, status page)
//! Grouped  sel = (group << 2) | byte     (edge and handshake counters)
//! ```
//!
//! Every call re-reads all bytes. The shell keeps counting while the bytes
//! are collected, so a counter that carries between byte 0 and byte 3 can
//! come back torn (e.g. `0x0000_01FF` → `0x0000_0200` read as `0x0000_02FF`).
//! For diagnostics that is accepted; the whole value is read inside one
//! [`Session`] so at least no other command interleaves.

use crate::channel::{Reply, Session, SidebandChannel, SidebandPort};
use crate::error::{Result, WdError};
use wd_chip::sideband::{Command, Function, Layout};

/// A composite value plus which of its bytes went unanswered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wide {
    /// Assembled value; unanswered bytes contribute zero.
    pub value: u64,
    /// Bit `i` set when byte `i` timed out.
    pub unanswered: u8,
}

impl Wide {
    /// Whether every byte was answered.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.unanswered == 0
    }
}

/// Commands needed to read `width` bytes of value `group` under `function`.
///
/// # Errors
///
/// Returns [`WdError::InvalidRequest`] if `width` is zero or wider than the
/// layout allows, or if `group` does not exist in the layout.
pub fn plan(function: Function, group: u8, width: usize) -> Result<Vec<Command>> {
    let layout = function.layout();
    if width == 0 || width > layout.max_width() {
        return Err(WdError::invalid_request(format!(
            "width {width} not readable under {layout:?} layout (max {})",
            layout.max_width()
        )));
    }
    if group >= layout.groups() {
        return Err(WdError::invalid_request(format!(
            "group {group} out of range for function {function}"
        )));
    }

    (0..width)
        .map(|byte_index| {
            // width <= 8, cannot truncate
            #[allow(clippy::cast_possible_truncation)]
            let byte_index = byte_index as u8;
            layout
                .selector(group, byte_index)
                .and_then(|sel| Command::new(function, sel))
                .ok_or_else(|| {
                    WdError::invalid_request(format!(
                        "no selector for group {group} byte {byte_index}"
                    ))
                })
        })
        .collect()
}

/// Read a composite value, tracking unanswered bytes.
///
/// # Errors
///
/// Returns error only for arguments the layout cannot address; sideband
/// timeouts are reported through [`Wide::unanswered`].
pub fn read_wide_checked<P: SidebandPort>(
    session: &mut Session<'_, P>,
    function: Function,
    group: u8,
    width: usize,
) -> Result<Wide> {
    let commands = plan(function, group, width)?;
    let mut wide = Wide {
        value: 0,
        unanswered: 0,
    };
    for (byte_index, command) in commands.into_iter().enumerate() {
        match session.transact(command) {
            Reply::Byte(b) => wide.value |= u64::from(b) << (byte_index * 8),
            Reply::NoResponse { .. } | Reply::PortFailed => wide.unanswered |= 1 << byte_index,
        }
    }
    if !wide.is_complete() {
        tracing::debug!(
            "Wide read func={function} group={group}: bytes {:#010b} unanswered",
            wide.unanswered
        );
    }
    Ok(wide)
}

/// Read a composite value; unanswered bytes read as zero.
///
/// # Errors
///
/// Returns error only for arguments the layout cannot address.
pub fn read_wide<P: SidebandPort>(
    session: &mut Session<'_, P>,
    function: Function,
    group: u8,
    width: usize,
) -> Result<u64> {
    read_wide_checked(session, function, group, width).map(|w| w.value)
}

impl<P: SidebandPort> SidebandChannel<P> {
    /// Read a composite value under one session.
    ///
    /// # Errors
    ///
    /// Returns error only for arguments the layout cannot address.
    pub fn read_wide(&self, function: Function, group: u8, width: usize) -> Result<u64> {
        read_wide(&mut self.session(), function, group, width)
    }

    /// Read a grouped 32-bit counter (edge or handshake counters).
    ///
    /// # Errors
    ///
    /// Returns error if `function` is not a grouped function or `group` > 3.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_counter32(&self, function: Function, group: u8) -> Result<u32> {
        if function.layout() != Layout::Grouped {
            return Err(WdError::invalid_request(format!(
                "function {function} does not hold grouped counters"
            )));
        }
        self.read_wide(function, group, 4).map(|v| v as u32)
    }

    /// Read a flat 64-bit field (captured address, write strobe).
    ///
    /// # Errors
    ///
    /// Returns error if `function` is not a flat function.
    pub fn read_field64(&self, function: Function) -> Result<u64> {
        self.read_wide(function, 0, 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::MapPort;
    use crate::config::ChannelConfig;
    use std::time::Duration;

    fn channel(port: MapPort) -> SidebandChannel<MapPort> {
        SidebandChannel::with_config(
            port,
            ChannelConfig::default()
                .with_poll_interval(Duration::ZERO)
                .with_max_attempts(4),
        )
    }

    #[test]
    fn flat_u64_is_little_endian() {
        let bytes = 0x0123_4567_89AB_CDEFu64.to_le_bytes();
        let values: Vec<_> = (0u8..8).map(|i| ((0xE, i), bytes[i as usize])).collect();
        let ch = channel(MapPort::with(&values));
        assert_eq!(ch.read_field64(Function::AW_ADDRESS).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn grouped_selectors_issued_in_byte_order() {
        // group 2 of the edge counters: selectors 8, 9, 10, 11
        let values = [((0xC, 8), 0x44), ((0xC, 9), 0x33), ((0xC, 10), 0x22), ((0xC, 11), 0x11)];
        let ch = channel(MapPort::with(&values));
        assert_eq!(ch.read_counter32(Function::EDGE_COUNTERS, 2).unwrap(), 0x1122_3344);
        let issued = ch.into_inner().commands;
        assert_eq!(issued, vec![0x008C, 0x009C, 0x00AC, 0x00BC]);
    }

    #[test]
    fn every_width_round_trips() {
        let expected = 0xF1E2_D3C4_B5A6_9788u64;
        let bytes = expected.to_le_bytes();
        let values: Vec<_> = (0u8..8).map(|i| ((0xF, i), bytes[i as usize])).collect();
        let ch = channel(MapPort::with(&values));
        for width in 1..=8 {
            let mask = if width == 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 };
            assert_eq!(
                ch.read_wide(Function::WRITE_STROBE, 0, width).unwrap(),
                expected & mask,
                "width {width}"
            );
        }
    }

    #[test]
    fn no_caching_between_calls() {
        let ch = channel(MapPort::with(&[((0xB, 0), 1)]));
        assert_eq!(ch.read_counter32(Function::HANDSHAKE_COUNTERS, 0).unwrap(), 1);
        {
            let mut s = ch.session();
            assert_eq!(read_wide(&mut s, Function::HANDSHAKE_COUNTERS, 0, 4).unwrap(), 1);
        }
        assert_eq!(ch.into_inner().commands.len(), 8);
    }

    #[test]
    fn unanswered_bytes_are_marked() {
        let mut port = MapPort::with(&[((0xE, 0), 0xAA)]);
        port.silent = true;
        let ch = channel(port);
        let w = read_wide_checked(&mut ch.session(), Function::AW_ADDRESS, 0, 8).unwrap();
        assert_eq!(w.value, 0);
        assert_eq!(w.unanswered, 0xFF);
        assert!(!w.is_complete());
    }

    #[test]
    fn rejects_unaddressable_reads() {
        assert!(plan(Function::EDGE_COUNTERS, 0, 8).is_err());
        assert!(plan(Function::EDGE_COUNTERS, 4, 4).is_err());
        assert!(plan(Function::AW_ADDRESS, 1, 8).is_err());
        assert!(plan(Function::AW_ADDRESS, 0, 0).is_err());
        assert!(plan(Function::AW_ADDRESS, 0, 9).is_err());
        let ch = channel(MapPort::default());
        assert!(ch.read_counter32(Function::AW_ADDRESS, 0).is_err());
    }
}
