// SPDX-License-Identifier: AGPL-3.0-only

//! Sideband (vDIP / vLED) command and status encoding.
//!
//! The shell exposes its debug state through a 16-bit write-only command
//! register (virtual DIP switches) and a 16-bit read-only status register
//! (virtual LEDs). Each command addresses a single byte:
//!
//! ```text
//! command (host → shell)          status (shell → host)
//!  15      8 7      4 3      0     15      8 7      4 3      0
//! ┌─────────┬────────┬────────┐   ┌─────────┬────────┬────────┐
//! │ 0x00    │  sel   │  func  │   │  byte   │  sel   │  func  │
//! └─────────┴────────┴────────┘   └─────────┴────────┴────────┘
//! ```
//!
//! The shell latches the command and echoes `func`/`sel` in the status word
//! once `byte` is valid. There is no request queue: a status word whose echo
//! does not match the last command is stale and must be discarded.
//!
//! ## Function map
//!
//! | Code | Domain | Selector layout |
//! |------|--------|-----------------|
//! | `0x0` | Status page, 16 bytes | flat, byte 0..15 |
//! | `0xB` | Handshake counters (AW, W), 32-bit | grouped |
//! | `0xC` | Edge counters (awvalid, awready, wvalid, wready), 32-bit | grouped |
//! | `0xD` | sel 0: last BRESP, sel 1: PCIM handshake bitmap | flat |
//! | `0xE` | Captured AW address, 64-bit | flat, byte 0..7 |
//! | `0xF` | Captured write strobe, 64-bit | flat, byte 0..7 |

use std::fmt;

/// Mask for the 4-bit function and selector fields.
pub const NIBBLE_MASK: u8 = 0xF;

/// Sideband function code (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Function(u8);

impl Function {
    /// Status page: 16 free-form status bytes.
    pub const STATUS_PAGE: Self = Self(0x0);
    /// AW / W handshake counters, 32-bit each.
    pub const HANDSHAKE_COUNTERS: Self = Self(0xB);
    /// awvalid / awready / wvalid / wready edge counters, 32-bit each.
    pub const EDGE_COUNTERS: Self = Self(0xC);
    /// Last BRESP (sel 0) and PCIM handshake bitmap (sel 1).
    pub const HANDSHAKE: Self = Self(0xD);
    /// Address captured on the last PCIM AW beat, 64-bit.
    pub const AW_ADDRESS: Self = Self(0xE);
    /// Write strobe captured on the last PCIM W beat, 64-bit.
    pub const WRITE_STROBE: Self = Self(0xF);

    /// Build a function code, rejecting values wider than 4 bits.
    #[must_use]
    pub const fn new(code: u8) -> Option<Self> {
        if code > NIBBLE_MASK {
            None
        } else {
            Some(Self(code))
        }
    }

    /// Raw 4-bit code.
    #[must_use]
    pub const fn code(self) -> u8 {
        self.0
    }

    /// Selector layout used by multi-byte values in this domain.
    #[must_use]
    pub const fn layout(self) -> Layout {
        match self.0 {
            0xB | 0xC => Layout::Grouped,
            _ => Layout::Flat,
        }
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// How a multi-byte value's byte index maps onto the 4-bit selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// `selector = byte_index`. One value per function, up to 16 bytes.
    Flat,
    /// `selector = (group << 2) | byte_index`. Four 32-bit values per function.
    Grouped,
}

impl Layout {
    /// Widest value (in bytes) addressable under this layout.
    #[must_use]
    pub const fn max_width(self) -> usize {
        match self {
            Self::Flat => 8,
            Self::Grouped => 4,
        }
    }

    /// Number of distinct groups addressable under this layout.
    #[must_use]
    pub const fn groups(self) -> u8 {
        match self {
            Self::Flat => 1,
            Self::Grouped => 4,
        }
    }

    /// Selector for byte `byte_index` of value `group`.
    ///
    /// Returns `None` when either index does not fit the layout.
    #[must_use]
    pub const fn selector(self, group: u8, byte_index: u8) -> Option<u8> {
        match self {
            Self::Flat => {
                if group != 0 || byte_index > NIBBLE_MASK {
                    None
                } else {
                    Some(byte_index)
                }
            }
            Self::Grouped => {
                if group > 3 || byte_index > 3 {
                    None
                } else {
                    Some((group << 2) | byte_index)
                }
            }
        }
    }
}

/// One sideband command: function plus 4-bit selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Command {
    function: Function,
    selector: u8,
}

impl Command {
    /// Build a command, rejecting selectors wider than 4 bits.
    #[must_use]
    pub const fn new(function: Function, selector: u8) -> Option<Self> {
        if selector > NIBBLE_MASK {
            None
        } else {
            Some(Self { function, selector })
        }
    }

    /// Function code.
    #[must_use]
    pub const fn function(self) -> Function {
        self.function
    }

    /// Selector.
    #[must_use]
    pub const fn selector(self) -> u8 {
        self.selector
    }

    /// Pack into the 16-bit command register value. The byte field is zero.
    #[must_use]
    pub const fn encode(self) -> u16 {
        ((self.selector as u16) << 4) | self.function.0 as u16
    }

    /// Unpack a command register value, ignoring the byte field.
    #[must_use]
    pub const fn decode(value: u16) -> Self {
        Self {
            function: Function((value & 0xF) as u8),
            selector: ((value >> 4) & 0xF) as u8,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func={:x} sel={}", self.function.0, self.selector)
    }
}

/// Decoded 16-bit status register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Data byte for the echoed command.
    pub byte: u8,
    /// Echoed function code.
    pub function: Function,
    /// Echoed selector.
    pub selector: u8,
}

impl Status {
    /// Unpack a raw status word.
    #[must_use]
    pub const fn decode(raw: u16) -> Self {
        Self {
            byte: (raw >> 8) as u8,
            function: Function((raw & 0xF) as u8),
            selector: ((raw >> 4) & 0xF) as u8,
        }
    }

    /// Pack back into a raw status word.
    #[must_use]
    pub const fn encode(self) -> u16 {
        ((self.byte as u16) << 8) | ((self.selector as u16) << 4) | self.function.0 as u16
    }

    /// Whether this status echoes `command`.
    #[must_use]
    pub const fn echoes(self, command: Command) -> bool {
        self.function.0 == command.function.0 && self.selector == command.selector
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "func={:x} sel={} byte={:#04x}",
            self.function.0, self.selector, self.byte
        )
    }
}

/// Number of bytes in the status page (function `0x0`).
pub const STATUS_PAGE_LEN: usize = 16;

/// Selectors under [`Function::HANDSHAKE`].
pub mod handshake {
    /// Last BRESP seen on the PCIM write response channel (bits 1:0).
    pub const BRESP: u8 = 0;
    /// PCIM handshake bitmap.
    pub const PCIM_BITS: u8 = 1;
    /// BRESP field mask.
    pub const BRESP_MASK: u8 = 0x3;
}

/// Groups under [`Function::EDGE_COUNTERS`].
pub mod edge {
    /// awvalid rising edges.
    pub const AWVALID: u8 = 0;
    /// awready rising edges.
    pub const AWREADY: u8 = 1;
    /// wvalid rising edges.
    pub const WVALID: u8 = 2;
    /// wready rising edges.
    pub const WREADY: u8 = 3;
}

/// Groups under [`Function::HANDSHAKE_COUNTERS`].
pub mod handshake_counter {
    /// Completed AW handshakes.
    pub const AW: u8 = 0;
    /// Completed W handshakes.
    pub const W: u8 = 1;
}
