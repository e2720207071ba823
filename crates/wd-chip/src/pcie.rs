// SPDX-License-Identifier: AGPL-3.0-only

//! PCIe identifiers and slot addressing.

/// Amazon vendor ID (PCI-SIG assigned).
pub const AMAZON_VENDOR_ID: u16 = 0x1D0F;

/// Application PF device ID of the default F1 shell.
pub const F1_APP_PF_DEVICE_ID: u16 = 0xF000;

/// Largest F1 instance exposes eight FPGA slots.
pub const MAX_SLOTS: u8 = 8;

/// Bit mask selecting `slot` for multi-slot initialization.
#[must_use]
pub const fn slot_mask(slot: u8) -> u32 {
    1 << slot
}

/// Format a `vendor:device` string for use with `lspci -d`.
#[must_use]
pub fn lspci_filter() -> String {
    format!("{AMAZON_VENDOR_ID:04x}:{F1_APP_PF_DEVICE_ID:04x}")
}
