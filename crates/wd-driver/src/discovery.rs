// SPDX-License-Identifier: AGPL-3.0-only

//! FPGA slot discovery
//!
//! Scans `/sys/bus/pci/devices` for application PFs of the F1 shell. Slots
//! are numbered in PCIe address order, matching the order the management
//! tools use.

use crate::error::{Result, WdError};
use std::path::Path;
use wd_chip::pcie::{AMAZON_VENDOR_ID, F1_APP_PF_DEVICE_ID, MAX_SLOTS};

const PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// One discovered FPGA slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Slot index (0..8).
    pub slot: u8,
    /// PCIe address of the application PF, e.g. `0000:00:1d.0`.
    pub pcie_address: String,
}

/// All application PFs on this host, in slot order.
///
/// # Errors
///
/// Returns error if sysfs cannot be read. An empty list is not an error.
pub fn discover() -> Result<Vec<SlotInfo>> {
    discover_in(Path::new(PCI_DEVICES))
}

fn discover_in(root: &Path) -> Result<Vec<SlotInfo>> {
    let entries = std::fs::read_dir(root)
        .map_err(|e| WdError::device_init(format!("Cannot read {}: {e}", root.display())))?;

    let mut addresses: Vec<String> = entries
        .flatten()
        .filter(|entry| is_app_pf(&entry.path()))
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    addresses.sort();

    if addresses.len() > usize::from(MAX_SLOTS) {
        tracing::warn!(
            "{} application PFs found, only the first {MAX_SLOTS} are slots",
            addresses.len()
        );
    }

    let slots: Vec<SlotInfo> = addresses
        .into_iter()
        .zip(0..MAX_SLOTS)
        .map(|(pcie_address, slot)| SlotInfo { slot, pcie_address })
        .collect();
    tracing::info!("Discovered {} FPGA slot(s)", slots.len());
    Ok(slots)
}

/// PCIe address of `slot`.
///
/// # Errors
///
/// Returns [`WdError::DeviceNotFound`] if the slot does not exist.
pub fn find_slot(slot: u8) -> Result<String> {
    discover()?
        .into_iter()
        .find(|s| s.slot == slot)
        .map(|s| s.pcie_address)
        .ok_or_else(|| WdError::device_not_found(format!("{PCI_DEVICES} (slot {slot})")))
}

/// Whether the sysfs device directory is an F1 application PF.
pub(crate) fn is_app_pf(dir: &Path) -> bool {
    matches!(
        (read_hex_sysfs(&dir.join("vendor")), read_hex_sysfs(&dir.join("device"))),
        (Some(AMAZON_VENDOR_ID), Some(F1_APP_PF_DEVICE_ID))
    )
}

fn read_hex_sysfs(path: &Path) -> Option<u16> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_hex_id(&content)
}

/// Parse a sysfs id file (`0x1d0f\n`).
fn parse_hex_id(content: &str) -> Option<u16> {
    let trimmed = content.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(digits, 16).ok()
}
