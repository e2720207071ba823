// SPDX-License-Identifier: AGPL-3.0-only

//! Register transports on a real FPGA slot
//!
//! Both the sideband pair and the counter window live in the OCL BAR of the
//! slot's application PF. One [`F1Device`] maps the BAR once and hands out
//! ports that share the mapping.

use super::mmap::MappedBar;
use crate::channel::SidebandPort;
use crate::counters::CounterPort;
use crate::discovery;
use crate::error::{Result, WdError};
use std::sync::Arc;
use wd_chip::counters::MAX_INDEX;
use wd_chip::regs;

/// An opened FPGA slot.
#[derive(Debug, Clone)]
pub struct F1Device {
    bar: Arc<MappedBar>,
}

impl F1Device {
    /// Open the application PF at `pcie_address` and map `bar`.
    ///
    /// # Errors
    ///
    /// Returns [`WdError::DeviceNotFound`] if the address is absent,
    /// [`WdError::DeviceInit`] if it is not an F1 application PF or the BAR
    /// cannot be mapped.
    pub fn open(pcie_address: &str, bar: usize) -> Result<Self> {
        let dir = std::path::Path::new("/sys/bus/pci/devices").join(pcie_address);
        if !dir.exists() {
            return Err(WdError::device_not_found(dir));
        }
        if !discovery::is_app_pf(&dir) {
            return Err(WdError::device_init(format!(
                "{pcie_address} is not an F1 application PF ({})",
                wd_chip::pcie::lspci_filter()
            )));
        }

        let bar = MappedBar::new(pcie_address, bar)?;
        if bar.size() < regs::WINDOW_END {
            return Err(WdError::device_init(format!(
                "BAR{} is {:#x} bytes, shell registers need {:#x}",
                bar.bar_index(),
                bar.size(),
                regs::WINDOW_END
            )));
        }
        Ok(Self { bar: Arc::new(bar) })
    }

    /// Open FPGA slot `slot` on the OCL BAR.
    ///
    /// # Errors
    ///
    /// Returns error if the slot does not exist or cannot be opened.
    pub fn open_slot(slot: u8) -> Result<Self> {
        let address = discovery::find_slot(slot)?;
        Self::open(&address, regs::OCL_BAR)
    }

    /// PCIe address of the slot.
    pub fn pcie_address(&self) -> &str {
        self.bar.pcie_address()
    }

    /// Sideband transport.
    pub fn sideband_port(&self) -> MmioPort {
        MmioPort {
            bar: Arc::clone(&self.bar),
        }
    }

    /// Counter transport.
    pub fn counter_port(&self) -> MmioCounterPort {
        MmioCounterPort {
            bar: Arc::clone(&self.bar),
        }
    }
}

/// Sideband command/status pair in the OCL BAR.
#[derive(Debug, Clone)]
pub struct MmioPort {
    bar: Arc<MappedBar>,
}

impl SidebandPort for MmioPort {
    fn set_command(&mut self, value: u16) -> Result<()> {
        self.bar.write_u32(regs::SIDEBAND_CMD, u32::from(value))
    }

    // upper half of the register is reserved
    #[allow(clippy::cast_possible_truncation)]
    fn get_status(&mut self) -> Result<u16> {
        self.bar.read_u32(regs::SIDEBAND_STATUS).map(|v| v as u16)
    }
}

/// Snapshot trigger and latched counter window in the OCL BAR.
#[derive(Debug, Clone)]
pub struct MmioCounterPort {
    bar: Arc<MappedBar>,
}

impl CounterPort for MmioCounterPort {
    fn snapshot(&mut self) -> Result<()> {
        self.bar.write_u32(regs::CNTR_SNAPSHOT, regs::CNTR_SNAPSHOT_TRIGGER)
    }

    fn read_counter(&mut self, index: u8) -> Result<u32> {
        if index > MAX_INDEX {
            return Err(WdError::invalid_request(format!(
                "counter {index} beyond window (max {MAX_INDEX})"
            )));
        }
        self.bar.read_u32(regs::counter(index))
    }
}
