// SPDX-License-Identifier: AGPL-3.0-only

//! Shell backends
//!
//! - **Hardware**: sideband and counters through the slot's OCL BAR
//!   (`/sys/bus/pci/devices/<addr>/resource0`). Work submission is owned by
//!   the external request path, not by this crate.
//! - **Simulated**: the whole host-visible surface in-process, including
//!   work submission and completion writes.

pub mod hardware;
pub mod mmap;
pub mod sim;

pub use hardware::{F1Device, MmioCounterPort, MmioPort};
pub use mmap::MappedBar;
pub use sim::{ResultRecord, SimCounterPort, SimSidebandPort, SimulatedShell};
