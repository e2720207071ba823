// SPDX-License-Identifier: AGPL-3.0-only

//! Silicon model for the Wiredancer ED25519 shell on AWS F1.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of what the host sees of the shell: the sideband function map
//! and its bit packing, the named counter table, result-ring geometry, BAR
//! register offsets and PCIe identifiers.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`sideband`] | Function codes, command/status packing, selector layouts |
//! | [`counters`] | Named snapshot counter table |
//! | [`ring`] | Result ring geometry (slot stride, depth, hugepage size) |
//! | [`regs`] | BAR register map used by the memory-mapped transports |
//! | [`pcie`] | Vendor/device IDs, slot masks |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod counters;
pub mod pcie;
pub mod regs;
pub mod ring;
pub mod sideband;
