// SPDX-License-Identifier: AGPL-3.0-only

//! OCL BAR register map used by the memory-mapped transports.
//!
//! On F1 the management library reaches the virtual DIP/LED pair through
//! the mailbox PF. The shell also mirrors the pair, the counter snapshot
//! trigger and the latched counter window into the application PF's OCL
//! BAR (BAR0), which is what the `mmio` transports map:
//!
//! ```text
//! 0x0500  SIDEBAND_CMD     [15:0] command word        (write)
//! 0x0504  SIDEBAND_STATUS  [15:0] status word         (read)
//! 0x0600  CNTR_SNAPSHOT    write 1 → latch all counters
//! 0x0700  CNTR_BASE        counter[i] at BASE + 4*i   (read, latched)
//! ```
//!
//! All registers are 32 bits wide; the upper half of the sideband pair reads
//! as zero.

/// BAR index of the OCL window on the application PF.
pub const OCL_BAR: usize = 0;

/// Sideband command register (low 16 bits significant).
pub const SIDEBAND_CMD: usize = 0x0500;

/// Sideband status register (low 16 bits significant).
pub const SIDEBAND_STATUS: usize = 0x0504;

/// Counter snapshot trigger.
pub const CNTR_SNAPSHOT: usize = 0x0600;

/// Value written to [`CNTR_SNAPSHOT`] to latch.
pub const CNTR_SNAPSHOT_TRIGGER: u32 = 1;

/// First latched counter register.
pub const CNTR_BASE: usize = 0x0700;

/// Stride between latched counter registers.
pub const CNTR_STRIDE: usize = 4;

/// Offset of latched counter `index`.
#[must_use]
pub const fn counter(index: u8) -> usize {
    CNTR_BASE + index as usize * CNTR_STRIDE
}

/// Last byte the transports touch; the BAR must be at least this large.
pub const WINDOW_END: usize = counter(crate::counters::MAX_INDEX) + CNTR_STRIDE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets_non_overlapping() {
        assert_ne!(SIDEBAND_CMD, SIDEBAND_STATUS);
        assert!(SIDEBAND_STATUS + 4 <= CNTR_SNAPSHOT);
        assert!(CNTR_SNAPSHOT + 4 <= CNTR_BASE);
    }

    #[test]
    fn counter_window() {
        assert_eq!(counter(0), 0x0700);
        assert_eq!(counter(16), 0x0740);
        assert_eq!(WINDOW_END, 0x0780);
    }
}
