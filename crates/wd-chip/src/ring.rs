// SPDX-License-Identifier: AGPL-3.0-only

//! Result ring geometry.
//!
//! Verify results are DMA'd by the shell into a host ring of fixed-size
//! slots. The slot for request `seq` lives at
//! `(seq & (depth - 1)) * SLOT_BYTES`, so the depth must be a power of two.

/// Bytes per result slot (one PCIM write burst).
pub const SLOT_BYTES: usize = 32;

/// Default ring depth in slots.
pub const DEFAULT_DEPTH: usize = 1024;

/// Size of the hugepage backing the ring.
pub const HUGEPAGE_SIZE: usize = 2 << 20;

/// x86-64 cache line size.
pub const CACHE_LINE: usize = 64;

/// Byte offset of the slot for `seq`.
///
/// `depth` must be a non-zero power of two; the result is only meaningful
/// when it is.
#[must_use]
pub const fn slot_offset(seq: u64, depth: usize, stride: usize) -> usize {
    // Truncation is fine: masked value is < depth, which is a usize.
    #[allow(clippy::cast_possible_truncation)]
    let index = (seq & (depth as u64).wrapping_sub(1)) as usize;
    index * stride
}

/// Bytes required for a ring of `depth` slots of `stride` bytes.
#[must_use]
pub const fn ring_bytes(depth: usize, stride: usize) -> usize {
    depth * stride
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ring_fits_one_hugepage() {
        assert!(ring_bytes(DEFAULT_DEPTH, SLOT_BYTES) <= HUGEPAGE_SIZE);
        assert!(DEFAULT_DEPTH.is_power_of_two());
    }

    #[test]
    fn slot_offset_wraps_at_depth() {
        assert_eq!(slot_offset(1, DEFAULT_DEPTH, SLOT_BYTES), 32);
        assert_eq!(slot_offset(1024, DEFAULT_DEPTH, SLOT_BYTES), 0);
        assert_eq!(slot_offset(1025, DEFAULT_DEPTH, SLOT_BYTES), 32);
        assert_eq!(slot_offset(u64::MAX, 4, 8), 24);
    }
}
