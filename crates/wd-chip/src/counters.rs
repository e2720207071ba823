// SPDX-License-Identifier: AGPL-3.0-only

//! Named snapshot counters.
//!
//! The shell keeps free-running 32-bit counters along the verify pipeline
//! (pad → sha → sv0 → sv2 → ecc) and at the request/result FIFOs. A snapshot
//! trigger latches all of them in the same cycle; reads return the latched
//! copy until the next trigger.
//!
//! Indices are sparse: 0, 8 and 9 are reserved.

/// One entry of the counter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterDesc {
    /// Counter index as addressed by the read port.
    pub index: u8,
    /// Display label.
    pub label: &'static str,
}

impl CounterDesc {
    const fn new(index: u8, label: &'static str) -> Self {
        Self { index, label }
    }
}

/// Padding stage input.
pub const PAD_IN: u8 = 1;
/// Padding stage output.
pub const PAD_OUT: u8 = 2;
/// SHA-512 stage output.
pub const SHA_OUT: u8 = 3;
/// First scalar-verify stage output.
pub const SV0_OUT: u8 = 4;
/// Second scalar-verify stage, fault path.
pub const SV2_F: u8 = 5;
/// Second scalar-verify stage output.
pub const SV2_OUT: u8 = 6;
/// Curve arithmetic stage output.
pub const ECC_OUT: u8 = 7;
/// Requests accepted.
pub const INPUT_COUNT: u8 = 10;
/// Request FIFO fill level.
pub const INPUT_FIFO_FILL: u8 = 11;
/// Requests dropped on a full FIFO.
pub const INPUT_DROPS: u8 = 12;
/// Results produced.
pub const RESULT_COUNT: u8 = 13;
/// Result FIFO fill level.
pub const RESULT_FIFO_FILL: u8 = 14;
/// Results dropped on a full FIFO.
pub const RESULT_DROPS: u8 = 15;
/// Results written to host memory over PCIM.
pub const RESULT_DMA_COUNT: u8 = 16;

/// Counters reported after a snapshot, in display order.
pub const SNAPSHOT_COUNTERS: &[CounterDesc] = &[
    CounterDesc::new(PAD_IN, "pad in"),
    CounterDesc::new(PAD_OUT, "pad out"),
    CounterDesc::new(SHA_OUT, "sha out"),
    CounterDesc::new(SV0_OUT, "sv0 out"),
    CounterDesc::new(SV2_F, "sv2_f"),
    CounterDesc::new(SV2_OUT, "sv2 out"),
    CounterDesc::new(ECC_OUT, "ecc out"),
    CounterDesc::new(INPUT_COUNT, "input count"),
    CounterDesc::new(INPUT_FIFO_FILL, "input fifo fill"),
    CounterDesc::new(INPUT_DROPS, "input drops"),
    CounterDesc::new(RESULT_COUNT, "result count"),
    CounterDesc::new(RESULT_FIFO_FILL, "result fifo fill"),
    CounterDesc::new(RESULT_DROPS, "result drops"),
    CounterDesc::new(RESULT_DMA_COUNT, "result dma count"),
];

/// Highest counter index the read port decodes.
pub const MAX_INDEX: u8 = 31;

/// Look up the label for a counter index.
#[must_use]
pub fn label(index: u8) -> Option<&'static str> {
    SNAPSHOT_COUNTERS
        .iter()
        .find(|d| d.index == index)
        .map(|d| d.label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_unique_and_in_range() {
        for (i, a) in SNAPSHOT_COUNTERS.iter().enumerate() {
            assert!(a.index <= MAX_INDEX);
            for b in &SNAPSHOT_COUNTERS[i + 1..] {
                assert_ne!(a.index, b.index, "duplicate index {}", a.index);
            }
        }
    }

    #[test]
    fn label_lookup() {
        assert_eq!(label(RESULT_DMA_COUNT), Some("result dma count"));
        assert_eq!(label(0), None);
        assert_eq!(label(8), None);
    }
}
