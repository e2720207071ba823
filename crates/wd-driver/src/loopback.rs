// SPDX-License-Identifier: AGPL-3.0-only

//! Loop-back check
//!
//! Brings up a result ring, looks at the PCIM capture registers, submits one
//! all-zero verify request, snapshots the pipeline counters and waits for
//! the result slot to turn non-zero. A zero slot at the end is a finding,
//! not a failure: the report carries it and the caller decides.

use crate::channel::{SidebandChannel, SidebandPort};
use crate::completion::CompletionDetector;
use crate::config::PollConfig;
use crate::counters::{CounterPort, CounterReading, CounterRegistry};
use crate::error::Result;
use crate::pcim::{PcimProbe, PcimReport};
use crate::ring::{page_size, Backing, PinnedBuffer, RingLayout};
use crate::submit::{VerifyRequest, WorkSubmitter};
use std::sync::Arc;
use std::time::Duration;
use wd_chip::ring::{DEFAULT_DEPTH, HUGEPAGE_SIZE, SLOT_BYTES};
use wd_chip::sideband::Status;

/// Loop-back parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// FPGA slot.
    pub slot: u8,
    /// Ring buffer size in bytes.
    pub buffer_size: usize,
    /// Ring depth (power of two).
    pub depth: usize,
    /// Slot stride in bytes.
    pub stride: usize,
    /// Sequence number of the test request.
    pub sequence: u64,
    /// How long to wait for the result write.
    pub dma_wait: Duration,
    /// Ring memory.
    pub backing: Backing,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            slot: 0,
            buffer_size: HUGEPAGE_SIZE,
            depth: DEFAULT_DEPTH,
            stride: SLOT_BYTES,
            sequence: 1,
            dma_wait: Duration::from_millis(5),
            backing: Backing::HugePage,
        }
    }
}

/// What the loop-back check saw.
#[derive(Debug, Clone)]
pub struct LoopbackReport {
    /// PCIM state before submission.
    pub pcim: PcimReport,
    /// Whether a request was handed to a submitter.
    pub submitted: bool,
    /// Counter snapshot taken right after submission.
    pub counters: Vec<CounterReading>,
    /// Byte offset of the result slot in the ring.
    pub slot_offset: usize,
    /// Bus address the shell should target, when known.
    pub expected_bus_address: Option<u64>,
    /// Whether the slot turned non-zero before the deadline.
    pub completed: bool,
    /// Slot contents after the wait.
    pub slot: Vec<u8>,
    /// Raw status register at the end.
    pub final_status: Status,
}

/// The pieces the check runs against.
#[derive(Debug)]
pub struct Loopback<'a, P, C> {
    /// Sideband channel of the slot.
    pub channel: &'a SidebandChannel<P>,
    /// Counter registry of the slot.
    pub counters: &'a mut CounterRegistry<C>,
    /// Request path; `None` skips submission.
    pub submitter: Option<&'a mut dyn WorkSubmitter>,
    /// Completion polling.
    pub poll: PollConfig,
}

impl<P: SidebandPort, C: CounterPort> Loopback<'_, P, C> {
    /// Run the check with a freshly allocated ring.
    ///
    /// # Errors
    ///
    /// Returns error if the ring cannot be allocated or attached, or a
    /// transport fails outright. Missing completions are not errors.
    pub fn run(self, config: &ProbeConfig) -> Result<LoopbackReport> {
        let layout = RingLayout::new(config.depth, config.stride)?;
        tracing::info!("Allocating {:?} ring buffer of {:#x} bytes", config.backing, config.buffer_size);
        let buffer = PinnedBuffer::allocate(config.buffer_size, page_size(), config.backing)?;
        layout.check_fits(&buffer)?;
        buffer.flush();
        self.run_with(Arc::new(buffer), layout, config)
    }

    /// Run the check against an existing ring.
    ///
    /// # Errors
    ///
    /// As for [`Self::run`].
    pub fn run_with(
        self,
        buffer: Arc<PinnedBuffer>,
        layout: RingLayout,
        config: &ProbeConfig,
    ) -> Result<LoopbackReport> {
        let Self {
            channel,
            counters,
            mut submitter,
            poll,
        } = self;

        if let Some(s) = submitter.as_deref_mut() {
            s.attach_ring(Arc::clone(&buffer), layout)?;
        }

        let pcim = PcimProbe::new(channel).report()?;

        let message = [0u8; 64];
        let signature = [0u8; 64];
        let public_key = [0u8; 32];
        let submitted = match submitter.as_deref_mut() {
            Some(s) => {
                s.submit(&VerifyRequest::new(&message, &signature, &public_key, config.sequence))?;
                true
            }
            None => {
                tracing::warn!("No work submitter; skipping verify request");
                false
            }
        };

        let readings = counters.read_all()?;

        let slot_range = layout.slot_range(config.sequence);
        let detector = CompletionDetector::with_config(poll);
        let completed = detector.poll_for_write(&*buffer, slot_range.clone(), config.dma_wait)?;
        let slot = detector.read_fresh(&*buffer, slot_range.clone())?;

        let expected_bus_address = buffer
            .physical_address()
            .map(|base| base + slot_range.start as u64);

        Ok(LoopbackReport {
            pcim,
            submitted,
            counters: readings,
            slot_offset: slot_range.start,
            expected_bus_address,
            completed,
            slot,
            final_status: channel.raw_status()?,
        })
    }
}
