// SPDX-License-Identifier: AGPL-3.0-only

//! DMA completion detection
//!
//! The shell signals completion only by writing the result slot. The host
//! sees that write once the slot's cache lines have been invalidated, so
//! every inspection here is invalidate → load → test for non-zero.
//!
//! A slot that is still zero at the deadline is reported with `Ok(false)` and
//! a warning, not an error. The ring is zeroed at allocation, so a zero slot
//! means "not yet", never corruption.

use crate::config::PollConfig;
use crate::error::{Result, WdError};
use std::ops::Range;
use std::time::{Duration, Instant};

/// Host view of memory a device writes into.
pub trait HostMemory {
    /// Bytes addressable through [`Self::load`].
    fn len(&self) -> usize;

    /// Whether the region is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make device writes to `range` visible to subsequent loads.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the region.
    fn invalidate(&self, range: Range<usize>) -> Result<()>;

    /// Copy `out.len()` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the region.
    fn load(&self, offset: usize, out: &mut [u8]) -> Result<()>;
}

impl<M: HostMemory + ?Sized> HostMemory for std::sync::Arc<M> {
    fn len(&self) -> usize {
        (**self).len()
    }

    fn invalidate(&self, range: Range<usize>) -> Result<()> {
        (**self).invalidate(range)
    }

    fn load(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        (**self).load(offset, out)
    }
}

/// Polls result slots for device writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompletionDetector {
    config: PollConfig,
}

impl CompletionDetector {
    /// Detector with default timing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector with explicit timing.
    pub const fn with_config(config: PollConfig) -> Self {
        Self { config }
    }

    /// Timing in use.
    pub const fn config(&self) -> &PollConfig {
        &self.config
    }

    /// Invalidate `range` and fence.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the region.
    pub fn invalidate<M: HostMemory + ?Sized>(&self, mem: &M, range: Range<usize>) -> Result<()> {
        mem.invalidate(range)
    }

    /// Fresh copy of `range`, invalidated first.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the region.
    pub fn read_fresh<M: HostMemory + ?Sized>(&self, mem: &M, range: Range<usize>) -> Result<Vec<u8>> {
        mem.invalidate(range.clone())?;
        let mut bytes = vec![0u8; range.len()];
        mem.load(range.start, &mut bytes)?;
        Ok(bytes)
    }

    /// Whether any byte of `range` is non-zero right now.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the region.
    pub fn is_written<M: HostMemory + ?Sized>(&self, mem: &M, range: Range<usize>) -> Result<bool> {
        Ok(self.read_fresh(mem, range)?.iter().any(|&b| b != 0))
    }

    /// Poll `slot` until it turns non-zero or `timeout` elapses.
    ///
    /// The slot is inspected at least once, even with a zero timeout.
    ///
    /// # Errors
    ///
    /// Returns error only if `slot` exceeds the region. Expiry is `Ok(false)`.
    pub fn poll_for_write<M: HostMemory + ?Sized>(
        &self,
        mem: &M,
        slot: Range<usize>,
        timeout: Duration,
    ) -> Result<bool> {
        let start = Instant::now();
        let mut polls = 0u32;
        loop {
            polls += 1;
            if self.is_written(mem, slot.clone())? {
                tracing::debug!(
                    "Slot {:#x} written after {polls} polls ({:?})",
                    slot.start,
                    start.elapsed()
                );
                return Ok(true);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                break;
            }
            let nap = self.config.interval.min(timeout - elapsed);
            if !nap.is_zero() {
                std::thread::sleep(nap);
            }
        }
        tracing::warn!(
            "Slot {:#x}..{:#x} still zero after {:?} ({polls} polls)",
            slot.start,
            slot.end,
            timeout
        );
        Ok(false)
    }

    /// [`Self::poll_for_write`] with the configured default deadline.
    ///
    /// # Errors
    ///
    /// Returns error only if `slot` exceeds the region.
    pub fn poll<M: HostMemory + ?Sized>(&self, mem: &M, slot: Range<usize>) -> Result<bool> {
        self.poll_for_write(mem, slot, self.config.timeout)
    }

    /// Wait for `slot` and return its contents; expiry is an error.
    ///
    /// # Errors
    ///
    /// Returns [`WdError::Timeout`] if the slot stays zero past `timeout`.
    pub fn wait_for_slot<M: HostMemory + ?Sized>(
        &self,
        mem: &M,
        slot: Range<usize>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        if self.poll_for_write(mem, slot.clone(), timeout)? {
            self.read_fresh(mem, slot)
        } else {
            Err(WdError::timeout(timeout))
        }
    }

    /// Lazily walk the first `size` bytes in `chunk`-byte pieces, yielding
    /// `(offset, bytes)` for every piece that is not all zero.
    ///
    /// A trailing partial chunk is yielded short.
    ///
    /// # Errors
    ///
    /// Returns error if `chunk` is zero or `size` exceeds the region.
    pub fn scan_nonzero<'a, M: HostMemory + ?Sized>(
        &self,
        mem: &'a M,
        size: usize,
        chunk: usize,
    ) -> Result<NonZeroChunks<'a, M>> {
        if chunk == 0 {
            return Err(WdError::invalid_request("scan chunk must be non-zero"));
        }
        if size > mem.len() {
            return Err(WdError::invalid_request(format!(
                "scan of {size:#x} bytes exceeds region of {:#x}",
                mem.len()
            )));
        }
        Ok(NonZeroChunks {
            mem,
            offset: 0,
            end: size,
            chunk,
        })
    }
}

/// Iterator returned by [`CompletionDetector::scan_nonzero`].
#[derive(Debug)]
pub struct NonZeroChunks<'a, M: ?Sized> {
    mem: &'a M,
    offset: usize,
    end: usize,
    chunk: usize,
}

impl<M: HostMemory + ?Sized> Iterator for NonZeroChunks<'_, M> {
    type Item = (usize, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let mut bytes = Vec::new();
        while self.offset < self.end {
            let offset = self.offset;
            let len = self.chunk.min(self.end - offset);
            self.offset += len;

            bytes.clear();
            bytes.resize(len, 0);
            let fetched = self
                .mem
                .invalidate(offset..offset + len)
                .and_then(|()| self.mem.load(offset, &mut bytes));
            if let Err(e) = fetched {
                tracing::warn!("Scan stopped at {offset:#x}: {e}");
                self.offset = self.end;
                return None;
            }
            if bytes.iter().any(|&b| b != 0) {
                return Some((offset, bytes));
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some((self.end - self.offset).div_ceil(self.chunk)))
    }
}

impl<M: HostMemory + ?Sized> std::iter::FusedIterator for NonZeroChunks<'_, M> {}
