// SPDX-License-Identifier: AGPL-3.0-only

//! Pinned result ring
//!
//! The shell DMAs each verify result into a 32-byte slot of a host ring. The
//! ring lives in memory that cannot move or be paged out while the device
//! holds its address:
//!
//! - [`Backing::HugePage`]: one anonymous 2 MiB hugepage (`MAP_HUGETLB`).
//!   Physically contiguous, never swapped. Requires reserved hugepages
//!   (`vm.nr_hugepages`).
//! - [`Backing::Locked`]: page-aligned heap allocation pinned with `mlock`.
//!   Resident, but only contiguous per page.
//! - [`Backing::Heap`]: ordinary zeroed allocation. Only for the simulated
//!   shell; no device may target it.
//!
//! Every backing is zeroed at allocation, so a non-zero slot can only mean a
//! device write. Host reads go through [`HostMemory`] and never bypass the
//! visibility barrier.

// Pointer/integer casts are inherent to address arithmetic on mapped memory
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::barrier::{platform_barrier, VisibilityBarrier};
use crate::completion::HostMemory;
use crate::error::{Result, WdError};
use rustix::mm::{mlock, mmap_anonymous, munlock, munmap, MapFlags, ProtFlags};
use std::alloc::Layout;
use std::fs::File;
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::ptr::NonNull;
use wd_chip::ring::{slot_offset, DEFAULT_DEPTH, HUGEPAGE_SIZE, SLOT_BYTES};

/// Where the pinned memory comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Anonymous 2 MiB hugepage(s).
    HugePage,
    /// Page-aligned allocation locked with `mlock`.
    Locked,
    /// Unpinned allocation for simulation.
    Heap,
}

impl std::str::FromStr for Backing {
    type Err = WdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hugepage" | "huge" => Ok(Self::HugePage),
            "locked" | "mlock" => Ok(Self::Locked),
            "heap" => Ok(Self::Heap),
            other => Err(WdError::invalid_request(format!(
                "unknown backing {other:?} (hugepage, locked, heap)"
            ))),
        }
    }
}

/// Zeroed, pinned host memory a device can write into.
pub struct PinnedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    align: usize,
    backing: Backing,
    barrier: Box<dyn VisibilityBarrier>,
}

impl std::fmt::Debug for PinnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedBuffer")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("size", &self.size)
            .field("align", &self.align)
            .field("backing", &self.backing)
            .field("barrier", &self.barrier.name())
            .finish()
    }
}

// SAFETY: PinnedBuffer owns its mapping exclusively; moving it between
// threads does not affect the mapping.
unsafe impl Send for PinnedBuffer {}

// SAFETY: all access through &self is bounds-checked and volatile, matching
// how the device itself writes the memory behind our back.
unsafe impl Sync for PinnedBuffer {}

impl PinnedBuffer {
    /// Allocate `size` zeroed bytes aligned to `alignment`.
    ///
    /// # Errors
    ///
    /// Returns [`WdError::InvalidRequest`] for a zero size or non power of
    /// two alignment, and [`WdError::AllocationFailed`] if the memory cannot
    /// be obtained or pinned.
    pub fn allocate(size: usize, alignment: usize, backing: Backing) -> Result<Self> {
        if size == 0 {
            return Err(WdError::invalid_request("pinned buffer size must be non-zero"));
        }
        if !alignment.is_power_of_two() {
            return Err(WdError::invalid_request(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let page = page_size();
        let (ptr, size, align) = match backing {
            Backing::HugePage => {
                if alignment > HUGEPAGE_SIZE {
                    return Err(WdError::invalid_request(format!(
                        "alignment {alignment:#x} exceeds hugepage size"
                    )));
                }
                let size = size.div_ceil(HUGEPAGE_SIZE) * HUGEPAGE_SIZE;
                (map_hugepages(size)?, size, HUGEPAGE_SIZE)
            }
            Backing::Locked => {
                let align = alignment.max(page);
                let size = size.div_ceil(page) * page;
                (alloc_locked(size, align)?, size, align)
            }
            Backing::Heap => {
                let layout = Layout::from_size_align(size, alignment)
                    .map_err(|e| WdError::allocation_failed(size, e.to_string()))?;
                // SAFETY: layout has non-zero size (checked above).
                let raw = unsafe { std::alloc::alloc_zeroed(layout) };
                let ptr = NonNull::new(raw)
                    .ok_or_else(|| WdError::allocation_failed(size, "out of memory"))?;
                (ptr, size, alignment)
            }
        };

        let buffer = Self {
            ptr,
            size,
            align,
            backing,
            barrier: platform_barrier(),
        };
        // mmap'd and alloc_zeroed memory is already zero; writing it faults
        // every page in before the device is told about it.
        buffer.fill_zero();
        tracing::info!(
            "Allocated {:?} buffer at {:p}, size={:#x}, align={:#x}",
            backing,
            buffer.ptr,
            size,
            align
        );
        Ok(buffer)
    }

    /// One 2 MiB hugepage, the standard result ring backing.
    ///
    /// # Errors
    ///
    /// Returns error if no hugepage is available.
    pub fn hugepage() -> Result<Self> {
        Self::allocate(HUGEPAGE_SIZE, HUGEPAGE_SIZE, Backing::HugePage)
    }

    /// Replace the visibility barrier.
    #[must_use]
    pub fn with_barrier(mut self, barrier: Box<dyn VisibilityBarrier>) -> Self {
        self.barrier = barrier;
        self
    }

    /// Size in bytes (rounded up to the backing's granule).
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Alignment actually provided.
    pub const fn alignment(&self) -> usize {
        self.align
    }

    /// Backing kind.
    pub const fn backing(&self) -> Backing {
        self.backing
    }

    /// Host virtual base address.
    pub const fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Barrier name, for logs.
    pub fn barrier_name(&self) -> &'static str {
        self.barrier.name()
    }

    /// Physical address of the first byte, from `/proc/self/pagemap`.
    ///
    /// Returns `None` without `CAP_SYS_ADMIN` (the kernel reports PFN 0) or
    /// if the page is not present.
    pub fn physical_address(&self) -> Option<u64> {
        physical_address_of(self.ptr.as_ptr() as usize)
    }

    /// Write the whole buffer back to memory before handing it to a device.
    pub fn flush(&self) {
        // SAFETY: the full range [ptr, ptr+size) is owned and mapped.
        unsafe { self.barrier.invalidate(self.ptr.as_ptr(), self.size) };
    }

    /// Zero the whole buffer.
    pub fn fill_zero(&self) {
        for i in 0..self.size {
            // SAFETY: i < size, memory owned and mapped.
            unsafe { self.ptr.as_ptr().add(i).write_volatile(0) };
        }
    }

    /// Store bytes at `offset`, as a device write would land.
    ///
    /// Used by the simulated shell; real devices write over PCIe.
    ///
    /// # Errors
    ///
    /// Returns error if the range exceeds the buffer.
    pub fn store(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check_range(offset, data.len())?;
        for (i, &b) in data.iter().enumerate() {
            // SAFETY: bounds checked above.
            unsafe { self.ptr.as_ptr().add(offset + i).write_volatile(b) };
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(WdError::invalid_request(format!(
                "range {offset:#x}+{len:#x} outside buffer of {:#x} bytes",
                self.size
            ))),
        }
    }
}

impl HostMemory for PinnedBuffer {
    fn len(&self) -> usize {
        self.size
    }

    fn invalidate(&self, range: Range<usize>) -> Result<()> {
        self.check_range(range.start, range.len())?;
        // SAFETY: range checked against the owned mapping.
        unsafe {
            self.barrier
                .invalidate(self.ptr.as_ptr().add(range.start), range.len());
        }
        Ok(())
    }

    fn load(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.check_range(offset, out.len())?;
        for (i, b) in out.iter_mut().enumerate() {
            // SAFETY: bounds checked above; volatile because the device may
            // have written the byte without the compiler's knowledge.
            *b = unsafe { self.ptr.as_ptr().add(offset + i).read_volatile() };
        }
        Ok(())
    }
}

impl Drop for PinnedBuffer {
    fn drop(&mut self) {
        match self.backing {
            Backing::HugePage => {
                // SAFETY: ptr/size are exactly what mmap returned; no
                // references outlive self.
                if let Err(e) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
                    tracing::error!("munmap failed during drop: {e}");
                }
            }
            Backing::Locked => {
                // SAFETY: ptr/size were mlock'd in alloc_locked.
                if let Err(e) = unsafe { munlock(self.ptr.as_ptr().cast(), self.size) } {
                    tracing::error!("munlock failed during drop: {e}");
                }
                if let Ok(layout) = Layout::from_size_align(self.size, self.align) {
                    // SAFETY: matches the alloc_zeroed layout in alloc_locked.
                    unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
                }
            }
            Backing::Heap => {
                if let Ok(layout) = Layout::from_size_align(self.size, self.align) {
                    // SAFETY: matches the alloc_zeroed layout in allocate.
                    unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
                }
            }
        }
        tracing::debug!("Freed {:?} buffer at {:p}", self.backing, self.ptr);
    }
}

fn map_hugepages(size: usize) -> Result<NonNull<u8>> {
    let flags = MapFlags::PRIVATE
        | MapFlags::from_bits_retain((libc::MAP_HUGETLB | libc::MAP_HUGE_2MB) as u32);

    // SAFETY: anonymous mapping at a kernel-chosen address; no existing
    // memory is affected. The result is unmapped in Drop.
    let addr = unsafe {
        mmap_anonymous(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            flags,
        )
    }
    .map_err(|e| {
        WdError::allocation_failed(
            size,
            format!("mmap MAP_HUGETLB failed: {e} (are hugepages reserved?)"),
        )
    })?;

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| WdError::allocation_failed(size, "mmap returned null"))
}

fn alloc_locked(size: usize, align: usize) -> Result<NonNull<u8>> {
    let layout = Layout::from_size_align(size, align)
        .map_err(|e| WdError::allocation_failed(size, format!("invalid layout: {e}")))?;

    // SAFETY: non-zero size, power-of-two alignment (validated by caller).
    let raw = unsafe { std::alloc::alloc_zeroed(layout) };
    let ptr = NonNull::new(raw).ok_or_else(|| WdError::allocation_failed(size, "out of memory"))?;

    // SAFETY: [ptr, ptr+size) is the allocation just made.
    if let Err(e) = unsafe { mlock(ptr.as_ptr().cast(), size) } {
        // SAFETY: same layout as the allocation above.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        return Err(WdError::allocation_failed(
            size,
            format!("mlock failed: {e} (check RLIMIT_MEMLOCK)"),
        ));
    }
    Ok(ptr)
}

/// Base page size of this host; the minimum alignment of a device-visible
/// buffer.
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Resolve a virtual address through `/proc/self/pagemap`.
fn physical_address_of(vaddr: usize) -> Option<u64> {
    const PRESENT: u64 = 1 << 63;
    const PFN_MASK: u64 = (1 << 55) - 1;

    let page = page_size();
    let file = File::open("/proc/self/pagemap").ok()?;
    let mut entry = [0u8; 8];
    file.read_exact_at(&mut entry, (vaddr / page) as u64 * 8).ok()?;
    let entry = u64::from_le_bytes(entry);

    let pfn = entry & PFN_MASK;
    if entry & PRESENT == 0 || pfn == 0 {
        tracing::debug!("pagemap entry for {vaddr:#x} unavailable ({entry:#x})");
        return None;
    }
    Some(pfn * page as u64 + (vaddr % page) as u64)
}

/// Ring geometry: power-of-two depth, fixed stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    depth: usize,
    stride: usize,
}

impl Default for RingLayout {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            stride: SLOT_BYTES,
        }
    }
}

impl RingLayout {
    /// Validate a geometry.
    ///
    /// # Errors
    ///
    /// Returns error unless `depth` is a non-zero power of two and `stride`
    /// is non-zero.
    pub fn new(depth: usize, stride: usize) -> Result<Self> {
        if !depth.is_power_of_two() {
            return Err(WdError::invalid_request(format!(
                "ring depth {depth} is not a power of two"
            )));
        }
        if stride == 0 {
            return Err(WdError::invalid_request("ring stride must be non-zero"));
        }
        Ok(Self { depth, stride })
    }

    /// Slots in the ring.
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Bytes per slot.
    pub const fn stride(&self) -> usize {
        self.stride
    }

    /// Bytes spanned by the ring.
    pub const fn bytes(&self) -> usize {
        self.depth * self.stride
    }

    /// Offset of the slot for `sequence`: `(sequence & (depth - 1)) * stride`.
    pub const fn slot_address(&self, sequence: u64) -> usize {
        slot_offset(sequence, self.depth, self.stride)
    }

    /// Byte range of the slot for `sequence`.
    pub const fn slot_range(&self, sequence: u64) -> Range<usize> {
        let start = self.slot_address(sequence);
        start..start + self.stride
    }

    /// Check the ring fits in `buffer`.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is smaller than the ring.
    pub fn check_fits(&self, buffer: &impl HostMemory) -> Result<()> {
        if self.bytes() > buffer.len() {
            return Err(WdError::invalid_request(format!(
                "ring of {} x {} bytes does not fit buffer of {:#x} bytes",
                self.depth,
                self.stride,
                buffer.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionDetector;
    use crate::config::PollConfig;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records every `(address, length)` it is asked to invalidate.
    #[derive(Debug, Default, Clone)]
    struct RecordingBarrier {
        calls: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl RecordingBarrier {
        fn calls(&self) -> Vec<(usize, usize)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl VisibilityBarrier for RecordingBarrier {
        unsafe fn invalidate(&self, addr: *const u8, len: usize) {
            self.calls.lock().unwrap().push((addr as usize, len));
        }

        fn name(&self) -> &'static str {
            "recording"
        }
    }

    fn recorded(size: usize) -> (PinnedBuffer, RecordingBarrier) {
        let barrier = RecordingBarrier::default();
        let buf = PinnedBuffer::allocate(size, 64, Backing::Heap)
            .unwrap()
            .with_barrier(Box::new(barrier.clone()));
        (buf, barrier)
    }

    #[test]
    fn invalidate_and_flush_reach_the_barrier() {
        let (buf, barrier) = recorded(4096);
        assert_eq!(buf.barrier_name(), "recording");
        let base = buf.as_ptr() as usize;

        buf.invalidate(32..64).unwrap();
        buf.flush();
        assert!(buf.invalidate(4090..4100).is_err());

        assert_eq!(barrier.calls(), vec![(base + 32, 32), (base, 4096)]);
    }

    #[test]
    fn completion_poll_invalidates_the_slot_it_reads() {
        let (buf, barrier) = recorded(4096);
        let base = buf.as_ptr() as usize;
        buf.store(96, &[5]).unwrap();

        let det = CompletionDetector::with_config(PollConfig::default());
        assert!(det.poll_for_write(&buf, 96..128, Duration::ZERO).unwrap());
        assert_eq!(barrier.calls(), vec![(base + 96, 32)]);

        barrier.calls.lock().unwrap().clear();
        assert!(!det.poll_for_write(&buf, 0..32, Duration::from_millis(1)).unwrap());
        let calls = barrier.calls();
        assert!(!calls.is_empty());
        assert!(calls.iter().all(|&c| c == (base, 32)), "{calls:?}");
    }

    #[test]
    fn scan_with_oversized_chunk_on_pinned_buffer() {
        let buf = PinnedBuffer::allocate(64, 64, Backing::Heap).unwrap();
        buf.store(3, &[1]).unwrap();
        let hits: Vec<_> = CompletionDetector::new()
            .scan_nonzero(&buf, 64, 1 << 62)
            .unwrap()
            .collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].1.len(), 64);
    }

    #[test]
    fn heap_buffer_is_zeroed_and_aligned() {
        let buf = PinnedBuffer::allocate(HUGEPAGE_SIZE, 4096, Backing::Heap).unwrap();
        assert_eq!(buf.size(), HUGEPAGE_SIZE);
        assert_eq!(buf.as_ptr() as usize % 4096, 0);
        let mut tail = vec![0xFFu8; 4096];
        buf.load(HUGEPAGE_SIZE - 4096, &mut tail).unwrap();
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(PinnedBuffer::allocate(0, 64, Backing::Heap).is_err());
        assert!(PinnedBuffer::allocate(64, 48, Backing::Heap).is_err());
        assert!(RingLayout::new(1000, 32).is_err());
        assert!(RingLayout::new(0, 32).is_err());
        assert!(RingLayout::new(1024, 0).is_err());
    }

    #[test]
    fn store_and_load_are_bounds_checked() {
        let buf = PinnedBuffer::allocate(128, 64, Backing::Heap).unwrap();
        buf.store(96, &[1; 32]).unwrap();
        assert!(buf.store(97, &[1; 32]).is_err());
        let mut out = [0u8; 32];
        buf.load(96, &mut out).unwrap();
        assert_eq!(out, [1; 32]);
        assert!(buf.load(usize::MAX, &mut out).is_err());
        assert!(buf.invalidate(0..129).is_err());
    }

    #[test]
    fn slot_address_is_periodic_in_depth() {
        let ring = RingLayout::new(1024, 32).unwrap();
        for seq in [0u64, 1, 7, 1023, 4096 + 5] {
            for k in 0..4u64 {
                assert_eq!(ring.slot_address(seq), ring.slot_address(seq + k * 1024));
            }
        }
        assert_eq!(ring.slot_address(1), 32);
        assert_eq!(ring.slot_range(1023), 32736..32768);
    }

    #[test]
    fn ring_must_fit() {
        let buf = PinnedBuffer::allocate(4096, 64, Backing::Heap).unwrap();
        assert!(RingLayout::new(128, 32).unwrap().check_fits(&buf).is_ok());
        assert!(RingLayout::new(256, 32).unwrap().check_fits(&buf).is_err());
    }

    #[test]
    fn page_aligned_buffer_honours_host_page_size() {
        let page = page_size();
        assert!(page.is_power_of_two() && page >= 4096);
        let buf = PinnedBuffer::allocate(2 * page, page, Backing::Heap).unwrap();
        assert_eq!(buf.as_ptr() as usize % page, 0);
        assert_eq!(buf.alignment(), page);
    }

    #[test]
    fn locked_buffer_unlocks_on_drop() {
        let page = page_size();
        for _ in 0..4 {
            let buf = PinnedBuffer::allocate(page, page, Backing::Locked).unwrap();
            assert_eq!(buf.backing(), Backing::Locked);
            buf.store(page - 8, &[0xA5; 8]).unwrap();
            let mut out = [0u8; 8];
            buf.load(page - 8, &mut out).unwrap();
            assert_eq!(out, [0xA5; 8]);
        }
    }

    #[test]
    fn backing_from_str() {
        assert_eq!("hugepage".parse::<Backing>().unwrap(), Backing::HugePage);
        assert_eq!("locked".parse::<Backing>().unwrap(), Backing::Locked);
        assert!("swap".parse::<Backing>().is_err());
    }

    #[test]
    #[ignore] // Requires reserved hugepages (vm.nr_hugepages >= 1)
    fn hugepage_allocation() {
        let buf = PinnedBuffer::hugepage().unwrap();
        assert_eq!(buf.size(), HUGEPAGE_SIZE);
        assert_eq!(buf.as_ptr() as usize % HUGEPAGE_SIZE, 0);
        buf.flush();
    }
}
