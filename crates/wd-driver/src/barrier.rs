// SPDX-License-Identifier: AGPL-3.0-only

//! Memory visibility barriers
//!
//! The shell writes results into host memory over PCIM. From the host's
//! side those writes are only guaranteed visible after the affected cache
//! lines are evicted and the eviction is ordered before subsequent loads.
//! How that is done is architecture specific, so the completion logic talks
//! to a [`VisibilityBarrier`] and the platform provides the instructions:
//!
//! | Target | Invalidate | Order |
//! |--------|-----------|-------|
//! | x86-64 | `clflush` per 64 B line | `mfence` |
//! | aarch64 | `dc civac` per 64 B line | `dsb sy` |
//! | other | (none) | `SeqCst` fence |

use std::fmt::Debug;
use std::sync::atomic::{fence, Ordering};
use wd_chip::ring::CACHE_LINE;

/// Capability to make device writes visible to subsequent host loads.
pub trait VisibilityBarrier: Debug + Send + Sync {
    /// Evict every cache line overlapping `[addr, addr + len)` and fence.
    ///
    /// # Safety
    ///
    /// The whole range must be mapped, readable memory for the duration of
    /// the call.
    unsafe fn invalidate(&self, addr: *const u8, len: usize);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Per-line cache flush followed by a full fence.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheLineFlush;

impl CacheLineFlush {
    /// Whether this target has a line flush instruction wired up.
    pub const fn is_native() -> bool {
        cfg!(any(target_arch = "x86_64", target_arch = "aarch64"))
    }
}

impl VisibilityBarrier for CacheLineFlush {
    unsafe fn invalidate(&self, addr: *const u8, len: usize) {
        if len == 0 {
            fence(Ordering::SeqCst);
            return;
        }
        let start = addr as usize & !(CACHE_LINE - 1);
        let end = addr as usize + len;

        #[cfg(target_arch = "x86_64")]
        {
            use core::arch::x86_64::{_mm_clflush, _mm_mfence};
            let mut line = start;
            while line < end {
                // SAFETY: line lies in a cache line overlapping the caller's
                // mapped range; clflush only needs the address to be mapped.
                unsafe { _mm_clflush(line as *const u8) };
                line += CACHE_LINE;
            }
            // SAFETY: mfence has no memory operands.
            unsafe { _mm_mfence() };
        }

        #[cfg(target_arch = "aarch64")]
        {
            let mut line = start;
            while line < end {
                // SAFETY: clean+invalidate by VA to point of coherency on a
                // mapped address; permitted at EL0 under Linux (SCTLR_EL1.UCI).
                unsafe {
                    core::arch::asm!("dc civac, {0}", in(reg) line, options(nostack, preserves_flags));
                }
                line += CACHE_LINE;
            }
            // SAFETY: full-system data synchronization barrier, no operands.
            unsafe { core::arch::asm!("dsb sy", options(nostack, preserves_flags)) };
        }

        #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
        {
            let _ = (start, end);
            fence(Ordering::SeqCst);
        }
    }

    fn name(&self) -> &'static str {
        "cache-line-flush"
    }
}

/// Ordering only, no eviction. For coherent platforms and simulation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FenceOnly;

impl VisibilityBarrier for FenceOnly {
    unsafe fn invalidate(&self, _addr: *const u8, _len: usize) {
        fence(Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "fence-only"
    }
}

/// Best barrier for the build target.
pub fn platform_barrier() -> Box<dyn VisibilityBarrier> {
    if CacheLineFlush::is_native() {
        Box::new(CacheLineFlush)
    } else {
        tracing::debug!("No line flush on this target; using fence-only barrier");
        Box::new(FenceOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_unaligned_range_is_harmless() {
        let buf = vec![7u8; 4 * CACHE_LINE];
        // SAFETY: range lies within buf
        unsafe { CacheLineFlush.invalidate(buf.as_ptr().wrapping_add(3), 2 * CACHE_LINE) };
        assert!(buf.iter().all(|&b| b == 7));
    }

    #[test]
    fn zero_length_is_fence() {
        let buf = [1u8; 8];
        // SAFETY: zero-length range
        unsafe { CacheLineFlush.invalidate(buf.as_ptr(), 0) };
        unsafe { FenceOnly.invalidate(buf.as_ptr(), 0) };
    }

    #[test]
    fn platform_choice() {
        let b = platform_barrier();
        if CacheLineFlush::is_native() {
            assert_eq!(b.name(), "cache-line-flush");
        } else {
            assert_eq!(b.name(), "fence-only");
        }
    }
}
