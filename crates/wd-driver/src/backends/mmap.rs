// SPDX-License-Identifier: AGPL-3.0-only

//! Memory-mapped PCIe BAR
//!
//! Maps `/sys/bus/pci/devices/<addr>/resource<N>` and offers bounds-checked
//! 32-bit volatile access. Register writes go through `&self` so the
//! sideband and counter ports can share one mapping.

use crate::error::{Result, WdError};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::PathBuf;
use std::ptr::NonNull;

/// A mapped BAR of one PCIe function.
#[derive(Debug)]
pub struct MappedBar {
    ptr: NonNull<u8>,
    size: usize,
    _file: File,
    pcie_address: String,
    bar_index: usize,
}

// SAFETY: MappedBar owns the mapping exclusively; it stays valid across
// threads until Drop.
unsafe impl Send for MappedBar {}

// SAFETY: every access is a bounds-checked, aligned, volatile 32-bit load or
// store. Concurrent register accesses are serialized by the device, not by
// us; callers that need a multi-register sequence hold their own lock
// (the sideband channel does).
unsafe impl Sync for MappedBar {}

impl MappedBar {
    /// Sysfs resource file for a BAR.
    pub fn resource_path(pcie_address: &str, bar_index: usize) -> PathBuf {
        PathBuf::from(format!(
            "/sys/bus/pci/devices/{pcie_address}/resource{bar_index}"
        ))
    }

    /// Map BAR `bar_index` of the function at `pcie_address`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The resource file does not exist (device absent or BAR unused)
    /// - It cannot be opened read/write (needs root)
    /// - The BAR has size zero or mmap fails
    pub fn new(pcie_address: &str, bar_index: usize) -> Result<Self> {
        let path = Self::resource_path(pcie_address, bar_index);
        if !path.exists() {
            return Err(WdError::device_not_found(path));
        }

        tracing::debug!("Mapping PCIe BAR: {}", path.display());

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                WdError::device_init(format!(
                    "Cannot open {}: {e}. Is the device enabled?",
                    path.display()
                ))
            })?;

        // BAR sizes fit in usize on the 64-bit hosts this runs on
        #[allow(clippy::cast_possible_truncation)]
        let size = file
            .metadata()
            .map_err(|e| WdError::device_init(format!("Cannot stat BAR: {e}")))?
            .len() as usize;

        if size == 0 {
            return Err(WdError::device_init(format!(
                "BAR{bar_index} of {pcie_address} has size 0 (memory decoding off?)"
            )));
        }

        // SAFETY: fd was just opened; size is the non-zero resource length;
        // MAP_SHARED because this is device memory. The file is kept alive
        // in the struct and the mapping is released in Drop.
        let addr = unsafe {
            mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                0,
            )
        }
        .map_err(|e| WdError::device_init(format!("mmap of BAR{bar_index} failed: {e}")))?;

        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| WdError::device_init("mmap returned null"))?;

        tracing::info!(
            "Mapped BAR{bar_index} for {pcie_address} ({size:#x} bytes at {ptr:p})"
        );

        Ok(Self {
            ptr,
            size,
            _file: file,
            pcie_address: pcie_address.to_string(),
            bar_index,
        })
    }

    fn check(&self, offset: usize) -> Result<()> {
        if offset % 4 != 0 || offset.checked_add(4).is_none_or(|end| end > self.size) {
            return Err(WdError::transport(format!(
                "register {offset:#x} outside or misaligned in BAR{} ({:#x} bytes)",
                self.bar_index, self.size
            )));
        }
        Ok(())
    }

    /// Read 32-bit register at offset.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is out of bounds or misaligned.
    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        self.check(offset)?;
        // SAFETY: offset + 4 <= size and 4-byte aligned (checked); ptr is
        // the live mapping. Volatile: the device changes the value.
        #[allow(clippy::cast_ptr_alignment)]
        let value = unsafe { self.ptr.as_ptr().add(offset).cast::<u32>().read_volatile() };
        tracing::trace!("Read u32 @ {offset:#x} = {value:#x}");
        Ok(value)
    }

    /// Write 32-bit register at offset.
    ///
    /// # Errors
    ///
    /// Returns error if the offset is out of bounds or misaligned.
    #[allow(clippy::cast_ptr_alignment)]
    pub fn write_u32(&self, offset: usize, value: u32) -> Result<()> {
        self.check(offset)?;
        tracing::trace!("Write u32 @ {offset:#x} = {value:#x}");
        // SAFETY: as in read_u32; the store has device side effects so it
        // must not be elided or merged.
        unsafe {
            self.ptr.as_ptr().add(offset).cast::<u32>().write_volatile(value);
        }
        Ok(())
    }

    /// Mapping size.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// PCIe address.
    #[must_use]
    pub fn pcie_address(&self) -> &str {
        &self.pcie_address
    }

    /// BAR index.
    #[must_use]
    pub const fn bar_index(&self) -> usize {
        self.bar_index
    }
}

impl Drop for MappedBar {
    fn drop(&mut self) {
        tracing::debug!("Unmapping BAR{} for {}", self.bar_index, self.pcie_address);
        // SAFETY: ptr/size are exactly the mapping made in new(); Drop runs
        // once and no borrows outlive self.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.size) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}
