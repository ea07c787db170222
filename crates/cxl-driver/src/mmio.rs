//! Memory-mapped CSR access for the L2 engine.
//!
//! The CSR block lives in FPGA BAR1. It can be reached either through the
//! sysfs PCI resource file (`/sys/bus/pci/devices/<addr>/resource1`) or
//! through `/dev/mem` at a known physical address. Both are mapped with
//! rustix `mmap` and unmapped on drop.
//!
//! [`RegisterIo`] is the 32-bit bus seam; [`Csr`] layers the typed 64-bit
//! register map from [`cxl_chip::regs`] on top of it, splitting each access
//! into low word then high word.

// MMIO registers are naturally aligned by hardware, so pointer casts are safe
#![allow(clippy::cast_ptr_alignment)]
#![allow(clippy::cast_possible_truncation)]

use crate::error::{CxlError, Result};
use cxl_chip::regs::{Reg, CSR_WINDOW_SIZE};
use rustix::mm::{mmap, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};

/// 32-bit register bus.
pub trait RegisterIo: Send {
    /// Read the 32-bit word at `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Write the 32-bit word at `offset`.
    fn write32(&mut self, offset: usize, value: u32);

    /// Order all prior register writes before any later access.
    fn fence(&self) {
        fence(Ordering::SeqCst);
    }
}

/// Acquires the CSR region for one streaming call.
pub trait CsrMapper {
    /// Mapped region; released when dropped.
    type Region: RegisterIo;

    /// Map the CSR block.
    ///
    /// # Errors
    ///
    /// Returns an error if the region cannot be opened or mapped.
    fn map(&self) -> Result<Self::Region>;
}

/// Where the CSR block is found on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsrSource {
    /// PCI sysfs resource file for the BAR.
    Resource(PathBuf),
    /// Physical window mapped through `/dev/mem`.
    Physical {
        /// Physical address of the CSR block
        addr: u64,
        /// Bytes to map
        len: usize,
    },
}

impl CsrSource {
    /// BAR1 of the device at PCIe address `pcie_address`.
    pub fn pci_bar(pcie_address: &str, bar: u32) -> Self {
        Self::Resource(PathBuf::from(format!(
            "/sys/bus/pci/devices/{pcie_address}/resource{bar}"
        )))
    }
}

impl CsrMapper for CsrSource {
    type Region = MappedRegion;

    fn map(&self) -> Result<MappedRegion> {
        match self {
            Self::Resource(path) => MappedRegion::open_resource(path),
            Self::Physical { addr, len } => MappedRegion::open_physical(*addr, *len),
        }
    }
}

/// Mapped CSR window.
pub struct MappedRegion {
    /// Start of the mapping (page aligned)
    map_base: NonNull<u8>,
    /// Length of the mapping
    map_len: usize,
    /// Offset of the CSR block inside the mapping
    start: usize,
    /// Usable bytes from `start`
    size: usize,
    /// Mapped file, kept open for the lifetime of the mapping
    _file: File,
    label: String,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &format_args!("{:p}", self.map_base))
            .field("size", &self.size)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

// SAFETY: Send - MappedRegion owns the mapping exclusively. Moving between threads
// doesn't invalidate it (mmap'd memory is process-wide). No thread-local state.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// Map a PCI sysfs resource file in full.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, is smaller than the CSR
    /// block, or cannot be mapped.
    pub fn open_resource(path: &Path) -> Result<Self> {
        let file = open_rw(path)?;
        let len = file
            .metadata()
            .map_err(|e| CxlError::mapping(format!("Cannot stat {}: {e}", path.display())))?
            .len() as usize;
        Self::map_file(file, 0, len, 0, path.display().to_string())
    }

    /// Map `len` bytes of physical memory at `addr` through `/dev/mem`.
    ///
    /// # Errors
    ///
    /// Returns an error if `/dev/mem` cannot be opened (root and
    /// `iomem=relaxed` are usually required) or the window cannot be mapped.
    pub fn open_physical(addr: u64, len: usize) -> Result<Self> {
        let page = rustix::param::page_size() as u64;
        let aligned = addr & !(page - 1);
        let start = (addr - aligned) as usize;
        let file = open_rw(Path::new("/dev/mem"))?;
        Self::map_file(file, aligned, start + len, start, format!("/dev/mem@{addr:#x}"))
    }

    fn map_file(
        file: File,
        offset: u64,
        map_len: usize,
        start: usize,
        label: String,
    ) -> Result<Self> {
        let size = map_len.saturating_sub(start);
        if size < CSR_WINDOW_SIZE {
            return Err(CxlError::mapping(format!(
                "{label}: {size:#x} bytes is smaller than the CSR block ({CSR_WINDOW_SIZE:#x})"
            )));
        }

        // SAFETY: mmap necessary for MMIO - maps the CSR window into the process.
        // Invariants: (1) file open read/write; (2) offset page aligned, map_len non-zero;
        // (3) MAP_SHARED so stores reach the device; (4) ptr valid for map_len bytes or Err.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                map_len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
            .map_err(|e| CxlError::mapping(format!("mmap of {label} failed: {e}")))?
        };
        let map_base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| CxlError::mapping(format!("mmap of {label} returned null")))?;

        tracing::info!("Mapped CSR {label} at {map_base:p}, size={size:#x}");

        Ok(Self {
            map_base,
            map_len,
            start,
            size,
            _file: file,
            label,
        })
    }

    /// Usable bytes of the mapping.
    pub const fn size(&self) -> usize {
        self.size
    }

    fn reg_ptr(&self, offset: usize) -> *mut u32 {
        assert!(offset + 4 <= self.size, "Register offset out of bounds");
        // SAFETY: start + offset + 4 <= map_len, checked above.
        unsafe { self.map_base.as_ptr().add(self.start + offset).cast::<u32>() }
    }
}

impl RegisterIo for MappedRegion {
    /// Volatile 32-bit read from the CSR window.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped window.
    fn read32(&self, offset: usize) -> u32 {
        let ptr = self.reg_ptr(offset);
        // SAFETY: read_volatile necessary for MMIO - hardware can change value.
        // Invariants: (1) ptr inside the live mapping; (2) u32 aligned.
        let value = unsafe { ptr.read_volatile() };
        tracing::trace!("Read u32 @ {offset:#x} = {value:#x}");
        value
    }

    /// Volatile 32-bit write to the CSR window.
    ///
    /// # Panics
    ///
    /// Panics if `offset + 4` exceeds the mapped window.
    fn write32(&mut self, offset: usize, value: u32) {
        let ptr = self.reg_ptr(offset);
        tracing::trace!("Write u32 @ {offset:#x} = {value:#x}");
        // SAFETY: write_volatile necessary for MMIO - triggers hardware side effects.
        // Invariants: (1) ptr inside the live mapping; (2) u32 aligned; (3) &mut self.
        unsafe { ptr.write_volatile(value) };
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: munmap of the exact range returned by mmap in map_file(); Drop runs once.
        unsafe {
            if let Err(e) = munmap(self.map_base.as_ptr().cast(), self.map_len) {
                tracing::error!("munmap of {} failed during drop: {e}", self.label);
            }
        }
        tracing::debug!("Unmapped CSR {}", self.label);
    }
}

fn open_rw(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| CxlError::mapping(format!("Cannot open {}: {e}", path.display())))
}

/// Typed access to the 64-bit register map over a 32-bit bus.
#[derive(Debug)]
pub struct Csr<R> {
    io: R,
}

impl<R: RegisterIo> Csr<R> {
    /// Wrap a register bus.
    pub const fn new(io: R) -> Self {
        Self { io }
    }

    /// Read a 64-bit register: low word, then high word.
    pub fn read(&self, reg: Reg) -> u64 {
        let lo = self.io.read32(reg.lo());
        let hi = self.io.read32(reg.hi());
        u64::from(lo) | (u64::from(hi) << 32)
    }

    /// Write a 64-bit register: low word, then high word.
    pub fn write(&mut self, reg: Reg, value: u64) {
        tracing::trace!("{reg} <- {value:#x}");
        self.io.write32(reg.lo(), value as u32);
        self.io.write32(reg.hi(), (value >> 32) as u32);
    }

    /// Memory barrier between register groups.
    pub fn barrier(&self) {
        self.io.fence();
    }

    /// Dump every register, for diagnostics.
    pub fn snapshot(&self) -> Vec<(Reg, u64)> {
        Reg::ALL.into_iter().map(|r| (r, self.read(r))).collect()
    }

    /// Underlying bus.
    pub const fn io(&self) -> &R {
        &self.io
    }

    /// Give the bus back (unmaps on drop if it owns a mapping).
    pub fn into_inner(self) -> R {
        self.io
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Words {
        mem: BTreeMap<usize, u32>,
        log: Vec<(usize, u32)>,
    }

    impl RegisterIo for Words {
        fn read32(&self, offset: usize) -> u32 {
            self.mem.get(&offset).copied().unwrap_or(0)
        }

        fn write32(&mut self, offset: usize, value: u32) {
            self.log.push((offset, value));
            self.mem.insert(offset, value);
        }
    }

    #[test]
    fn write_splits_low_then_high() {
        let mut csr = Csr::new(Words::default());
        csr.write(Reg::PageAddr0, 0x0000_0080_0020_1000);
        assert_eq!(
            csr.io().log,
            vec![(0x08, 0x0020_1000), (0x0c, 0x0000_0080)]
        );
        assert_eq!(csr.read(Reg::PageAddr0), 0x0000_0080_0020_1000);
    }

    #[test]
    fn snapshot_covers_all_registers() {
        let mut csr = Csr::new(Words::default());
        csr.write(Reg::TestCase, 100);
        let snap = csr.snapshot();
        assert_eq!(snap.len(), Reg::ALL.len());
        assert!(snap.contains(&(Reg::TestCase, 100)));
    }

    #[test]
    fn pci_bar_path() {
        assert_eq!(
            CsrSource::pci_bar("0000:43:00.0", 1),
            CsrSource::Resource(PathBuf::from("/sys/bus/pci/devices/0000:43:00.0/resource1"))
        );
    }

    #[test]
    #[ignore] // Requires hardware
    fn map_reference_csr_block() {
        let region = MappedRegion::open_physical(cxl_chip::regs::TYPICAL_CSR_PHYS, CSR_WINDOW_SIZE)
            .expect("map CSR");
        let csr = Csr::new(region);
        println!("RESP = {:#x}", csr.read(Reg::Response));
    }
}
