//! Page-aligned, physically contiguous staging memory.
//!
//! Two pools take part in a streaming call:
//!
//! ```text
//! PoolId::Host      ordinary host RAM, where samples are read and converted
//! PoolId::Node(n)   CXL-attached memory (NUMA node n), read by the accelerator
//! ```
//!
//! Each pool carves contiguous page runs out of one [`Arena`]: a locked
//! mapping whose physical base is known, so that `phys = base + offset`
//! holds for every byte. Device memory is typically a device-DAX instance
//! of the CXL window; host memory is an anonymous locked mapping.
//!
//! [`ContigBuffer`] is the scoped handle: `release()` is idempotent and
//! dropping an unreleased buffer releases it, so every exit path of the
//! engine returns its pages exactly once.

use crate::error::{CxlError, Result};
use cxl_chip::window::{CxlWindow, Translation};
use rustix::mm::{mlock, mmap, mmap_anonymous, munlock, munmap, MapFlags, ProtFlags};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Allocation granularity.
pub const PAGE_SIZE: usize = 4096;

/// Round `bytes` up to a whole number of pages.
pub const fn page_align(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Memory pool identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolId {
    /// Default host pool.
    Host,
    /// NUMA-like node, e.g. the CXL window.
    Node(u32),
}

impl PoolId {
    /// NUMA node id, if any.
    pub const fn node(self) -> Option<u32> {
        match self {
            Self::Host => None,
            Self::Node(n) => Some(n),
        }
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "host pool"),
            Self::Node(n) => write!(f, "node {n}"),
        }
    }
}

#[derive(Debug)]
enum Backing {
    Anonymous,
    File { path: PathBuf, _file: File },
}

/// Locked byte region with a known physical base.
pub struct Arena {
    ptr: NonNull<u8>,
    len: usize,
    phys_base: u64,
    locked: bool,
    backing: Backing,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("ptr", &format_args!("{:p}", self.ptr))
            .field("len", &self.len)
            .field("phys_base", &format_args!("{:#x}", self.phys_base))
            .field("locked", &self.locked)
            .field("backing", &self.backing)
            .finish()
    }
}

// SAFETY: Send - Arena owns its mapping exclusively; the mapping is process-wide.
unsafe impl Send for Arena {}

// SAFETY: Sync - Arena itself exposes no access to its bytes; PagePool hands out
// disjoint page runs and only a ContigBuffer (behind &mut) may write its run.
unsafe impl Sync for Arena {}

impl Arena {
    /// Anonymous locked host memory.
    ///
    /// `phys_base` is the physical address the caller knows the region to
    /// start at (for instance a reserved `memmap=` range), or 0 if unknown.
    /// Locking is best effort: an `RLIMIT_MEMLOCK` failure is logged.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is not page aligned or the mapping fails.
    pub fn anonymous(len: usize, phys_base: u64) -> Result<Self> {
        check_len(PoolId::Host, len)?;

        // SAFETY: anonymous private mapping of len bytes; no existing memory is aliased.
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
            .map_err(|e| CxlError::allocation(PoolId::Host, len, format!("mmap failed: {e}")))?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| CxlError::allocation(PoolId::Host, len, "mmap returned null"))?;

        let mut arena = Self {
            ptr,
            len,
            phys_base,
            locked: false,
            backing: Backing::Anonymous,
        };
        arena.lock();
        tracing::debug!("Host arena: {len:#x} bytes at {ptr:p}, phys={phys_base:#x}");
        Ok(arena)
    }

    /// Map `len` bytes of a device-DAX instance (or any shared file) at `offset`.
    ///
    /// When `phys_base` is `None` the physical start of the device is read
    /// from `/sys/bus/dax/devices/<name>/resource`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be opened or mapped, or its
    /// physical base cannot be determined.
    pub fn map_device(
        path: &Path,
        len: usize,
        offset: u64,
        phys_base: Option<u64>,
    ) -> Result<Self> {
        if len == 0 || len % PAGE_SIZE != 0 {
            return Err(CxlError::mapping(format!(
                "{}: window length {len:#x} is not a non-zero multiple of {PAGE_SIZE}",
                path.display()
            )));
        }

        let phys_base = match phys_base {
            Some(p) => p,
            None => dax_resource(path)? + offset,
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CxlError::mapping(format!("Cannot open {}: {e}", path.display())))?;

        // SAFETY: shared mapping of len bytes of an open device file; the file is kept
        // open in `backing` for the lifetime of the mapping and unmapped in Drop.
        let ptr = unsafe {
            mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                file.as_fd(),
                offset,
            )
            .map_err(|e| CxlError::mapping(format!("mmap of {} failed: {e}", path.display())))?
        };
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| CxlError::mapping(format!("mmap of {} returned null", path.display())))?;

        tracing::info!(
            "Mapped {} ({} MB at {ptr:p}, phys={phys_base:#x})",
            path.display(),
            len / (1024 * 1024)
        );

        let mut arena = Self {
            ptr,
            len,
            phys_base,
            locked: false,
            backing: Backing::File {
                path: path.to_path_buf(),
                _file: file,
            },
        };
        arena.lock();
        Ok(arena)
    }

    fn lock(&mut self) {
        // SAFETY: mlock over exactly the mapped range [ptr, ptr+len).
        match unsafe { mlock(self.ptr.as_ptr().cast(), self.len) } {
            Ok(()) => self.locked = true,
            Err(e) => tracing::warn!("mlock of {:#x} bytes failed ({e}); pages may move", self.len),
        }
    }

    /// Bytes in the arena.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the arena is empty (never true for a constructed arena).
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address of the first byte.
    pub const fn phys_base(&self) -> u64 {
        self.phys_base
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: ptr/len are the exact range from mmap in the constructor; Drop runs once
        // and no ContigBuffer outlives the pool that owns this arena.
        unsafe {
            if self.locked {
                let _ = munlock(self.ptr.as_ptr().cast(), self.len);
            }
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.len) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
        if let Backing::File { path, .. } = &self.backing {
            tracing::debug!("Unmapped {}", path.display());
        }
    }
}

fn check_len(pool: PoolId, len: usize) -> Result<()> {
    if len == 0 || len % PAGE_SIZE != 0 {
        return Err(CxlError::allocation(
            pool,
            len,
            format!("size must be a non-zero multiple of {PAGE_SIZE}"),
        ));
    }
    Ok(())
}

/// Physical start of a device-DAX instance, from sysfs.
///
/// # Errors
///
/// Returns an error if the sysfs attribute is missing or not a hex address.
pub fn dax_resource(dev: &Path) -> Result<u64> {
    let name = dev
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CxlError::mapping(format!("Not a DAX device path: {}", dev.display())))?;
    let attr = format!("/sys/bus/dax/devices/{name}/resource");
    let text = std::fs::read_to_string(&attr)
        .map_err(|e| CxlError::mapping(format!("Cannot read {attr}: {e}")))?;
    parse_hex(text.trim())
        .ok_or_else(|| CxlError::mapping(format!("Invalid resource in {attr}: {}", text.trim())))
}

fn parse_hex(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u64::from_str_radix(digits, 16).ok()
}

/// Allocation counters for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Successful allocations since creation
    pub allocations: u64,
    /// Releases since creation
    pub releases: u64,
    /// Buffers currently outstanding
    pub live: usize,
    /// Free pages
    pub free_pages: usize,
    /// Pages in the arena
    pub total_pages: usize,
}

#[derive(Debug)]
struct PageMap {
    used: Vec<bool>,
    stats: PoolStats,
}

impl PageMap {
    fn find_run(&self, pages: usize) -> Option<usize> {
        let mut run = 0;
        for (i, used) in self.used.iter().enumerate() {
            if *used {
                run = 0;
            } else {
                run += 1;
                if run == pages {
                    return Some(i + 1 - pages);
                }
            }
        }
        None
    }
}

#[derive(Debug)]
struct PoolInner {
    id: PoolId,
    arena: Arena,
    pages: Mutex<PageMap>,
}

/// First-fit allocator of contiguous page runs over one arena.
#[derive(Debug, Clone)]
pub struct PagePool {
    inner: Arc<PoolInner>,
}

impl PagePool {
    /// Pool `id` over `arena`.
    pub fn new(id: PoolId, arena: Arena) -> Self {
        let total_pages = arena.len() / PAGE_SIZE;
        Self {
            inner: Arc::new(PoolInner {
                id,
                arena,
                pages: Mutex::new(PageMap {
                    used: vec![false; total_pages],
                    stats: PoolStats {
                        free_pages: total_pages,
                        total_pages,
                        ..PoolStats::default()
                    },
                }),
            }),
        }
    }

    /// Pool identifier.
    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        self.pages().stats
    }

    fn pages(&self) -> MutexGuard<'_, PageMap> {
        self.inner.pages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate `bytes` of contiguous, zeroed memory.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if `bytes` is zero, not a page multiple,
    /// or no contiguous run of that size is free.
    pub fn allocate(&self, bytes: usize) -> Result<ContigBuffer> {
        let id = self.id();
        check_len(id, bytes)?;
        let pages = bytes / PAGE_SIZE;

        let first_page = {
            let mut map = self.pages();
            let first = map.find_run(pages).ok_or_else(|| {
                CxlError::allocation(
                    id,
                    bytes,
                    format!(
                        "no contiguous run of {pages} pages ({} of {} free)",
                        map.stats.free_pages, map.stats.total_pages
                    ),
                )
            })?;
            map.used[first..first + pages].fill(true);
            map.stats.allocations += 1;
            map.stats.live += 1;
            map.stats.free_pages -= pages;
            first
        };

        let offset = first_page * PAGE_SIZE;
        let phys = self.inner.arena.phys_base() + offset as u64;
        let mut buf = ContigBuffer {
            pool: self.clone(),
            offset,
            len: bytes,
            phys,
            device_addr: phys,
            released: false,
        };
        buf.as_mut_slice().fill(0);

        tracing::debug!("Allocated {bytes:#x} bytes from {id} at phys={phys:#x}");
        Ok(buf)
    }

    fn release_run(&self, offset: usize, len: usize) {
        let first = offset / PAGE_SIZE;
        let pages = len / PAGE_SIZE;
        let mut map = self.pages();
        map.used[first..first + pages].fill(false);
        map.stats.releases += 1;
        map.stats.live -= 1;
        map.stats.free_pages += pages;
    }
}

/// One page-aligned, physically contiguous buffer.
#[derive(Debug)]
pub struct ContigBuffer {
    pool: PagePool,
    offset: usize,
    len: usize,
    phys: u64,
    device_addr: u64,
    released: bool,
}

impl ContigBuffer {
    /// Host physical address.
    pub const fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// Address the accelerator uses for this buffer.
    pub const fn device_addr(&self) -> u64 {
        self.device_addr
    }

    /// Pool the buffer came from.
    pub fn pool_id(&self) -> PoolId {
        self.pool.id()
    }

    /// Size in bytes (0 once released).
    pub const fn len(&self) -> usize {
        if self.released {
            0
        } else {
            self.len
        }
    }

    /// Whether the buffer holds no bytes (released).
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whole vectors of `bytes_per_vector` that fit.
    pub const fn capacity_vectors(&self, bytes_per_vector: usize) -> usize {
        if bytes_per_vector == 0 {
            0
        } else {
            self.len() / bytes_per_vector
        }
    }

    /// Whether `release` already ran.
    pub const fn is_released(&self) -> bool {
        self.released
    }

    /// Apply the CXL window translation and remember the device address.
    pub fn translate(&mut self, window: &CxlWindow) -> Translation {
        let t = window.translate(self.phys, self.pool_id().node());
        self.device_addr = t.address();
        t
    }

    /// Read view.
    pub fn as_slice(&self) -> &[u8] {
        if self.released {
            return &[];
        }
        // SAFETY: (1) [offset, offset+len) lies inside the pool's arena and is marked used;
        // (2) the arena outlives self through the Arc in `pool`; (3) &self excludes writers.
        unsafe {
            let ptr = self.pool.inner.arena.ptr.as_ptr().add(self.offset);
            std::slice::from_raw_parts(ptr, self.len)
        }
    }

    /// Write view.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.released {
            return &mut [];
        }
        // SAFETY: as in as_slice; the page run is owned by this buffer alone and
        // &mut self gives exclusive access.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.pool.inner.arena.ptr.as_ptr().add(self.offset),
                self.len,
            )
        }
    }

    /// Return the pages to the pool. Calling it again is a no-op.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.pool.release_run(self.offset, self.len);
        tracing::debug!(
            "Released {:#x} bytes to {} (phys={:#x})",
            self.len,
            self.pool.id(),
            self.phys
        );
    }
}

impl Drop for ContigBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// The host staging pool plus any device-visible pools.
#[derive(Debug, Clone)]
pub struct PoolSet {
    host: PagePool,
    devices: Vec<PagePool>,
}

impl PoolSet {
    /// Host pool only; add device pools with [`PoolSet::with_device`].
    pub fn new(host: PagePool) -> Self {
        Self {
            host,
            devices: Vec::new(),
        }
    }

    /// Add a device-visible pool.
    #[must_use]
    pub fn with_device(mut self, pool: PagePool) -> Self {
        self.devices.push(pool);
        self
    }

    /// Look up a pool.
    pub fn pool(&self, id: PoolId) -> Option<&PagePool> {
        if id == self.host.id() {
            return Some(&self.host);
        }
        self.devices.iter().find(|p| p.id() == id)
    }

    /// Allocate `bytes` from pool `id`.
    ///
    /// # Errors
    ///
    /// Returns an allocation error if the pool does not exist or cannot
    /// satisfy the request.
    pub fn allocate(&self, bytes: usize, id: PoolId) -> Result<ContigBuffer> {
        self.pool(id)
            .ok_or_else(|| CxlError::allocation(id, bytes, "no such pool"))?
            .allocate(bytes)
    }

    /// Counters of every pool, host first.
    pub fn stats(&self) -> Vec<(PoolId, PoolStats)> {
        std::iter::once(&self.host)
            .chain(self.devices.iter())
            .map(|p| (p.id(), p.stats()))
            .collect()
    }

    /// Buffers outstanding across all pools.
    pub fn live(&self) -> usize {
        self.stats().iter().map(|(_, s)| s.live).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(id: PoolId, pages: usize, phys: u64) -> PagePool {
        PagePool::new(id, Arena::anonymous(pages * PAGE_SIZE, phys).unwrap())
    }

    #[test]
    fn page_align_rounds_up() {
        assert_eq!(page_align(1), PAGE_SIZE);
        assert_eq!(page_align(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_align(4096 * 512), 4096 * 512);
        assert_eq!(page_align(1808 * 512 + 1), 227 * PAGE_SIZE);
    }

    #[test]
    fn rejects_zero_and_unaligned_sizes() {
        let p = pool(PoolId::Host, 4, 0);
        assert!(matches!(p.allocate(0), Err(CxlError::Allocation { .. })));
        assert!(matches!(p.allocate(100), Err(CxlError::Allocation { .. })));
        assert_eq!(p.stats().allocations, 0);
    }

    #[test]
    fn contiguous_runs_and_exhaustion() {
        let p = pool(PoolId::Node(1), 4, 0x80_8000_0000);
        let a = p.allocate(2 * PAGE_SIZE).unwrap();
        let b = p.allocate(PAGE_SIZE).unwrap();
        assert_eq!(a.phys_addr(), 0x80_8000_0000);
        assert_eq!(b.phys_addr(), 0x80_8000_0000 + 2 * PAGE_SIZE as u64);
        assert!(p.allocate(2 * PAGE_SIZE).is_err());
        drop(a);
        let c = p.allocate(2 * PAGE_SIZE).unwrap();
        assert_eq!(c.phys_addr(), 0x80_8000_0000);
    }

    #[test]
    fn release_is_idempotent() {
        let p = pool(PoolId::Host, 2, 0);
        let mut buf = p.allocate(PAGE_SIZE).unwrap();
        buf.release();
        buf.release();
        assert!(buf.is_released());
        assert!(buf.as_slice().is_empty());
        drop(buf);
        let s = p.stats();
        assert_eq!((s.allocations, s.releases, s.live), (1, 1, 0));
        assert_eq!(s.free_pages, 2);
    }

    #[test]
    fn buffers_are_zeroed_on_allocation() {
        let p = pool(PoolId::Host, 1, 0);
        let mut buf = p.allocate(PAGE_SIZE).unwrap();
        buf.as_mut_slice().fill(0xEE);
        drop(buf);
        let buf = p.allocate(PAGE_SIZE).unwrap();
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        assert_eq!(buf.capacity_vectors(512), 8);
    }

    #[test]
    fn translation_uses_node_membership() {
        let window = CxlWindow::new(0x80_8000_0000, 1);
        let dev = pool(PoolId::Node(1), 2, 0x80_8000_0000);
        let host = pool(PoolId::Host, 2, 0x1_0000_0000);

        let mut d = dev.allocate(PAGE_SIZE).unwrap();
        assert!(d.translate(&window).is_translated());
        assert_eq!(d.device_addr(), 0);

        let mut h = host.allocate(PAGE_SIZE).unwrap();
        assert!(!h.translate(&window).is_translated());
        assert_eq!(h.device_addr(), 0x1_0000_0000);
    }

    #[test]
    fn pool_set_routes_by_id() {
        let set = PoolSet::new(pool(PoolId::Host, 1, 0)).with_device(pool(PoolId::Node(1), 1, 0));
        assert_eq!(set.allocate(PAGE_SIZE, PoolId::Node(1)).unwrap().pool_id(), PoolId::Node(1));
        assert!(matches!(
            set.allocate(PAGE_SIZE, PoolId::Node(7)),
            Err(CxlError::Allocation { pool: PoolId::Node(7), .. })
        ));
        assert_eq!(set.live(), 0);
    }

    #[test]
    fn parses_sysfs_hex() {
        assert_eq!(parse_hex("0x8080000000"), Some(0x80_8000_0000));
        assert_eq!(parse_hex("ff"), Some(0xff));
        assert_eq!(parse_hex("zz"), None);
    }
}
