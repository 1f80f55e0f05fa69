//! Host memory pages that are simultaneously mapped for CPU access and for device DMA.
//!
//! A [`CoherentPage`] owns one 4 KiB region obtained from a [`CoherentAllocator`],
//! i.e., the host environment's coherent DMA allocator, and knows both the CPU pointer
//! and the bus address that the device uses to reach the same memory.
//! The region is returned to its allocator when the `CoherentPage` is dropped,
//! so every successful allocation is released exactly once.
//!
//! The [`HeapCoherentAllocator`] is an allocator for hosts where heap memory
//! is directly visible to the device at its CPU address (e.g., emulated devices),
//! and it doubles as the allocator used by tests.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate derive_more;

#[cfg(test)]
mod test;

use core::{
    fmt,
    mem,
    ptr::NonNull,
    slice,
    sync::atomic::{AtomicUsize, Ordering},
};
use alloc::{
    alloc::{alloc_zeroed, dealloc, Layout},
    sync::Arc,
};

/// The size of every region handed out by this crate: 4 KiB.
pub const PAGE_SIZE: usize = 4096;

/// An address in the device's view of host memory, i.e., what the device puts on the bus
/// when it DMAs to or from a [`CoherentPage`].
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    Debug, Display, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct BusAddress(u64);

impl BusAddress {
    pub const fn new(addr: u64) -> BusAddress {
        BusAddress(addr)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE as u64 == 0
    }

    /// Returns the bus address `bytes` past this one.
    pub const fn offset(&self, bytes: usize) -> BusAddress {
        BusAddress(self.0 + bytes as u64)
    }
}


/// The host environment's hook for obtaining memory that both the CPU and the device can access.
///
/// A write issued by the CPU before an ordering barrier must be observable by a device read
/// that begins after that barrier, and vice versa.
pub trait CoherentAllocator: Send + Sync {
    /// Allocates `size_in_bytes` of zeroed, coherent memory aligned to at least [`PAGE_SIZE`].
    ///
    /// Returns the CPU pointer and the bus address of the start of the region.
    fn alloc_coherent(&self, size_in_bytes: usize) -> Result<(NonNull<u8>, BusAddress), &'static str>;

    /// Releases a region previously returned by [`alloc_coherent()`](#tymethod.alloc_coherent).
    ///
    /// # Safety
    /// `cpu` and `bus` must be a pair returned by `alloc_coherent()` on this same allocator
    /// with the same `size_in_bytes`, and must not have been freed already.
    /// The region must not be accessed after this returns.
    unsafe fn free_coherent(&self, cpu: NonNull<u8>, bus: BusAddress, size_in_bytes: usize);
}


/// One [`PAGE_SIZE`] region of coherent memory, owned exclusively by this object.
///
/// Dropping a `CoherentPage` returns it to the allocator it came from.
pub struct CoherentPage {
    cpu: NonNull<u8>,
    bus: BusAddress,
    allocator: Arc<dyn CoherentAllocator>,
}

// SAFE: the region is exclusively owned by this object and is only reachable through it,
// so moving it to (or sharing `&` references with) another thread is no different than a Box.
unsafe impl Send for CoherentPage {}
unsafe impl Sync for CoherentPage {}

impl CoherentPage {
    /// Allocates a new zeroed page from the given `allocator`.
    ///
    /// Fails if the allocator refuses, or if it hands back a region that isn't page-aligned
    /// on both the CPU and the bus side (in which case the region is given back right away).
    pub fn allocate(allocator: &Arc<dyn CoherentAllocator>) -> Result<CoherentPage, &'static str> {
        let (cpu, bus) = allocator.alloc_coherent(PAGE_SIZE)?;
        if cpu.as_ptr() as usize % PAGE_SIZE != 0 || !bus.is_page_aligned() {
            error!("CoherentPage::allocate(): allocator returned a misaligned region, cpu: {:p}, bus: {:#X}", cpu, bus);
            // SAFE: this pair was just returned by `alloc_coherent()` for the same size and is never used again.
            unsafe { allocator.free_coherent(cpu, bus, PAGE_SIZE) };
            return Err("CoherentPage::allocate(): allocator returned a misaligned region");
        }
        trace!("CoherentPage::allocate(): cpu: {:p}, bus: {:#X}", cpu, bus);
        Ok(CoherentPage {
            cpu,
            bus,
            allocator: Arc::clone(allocator),
        })
    }

    pub fn bus_address(&self) -> BusAddress {
        self.bus
    }

    /// The CPU-side address of the start of this page.
    pub fn as_ptr(&self) -> *mut u8 {
        self.cpu.as_ptr()
    }

    /// Reinterprets the whole page as a slice of `T`, e.g., an array of device descriptors.
    ///
    /// # Panics
    /// Panics if `T` is zero-sized, if its size doesn't evenly divide [`PAGE_SIZE`],
    /// or if its alignment exceeds [`PAGE_SIZE`].
    pub fn entries<T>(&self) -> &[T] {
        let len = Self::entries_per_page::<T>();
        // SAFE: the page is PAGE_SIZE bytes, page-aligned, and the returned lifetime is tied to `self`.
        unsafe { slice::from_raw_parts(self.cpu.as_ptr() as *const T, len) }
    }

    /// Same as [`entries()`](#method.entries), but returns a *mutable* slice.
    pub fn entries_mut<T>(&mut self) -> &mut [T] {
        let len = Self::entries_per_page::<T>();
        // SAFE: same as `entries()`, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.cpu.as_ptr() as *mut T, len) }
    }

    fn entries_per_page<T>() -> usize {
        let size = mem::size_of::<T>();
        assert!(size != 0 && PAGE_SIZE % size == 0 && mem::align_of::<T>() <= PAGE_SIZE,
            "CoherentPage: type of size {} and alignment {} cannot tile a page", size, mem::align_of::<T>()
        );
        PAGE_SIZE / size
    }
}

impl Drop for CoherentPage {
    fn drop(&mut self) {
        trace!("CoherentPage::drop(): cpu: {:p}, bus: {:#X}", self.cpu, self.bus);
        // SAFE: `cpu` and `bus` came from `alloc_coherent()` on this allocator and are freed only here.
        unsafe { self.allocator.free_coherent(self.cpu, self.bus, PAGE_SIZE) }
    }
}

impl fmt::Debug for CoherentPage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "CoherentPage {{ cpu: {:p}, bus: {:#X} }}", self.cpu, self.bus)
    }
}


/// Sentinel for "no allocation limit" in [`HeapCoherentAllocator::remaining`].
const UNLIMITED: usize = usize::MAX;

/// A [`CoherentAllocator`] that carves regions out of the global heap
/// and uses each region's CPU address as its bus address.
///
/// It can be told to refuse allocations after a given number of successes,
/// and it tracks how many regions are currently outstanding.
pub struct HeapCoherentAllocator {
    /// How many more allocations may succeed, or `UNLIMITED`.
    remaining: AtomicUsize,
    /// Number of regions allocated but not yet freed.
    outstanding: AtomicUsize,
}

impl HeapCoherentAllocator {
    pub const fn new() -> HeapCoherentAllocator {
        HeapCoherentAllocator {
            remaining: AtomicUsize::new(UNLIMITED),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Creates an allocator that will succeed `allocations` more times and then refuse.
    pub const fn with_limit(allocations: usize) -> HeapCoherentAllocator {
        HeapCoherentAllocator {
            remaining: AtomicUsize::new(allocations),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Allows `allocations` more successful allocations from now on, then refuses.
    pub fn set_limit(&self, allocations: usize) {
        self.remaining.store(allocations, Ordering::SeqCst);
    }

    /// Removes any limit set by [`set_limit()`](#method.set_limit).
    pub fn clear_limit(&self) {
        self.remaining.store(UNLIMITED, Ordering::SeqCst);
    }

    /// Returns the number of regions that have been allocated but not yet freed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl Default for HeapCoherentAllocator {
    fn default() -> Self {
        HeapCoherentAllocator::new()
    }
}

impl CoherentAllocator for HeapCoherentAllocator {
    fn alloc_coherent(&self, size_in_bytes: usize) -> Result<(NonNull<u8>, BusAddress), &'static str> {
        if size_in_bytes == 0 || size_in_bytes % PAGE_SIZE != 0 {
            return Err("HeapCoherentAllocator: size must be a non-zero multiple of PAGE_SIZE");
        }
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| match remaining {
                UNLIMITED => Some(UNLIMITED),
                0 => None,
                n => Some(n - 1),
            })
            .map_err(|_| "HeapCoherentAllocator: allocation limit reached")?;

        let layout = Layout::from_size_align(size_in_bytes, PAGE_SIZE)
            .map_err(|_| "HeapCoherentAllocator: invalid layout")?;
        // SAFE: the layout has a non-zero size.
        let cpu = NonNull::new(unsafe { alloc_zeroed(layout) })
            .ok_or("HeapCoherentAllocator: out of heap memory")?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok((cpu, BusAddress::new(cpu.as_ptr() as u64)))
    }

    unsafe fn free_coherent(&self, cpu: NonNull<u8>, bus: BusAddress, size_in_bytes: usize) {
        debug_assert_eq!(bus.value(), cpu.as_ptr() as u64, "HeapCoherentAllocator: cpu/bus pair mismatch");
        dealloc(cpu.as_ptr(), Layout::from_size_align_unchecked(size_in_bytes, PAGE_SIZE));
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}
