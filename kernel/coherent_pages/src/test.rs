//! Tests for `CoherentPage` and the `HeapCoherentAllocator`.

extern crate std;

use super::*;

fn heap() -> (Arc<HeapCoherentAllocator>, Arc<dyn CoherentAllocator>) {
    let heap = Arc::new(HeapCoherentAllocator::new());
    let allocator: Arc<dyn CoherentAllocator> = heap.clone();
    (heap, allocator)
}

#[test]
fn allocate_is_zeroed_and_aligned() {
    let (_heap, allocator) = heap();
    let page = CoherentPage::allocate(&allocator).unwrap();
    assert_eq!(page.as_ptr() as usize % PAGE_SIZE, 0);
    assert!(page.bus_address().is_page_aligned());
    assert!(page.entries::<u64>().iter().all(|&word| word == 0));
}

#[test]
fn drop_returns_page_to_allocator() {
    let (heap, allocator) = heap();
    let first = CoherentPage::allocate(&allocator).unwrap();
    let second = CoherentPage::allocate(&allocator).unwrap();
    assert_eq!(heap.outstanding(), 2);
    drop(first);
    assert_eq!(heap.outstanding(), 1);
    drop(second);
    assert_eq!(heap.outstanding(), 0);
}

#[test]
fn limit_refuses_then_recovers() {
    let heap = Arc::new(HeapCoherentAllocator::with_limit(1));
    let allocator: Arc<dyn CoherentAllocator> = heap.clone();

    let _page = CoherentPage::allocate(&allocator).unwrap();
    assert!(CoherentPage::allocate(&allocator).is_err());
    assert_eq!(heap.outstanding(), 1);

    heap.clear_limit();
    let _another = CoherentPage::allocate(&allocator).unwrap();
    assert_eq!(heap.outstanding(), 2);

    heap.set_limit(0);
    assert!(CoherentPage::allocate(&allocator).is_err());
}

#[test]
fn rejects_bad_sizes() {
    let heap = HeapCoherentAllocator::new();
    assert!(heap.alloc_coherent(0).is_err());
    assert!(heap.alloc_coherent(PAGE_SIZE + 8).is_err());
    assert_eq!(heap.outstanding(), 0);
}

#[test]
fn entries_cover_the_whole_page() {
    let (_heap, allocator) = heap();
    let mut page = CoherentPage::allocate(&allocator).unwrap();
    assert_eq!(page.entries::<u64>().len(), 512);
    assert_eq!(page.entries::<[u64; 2]>().len(), 256);

    page.entries_mut::<u64>()[511] = 0xdead_beef;
    // SAFE: the last word of the page, which we just wrote.
    let last = unsafe { *(page.as_ptr().add(PAGE_SIZE - 8) as *const u64) };
    assert_eq!(last, 0xdead_beef);
}

#[test]
#[should_panic]
fn entries_rejects_non_tiling_type() {
    let (_heap, allocator) = heap();
    let page = CoherentPage::allocate(&allocator).unwrap();
    let _ = page.entries::<[u8; 3]>();
}

/// Hands out regions shifted off their page boundary.
struct MisalignedAllocator {
    inner: HeapCoherentAllocator,
}

impl CoherentAllocator for MisalignedAllocator {
    fn alloc_coherent(&self, size_in_bytes: usize) -> Result<(NonNull<u8>, BusAddress), &'static str> {
        let (cpu, bus) = self.inner.alloc_coherent(size_in_bytes)?;
        Ok((cpu, bus.offset(8)))
    }

    unsafe fn free_coherent(&self, cpu: NonNull<u8>, _bus: BusAddress, size_in_bytes: usize) {
        self.inner.free_coherent(cpu, BusAddress::new(cpu.as_ptr() as u64), size_in_bytes)
    }
}

#[test]
fn misaligned_region_is_given_back() {
    let misaligned = Arc::new(MisalignedAllocator { inner: HeapCoherentAllocator::new() });
    let allocator: Arc<dyn CoherentAllocator> = misaligned.clone();
    assert!(CoherentPage::allocate(&allocator).is_err());
    assert_eq!(misaligned.inner.outstanding(), 0);
}
