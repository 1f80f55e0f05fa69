//! The kernel descriptor table (KDT): a device-walkable chain of descriptor pages
//! presented to callers as one flat index space.
//!
//! Every descriptor page holds 256 [`KernelDescriptor`]s. The first 255 are user slots;
//! the last one is reserved as the link to the next page in the chain.
//! Flat index `n` lives on page `n / 255` at position `n % 255`.
//!
//! The table only ever grows: pages are appended by stamping the link slot of the
//! current tail page, and no existing descriptor is ever moved.

use core::{cmp::min, fmt, ptr::NonNull, slice};
use alloc::{sync::Arc, vec::Vec};
use coherent_pages::{BusAddress, CoherentAllocator, CoherentPage, PAGE_SIZE};
use crate::{
    descriptor::{user_descriptor_flags, DescriptorFlags, DescriptorSnapshot, KernelDescriptor},
    doorbell::Group,
    DescriptorLock, HdbrError, Result,
};

/// Number of descriptors in one descriptor page.
pub const DESCRIPTORS_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<KernelDescriptor>();
/// Number of user slots in one descriptor page; the last descriptor is the link slot.
pub const SLOTS_PER_KDT_PAGE: usize = DESCRIPTORS_PER_PAGE - 1;
/// Position of the link slot within each descriptor page.
const LINK_SLOT: usize = DESCRIPTORS_PER_PAGE - 1;
/// Hard cap on the length of a descriptor page chain, enough for 2^18 user slots.
/// Reaching it means the device resources were sized wrong.
pub const MAX_KDT_PAGES: usize = ((1 << 18) + SLOTS_PER_KDT_PAGE - 1) / SLOTS_PER_KDT_PAGE;


/// The flat index of a user slot in a [`KernelDescriptorTable`], as returned by
/// [`register()`](KernelDescriptorTable::register).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotIndex(usize);

impl SlotIndex {
    pub(crate) const fn new(flat_index: usize) -> SlotIndex {
        SlotIndex(flat_index)
    }

    /// The flat index value, for diagnostics.
    pub const fn value(&self) -> usize {
        self.0
    }

    /// The descriptor page this slot lives on.
    pub const fn page(&self) -> usize {
        self.0 / SLOTS_PER_KDT_PAGE
    }

    /// The position of this slot within its descriptor page.
    pub const fn offset(&self) -> usize {
        self.0 % SLOTS_PER_KDT_PAGE
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}


/// A snapshot of a table's bookkeeping, taken under the table lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdtStats {
    /// Lowest flat index at which the next registration may land.
    pub first_avail: usize,
    /// One past the highest flat index ever in use since the tail last moved down.
    pub first_empty: usize,
    /// Flat index of the LAST-flagged descriptor, if any slot is in use.
    pub last_entry: Option<usize>,
    /// Number of free user slots across all pages.
    pub slot_avail: usize,
    /// Number of descriptor pages in the chain.
    pub num_pages: usize,
}


/// One 4 KiB page of descriptors.
struct DescriptorPage {
    descs: NonNull<KernelDescriptor>,
    bus: BusAddress,
    /// `None` when the page is owned by whoever supplied it (page 0 from a backing store).
    _backing: Option<CoherentPage>,
}

// SAFE: the descriptor memory is only accessed through the owning table's lock.
unsafe impl Send for DescriptorPage {}

impl DescriptorPage {
    fn owned(mut page: CoherentPage) -> DescriptorPage {
        let descs = NonNull::from(page.entries_mut::<KernelDescriptor>()).cast();
        DescriptorPage {
            descs,
            bus: page.bus_address(),
            _backing: Some(page),
        }
    }

    fn descriptors(&self) -> &[KernelDescriptor] {
        // SAFE: `descs` points at a live, page-aligned page of DESCRIPTORS_PER_PAGE descriptors.
        unsafe { slice::from_raw_parts(self.descs.as_ptr(), DESCRIPTORS_PER_PAGE) }
    }

    fn descriptors_mut(&mut self) -> &mut [KernelDescriptor] {
        // SAFE: same as above, and `&mut self` gives exclusive CPU-side access.
        unsafe { slice::from_raw_parts_mut(self.descs.as_ptr(), DESCRIPTORS_PER_PAGE) }
    }

    fn zero(&mut self) {
        for desc in self.descriptors_mut() {
            desc.retract();
        }
    }
}


/// The mutable state of a table, protected by its lock.
struct TableState {
    pages: Vec<DescriptorPage>,
    first_avail: usize,
    first_empty: usize,
    last_entry: Option<usize>,
    slot_avail: usize,
}

impl TableState {
    fn descriptor(&self, flat_index: usize) -> &KernelDescriptor {
        &self.pages[flat_index / SLOTS_PER_KDT_PAGE].descriptors()[flat_index % SLOTS_PER_KDT_PAGE]
    }

    fn descriptor_mut(&mut self, flat_index: usize) -> &mut KernelDescriptor {
        &mut self.pages[flat_index / SLOTS_PER_KDT_PAGE].descriptors_mut()[flat_index % SLOTS_PER_KDT_PAGE]
    }

    fn capacity(&self) -> usize {
        self.pages.len() * SLOTS_PER_KDT_PAGE
    }

    /// Lowest free flat index in `[start, first_empty)`, or `first_empty` if there is none.
    fn next_free_from(&self, start: usize) -> usize {
        (start..self.first_empty)
            .find(|&i| self.descriptor(i).is_empty())
            .unwrap_or(self.first_empty)
    }

    /// Appends a new descriptor page to the chain and links the old tail to it.
    fn grow(&mut self, group: Group, allocator: &Arc<dyn CoherentAllocator>) -> Result<()> {
        assert!(self.pages.len() < MAX_KDT_PAGES,
            "KernelDescriptorTable::grow(): group {:?} would exceed {} descriptor pages", group, MAX_KDT_PAGES
        );
        let page = CoherentPage::allocate(allocator).map_err(|e| {
            error!("KernelDescriptorTable::grow(): couldn't allocate descriptor page {} for group {:?}: {}",
                self.pages.len(), group, e
            );
            HdbrError::OutOfMemory
        })?;
        let new_page = DescriptorPage::owned(page);
        let new_bus = new_page.bus;

        let link_flags = (DescriptorFlags::VALID | DescriptorFlags::LINKED).bits();
        let tail = self.pages.len() - 1;
        self.pages[tail].descriptors_mut()[LINK_SLOT].publish(new_bus, link_flags);
        self.pages.push(new_page);
        self.slot_avail += SLOTS_PER_KDT_PAGE;

        debug!("KernelDescriptorTable: group {:?} chained descriptor page {} at bus {:#X}",
            group, self.pages.len() - 1, new_bus
        );
        Ok(())
    }
}


/// A per-group chain of descriptor pages that the device walks to find doorbell shadows.
///
/// All mutation happens under an internal lock, so a table can be shared (e.g., in an `Arc`)
/// between the L2 application page manager and RDMA consumers registering their own pages.
pub struct KernelDescriptorTable {
    group: Group,
    head: BusAddress,
    allocator: Arc<dyn CoherentAllocator>,
    state: DescriptorLock<TableState>,
}

impl KernelDescriptorTable {
    /// Creates a table whose head page is allocated from (and owned by) this table.
    pub fn new(group: Group, allocator: Arc<dyn CoherentAllocator>) -> Result<KernelDescriptorTable> {
        let page = CoherentPage::allocate(&allocator).map_err(|e| {
            error!("KernelDescriptorTable::new(): couldn't allocate head page for group {:?}: {}", group, e);
            HdbrError::OutOfMemory
        })?;
        Ok(Self::with_head_page(group, DescriptorPage::owned(page), allocator))
    }

    /// Creates a table whose head page was allocated elsewhere, e.g., by the driver's backing store.
    /// The head page is zeroed.
    ///
    /// # Safety
    /// `page0_cpu` must point at a page-aligned, writable, [`PAGE_SIZE`] region of coherent memory
    /// that the device reaches at `page0_bus`. The region must stay valid, and must not be accessed
    /// by anything else, until the returned table is dropped.
    pub unsafe fn from_backing_store(
        group: Group,
        page0_cpu: NonNull<u8>,
        page0_bus: BusAddress,
        allocator: Arc<dyn CoherentAllocator>,
    ) -> KernelDescriptorTable {
        debug_assert_eq!(page0_cpu.as_ptr() as usize % PAGE_SIZE, 0);
        debug_assert!(page0_bus.is_page_aligned());
        let head = DescriptorPage {
            descs: page0_cpu.cast(),
            bus: page0_bus,
            _backing: None,
        };
        Self::with_head_page(group, head, allocator)
    }

    fn with_head_page(group: Group, mut head: DescriptorPage, allocator: Arc<dyn CoherentAllocator>) -> KernelDescriptorTable {
        head.zero();
        let head_bus = head.bus;
        let mut pages = Vec::with_capacity(1);
        pages.push(head);
        debug!("KernelDescriptorTable: group {:?} head page at bus {:#X}", group, head_bus);
        KernelDescriptorTable {
            group,
            head: head_bus,
            allocator,
            state: DescriptorLock::new(TableState {
                pages,
                first_avail: 0,
                first_empty: 0,
                last_entry: None,
                slot_avail: SLOTS_PER_KDT_PAGE,
            }),
        }
    }

    pub fn group(&self) -> Group {
        self.group
    }

    /// The bus address of descriptor page 0, which the driver publishes to firmware.
    pub fn head_bus_addr(&self) -> BusAddress {
        self.head
    }

    /// Points the lowest free user slot at the application page at `app_bus`.
    ///
    /// If the slot becomes the new tail it is marked LAST, and only then is LAST
    /// cleared from the previous tail, so the device always sees a terminator.
    /// Fails only if a new descriptor page was needed and couldn't be allocated,
    /// in which case the table is unchanged.
    pub fn register(&self, app_bus: BusAddress, pi: u16) -> Result<SlotIndex> {
        let mut state = self.state.lock();
        if state.slot_avail == 0 {
            state.grow(self.group, &self.allocator)?;
        }

        let slot = state.first_avail;
        debug_assert!(slot < state.capacity() && state.descriptor(slot).is_empty(),
            "KernelDescriptorTable::register(): first_avail {} is not a free slot", slot
        );
        let new_tail = slot == state.first_empty;
        let flags = user_descriptor_flags(pi, new_tail);
        state.descriptor_mut(slot).publish(app_bus, flags);

        if new_tail {
            if let Some(prev) = state.last_entry {
                state.descriptor_mut(prev).clear_last();
            }
            state.last_entry = Some(slot);
            state.first_empty = slot + 1;
            state.first_avail = state.first_empty;
        } else {
            state.first_avail = state.next_free_from(slot + 1);
        }
        state.slot_avail -= 1;

        trace!("KernelDescriptorTable::register(): group {:?} slot {} -> {:#X}, flags {:#X}",
            self.group, slot, app_bus, flags
        );
        Ok(SlotIndex(slot))
    }

    /// Empties the given user slot so it can be recycled.
    ///
    /// If it was the tail, LAST moves to the highest remaining in-use slot first.
    ///
    /// # Panics
    /// Panics if `index` is not currently in use in this table.
    pub fn unregister(&self, index: SlotIndex) {
        let slot = index.0;
        let mut state = self.state.lock();
        assert!(slot < state.first_empty && state.descriptor(slot).is_used(),
            "KernelDescriptorTable::unregister(): slot {} of group {:?} is not in use", slot, self.group
        );

        if state.last_entry == Some(slot) {
            let new_tail = (0..slot).rev().find(|&i| state.descriptor(i).is_used());
            if let Some(tail) = new_tail {
                state.descriptor_mut(tail).set_last();
            }
            state.last_entry = new_tail;
            state.first_empty = new_tail.map_or(0, |tail| tail + 1);
        }

        state.descriptor_mut(slot).retract();
        state.first_avail = min(min(state.first_avail, slot), state.first_empty);
        state.slot_avail += 1;

        trace!("KernelDescriptorTable::unregister(): group {:?} slot {}, last_entry {:?}",
            self.group, slot, state.last_entry
        );
    }

    pub fn stats(&self) -> KdtStats {
        let state = self.state.lock();
        KdtStats {
            first_avail: state.first_avail,
            first_empty: state.first_empty,
            last_entry: state.last_entry,
            slot_avail: state.slot_avail,
            num_pages: state.pages.len(),
        }
    }

    /// A copy of the user descriptor at `index`.
    pub fn descriptor(&self, index: SlotIndex) -> DescriptorSnapshot {
        self.descriptor_at(index.0)
            .unwrap_or_else(|| panic!("KernelDescriptorTable::descriptor(): slot {} is out of range", index.0))
    }

    /// A copy of the user descriptor at flat index `flat_index`, or `None` if no page holds it yet.
    pub fn descriptor_at(&self, flat_index: usize) -> Option<DescriptorSnapshot> {
        let state = self.state.lock();
        if flat_index < state.capacity() {
            Some(state.descriptor(flat_index).snapshot())
        } else {
            None
        }
    }

    /// A copy of the link slot of descriptor page `page`.
    pub fn link_descriptor(&self, page: usize) -> Option<DescriptorSnapshot> {
        let state = self.state.lock();
        state.pages.get(page).map(|p| p.descriptors()[LINK_SLOT].snapshot())
    }

    /// The bus address of descriptor page `page`.
    pub fn page_bus_addr(&self, page: usize) -> Option<BusAddress> {
        self.state.lock().pages.get(page).map(|p| p.bus)
    }

    /// Calls `f` with the index, bus address and descriptors of every page, in chain order,
    /// while holding the table lock.
    pub fn visit_pages<F>(&self, mut f: F)
        where F: FnMut(usize, BusAddress, &[KernelDescriptor])
    {
        let state = self.state.lock();
        for (i, page) in state.pages.iter().enumerate() {
            f(i, page.bus, page.descriptors());
        }
    }
}

impl Drop for KernelDescriptorTable {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let in_use = state.capacity() - state.slot_avail;
        if in_use != 0 {
            warn!("KernelDescriptorTable::drop(): group {:?} still has {} slots in use", self.group, in_use);
        }
        // Unlink from the tail backwards so the device never follows a link into a freed page.
        let num_pages = state.pages.len();
        for page in state.pages[..num_pages - 1].iter_mut().rev() {
            page.descriptors_mut()[LINK_SLOT].retract();
        }
        debug!("KernelDescriptorTable::drop(): group {:?}, freeing {} chained pages", self.group, num_pages - 1);
    }
}

impl fmt::Debug for KernelDescriptorTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KernelDescriptorTable")
            .field("group", &self.group)
            .field("head", &self.head)
            .field("stats", &self.stats())
            .finish()
    }
}
