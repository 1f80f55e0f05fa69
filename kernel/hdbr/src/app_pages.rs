//! The application page manager (APM): hands out 8-byte doorbell shadow slots
//! and keeps every application page walkable by the device.
//!
//! An application page is 512 shadow slots. Slots are handed out in blocks of
//! [`Group::block_size()`] slots, front to back. The first slot after the last block
//! handed out is always stamped [`DOORBELL_LAST`] so the device knows where to stop,
//! unless the page is exactly full.
//!
//! The APM is only touched on the queue setup and teardown paths, which the caller serializes,
//! so it has no lock of its own; methods that mutate it take `&mut self`.

use core::{fmt, ptr::NonNull};
use alloc::{sync::Arc, vec::Vec};
use byteorder::LittleEndian;
use coherent_pages::{BusAddress, CoherentAllocator, CoherentPage, PAGE_SIZE};
use volatile::Volatile;
use zerocopy::byteorder::U64;
use crate::{
    descriptor::write_barrier,
    doorbell::{DoorbellValue, Group, DOORBELL_INIT, DOORBELL_LAST},
    kdt::{KernelDescriptorTable, SlotIndex},
    HdbrError, Result,
};

/// Number of 8-byte shadow slots in one application page.
pub const DOORBELLS_PER_PAGE: usize = PAGE_SIZE / core::mem::size_of::<ShadowSlot>();


/// One 8-byte little-endian doorbell shadow, as read by the device.
#[repr(transparent)]
pub struct ShadowSlot(Volatile<U64<LittleEndian>>);

const_assert_eq!(core::mem::size_of::<ShadowSlot>(), 8);

impl ShadowSlot {
    pub fn read(&self) -> DoorbellValue {
        DoorbellValue::from_raw(self.0.read().get())
    }

    pub(crate) fn write(&mut self, value: DoorbellValue) {
        self.0.write(U64::new(value.value()));
    }
}


/// An application page and the KDT slot that points the device at it.
struct ApplicationPage {
    page: CoherentPage,
    kdt_index: SlotIndex,
}

impl ApplicationPage {
    fn slots(&self) -> &[ShadowSlot] {
        self.page.entries()
    }

    fn slots_mut(&mut self) -> &mut [ShadowSlot] {
        self.page.entries_mut()
    }
}


/// Manages the application pages of one shadowed [`Group`].
pub struct ApplicationPageManager {
    group: Group,
    block_size: usize,
    entries_per_page: usize,
    max_pages: usize,
    pages: Vec<ApplicationPage>,
    /// The page the next block will be handed out from.
    /// Equal to `pages.len()` when a new page must be allocated first.
    next_page: usize,
    /// The block within `next_page` that will be handed out next.
    next_entry: usize,
    kdt: Arc<KernelDescriptorTable>,
    allocator: Arc<dyn CoherentAllocator>,
}

impl ApplicationPageManager {
    /// Creates an APM for the group of the given `kdt` that will never use more than `max_pages`
    /// application pages. No pages are allocated until the first registration.
    ///
    /// # Panics
    /// Panics if the `kdt` belongs to a group that has no shadows.
    pub fn new(kdt: Arc<KernelDescriptorTable>, allocator: Arc<dyn CoherentAllocator>, max_pages: usize) -> ApplicationPageManager {
        let group = kdt.group();
        assert!(group.has_shadow(), "ApplicationPageManager::new(): group {:?} has no doorbell shadows", group);
        ApplicationPageManager {
            group,
            block_size: group.block_size(),
            entries_per_page: group.entries_per_page(),
            max_pages,
            pages: Vec::new(),
            next_page: 0,
            next_entry: 0,
            kdt,
            allocator,
        }
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn kdt(&self) -> &Arc<KernelDescriptorTable> {
        &self.kdt
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    pub fn entries_per_page(&self) -> usize {
        self.entries_per_page
    }

    /// Number of application pages currently allocated.
    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// The `(page, block)` position the next registration will be handed.
    pub fn cursor(&self) -> (usize, usize) {
        (self.next_page, self.next_entry)
    }

    pub fn page_bus_addr(&self, page: usize) -> Option<BusAddress> {
        self.pages.get(page).map(|p| p.page.bus_address())
    }

    /// The CPU address of the start of application page `page`.
    pub fn page_cpu_addr(&self, page: usize) -> Option<*mut u8> {
        self.pages.get(page).map(|p| p.page.as_ptr())
    }

    /// The KDT slot that points at application page `page`.
    pub fn page_kdt_index(&self, page: usize) -> Option<SlotIndex> {
        self.pages.get(page).map(|p| p.kdt_index)
    }

    /// The current contents of shadow slot `slot` on application page `page`.
    pub fn read_slot(&self, page: usize, slot: usize) -> Option<DoorbellValue> {
        self.pages.get(page)?.slots().get(slot).map(ShadowSlot::read)
    }

    /// Hands out the next block of shadow slots in this group.
    ///
    /// Every slot of the block is stamped [`DOORBELL_INIT`], and the first slot of the following
    /// block is stamped [`DOORBELL_LAST`] unless the block filled its page.
    ///
    /// Returns [`HdbrError::Unavailable`] if a new page is needed but `max_pages` are already in use,
    /// or [`HdbrError::OutOfMemory`] if the new page or a new KDT page couldn't be allocated.
    /// On error nothing has changed.
    pub fn register_doorbell(&mut self) -> Result<DoorbellSlot> {
        if self.next_page == self.pages.len() {
            self.add_page()?;
        }

        let block_size = self.block_size;
        let first = self.next_entry * block_size;
        let page_full = self.next_entry + 1 == self.entries_per_page;
        let app_page = &mut self.pages[self.next_page];
        let bus = app_page.page.bus_address().offset(first * 8);
        let slots = app_page.slots_mut();

        // Move the terminator forward before the old one is overwritten by INIT.
        if !page_full {
            slots[first + block_size].write(DOORBELL_LAST);
            write_barrier();
        }
        for slot in &mut slots[first .. first + block_size] {
            slot.write(DOORBELL_INIT);
        }
        write_barrier();
        let ptr = NonNull::from(&mut slots[first]);

        trace!("ApplicationPageManager::register_doorbell(): group {:?} page {} block {} at bus {:#X}",
            self.group, self.next_page, self.next_entry, bus
        );
        if page_full {
            self.next_page += 1;
            self.next_entry = 0;
        } else {
            self.next_entry += 1;
        }

        Ok(DoorbellSlot {
            ptr,
            bus,
            group: self.group,
        })
    }

    /// Allocates a new application page, terminates it at slot 0, and registers it with the KDT.
    fn add_page(&mut self) -> Result<()> {
        if self.pages.len() >= self.max_pages {
            warn!("ApplicationPageManager: group {:?} is out of application pages (max {})", self.group, self.max_pages);
            return Err(HdbrError::Unavailable);
        }
        let mut page = CoherentPage::allocate(&self.allocator).map_err(|e| {
            error!("ApplicationPageManager: couldn't allocate application page {} for group {:?}: {}",
                self.pages.len(), self.group, e
            );
            HdbrError::OutOfMemory
        })?;
        page.entries_mut::<ShadowSlot>()[0].write(DOORBELL_LAST);
        write_barrier();

        // If this fails `page` is dropped here, which gives it back to the allocator.
        let kdt_index = self.kdt.register(page.bus_address(), 0)?;

        debug!("ApplicationPageManager: group {:?} added application page {} at bus {:#X}, KDT slot {}",
            self.group, self.pages.len(), page.bus_address(), kdt_index
        );
        self.pages.push(ApplicationPage { page, kdt_index });
        Ok(())
    }

    /// Clears every application page back to a lone terminator at slot 0 and rewinds the cursor,
    /// so the next registrations reuse the existing pages from the beginning.
    /// The pages stay registered with the KDT.
    pub fn reset_all(&mut self) {
        for app_page in &mut self.pages {
            let slots = app_page.slots_mut();
            for slot in slots[1..].iter_mut() {
                slot.write(DoorbellValue::from_raw(0));
            }
            slots[0].write(DOORBELL_LAST);
        }
        write_barrier();
        self.next_page = 0;
        self.next_entry = 0;
        debug!("ApplicationPageManager::reset_all(): group {:?}, {} pages kept", self.group, self.pages.len());
    }

    /// Unregisters every application page from the KDT and frees it.
    pub fn teardown(mut self) {
        debug!("ApplicationPageManager::teardown(): group {:?}, freeing {} pages", self.group, self.pages.len());
        self.release_pages();
    }

    fn release_pages(&mut self) {
        for app_page in self.pages.drain(..) {
            self.kdt.unregister(app_page.kdt_index);
            // `app_page` is dropped here, after the device can no longer reach it.
        }
        self.next_page = 0;
        self.next_entry = 0;
    }
}

impl Drop for ApplicationPageManager {
    fn drop(&mut self) {
        self.release_pages();
    }
}

impl fmt::Debug for ApplicationPageManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ApplicationPageManager")
            .field("group", &self.group)
            .field("num_pages", &self.pages.len())
            .field("max_pages", &self.max_pages)
            .field("next_page", &self.next_page)
            .field("next_entry", &self.next_entry)
            .finish()
    }
}


/// A block of shadow slots handed out to one queue by [`ApplicationPageManager::register_doorbell()`].
///
/// The consumer must copy each doorbell value into its shadow before writing that doorbell
/// to the device.
#[derive(Clone, Copy)]
pub struct DoorbellSlot {
    ptr: NonNull<ShadowSlot>,
    bus: BusAddress,
    group: Group,
}

// SAFE: the slot is only written through `copy_doorbell()`, whose caller guarantees exclusive use.
unsafe impl Send for DoorbellSlot {}

impl DoorbellSlot {
    /// The CPU address of the first slot of the block.
    pub fn as_ptr(&self) -> *mut u64 {
        self.ptr.as_ptr() as *mut u64
    }

    /// The bus address of the first slot of the block.
    pub fn bus_address(&self) -> BusAddress {
        self.bus
    }

    pub fn group(&self) -> Group {
        self.group
    }

    /// Number of 8-byte slots in this block.
    pub fn block_size(&self) -> usize {
        self.group.block_size()
    }

    /// Stores `value` in the slot of this block that shadows its doorbell type,
    /// then issues a release fence so the shadow is visible before the doorbell MMIO write.
    ///
    /// Returns `false` and writes nothing if `value` doesn't belong to this block's group.
    ///
    /// # Safety
    /// The application page holding this block must still be allocated, i.e., its group
    /// must not have been reset or torn down since this slot was handed out,
    /// and no other thread may be writing to this block.
    pub unsafe fn copy_doorbell(&self, value: DoorbellValue) -> bool {
        let db_type = match value.db_type() {
            Some(t) if t.group() == Some(self.group) => t,
            _ => return false,
        };
        let offset = db_type.block_offset();
        debug_assert!(offset < self.block_size());
        (*self.ptr.as_ptr().add(offset)).write(value);
        write_barrier();
        true
    }

    /// Reads sub-slot `offset` of this block.
    ///
    /// # Safety
    /// Same as [`copy_doorbell()`](#method.copy_doorbell); `offset` must be less than `block_size()`.
    pub unsafe fn read(&self, offset: usize) -> DoorbellValue {
        debug_assert!(offset < self.block_size());
        (*self.ptr.as_ptr().add(offset)).read()
    }
}

impl fmt::Debug for DoorbellSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DoorbellSlot {{ group: {:?}, cpu: {:p}, bus: {:#X} }}", self.group, self.ptr, self.bus)
    }
}

