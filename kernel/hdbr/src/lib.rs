//! Hardware doorbell recovery (HDBR) memory management for an RDMA-capable NIC.
//!
//! The host keeps, in coherent memory, a shadow copy of the last doorbell value written
//! for every live queue, so the device can replay doorbells that were lost.
//! The shadows live in *application pages* (see [`app_pages`]), and the device finds
//! those pages by walking a per-group *kernel descriptor table* (see [`kdt`]),
//! a chain of 4 KiB descriptor pages whose head bus address is handed to firmware.
//!
//! Three groups keep shadows: send queues (SQ), shared receive queues (SRQ) and
//! completion queues (CQ). [`Hdbr`] bundles one table and one application page manager
//! per group for a single NIC.
//!
//! All memory comes from the host's coherent allocator, see the `coherent_pages` crate.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate bitflags;
#[macro_use] extern crate static_assertions;
extern crate bit_field;
extern crate byteorder;
extern crate coherent_pages;
extern crate volatile;
extern crate zerocopy;
#[cfg(target_os = "none")]
extern crate irq_safety;
#[cfg(not(target_os = "none"))]
extern crate spin;

pub mod doorbell;
pub mod descriptor;
pub mod kdt;
pub mod app_pages;
pub mod dump;


use core::{fmt, mem};
use alloc::sync::Arc;

pub use coherent_pages::{BusAddress, CoherentAllocator, PAGE_SIZE};
pub use doorbell::{
    group_of, group_of_ring, DoorbellPath, DoorbellType, DoorbellValue, Group, RingType,
    DOORBELL_INIT, DOORBELL_LAST,
};
pub use descriptor::{DescriptorFlags, DescriptorSnapshot, KernelDescriptor};
pub use kdt::{KdtStats, KernelDescriptorTable, SlotIndex, DESCRIPTORS_PER_PAGE, MAX_KDT_PAGES, SLOTS_PER_KDT_PAGE};
pub use app_pages::{ApplicationPageManager, DoorbellSlot, ShadowSlot, DOORBELLS_PER_PAGE};

/// The lock protecting each descriptor table.
/// On bare metal the device's interrupt handlers may also take it, so interrupts are disabled while held.
#[cfg(target_os = "none")]
pub(crate) type DescriptorLock<T> = irq_safety::MutexIrqSafe<T>;
#[cfg(not(target_os = "none"))]
pub(crate) type DescriptorLock<T> = spin::Mutex<T>;


/// The ways HDBR operations can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HdbrError {
    /// The coherent allocator couldn't provide a page.
    OutOfMemory,
    /// The group already uses as many application pages as it is allowed.
    Unavailable,
}

impl fmt::Display for HdbrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg: &'static str = (*self).into();
        f.write_str(msg)
    }
}

impl From<HdbrError> for &'static str {
    fn from(error: HdbrError) -> Self {
        match error {
            HdbrError::OutOfMemory => "HDBR: out of coherent memory",
            HdbrError::Unavailable => "HDBR: no doorbell shadow slots available in this group",
        }
    }
}

pub type Result<T> = core::result::Result<T, HdbrError>;


/// The per-NIC ring counts that bound how many application pages each group may use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceCaps {
    pub max_tx_rings: usize,
    pub max_rx_rings: usize,
    pub max_cp_rings: usize,
}

impl ResourceCaps {
    /// The number of queues of the given group the NIC can have.
    pub fn max_rings(&self, group: Group) -> usize {
        match group {
            Group::Sq => self.max_tx_rings,
            Group::Srq => self.max_rx_rings,
            Group::Cq => self.max_cp_rings,
            Group::Rq => 0,
        }
    }

    /// The number of application pages needed to shadow every queue of the given group.
    pub fn max_pages(&self, group: Group) -> usize {
        let per_page = group.entries_per_page();
        (self.max_rings(group) + per_page - 1) / per_page
    }
}


/// Position of a shadowed group in [`Hdbr`]'s tables.
fn group_slot(group: Group) -> Option<usize> {
    Group::SHADOWED.iter().position(|&g| g == group)
}

/// The doorbell recovery state of one NIC: a kernel descriptor table and an
/// application page manager for each of the SQ, SRQ and CQ groups.
pub struct Hdbr {
    caps: ResourceCaps,
    allocator: Arc<dyn CoherentAllocator>,
    groups: [ApplicationPageManager; 3],
}

impl Hdbr {
    /// Creates the three descriptor tables, each with a head page allocated from `allocator`.
    /// No application pages are allocated yet.
    pub fn new(caps: ResourceCaps, allocator: Arc<dyn CoherentAllocator>) -> Result<Hdbr> {
        let sq  = Arc::new(KernelDescriptorTable::new(Group::Sq,  Arc::clone(&allocator))?);
        let srq = Arc::new(KernelDescriptorTable::new(Group::Srq, Arc::clone(&allocator))?);
        let cq  = Arc::new(KernelDescriptorTable::new(Group::Cq,  Arc::clone(&allocator))?);
        Ok(Self::from_tables(caps, allocator, sq, srq, cq))
    }

    /// Creates the recovery state around existing descriptor tables,
    /// e.g., ones whose head pages came from the driver's backing store.
    ///
    /// # Panics
    /// Panics if a table belongs to a different group than its position.
    pub fn from_tables(
        caps: ResourceCaps,
        allocator: Arc<dyn CoherentAllocator>,
        sq: Arc<KernelDescriptorTable>,
        srq: Arc<KernelDescriptorTable>,
        cq: Arc<KernelDescriptorTable>,
    ) -> Hdbr {
        let groups = [sq, srq, cq];
        for (kdt, &group) in groups.iter().zip(Group::SHADOWED.iter()) {
            assert_eq!(kdt.group(), group, "Hdbr::from_tables(): table passed in the wrong position");
        }
        let [sq, srq, cq] = groups;
        let apm = |kdt: Arc<KernelDescriptorTable>| {
            let max_pages = caps.max_pages(kdt.group());
            ApplicationPageManager::new(kdt, Arc::clone(&allocator), max_pages)
        };
        let groups = [apm(sq), apm(srq), apm(cq)];
        debug!("Hdbr: created with {:?}, max pages SQ {}, SRQ {}, CQ {}", caps,
            groups[0].max_pages(), groups[1].max_pages(), groups[2].max_pages()
        );
        Hdbr { caps, allocator, groups }
    }

    pub fn caps(&self) -> ResourceCaps {
        self.caps
    }

    /// Hands out a shadow slot for a queue that rings doorbells like `value`.
    ///
    /// Returns `Ok(None)` if doorbells of that type aren't shadowed.
    pub fn register_doorbell(&mut self, value: DoorbellValue) -> Result<Option<DoorbellSlot>> {
        match group_of(value) {
            Some(group) => self.register_group(group),
            None => Ok(None),
        }
    }

    /// Hands out a shadow slot for a queue built on a ring of the given type.
    ///
    /// Returns `Ok(None)` if that type of ring isn't shadowed.
    pub fn register_ring(&mut self, ring: RingType) -> Result<Option<DoorbellSlot>> {
        match group_of_ring(ring) {
            Some(group) => self.register_group(group),
            None => Ok(None),
        }
    }

    fn register_group(&mut self, group: Group) -> Result<Option<DoorbellSlot>> {
        match group_slot(group) {
            Some(i) => self.groups[i].register_doorbell().map(Some),
            None => Ok(None),
        }
    }

    /// Rewinds every shadow slot of `group`, keeping its application pages.
    pub fn reset_group(&mut self, group: Group) {
        if let Some(i) = group_slot(group) {
            self.groups[i].reset_all();
        }
    }

    /// Unregisters and frees every application page of `group`.
    /// The group's descriptor table stays live, so the group can be registered into again.
    pub fn teardown_group(&mut self, group: Group) {
        if let Some(i) = group_slot(group) {
            let kdt = Arc::clone(self.groups[i].kdt());
            let max_pages = self.groups[i].max_pages();
            let fresh = ApplicationPageManager::new(kdt, Arc::clone(&self.allocator), max_pages);
            mem::replace(&mut self.groups[i], fresh).teardown();
        }
    }

    /// The bus address of the head descriptor page of `group`, to be handed to firmware.
    pub fn head_bus_addr(&self, group: Group) -> Option<BusAddress> {
        self.kdt(group).map(|kdt| kdt.head_bus_addr())
    }

    pub fn kdt(&self, group: Group) -> Option<&Arc<KernelDescriptorTable>> {
        self.pages(group).map(ApplicationPageManager::kdt)
    }

    pub fn pages(&self, group: Group) -> Option<&ApplicationPageManager> {
        group_slot(group).map(|i| &self.groups[i])
    }
}

impl fmt::Debug for Hdbr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Hdbr")
            .field("caps", &self.caps)
            .field("sq", &self.groups[0])
            .field("srq", &self.groups[1])
            .field("cq", &self.groups[2])
            .finish()
    }
}
