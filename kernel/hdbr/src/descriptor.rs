//! The 16-byte kernel descriptor that the device walks to find application pages.
//!
//! Word 0 (`flags`) and word 1 (`memptr`) are both little-endian.
//! The device reads descriptors lock-free, so every change that makes a descriptor valid
//! writes `memptr` before `flags`, and every change that invalidates one clears `flags`
//! before `memptr`, with a release fence in between. That ordering lives only in
//! [`KernelDescriptor::publish()`] and [`KernelDescriptor::retract()`].

use core::{fmt, mem, ops::Range, sync::atomic::{fence, Ordering}};
use bit_field::BitField;
use byteorder::LittleEndian;
use coherent_pages::BusAddress;
use volatile::Volatile;
use zerocopy::byteorder::U64;

bitflags! {
    /// The flag bits of word 0 of a [`KernelDescriptor`].
    pub struct DescriptorFlags: u64 {
        /// The descriptor points at something the device should read.
        const VALID         = 1 << 0;
        /// The highest in-use user descriptor; ends the device's walk of the table.
        const LAST          = 1 << 1;
        /// `memptr` is the next descriptor page rather than an application page.
        const LINKED        = 1 << 2;
        /// Application page slots are 64-bit doorbell words.
        const DB_FORMAT_B64 = 1 << 3;
    }
}

/// Stride field (bits 8..10) value meaning "no stride".
pub const DESCRIPTOR_STRIDE_OFF:    u64 = 0 << 8;
/// Size field (bits 10..12) value meaning a 4 KiB application page.
pub const DESCRIPTOR_SIZE_4K:       u64 = 0 << 10;
/// Bit position of the 16-bit page index (`pi`) field.
pub const DESCRIPTOR_PI_SHIFT:      usize = 32;
const DESCRIPTOR_PI_BITS:           Range<u8> = 32..48;

/// Composes word 0 of a user descriptor pointing at an application page.
pub(crate) fn user_descriptor_flags(pi: u16, last: bool) -> u64 {
    let mut flags = DescriptorFlags::VALID | DescriptorFlags::DB_FORMAT_B64;
    if last {
        flags |= DescriptorFlags::LAST;
    }
    flags.bits() | DESCRIPTOR_STRIDE_OFF | DESCRIPTOR_SIZE_4K | ((pi as u64) << DESCRIPTOR_PI_SHIFT)
}


/// One entry of a descriptor page. There are 256 of these per 4 KiB page.
#[repr(C)]
pub struct KernelDescriptor {
    flags:  Volatile<U64<LittleEndian>>,
    memptr: Volatile<U64<LittleEndian>>,
}

const_assert_eq!(mem::size_of::<KernelDescriptor>(), 16);

impl KernelDescriptor {
    /// The full word 0, including the `pi` and reserved fields.
    pub fn raw_flags(&self) -> u64 {
        self.flags.read().get()
    }

    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.raw_flags())
    }

    /// The page index (`pi`) supplied when this descriptor was registered.
    pub fn page_index(&self) -> u16 {
        self.raw_flags().get_bits(DESCRIPTOR_PI_BITS) as u16
    }

    pub fn memptr(&self) -> BusAddress {
        BusAddress::new(self.memptr.read().get())
    }

    /// True if word 0 is entirely clear, i.e., the descriptor is free.
    pub fn is_empty(&self) -> bool {
        self.raw_flags() == 0
    }

    /// True if this descriptor points at an application page.
    pub fn is_used(&self) -> bool {
        let flags = self.flags();
        flags.contains(DescriptorFlags::VALID) && !flags.contains(DescriptorFlags::LINKED)
    }

    pub fn snapshot(&self) -> DescriptorSnapshot {
        DescriptorSnapshot {
            raw_flags: self.raw_flags(),
            memptr: self.memptr(),
        }
    }

    /// Makes this descriptor point at `memptr` with the given word 0.
    /// The device never sees `flags` before the matching `memptr`.
    pub(crate) fn publish(&mut self, memptr: BusAddress, raw_flags: u64) {
        self.write_memptr(memptr.value());
        write_barrier();
        self.write_flags(raw_flags);
    }

    /// Empties this descriptor. The device sees it invalid before `memptr` is cleared.
    pub(crate) fn retract(&mut self) {
        self.write_flags(0);
        write_barrier();
        self.write_memptr(0);
    }

    /// Sets LAST on an already-valid descriptor; `memptr` is untouched.
    pub(crate) fn set_last(&mut self) {
        self.write_flags(self.raw_flags() | DescriptorFlags::LAST.bits());
    }

    /// Clears LAST on an already-valid descriptor; `memptr` is untouched.
    pub(crate) fn clear_last(&mut self) {
        self.write_flags(self.raw_flags() & !DescriptorFlags::LAST.bits());
    }

    fn write_flags(&mut self, raw_flags: u64) {
        self.flags.write(U64::new(raw_flags));
        #[cfg(test)]
        crate::test::log_write(crate::test::DescriptorWrite::Flags(self.address(), raw_flags));
    }

    fn write_memptr(&mut self, memptr: u64) {
        self.memptr.write(U64::new(memptr));
        #[cfg(test)]
        crate::test::log_write(crate::test::DescriptorWrite::Memptr(self.address(), memptr));
    }

    #[cfg(test)]
    pub(crate) fn address(&self) -> usize {
        self as *const KernelDescriptor as usize
    }
}

/// Orders every earlier write to device-visible memory before every later one.
///
/// Relies on the [`CoherentAllocator`](coherent_pages::CoherentAllocator) contract that
/// CPU writes separated by a release fence reach the device in that order.
pub(crate) fn write_barrier() {
    fence(Ordering::Release);
    #[cfg(test)]
    crate::test::log_write(crate::test::DescriptorWrite::Barrier);
}

impl fmt::Debug for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{flags: {:#X}, memptr: {:#X}}}", self.raw_flags(), self.memptr())
    }
}


/// A copy of a descriptor's two words, taken under the table lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorSnapshot {
    pub raw_flags: u64,
    pub memptr: BusAddress,
}

impl DescriptorSnapshot {
    pub fn flags(&self) -> DescriptorFlags {
        DescriptorFlags::from_bits_truncate(self.raw_flags)
    }

    pub fn page_index(&self) -> u16 {
        self.raw_flags.get_bits(DESCRIPTOR_PI_BITS) as u16
    }

    pub fn is_empty(&self) -> bool {
        self.raw_flags == 0
    }

    pub fn is_used(&self) -> bool {
        let flags = self.flags();
        flags.contains(DescriptorFlags::VALID) && !flags.contains(DescriptorFlags::LINKED)
    }
}
