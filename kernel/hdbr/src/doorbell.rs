//! The 64-bit doorbell word and the classification of doorbells and rings into shadow groups.
//!
//! These are the only places where the doorbell taxonomy is interpreted.

use core::{fmt, ops::Range};
use bit_field::BitField;

const DB_INDEX_BITS:        Range<u8> = 0..24;
const DB_EPOCH_BIT:         u8 = 24;
const DB_TOGGLE_BITS:       Range<u8> = 25..27;
const DB_XID_BITS:          Range<u8> = 32..52;
const DB_PATH_BITS:         Range<u8> = 56..58;
const DB_VALID_BIT:         u8 = 58;
const DB_DEBUG_TRACE_BIT:   u8 = 59;
const DB_TYPE_BITS:         Range<u8> = 60..64;

/// Mask of the index field of a doorbell word.
pub const DB_INDEX_MASK:    u64 = 0xFF_FFFF;

/// Stamped into every slot of a freshly handed-out block: type zero, index all-ones.
pub const DOORBELL_INIT: DoorbellValue = DoorbellValue(DB_INDEX_MASK);
/// Terminates the device's walk of an application page: type zero, valid bit set.
pub const DOORBELL_LAST: DoorbellValue = DoorbellValue(1u64 << DB_VALID_BIT);


/// The type encoded in the top 4 bits of a doorbell word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DoorbellType {
    Sq          = 0x0,
    Rq          = 0x1,
    Srq         = 0x2,
    SrqArm      = 0x3,
    Cq          = 0x4,
    CqArmSe     = 0x5,
    CqArmAll    = 0x6,
    CqArmEna    = 0x7,
    SrqArmEna   = 0x8,
    CqCutoffAck = 0x9,
    Nq          = 0xA,
    NqArm       = 0xB,
    NqMask      = 0xE,
    /// Reserved.
    Null        = 0xF,
}

impl DoorbellType {
    /// Decodes the 4-bit type field, returning `None` for unassigned encodings.
    pub fn from_bits(bits: u8) -> Option<DoorbellType> {
        let db_type = match bits {
            0x0 => DoorbellType::Sq,
            0x1 => DoorbellType::Rq,
            0x2 => DoorbellType::Srq,
            0x3 => DoorbellType::SrqArm,
            0x4 => DoorbellType::Cq,
            0x5 => DoorbellType::CqArmSe,
            0x6 => DoorbellType::CqArmAll,
            0x7 => DoorbellType::CqArmEna,
            0x8 => DoorbellType::SrqArmEna,
            0x9 => DoorbellType::CqCutoffAck,
            0xA => DoorbellType::Nq,
            0xB => DoorbellType::NqArm,
            0xE => DoorbellType::NqMask,
            0xF => DoorbellType::Null,
            _ => return None,
        };
        Some(db_type)
    }

    /// The shadow group this type of doorbell belongs to, if any.
    pub fn group(self) -> Option<Group> {
        match self {
            DoorbellType::Sq => Some(Group::Sq),
            DoorbellType::Rq => Some(Group::Rq),
            DoorbellType::Srq
            | DoorbellType::SrqArm
            | DoorbellType::SrqArmEna => Some(Group::Srq),
            DoorbellType::Cq
            | DoorbellType::CqArmSe
            | DoorbellType::CqArmAll
            | DoorbellType::CqArmEna
            | DoorbellType::CqCutoffAck => Some(Group::Cq),
            DoorbellType::Nq
            | DoorbellType::NqArm
            | DoorbellType::NqMask
            | DoorbellType::Null => None,
        }
    }

    /// Which slot of a block this type of doorbell is shadowed in.
    ///
    /// Completion queues use three slots per block: the consumer index,
    /// the arm request (arm-all, arm-se and arm-enable share one slot), and the cutoff ack.
    /// Every other group uses a single slot.
    pub fn block_offset(self) -> usize {
        match self {
            DoorbellType::CqArmSe
            | DoorbellType::CqArmAll
            | DoorbellType::CqArmEna => 1,
            DoorbellType::CqCutoffAck => 2,
            _ => 0,
        }
    }
}


/// The datapath a doorbell is routed through.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DoorbellPath {
    Roce    = 0,
    L2      = 1,
    Engine  = 2,
}


/// A packed 64-bit doorbell word, as written to the device and to its shadow slot.
///
/// | bits   | field       |
/// |--------|-------------|
/// | 0..24  | index       |
/// | 24     | epoch       |
/// | 25..27 | toggle      |
/// | 32..52 | xid         |
/// | 56..58 | path        |
/// | 58     | valid       |
/// | 59     | debug trace |
/// | 60..64 | type        |
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct DoorbellValue(u64);

impl DoorbellValue {
    pub const fn from_raw(value: u64) -> DoorbellValue {
        DoorbellValue(value)
    }

    /// Builds a valid doorbell of the given type for queue `xid` at producer/consumer `index`.
    /// Out-of-range `xid` and `index` bits are truncated to their field widths.
    pub fn new(db_type: DoorbellType, path: DoorbellPath, xid: u32, index: u32) -> DoorbellValue {
        let mut value = 0u64;
        value.set_bits(DB_INDEX_BITS, index as u64 & DB_INDEX_MASK);
        value.set_bits(DB_XID_BITS, xid as u64 & 0xF_FFFF);
        value.set_bits(DB_PATH_BITS, path as u64);
        value.set_bit(DB_VALID_BIT, true);
        value.set_bits(DB_TYPE_BITS, db_type as u64);
        DoorbellValue(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    pub fn index(&self) -> u32 {
        self.0.get_bits(DB_INDEX_BITS) as u32
    }

    pub fn epoch(&self) -> bool {
        self.0.get_bit(DB_EPOCH_BIT)
    }

    pub fn toggle(&self) -> u8 {
        self.0.get_bits(DB_TOGGLE_BITS) as u8
    }

    pub fn xid(&self) -> u32 {
        self.0.get_bits(DB_XID_BITS) as u32
    }

    pub fn path(&self) -> u8 {
        self.0.get_bits(DB_PATH_BITS) as u8
    }

    pub fn is_valid(&self) -> bool {
        self.0.get_bit(DB_VALID_BIT)
    }

    pub fn debug_trace(&self) -> bool {
        self.0.get_bit(DB_DEBUG_TRACE_BIT)
    }

    /// The raw 4-bit type field.
    pub fn type_bits(&self) -> u8 {
        self.0.get_bits(DB_TYPE_BITS) as u8
    }

    pub fn db_type(&self) -> Option<DoorbellType> {
        DoorbellType::from_bits(self.type_bits())
    }

    pub fn with_epoch(mut self, epoch: bool) -> DoorbellValue {
        self.0.set_bit(DB_EPOCH_BIT, epoch);
        self
    }

    pub fn with_toggle(mut self, toggle: u8) -> DoorbellValue {
        self.0.set_bits(DB_TOGGLE_BITS, toggle as u64 & 0x3);
        self
    }

    pub fn with_debug_trace(mut self, debug_trace: bool) -> DoorbellValue {
        self.0.set_bit(DB_DEBUG_TRACE_BIT, debug_trace);
        self
    }
}

impl fmt::Debug for DoorbellValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{type: {:#X}, valid: {}, path: {}, xid: {:#X}, toggle: {}, epoch: {}, index: {:#X}}}",
            self.type_bits(), self.is_valid(), self.path(), self.xid(), self.toggle(), self.epoch() as u8, self.index()
        )
    }
}


/// The classification of queues that determines block size and which descriptor table is used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Group {
    /// Send queues.
    Sq,
    /// Receive queues. These have no shadow; L2 receive rings use the SRQ group.
    Rq,
    /// Shared receive queues, including L2 receive and aggregation rings.
    Srq,
    /// Completion queues.
    Cq,
}

impl Group {
    /// The groups that keep doorbell shadows, in table order.
    pub const SHADOWED: [Group; 3] = [Group::Sq, Group::Srq, Group::Cq];

    /// Number of 8-byte slots in one block of this group.
    pub const fn block_size(self) -> usize {
        match self {
            Group::Cq => 3,
            Group::Sq | Group::Rq | Group::Srq => 1,
        }
    }

    /// Number of blocks that fit in one application page.
    pub const fn entries_per_page(self) -> usize {
        crate::DOORBELLS_PER_PAGE / self.block_size()
    }

    /// Whether the device expects shadows for this group.
    pub const fn has_shadow(self) -> bool {
        !matches!(self, Group::Rq)
    }
}


/// The kind of hardware ring a queue is built on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingType {
    Tx,
    Rx,
    /// Receive aggregation ring.
    Agg,
    /// Completion ring.
    Cmpl,
    /// Notification queue.
    Nq,
}


/// Classifies a doorbell word by its type field.
///
/// Returns `None` for types that do not need a shadow, e.g., notification queue doorbells.
pub fn group_of(value: DoorbellValue) -> Option<Group> {
    value.db_type().and_then(DoorbellType::group)
}

/// Classifies a ring by its type.
pub fn group_of_ring(ring: RingType) -> Option<Group> {
    match ring {
        RingType::Tx => Some(Group::Sq),
        RingType::Rx | RingType::Agg => Some(Group::Srq),
        RingType::Cmpl => Some(Group::Cq),
        RingType::Nq => None,
    }
}
