//! Human-readable listings of a descriptor table and of a group's application pages,
//! for debugging doorbell recovery.

use core::{cmp::Ordering, fmt::{self, Write}};
use crate::{
    app_pages::{ApplicationPageManager, DOORBELLS_PER_PAGE},
    descriptor::{DescriptorFlags, KernelDescriptor},
    kdt::{KernelDescriptorTable, SLOTS_PER_KDT_PAGE},
};

/// Writes the table's bookkeeping followed by every non-empty descriptor, page by page.
pub fn dump_kdt<W: Write>(kdt: &KernelDescriptorTable, out: &mut W) -> fmt::Result {
    let stats = kdt.stats();
    writeln!(out, "KDT {:?}: head {:#X}, {} pages, first_avail {}, first_empty {}, last_entry {:?}, slot_avail {}",
        kdt.group(), kdt.head_bus_addr(), stats.num_pages,
        stats.first_avail, stats.first_empty, stats.last_entry, stats.slot_avail
    )?;

    let mut result = Ok(());
    kdt.visit_pages(|page, bus, descs| {
        if result.is_err() {
            return;
        }
        result = dump_kdt_page(out, page, bus.value(), descs);
    });
    result
}

fn dump_kdt_page<W: Write>(out: &mut W, page: usize, bus: u64, descs: &[KernelDescriptor]) -> fmt::Result {
    writeln!(out, "  page {} @ {:#X}", page, bus)?;
    for (i, desc) in descs.iter().enumerate().filter(|(_, d)| !d.is_empty()) {
        if i < SLOTS_PER_KDT_PAGE {
            write!(out, "    [{:3}] flat {:6}", i, page * SLOTS_PER_KDT_PAGE + i)?;
        } else {
            write!(out, "    [link]            ")?;
        }
        writeln!(out, " flags {:#010X} ({}) pi {} -> {:#X}",
            desc.raw_flags(), FlagNames(desc.flags()), desc.page_index(), desc.memptr()
        )?;
    }
    Ok(())
}

/// Writes every application page of the group with its shadow words up to its terminator.
///
/// The terminator is located from the cursor rather than by value, because a live SQ shadow
/// can hold the same word as [`DOORBELL_LAST`](crate::DOORBELL_LAST).
pub fn dump_app_pages<W: Write>(apm: &ApplicationPageManager, out: &mut W) -> fmt::Result {
    let (next_page, next_entry) = apm.cursor();
    let block_size = apm.group().block_size();
    writeln!(out, "APM {:?}: {} of {} pages, cursor page {} entry {}",
        apm.group(), apm.num_pages(), apm.max_pages(), next_page, next_entry
    )?;
    for page in 0..apm.num_pages() {
        let bus = apm.page_bus_addr(page).unwrap_or_default();
        match apm.page_kdt_index(page) {
            Some(index) => writeln!(out, "  page {} @ {:#X}, KDT slot {}", page, bus, index)?,
            None => writeln!(out, "  page {} @ {:#X}", page, bus)?,
        }
        let terminator = match page.cmp(&next_page) {
            Ordering::Less => None,
            Ordering::Equal => Some(next_entry * block_size),
            Ordering::Greater => Some(0),
        };
        for slot in 0..DOORBELLS_PER_PAGE {
            if Some(slot) == terminator {
                writeln!(out, "    [{:3}] LAST", slot)?;
                break;
            }
            let value = match apm.read_slot(page, slot) {
                Some(v) => v,
                None => break,
            };
            if value.value() != 0 {
                writeln!(out, "    [{:3}] {:#018X} {:?}", slot, value.value(), value)?;
            }
        }
    }
    Ok(())
}

/// Displays descriptor flags as `VALID|LAST|...`.
struct FlagNames(DescriptorFlags);

impl fmt::Display for FlagNames {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = [
            (DescriptorFlags::VALID, "VALID"),
            (DescriptorFlags::LAST, "LAST"),
            (DescriptorFlags::LINKED, "LINKED"),
            (DescriptorFlags::DB_FORMAT_B64, "B64"),
        ];
        let mut first = true;
        for (flag, name) in names.iter() {
            if self.0.contains(*flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("-")?;
        }
        Ok(())
    }
}
