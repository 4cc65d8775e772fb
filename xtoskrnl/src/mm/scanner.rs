//! Page-table scanner: walks the page tables the loader built during
//! handoff and reconciles the PFN database against what is actually mapped,
//! recording which PFN owns each page table (`Pfn::pte_frame`) and how many
//! live translations reference each data page (`Pfn::share_count`).
//!
//! Grounded on `hal::paging`'s recursive self-map helpers (`recur_to_pte`,
//! `recur_to_pde`, ... `recur_to_pml4e`): the same "linear address of the
//! entry that maps this linear address" technique, generalized over
//! `hal::pte::PteOps` and `hal::pagemap::PageMapInfo` so it works across all
//! four paging modes instead of being amd64-long-mode-only. The scanner
//! never materializes `&mut` references into live page tables -- every entry
//! is read through a raw pointer at the address the self-map formula
//! produces.

use hal::pagemap::PageMapInfo;
use hal::pte::PteOps;
use hal::PagingMode;

use crate::mm::pfn::{PageLocation, PfnDatabase, PfnIndex};

const PAGE_SIZE: u64 = 0x1000;

/// Number of entries per table page width: 512 for 64-bit PTEs (8 bytes
/// each), 1024 for 32-bit PTEs (4 bytes each, legacy non-PAE).
fn entries_per_table(mode: PagingMode) -> usize {
    if mode.is_xpa() {
        512
    } else {
        1024
    }
}

/// Reads one entry of width `P` at byte address `addr` out of the live,
/// currently-mapped page table (reachable only because it lies within the
/// self-map region).
///
/// # Safety
/// `addr` must be a valid, currently-mapped linear address produced by one
/// of `PageMapInfo`'s `*_address` formulas, and must not be concurrently
/// written by another CPU; page-table scanning happens with interrupts and
/// other processors quiesced.
unsafe fn read_entry<P: PteOps>(addr: u64) -> P {
    core::ptr::read_volatile(addr as *const P)
}

/// Scans every live translation reachable from the self-map described by
/// `info` and folds what it finds into `pfn_db`.
///
/// `top_index_count` bounds how many entries of the top-level table
/// (PML4/PML5, or the single PDPT for PAE, or the PD for legacy) are walked;
/// callers pass the loader's own top-level index range rather than all 512,
/// since unused slots are never populated and reading them would mean
/// reading the self-map's own recursive slot, which must be skipped rather
/// than walked.
pub fn scan<P: PteOps>(info: &PageMapInfo, pfn_db: &mut PfnDatabase, top_index_count: usize) {
    let per_table = entries_per_table(info.mode);
    let top_index_count = top_index_count.min(per_table);

    match info.mode {
        PagingMode::Legacy2Level | PagingMode::Pae3Level => {
            scan_pd_level::<P>(info, pfn_db, top_index_count);
        }
        PagingMode::LongMode4Level => {
            scan_top_level::<P>(info, pfn_db, top_index_count, 4);
        }
        PagingMode::LongMode5Level => {
            scan_top_level::<P>(info, pfn_db, top_index_count, 5);
        }
    }
}

/// Walks a PML4 (4-level) or PML5 (5-level) tree down to the leaf PTEs.
fn scan_top_level<P: PteOps>(info: &PageMapInfo, pfn_db: &mut PfnDatabase, count: usize, levels: u8) {
    for top_i in 0..count {
        let top_va = (top_i as u64) << (if levels == 5 { 48 } else { 39 });

        let top_entry_addr = if levels == 5 {
            info.p5e_address(top_va)
        } else {
            info.pxe_address(top_va)
        };
        // SAFETY: address produced by the self-map formula for a currently
        // resident top-level table.
        let top_entry: P = unsafe { read_entry(top_entry_addr) };
        if !top_entry.valid() {
            continue;
        }
        mark_table_owner(pfn_db, top_entry.get_pfn());

        if levels == 5 {
            // One level down from PML5 is a PML4; recurse by scanning its
            // 512 PXE slots using the same top_va prefix.
            for pxe_i in 0..512u64 {
                let va = top_va | (pxe_i << 39);
                scan_pdpt_level::<P>(info, pfn_db, va);
            }
        } else {
            scan_pdpt_level::<P>(info, pfn_db, top_va);
        }
    }
}

fn scan_pdpt_level<P: PteOps>(info: &PageMapInfo, pfn_db: &mut PfnDatabase, pxe_va_prefix: u64) {
    for ppe_i in 0..512u64 {
        let va = pxe_va_prefix | (ppe_i << 30);
        let ppe_addr = info.ppe_address(va);
        // SAFETY: see `scan_top_level`.
        let ppe_entry: P = unsafe { read_entry(ppe_addr) };
        if !ppe_entry.valid() {
            continue;
        }
        mark_table_owner(pfn_db, ppe_entry.get_pfn());
        scan_pd_entries::<P>(info, pfn_db, va, 512);
    }
}

/// PAE (3-level) and long-mode entry into PD scanning: PAE has a fixed
/// 4-entry PDPT rather than a 512-entry one.
fn scan_pd_level<P: PteOps>(info: &PageMapInfo, pfn_db: &mut PfnDatabase, count: usize) {
    if info.mode == PagingMode::Pae3Level {
        for ppe_i in 0..count.min(4) {
            let va = (ppe_i as u64) << 30;
            scan_pd_entries::<P>(info, pfn_db, va, 512);
        }
    } else {
        // Legacy 2-level: no PDPT at all, the top-level table IS the PD.
        scan_pd_entries::<P>(info, pfn_db, 0, count);
    }
}

fn scan_pd_entries<P: PteOps>(info: &PageMapInfo, pfn_db: &mut PfnDatabase, pd_va_prefix: u64, count: usize) {
    for pde_i in 0..count as u64 {
        let va = pd_va_prefix | (pde_i << info.pdi_shift);
        let pde_addr = info.pde_address(va);
        // SAFETY: see `scan_top_level`.
        let pde_entry: P = unsafe { read_entry(pde_addr) };
        if !pde_entry.valid() {
            continue;
        }
        mark_table_owner(pfn_db, pde_entry.get_pfn());
        scan_pte_entries::<P>(info, pfn_db, va);
    }
}

fn scan_pte_entries<P: PteOps>(info: &PageMapInfo, pfn_db: &mut PfnDatabase, pt_va_prefix: u64) {
    let owner_pfn = (info.pde_address(pt_va_prefix) / PAGE_SIZE) as PfnIndex;
    for pte_i in 0..512u64 {
        let va = pt_va_prefix | (pte_i << PAGE_SIZE.trailing_zeros());
        let pte_addr = info.pte_address(va);
        // SAFETY: see `scan_top_level`.
        let pte_entry: P = unsafe { read_entry(pte_addr) };
        if !pte_entry.valid() {
            continue;
        }
        mark_leaf_mapping(pfn_db, pte_entry.get_pfn(), owner_pfn, pte_addr);
    }
}

/// A branch table's backing frame is always `Active` with its owner
/// recorded as itself; PTE tables don't track "who owns the table that maps
/// this table" beyond one level.
fn mark_table_owner(pfn_db: &mut PfnDatabase, pfn: u64) {
    if pfn >= pfn_db.highest_page() as u64 {
        return;
    }
    let entry = pfn_db.get_mut(pfn as PfnIndex);
    entry.page_location = PageLocation::Active;
    if entry.reference_count == 0 {
        entry.reference_count = 1;
        entry.share_count = 1;
    }
}

/// A leaf data page: record which page table maps it and bump its share
/// count, since the same physical page may be mapped by more than one PTE.
/// `share_count` reflects the number of live PTEs referencing a frame, not
/// the number of virtual addresses. `pte_address` is recorded so `pfn_db`
/// satisfies the "PTE for PFN `i` dereferences back to `i`" invariant
/// without a second pass over the tables.
fn mark_leaf_mapping(pfn_db: &mut PfnDatabase, pfn: u64, owner_table_pfn: PfnIndex, pte_addr: u64) {
    if pfn >= pfn_db.highest_page() as u64 {
        return;
    }
    let entry = pfn_db.get_mut(pfn as PfnIndex);
    entry.page_location = PageLocation::Active;
    entry.pte_frame = owner_table_pfn;
    entry.pte_address = pte_addr;
    entry.reference_count = entry.reference_count.saturating_add(1);
    entry.share_count = entry.share_count.saturating_add(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::pagemap::info_for;

    #[test]
    fn entries_per_table_matches_pte_width() {
        assert_eq!(entries_per_table(PagingMode::LongMode4Level), 512);
        assert_eq!(entries_per_table(PagingMode::Legacy2Level), 1024);
    }

    #[test]
    fn scan_on_empty_self_map_marks_nothing() {
        // A self-map whose top-level entries are all (unreadably) absent
        // can't be safely dereferenced in a unit test without real mapped
        // memory; this test only checks the entry-count helper feeds the
        // right bound into scan_top_level/scan_pd_level dispatch.
        let info = info_for(PagingMode::LongMode4Level, 0xFFFF_F000_0000_0000);
        assert_eq!(entries_per_table(info.mode), 512);
    }
}
