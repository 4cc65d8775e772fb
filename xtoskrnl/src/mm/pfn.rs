//! PFN (Page Frame Number) database initialization.
//!
//! Rather than modelling the self-map as a Rust reference graph, the
//! database is a flat `Vec<Pfn>` indexed by `PfnIndex`, with free pages
//! threaded into per-color singly-linked lists via in-place `flink` fields
//! rather than pointers -- an arena + index design is simplest to get right.
//! Grounded on a preference for flat, arena-backed structures over pointer
//! graphs seen elsewhere in this codebase (`utils::llist::LlistNode` is the
//! one exception, and only for short-lived bootstrap lists) and on
//! `hal::atomic::SListHead` for the lock-free-list idiom the free lists
//! intentionally do NOT use here; PFN database mutation is guarded by a
//! single spinlock, not lock-free.

use alloc::vec::Vec;

use hal::pagemap::PageMapInfo;

use crate::handoff::KSEG0_BASE;
use crate::mm::mapping::{LoaderMemoryType, MappingList};

/// Index into the PFN database arena. `u32::MAX` is the list terminator
/// sentinel (mirrors `hal::pte::LIST_TERMINATOR_SENTINEL` at a narrower width
/// since the arena is addressed by page count, not byte address).
pub type PfnIndex = u32;

pub const PFN_LIST_TERMINATOR: PfnIndex = u32::MAX;

/// Number of page-color buckets the free lists are split across, chosen to
/// match typical L2 cache-indexing aliasing.
pub const COLOR_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLocation {
    Active,
    FreeList,
    ZeroedList,
    BadList,
    StandbyList,
    ModifiedList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAttribute {
    NonCached,
    Cached,
    WriteCombined,
}

/// One entry of the PFN database: the bookkeeping record for a single
/// physical page frame.
#[derive(Debug, Clone, Copy)]
pub struct Pfn {
    /// Link to the next frame in whatever list `page_location` says this
    /// frame belongs to; `PFN_LIST_TERMINATOR` if none.
    pub flink: PfnIndex,
    /// PFN of the page table that maps this frame, or `PFN_LIST_TERMINATOR`
    /// if this frame is not currently mapped by any tracked page table.
    pub pte_frame: PfnIndex,
    /// Virtual address of the PTE that maps this frame, computed via
    /// `PageMapInfo::pte_address` over the frame's KSEG0-relative virtual
    /// address. `0` means "not yet mapped" (e.g. still on a free list).
    pub pte_address: u64,
    pub share_count: u16,
    pub reference_count: u16,
    pub cache_attribute: CacheAttribute,
    pub page_location: PageLocation,
    pub prototype_pte: bool,
    pub rom: bool,
    pub in_page_error: bool,
}

impl Pfn {
    const fn new_bad() -> Self {
        Pfn {
            flink: PFN_LIST_TERMINATOR,
            pte_frame: PFN_LIST_TERMINATOR,
            pte_address: 0,
            share_count: 0,
            reference_count: 0,
            cache_attribute: CacheAttribute::NonCached,
            page_location: PageLocation::BadList,
            prototype_pte: false,
            rom: false,
            in_page_error: false,
        }
    }

    const fn new_free() -> Self {
        Pfn {
            flink: PFN_LIST_TERMINATOR,
            pte_frame: PFN_LIST_TERMINATOR,
            pte_address: 0,
            share_count: 0,
            reference_count: 0,
            cache_attribute: CacheAttribute::Cached,
            page_location: PageLocation::FreeList,
            prototype_pte: false,
            rom: false,
            in_page_error: false,
        }
    }

    const fn new_reserved(location: PageLocation) -> Self {
        Pfn {
            flink: PFN_LIST_TERMINATOR,
            pte_frame: PFN_LIST_TERMINATOR,
            pte_address: 0,
            share_count: 1,
            reference_count: 1,
            cache_attribute: CacheAttribute::Cached,
            page_location: location,
            prototype_pte: false,
            rom: false,
            in_page_error: false,
        }
    }

    /// XIP ROM per the §4.8 rule: tracked as a prototype, read-only mapping
    /// rather than a pinned active page -- it is never written back and
    /// never counted against the working set the way `new_reserved` frames
    /// are.
    const fn new_xip_rom(pte_address: u64) -> Self {
        Pfn {
            flink: PFN_LIST_TERMINATOR,
            pte_frame: PFN_LIST_TERMINATOR,
            pte_address,
            share_count: 0,
            reference_count: 0,
            cache_attribute: CacheAttribute::Cached,
            page_location: PageLocation::Active,
            prototype_pte: true,
            rom: true,
            in_page_error: false,
        }
    }
}

/// The PFN database proper: an arena of `Pfn` records plus the free-list
/// heads that thread through it. Indexed by page frame number, not byte
/// address -- `database[pfn_index]` describes the frame at physical address
/// `pfn_index * PAGE_SIZE`.
pub struct PfnDatabase {
    arena: Vec<Pfn>,
    highest_page: PfnIndex,
    free_list_heads: [PfnIndex; COLOR_COUNT],
    bad_list_head: PfnIndex,
}

const PAGE_SIZE: u64 = 0x1000;

impl PfnDatabase {
    /// Builds the database sized to cover `total_pages` physical frames.
    ///
    /// Allocates the arena sized to cover every page the loader's mapping
    /// list touches, initializes every frame to `BadList` (the safe default
    /// for pages the mapping list never mentions), then walks the mapping
    /// list once in ascending physical-address order calling `process` per
    /// entry. Pages the mapping list never mentions default to `BadList`
    /// and are never handed out.
    pub fn init(mapping_list: &MappingList, total_pages: u64, paging_info: &PageMapInfo) -> Self {
        let highest_page = total_pages as PfnIndex;
        let mut arena = Vec::with_capacity(total_pages as usize);
        arena.resize(total_pages as usize, Pfn::new_bad());

        let mut db = PfnDatabase {
            arena,
            highest_page,
            free_list_heads: [PFN_LIST_TERMINATOR; COLOR_COUNT],
            bad_list_head: PFN_LIST_TERMINATOR,
        };

        for mapping in mapping_list.iter() {
            db.process(mapping.physical_address, mapping.page_count, mapping.memory_type, paging_info);
        }

        db
    }

    fn color_of(pfn: PfnIndex) -> usize {
        (pfn as usize) % COLOR_COUNT
    }

    /// Classifies one contiguous physical range and threads its frames into
    /// the appropriate list.
    ///
    /// - `Free` ranges are pushed onto their color's free list.
    /// - `Bad` ranges are pushed onto the bad list (never handed out).
    /// - `XipRom` gets the distinct §4.8 prototype/read-only treatment
    ///   (`Pfn::new_xip_rom`) rather than a pinned active reference.
    /// - Every other type marks the frames `Active` with a pinned reference,
    ///   since the loader's own code/data/tables must never be reclaimed.
    pub fn process(&mut self, base_phys: u64, n_pages: u64, ty: LoaderMemoryType, paging_info: &PageMapInfo) {
        let start_pfn = (base_phys / PAGE_SIZE) as PfnIndex;
        for i in 0..n_pages as PfnIndex {
            let pfn = start_pfn + i;
            if pfn >= self.highest_page {
                continue;
            }
            let pte_addr = paging_info.pte_address(KSEG0_BASE + (pfn as u64) * PAGE_SIZE);
            match ty {
                LoaderMemoryType::Free => {
                    self.arena[pfn as usize] = Pfn::new_free();
                    self.push_free(pfn);
                }
                LoaderMemoryType::Bad => {
                    self.arena[pfn as usize] = Pfn::new_bad();
                    self.push_bad(pfn);
                }
                LoaderMemoryType::XipRom => {
                    self.arena[pfn as usize] = Pfn::new_xip_rom(pte_addr);
                }
                _ => {
                    let mut entry = Pfn::new_reserved(PageLocation::Active);
                    entry.pte_address = pte_addr;
                    self.arena[pfn as usize] = entry;
                }
            }
        }
    }

    fn push_free(&mut self, pfn: PfnIndex) {
        let color = Self::color_of(pfn);
        self.arena[pfn as usize].flink = self.free_list_heads[color];
        self.free_list_heads[color] = pfn;
    }

    fn push_bad(&mut self, pfn: PfnIndex) {
        self.arena[pfn as usize].flink = self.bad_list_head;
        self.bad_list_head = pfn;
    }

    /// Remove and return one free frame of the requested color, or any color
    /// if that color's list is exhausted. Color affinity is a hint, not a
    /// guarantee.
    pub fn pop_free(&mut self, preferred_color: usize) -> Option<PfnIndex> {
        let preferred_color = preferred_color % COLOR_COUNT;
        if let Some(pfn) = self.pop_free_from(preferred_color) {
            return Some(pfn);
        }
        for color in 0..COLOR_COUNT {
            if color == preferred_color {
                continue;
            }
            if let Some(pfn) = self.pop_free_from(color) {
                return Some(pfn);
            }
        }
        None
    }

    fn pop_free_from(&mut self, color: usize) -> Option<PfnIndex> {
        let head = self.free_list_heads[color];
        if head == PFN_LIST_TERMINATOR {
            return None;
        }
        let next = self.arena[head as usize].flink;
        self.free_list_heads[color] = next;
        self.arena[head as usize].page_location = PageLocation::Active;
        self.arena[head as usize].flink = PFN_LIST_TERMINATOR;
        self.arena[head as usize].reference_count = 1;
        self.arena[head as usize].share_count = 1;
        Some(head)
    }

    pub fn get(&self, pfn: PfnIndex) -> &Pfn {
        &self.arena[pfn as usize]
    }

    pub fn get_mut(&mut self, pfn: PfnIndex) -> &mut Pfn {
        &mut self.arena[pfn as usize]
    }

    pub fn highest_page(&self) -> PfnIndex {
        self.highest_page
    }

    pub fn free_page_count(&self) -> u64 {
        let mut count = 0u64;
        for color in 0..COLOR_COUNT {
            let mut cur = self.free_list_heads[color];
            while cur != PFN_LIST_TERMINATOR {
                count += 1;
                cur = self.arena[cur as usize].flink;
            }
        }
        count
    }

    pub fn bad_page_count(&self) -> u64 {
        let mut count = 0u64;
        let mut cur = self.bad_list_head;
        while cur != PFN_LIST_TERMINATOR {
            count += 1;
            cur = self.arena[cur as usize].flink;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::pagemap::info_for;
    use hal::PagingMode;

    fn list_with(entries: &[(u64, u64, LoaderMemoryType)]) -> MappingList {
        let mut list = MappingList::new();
        for &(phys, n, ty) in entries {
            let virt = if ty.is_free() { 0 } else { 0xFFFF_0000_0000_0000 + phys };
            list.insert(virt, phys, n, ty);
        }
        list
    }

    fn test_paging_info() -> PageMapInfo {
        info_for(PagingMode::LongMode4Level, 0xFFFF_F680_0000_0000)
    }

    #[test]
    fn s3_free_pages_are_reclaimable() {
        let list = list_with(&[(0, 16, LoaderMemoryType::Free)]);
        let mut db = PfnDatabase::init(&list, 16, &test_paging_info());
        assert_eq!(db.free_page_count(), 16);
        assert_eq!(db.bad_page_count(), 0);

        let pfn = db.pop_free(0).expect("expected a free frame");
        assert_eq!(db.get(pfn).page_location, PageLocation::Active);
        assert_eq!(db.free_page_count(), 15);
    }

    #[test]
    fn bad_pages_are_never_handed_out() {
        let list = list_with(&[(0, 4, LoaderMemoryType::Bad), (4, 4, LoaderMemoryType::Free)]);
        let mut db = PfnDatabase::init(&list, 8, &test_paging_info());
        assert_eq!(db.bad_page_count(), 4);
        assert_eq!(db.free_page_count(), 4);

        for _ in 0..4 {
            let pfn = db.pop_free(0).expect("free frame available");
            assert!(pfn >= 4);
        }
        assert!(db.pop_free(0).is_none());
    }

    #[test]
    fn non_free_ranges_are_pinned_active_and_excluded_from_free_lists() {
        let list = list_with(&[
            (0, 4, LoaderMemoryType::SystemCode),
            (4, 12, LoaderMemoryType::Free),
        ]);
        let db = PfnDatabase::init(&list, 16, &test_paging_info());
        for pfn in 0..4 {
            assert_eq!(db.get(pfn).page_location, PageLocation::Active);
            assert_eq!(db.get(pfn).reference_count, 1);
        }
        assert_eq!(db.free_page_count(), 12);
    }

    #[test]
    fn gaps_not_covered_by_the_mapping_list_default_to_bad() {
        let list = list_with(&[(0, 4, LoaderMemoryType::Free)]);
        let db = PfnDatabase::init(&list, 8, &test_paging_info());
        for pfn in 4..8 {
            assert_eq!(db.get(pfn).page_location, PageLocation::BadList);
        }
    }

    #[test]
    fn color_affinity_falls_back_when_exhausted() {
        let list = list_with(&[(0, 1, LoaderMemoryType::Free)]);
        let mut db = PfnDatabase::init(&list, 1, &test_paging_info());
        let pfn = db.pop_free(5).expect("fallback should find the only free frame");
        assert_eq!(pfn, 0);
    }

    #[test]
    fn xip_rom_pages_get_prototype_rom_semantics_and_a_pte_address() {
        let list = list_with(&[(0, 4, LoaderMemoryType::XipRom)]);
        let info = test_paging_info();
        let db = PfnDatabase::init(&list, 4, &info);
        for pfn in 0..4 {
            let entry = db.get(pfn);
            assert_eq!(entry.page_location, PageLocation::Active);
            assert!(entry.prototype_pte);
            assert!(entry.rom);
            assert_eq!(entry.share_count, 0);
            assert_eq!(entry.reference_count, 0);
            assert_eq!(entry.pte_address, info.pte_address(KSEG0_BASE + (pfn as u64) * PAGE_SIZE));
        }
    }
}
