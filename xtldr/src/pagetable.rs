//! Page-table builder and recursive self-map.
//!
//! Generic over the `PteOps` backend (`hal::pte::Basic`/`Xpa`) -- a trait
//! parameter rather than a runtime branch, so the compiler specializes both
//! variants -- and over `PagingMode` for the level count and index shifts
//! (`hal::pagemap::info_for`).
//!
//! Grounded on `xtldr/memory.cc`'s `BlpBuildPageMap`/`BlpGetNextPageTable`/
//! `BlpMapPage` (self-map installed once, then every mapping-list entry with
//! a non-zero virtual address walked down to its leaf PTE, allocating
//! intermediate tables on demand).

use core::marker::PhantomData;

use hal::pagemap::{PageMapInfo, PDI_LEGACY_SHIFT, PDI_XPA_SHIFT, PPI_SHIFT, PXI_SHIFT, P5I_SHIFT};
use hal::pte::PteOps;
use hal::PagingMode;

use xtoskrnl::mm::mapping::{LoaderMemoryType, MappingList, MemoryMapping};

use crate::error::{LdrResult, Status};

const PAGE_SIZE: u64 = 0x1000;

/// One (shift, index-mask) pair per paging level, ordered top (closest to
/// root) to bottom (leaf PTE), decomposing a virtual address into its
/// per-level indices using architecture-specific shifts.
fn level_shifts(mode: PagingMode) -> &'static [(u32, u64)] {
    match mode {
        PagingMode::Legacy2Level => &[(PDI_LEGACY_SHIFT, 0x3FF), (12, 0x3FF)],
        // Top level is a 4-entry PDPT: only 2 index bits.
        PagingMode::Pae3Level => &[(PPI_SHIFT, 0x3), (PDI_XPA_SHIFT, 0x1FF), (12, 0x1FF)],
        PagingMode::LongMode4Level => &[
            (PXI_SHIFT, 0x1FF),
            (PPI_SHIFT, 0x1FF),
            (PDI_XPA_SHIFT, 0x1FF),
            (12, 0x1FF),
        ],
        PagingMode::LongMode5Level => &[
            (P5I_SHIFT, 0x1FF),
            (PXI_SHIFT, 0x1FF),
            (PPI_SHIFT, 0x1FF),
            (PDI_XPA_SHIFT, 0x1FF),
            (12, 0x1FF),
        ],
    }
}

/// Allocates and zeroes one physical page. Boot-time physical memory below
/// 4 GiB is identity-accessible through the firmware's own page tables, so
/// the zeroing write goes straight through the physical address -- page
/// tables here are raw memory indexed through physical frames, never a Rust
/// reference.
pub trait PageAllocator {
    fn allocate_zeroed_page(&mut self) -> LdrResult<u64>;
}

/// The materialized hardware page map, generic over its PTE backend.
pub struct PageMap<P: PteOps> {
    pub mode: PagingMode,
    pub info: PageMapInfo,
    pub root_phys: u64,
    /// Only populated for `Pae3Level`: the 4 page-directory pages the root
    /// PDPT's entries point to, one per PDPT entry.
    pub pae_pd_phys: [u64; 4],
    _backend: PhantomData<P>,
}

fn zero_page(phys: u64) {
    unsafe { core::ptr::write_bytes(phys as *mut u8, 0, PAGE_SIZE as usize) };
}

fn entry_ptr<P: PteOps>(table_phys: u64, index: u64) -> *mut P {
    (table_phys + index * core::mem::size_of::<P>() as u64) as *mut P
}

impl<P: PteOps> PageMap<P> {
    /// Allocates the root (and, on PAE, the 4 page-directory pages), then
    /// installs the self-map.
    pub fn build(
        mode: PagingMode,
        self_map_va: u64,
        alloc: &mut impl PageAllocator,
    ) -> LdrResult<Self> {
        let root_phys = alloc.allocate_zeroed_page()?;
        zero_page(root_phys);

        let mut pae_pd_phys = [0u64; 4];
        if mode == PagingMode::Pae3Level {
            for slot in pae_pd_phys.iter_mut() {
                let pd = alloc.allocate_zeroed_page()?;
                zero_page(pd);
                *slot = pd;
            }
            for (i, pd) in pae_pd_phys.iter().enumerate() {
                // PDPT entries are Valid-only, no writable bit.
                let mut pte = P::zero();
                pte.set(*pd >> 12, 0);
                unsafe { entry_ptr::<P>(root_phys, i as u64).write(pte) };
            }
        }

        let info = hal::pagemap::info_for(mode, self_map_va);
        let mut page_map = PageMap {
            mode,
            info,
            root_phys,
            pae_pd_phys,
            _backend: PhantomData,
        };
        page_map.self_map_pml(self_map_va)?;
        Ok(page_map)
    }

    /// Installs the recursive self-map: a PTE at `self_map_va`'s own
    /// top-level index whose target is the root table itself.
    fn self_map_pml(&mut self, self_map_va: u64) -> LdrResult<()> {
        match self.mode {
            PagingMode::LongMode4Level | PagingMode::LongMode5Level => {
                let shift = if self.mode == PagingMode::LongMode5Level { P5I_SHIFT } else { PXI_SHIFT };
                let index = (self_map_va >> shift) & 0x1FF;
                let mut pte = P::zero();
                pte.set(self.root_phys >> 12, P::WRITABLE_BIT);
                unsafe { entry_ptr::<P>(self.root_phys, index).write(pte) };
                Ok(())
            }
            PagingMode::Pae3Level => {
                // Self-map index picks which PD (of the 4) holds the
                // self-referencing entries; write all 4 PDPT-indexed PD
                // slots so every PD-region page is reachable through the
                // self-map. The PDI shift used here matches PAE's own
                // layout, not long-mode's.
                let pd_index = (self_map_va >> PDI_XPA_SHIFT) & 0x1FF;
                for (i, pd) in self.pae_pd_phys.iter().enumerate() {
                    let mut pte = P::zero();
                    pte.set(self.pae_pd_phys[i] >> 12, P::WRITABLE_BIT);
                    unsafe { entry_ptr::<P>(*pd, pd_index).write(pte) };
                }
                Ok(())
            }
            PagingMode::Legacy2Level => {
                let index = (self_map_va >> PDI_LEGACY_SHIFT) & 0x3FF;
                let mut pte = P::zero();
                pte.set(self.root_phys >> 12, P::WRITABLE_BIT);
                unsafe { entry_ptr::<P>(self.root_phys, index).write(pte) };
                Ok(())
            }
        }
    }

    /// Returns the physical address of the next-level table, allocating and
    /// wiring a fresh one if the entry isn't valid yet.
    fn get_next_page_table(
        &self,
        mappings: &mut MappingList,
        current_phys: u64,
        index: u64,
        alloc: &mut impl PageAllocator,
    ) -> LdrResult<u64> {
        let ptr = entry_ptr::<P>(current_phys, index);
        let existing = unsafe { ptr.read() };
        if existing.valid() {
            return Ok(existing.get_pfn() << 12);
        }

        let new_page = alloc.allocate_zeroed_page()?;
        zero_page(new_page);
        mappings.insert(0, new_page, 1, LoaderMemoryType::MemoryData);

        let mut pte = P::zero();
        pte.set(new_page >> 12, P::WRITABLE_BIT);
        unsafe { ptr.write(pte) };
        Ok(new_page)
    }

    /// Walks/allocates down to the leaf PTE for each of the `npages`
    /// consecutive pages and writes `Valid=1, Writable=1`.
    pub fn map_page(
        &self,
        mappings: &mut MappingList,
        mut virt: u64,
        mut phys: u64,
        npages: u64,
        alloc: &mut impl PageAllocator,
    ) -> LdrResult<()> {
        let levels = level_shifts(self.mode);

        for _ in 0..npages {
            let mut table_phys = if self.mode == PagingMode::Pae3Level {
                // Top-level PDPT lookup is a direct index into the root;
                // descend into the matching PD page next.
                let (shift, mask) = levels[0];
                let pdpt_index = (virt >> shift) & mask;
                self.pae_pd_phys[pdpt_index as usize]
            } else {
                self.root_phys
            };

            let start = if self.mode == PagingMode::Pae3Level { 1 } else { 0 };
            for &(shift, mask) in &levels[start..levels.len() - 1] {
                let index = (virt >> shift) & mask;
                table_phys = self.get_next_page_table(mappings, table_phys, index, alloc)?;
            }

            let (leaf_shift, leaf_mask) = levels[levels.len() - 1];
            let leaf_index = (virt >> leaf_shift) & leaf_mask;
            let mut pte = P::zero();
            pte.set(phys >> 12, P::WRITABLE_BIT);
            unsafe { entry_ptr::<P>(table_phys, leaf_index).write(pte) };

            virt += PAGE_SIZE;
            phys += PAGE_SIZE;
        }

        Ok(())
    }

    /// Maps every entry in `mappings` with a non-zero virtual address, plus
    /// the fixed identity ranges that accompany every page map: the
    /// trampoline page, each loaded module's code range, and the loader's
    /// own image.
    pub fn map_fixed_regions(
        &self,
        mappings: &mut MappingList,
        trampoline_phys: u64,
        loader_image: Option<(u64, u64)>,
        alloc: &mut impl PageAllocator,
    ) -> LdrResult<()> {
        self.map_page(mappings, trampoline_phys, trampoline_phys, 1, alloc)?;

        let (loader_base, loader_size) = loader_image.ok_or(Status::NotFound)?;
        let loader_pages = (loader_size + PAGE_SIZE - 1) / PAGE_SIZE;
        self.map_page(mappings, loader_base, loader_base, loader_pages, alloc)?;

        let entries: alloc::vec::Vec<MemoryMapping> = mappings.iter().copied().collect();
        for m in entries {
            if m.virtual_address != 0 {
                self.map_page(mappings, m.virtual_address, m.physical_address, m.page_count, alloc)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use hal::pte::Xpa;

    /// Leaks page-aligned buffers for the lifetime of the test; identity
    /// since tests run with host addressing, not real physical memory.
    struct TestAllocator {
        pages: Vec<alloc::boxed::Box<[u8; 4096]>>,
    }

    impl TestAllocator {
        fn new() -> Self {
            TestAllocator { pages: Vec::new() }
        }
    }

    impl PageAllocator for TestAllocator {
        fn allocate_zeroed_page(&mut self) -> LdrResult<u64> {
            let boxed = alloc::boxed::Box::new([0u8; 4096]);
            let addr = boxed.as_ptr() as u64;
            self.pages.push(boxed);
            Ok(addr)
        }
    }

    #[test]
    fn s4_self_map_resolves_root_through_formula() {
        let mut alloc = TestAllocator::new();
        let self_map_va = 0xFFFF_F680_0000_0000u64;
        let page_map = PageMap::<Xpa>::build(PagingMode::LongMode4Level, self_map_va, &mut alloc).unwrap();

        let index = (self_map_va >> PXI_SHIFT) & 0x1FF;
        let pte: Xpa = unsafe { entry_ptr::<Xpa>(page_map.root_phys, index).read() };
        assert!(pte.valid());
        assert_eq!(pte.get_pfn(), page_map.root_phys >> 12);
    }

    #[test]
    fn map_page_round_trips_through_live_tables() {
        let mut alloc = TestAllocator::new();
        let self_map_va = 0xFFFF_F680_0000_0000u64;
        let page_map = PageMap::<Xpa>::build(PagingMode::LongMode4Level, self_map_va, &mut alloc).unwrap();
        let mut mappings = MappingList::new();

        let phys = alloc.allocate_zeroed_page().unwrap();
        page_map.map_page(&mut mappings, 0xFFFF_8000_0010_0000, phys, 1, &mut alloc).unwrap();

        // Walk down manually and confirm the leaf PTE is valid with the
        // right PFN, exercised directly rather than through the inverse
        // self-map formula since this test owns the host-addressed page
        // tables, not a self-mapped linear range.
        let pml4_index = (0xFFFF_8000_0010_0000u64 >> PXI_SHIFT) & 0x1FF;
        let pdpt_phys = unsafe { entry_ptr::<Xpa>(page_map.root_phys, pml4_index).read() }.get_pfn() << 12;
        let pd_index = (0xFFFF_8000_0010_0000u64 >> PPI_SHIFT) & 0x1FF;
        let pd_phys = unsafe { entry_ptr::<Xpa>(pdpt_phys, pd_index).read() }.get_pfn() << 12;
        let pt_index = (0xFFFF_8000_0010_0000u64 >> PDI_XPA_SHIFT) & 0x1FF;
        let pt_phys = unsafe { entry_ptr::<Xpa>(pd_phys, pt_index).read() }.get_pfn() << 12;
        let pte_index = (0xFFFF_8000_0010_0000u64 >> 12) & 0x1FF;
        let leaf: Xpa = unsafe { entry_ptr::<Xpa>(pt_phys, pte_index).read() };

        assert!(leaf.valid());
        assert_eq!(leaf.get_pfn(), phys >> 12);
    }
}
