//! Kernel handoff, loader side: builds the `InitializationBlock` the kernel
//! entry point receives, maps it and the framebuffer into the new address
//! space, locates the APIC, exits boot services, and jumps to the kernel.
//!
//! Grounded on `old/old_bootloader.rs`'s tail (`stack_setup` /
//! `exit_boot_services` / the final `kn_start(payload)` transmute-and-call)
//! for the overall "build payload, exit boot services, jump" shape. The
//! handoff ABI type itself (`xtoskrnl::handoff::InitializationBlock`) is
//! shared with the kernel crate rather than redefined here.

use raw_cpuid::CpuId;

use xtoskrnl::handoff::{
    EfiFirmwareInformation, FirmwareInformation, FirmwareType, FramebufferInfo, FramebufferProtocol,
    InitializationBlock, LoaderInformation, MemoryMapHandoff, MAX_KERNEL_PARAMETERS,
};
pub use xtoskrnl::handoff::{APIC_BASE_VA, KSEG0_BASE, KSEG0_KERNEL_BASE};
use xtoskrnl::mm::mapping::{LoaderMemoryType, MappingList, MemoryMapping};

use crate::error::{LdrResult, Status};
use crate::pagetable::{PageAllocator, PageMap};

use hal::pte::PteOps;
use hal::registers::{rdmsr, wrmsr};

const PAGE_SIZE: u64 = 0x1000;

const APIC_BASE_MSR: u64 = 0x0000_001B;
const APIC_BASE_ADDR_MASK: u64 = 0xFFFF_F000;

/// Builds the handoff block at a freshly allocated page range, zeroed but
/// not yet filled or mapped.
pub fn allocate_init_block(alloc: &mut impl PageAllocator) -> LdrResult<u64> {
    let pages = InitializationBlock::size_in_pages();
    let first = alloc.allocate_zeroed_page()?;
    // size_in_pages() is typically 1 for this struct; allocate the rest
    // contiguously if it ever grows past one page.
    for _ in 1..pages {
        alloc.allocate_zeroed_page()?;
    }
    unsafe { core::ptr::write_bytes(first as *mut u8, 0, (pages * PAGE_SIZE) as usize) };
    Ok(first)
}

/// Populates an already-allocated, zeroed `InitializationBlock` in place.
///
/// # Safety
/// `block_phys` must point at `InitializationBlock::size_in_pages()` zeroed,
/// writable pages.
pub unsafe fn fill_init_block(
    block_phys: u64,
    framebuffer: Option<FramebufferInfo>,
    efi_runtime_services: Option<core::ptr::NonNull<u8>>,
    kernel_parameters: &str,
    paging_level: u8,
) -> LdrResult<()> {
    let block = &mut *(block_phys as *mut InitializationBlock);
    block.block_size = core::mem::size_of::<InitializationBlock>() as u32;
    block.block_version = xtoskrnl::handoff::INIT_BLOCK_VERSION;
    block.protocol_version = xtoskrnl::handoff::PROTOCOL_VERSION;
    block.paging_level = paging_level;
    block.loader_information = LoaderInformation {
        debug_print: None,
        framebuffer: framebuffer.unwrap_or_else(FramebufferInfo::uninitialized),
    };
    block.firmware_information = FirmwareInformation {
        firmware_type: FirmwareType::Efi,
        efi: Some(EfiFirmwareInformation {
            version: 0,
            runtime_services: efi_runtime_services,
        }),
    };
    block.memory_map = MemoryMapHandoff::empty();

    let bytes = kernel_parameters.as_bytes();
    let len = bytes.len().min(MAX_KERNEL_PARAMETERS);
    block.kernel_parameters[..len].copy_from_slice(&bytes[..len]);
    block.kernel_parameters_len = len;

    Ok(())
}

/// Copies the finished mapping list into freshly allocated pages and points
/// the block's `memory_map` field at them, mapping the pages into the new
/// address space identically (identity, since the kernel reads this array
/// once at startup through the same physical-equals-KSEG0-offset window
/// every other early structure uses).
///
/// # Safety
/// `block_phys` must be the same block passed to `fill_init_block`.
pub unsafe fn publish_mapping_list<P: PteOps>(
    page_map: &PageMap<P>,
    mappings: &mut MappingList,
    block_phys: u64,
    next_virt: &mut u64,
    alloc: &mut impl PageAllocator,
) -> LdrResult<()> {
    let entries: alloc::vec::Vec<MemoryMapping> = mappings.iter().copied().collect();
    let bytes = entries.len() * core::mem::size_of::<MemoryMapping>();
    let pages = ((bytes as u64) + PAGE_SIZE - 1) / PAGE_SIZE;
    let pages = pages.max(1);

    let first_phys = alloc.allocate_zeroed_page()?;
    for _ in 1..pages {
        alloc.allocate_zeroed_page()?;
    }
    let dst = first_phys as *mut MemoryMapping;
    for (i, entry) in entries.iter().enumerate() {
        core::ptr::write(dst.add(i), *entry);
    }

    let virt = *next_virt;
    if mappings.insert(virt, first_phys, pages, LoaderMemoryType::SystemBlock)
        != xtoskrnl::mm::mapping::MapStatus::Success
    {
        return Err(Status::InvalidParameter);
    }
    page_map.map_page(mappings, virt, first_phys, pages, alloc)?;
    *next_virt += pages * PAGE_SIZE;

    let block = &mut *(block_phys as *mut InitializationBlock);
    block.memory_map = MemoryMapHandoff {
        entries: core::ptr::NonNull::new((virt as *mut MemoryMapping).cast()),
        count: entries.len(),
    };
    Ok(())
}

/// Maps the init block at `*next_virt` as `SystemBlock` and bumps the
/// cursor.
pub fn map_init_block<P: PteOps>(
    page_map: &PageMap<P>,
    mappings: &mut MappingList,
    block_phys: u64,
    next_virt: &mut u64,
    alloc: &mut impl PageAllocator,
) -> LdrResult<u64> {
    let pages = InitializationBlock::size_in_pages();
    let virt = *next_virt;
    if mappings.insert(virt, block_phys, pages, LoaderMemoryType::SystemBlock)
        != xtoskrnl::mm::mapping::MapStatus::Success
    {
        return Err(Status::InvalidParameter);
    }
    page_map.map_page(mappings, virt, block_phys, pages, alloc)?;
    *next_virt += pages * PAGE_SIZE;
    Ok(virt)
}

/// Maps the framebuffer (if the firmware supplied one) at `*next_virt` as
/// `FirmwarePermanent` and rewrites the block's stored address to the new
/// virtual one.
pub fn map_framebuffer<P: PteOps>(
    page_map: &PageMap<P>,
    mappings: &mut MappingList,
    block_phys: u64,
    framebuffer_phys: u64,
    buffer_size: u64,
    next_virt: &mut u64,
    alloc: &mut impl PageAllocator,
) -> LdrResult<()> {
    let pages = (buffer_size + PAGE_SIZE - 1) / PAGE_SIZE;
    let virt = *next_virt;
    if mappings.insert(virt, framebuffer_phys, pages, LoaderMemoryType::FirmwarePermanent)
        != xtoskrnl::mm::mapping::MapStatus::Success
    {
        return Err(Status::InvalidParameter);
    }
    page_map.map_page(mappings, virt, framebuffer_phys, pages, alloc)?;
    *next_virt += pages * PAGE_SIZE;

    // SAFETY: block_phys was produced by allocate_init_block and is still
    // identity-accessible before boot services exit.
    unsafe {
        let block = &mut *(block_phys as *mut InitializationBlock);
        block.loader_information.framebuffer.address = virt;
    }
    Ok(())
}

/// Locates the local APIC's physical base via CPUID + MSR 0x1B and maps one
/// page at `APIC_BASE_VA`. Returns `Unsupported` if CPUID reports no APIC.
pub fn map_apic<P: PteOps>(
    page_map: &PageMap<P>,
    mappings: &mut MappingList,
) -> LdrResult<()> {
    let has_apic = CpuId::new()
        .get_feature_info()
        .map(|f| f.has_apic())
        .unwrap_or(false);
    if !has_apic {
        return Err(Status::Unsupported);
    }

    let apic_phys = rdmsr(APIC_BASE_MSR) & APIC_BASE_ADDR_MASK;
    if mappings.insert(APIC_BASE_VA, apic_phys, 1, LoaderMemoryType::FirmwarePermanent)
        != xtoskrnl::mm::mapping::MapStatus::Success
    {
        return Err(Status::InvalidParameter);
    }
    let mut dummy = NoAlloc;
    page_map.map_page(mappings, APIC_BASE_VA, apic_phys, 1, &mut dummy)
}

/// `map_page` never allocates an intermediate table for an already-mapped
/// APIC range in practice, but the trait requires an allocator; this stub
/// only panics if one is genuinely needed, which would indicate the self-map
/// region itself is unmapped -- a boot-fatal condition regardless.
struct NoAlloc;
impl PageAllocator for NoAlloc {
    fn allocate_zeroed_page(&mut self) -> LdrResult<u64> {
        Err(Status::OutOfResources)
    }
}

/// Re-enables the APIC in the MSR if firmware had disabled it, forcing the
/// standard enable bit (bit 11) alongside the existing base (used by
/// `HlInitAcpi`-era firmware quirks in the original ExectOS sources).
pub fn ensure_apic_enabled() {
    const APIC_GLOBAL_ENABLE: u64 = 1 << 11;
    let value = rdmsr(APIC_BASE_MSR);
    if value & APIC_GLOBAL_ENABLE == 0 {
        wrmsr(APIC_BASE_MSR, value | APIC_GLOBAL_ENABLE);
    }
}

/// Loads the new root page-table physical address into the control register,
/// which performs a full TLB flush as a side effect of reloading CR3.
///
/// # Safety
/// `root_phys` must point at a fully populated, self-mapped root table whose
/// mappings include every page the caller executes or reads until the
/// kernel establishes its own mappings.
pub unsafe fn switch_to_new_page_map(root_phys: u64) {
    hal::registers::CR3::set_nflags(root_phys as usize);
}

/// Kernel entry point signature: called once, with the init block's virtual
/// address as the sole argument, and never expected to return.
pub type KernelEntry = extern "sysv64" fn(*const InitializationBlock) -> !;

/// Transmutes `entry_virt` to a callable kernel entry point and calls it.
///
/// # Safety
/// `entry_virt` must be the kernel image's validated entry RVA added to its
/// mapped base, and `block_virt` must be the already-mapped, fully
/// populated `InitializationBlock`'s virtual address.
pub unsafe fn jump_to_kernel(entry_virt: u64, block_virt: u64) -> ! {
    let entry: KernelEntry = core::mem::transmute(entry_virt as usize);
    entry(block_virt as *const InitializationBlock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apic_base_va_is_page_aligned() {
        assert_eq!(APIC_BASE_VA % PAGE_SIZE, 0);
    }
}
