//! Memory-Map Planner: walks the firmware memory map, classifies each
//! descriptor, and calls the mapping list to build the loader's
//! physical->virtual plan.
//!
//! Grounded on `xtldr/memory.cc`'s `BlpMapEfiMemory` (the C++ variant, taken
//! as authoritative over the legacy `memory.c`): skip
//! `EfiReservedMemoryType` outright, identity-map `BootServicesData`-class
//! regions as `FirmwareTemporary`, leave `Free` physical-only, and place
//! everything else at the caller's running virtual cursor. The final forced
//! identity maps (page 0, legacy VRAM/BIOS) mirror the same function's tail.

use hal::PagingMode;

use xtoskrnl::mm::mapping::{LoaderMemoryType, MappingList};

use crate::error::{LdrResult, Status};
use crate::firmware::FirmwareMemoryDescriptor;

const PAGE_SIZE: u64 = 0x1000;

// Standard EFI_MEMORY_TYPE values (UEFI spec table); the loader only needs
// to name the few that drive classification policy, not the whole enum.
const EFI_RESERVED_MEMORY_TYPE: u32 = 0;
const EFI_LOADER_CODE: u32 = 1;
const EFI_LOADER_DATA: u32 = 2;
const EFI_BOOT_SERVICES_DATA: u32 = 4;
const EFI_RUNTIME_SERVICES_CODE: u32 = 5;
const EFI_RUNTIME_SERVICES_DATA: u32 = 6;
const EFI_UNUSABLE_MEMORY: u32 = 8;
const EFI_ACPI_RECLAIM_MEMORY: u32 = 9;
const EFI_ACPI_MEMORY_NVS: u32 = 10;
const EFI_MEMORY_MAPPED_IO: u32 = 11;
const EFI_MEMORY_MAPPED_IO_PORT_SPACE: u32 = 12;
const EFI_PAL_CODE: u32 = 13;

/// Default EFI-type -> loader-type classification.
pub fn classify_efi_type(efi_type: u32) -> LoaderMemoryType {
    match efi_type {
        EFI_ACPI_MEMORY_NVS | EFI_ACPI_RECLAIM_MEMORY | EFI_PAL_CODE | EFI_RESERVED_MEMORY_TYPE => {
            LoaderMemoryType::SpecialMemory
        }
        EFI_RUNTIME_SERVICES_CODE
        | EFI_RUNTIME_SERVICES_DATA
        | EFI_MEMORY_MAPPED_IO
        | EFI_MEMORY_MAPPED_IO_PORT_SPACE => LoaderMemoryType::FirmwarePermanent,
        EFI_BOOT_SERVICES_DATA | EFI_LOADER_CODE | EFI_LOADER_DATA => LoaderMemoryType::FirmwareTemporary,
        EFI_UNUSABLE_MEMORY => LoaderMemoryType::Bad,
        _ => LoaderMemoryType::Free,
    }
}

/// Maximum physical address a given paging mode can address without PAE/long
/// mode extensions: 2-level mode is clipped to <=4GiB, PAE to <=64GiB.
fn max_physical_address(mode: PagingMode) -> u64 {
    match mode {
        PagingMode::Legacy2Level => 0x1_0000_0000,
        PagingMode::Pae3Level => 0x10_0000_0000,
        PagingMode::LongMode4Level | PagingMode::LongMode5Level => u64::MAX,
    }
}

/// Walks `descriptors`, classifying each with `classify` and inserting the
/// resulting mappings into `list`. `next_virt` is the caller's running
/// virtual-address cursor, bumped for every non-Free, non-identity mapping
/// and returned for the caller to continue using for subsequent regions
/// (kernel image, init block, framebuffer).
pub fn map_efi_memory(
    list: &mut MappingList,
    mode: PagingMode,
    descriptors: &[FirmwareMemoryDescriptor],
    mut next_virt: u64,
    classify: impl Fn(u32) -> LoaderMemoryType,
) -> LdrResult<u64> {
    let max_phys = max_physical_address(mode);

    for desc in descriptors {
        if desc.efi_type == EFI_RESERVED_MEMORY_TYPE {
            continue;
        }
        if desc.page_count == 0 {
            continue;
        }
        if desc.physical_start >= max_phys {
            continue;
        }

        let loader_type = classify(desc.efi_type);

        let status = match loader_type {
            LoaderMemoryType::FirmwareTemporary => {
                list.insert(desc.physical_start, desc.physical_start, desc.page_count, loader_type)
            }
            LoaderMemoryType::Free => list.insert(0, desc.physical_start, desc.page_count, loader_type),
            _ => {
                let virt = next_virt;
                next_virt += desc.page_count * PAGE_SIZE;
                list.insert(virt, desc.physical_start, desc.page_count, loader_type)
            }
        };

        if status != xtoskrnl::mm::mapping::MapStatus::Success {
            return Err(Status::InvalidParameter);
        }
    }

    // Unconditional identity maps regardless of what the firmware reported
    // for these ranges: page 0, and legacy VRAM/BIOS.
    force_identity(list, 0x0000_0000, 1)?;
    force_identity(list, 0x000A_0000, 0x60)?;

    Ok(next_virt)
}

fn force_identity(list: &mut MappingList, phys: u64, n_pages: u64) -> LdrResult<()> {
    match list.insert(phys, phys, n_pages, LoaderMemoryType::FirmwarePermanent) {
        xtoskrnl::mm::mapping::MapStatus::Success => Ok(()),
        xtoskrnl::mm::mapping::MapStatus::InvalidParameter => Err(Status::InvalidParameter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(efi_type: u32, phys: u64, n_pages: u64) -> FirmwareMemoryDescriptor {
        FirmwareMemoryDescriptor {
            physical_start: phys,
            virtual_start: 0,
            page_count: n_pages,
            efi_type,
            attribute: 0,
        }
    }

    #[test]
    fn s3_firmware_map_classification() {
        let descriptors = [
            desc(EFI_BOOT_SERVICES_DATA, 0x10_0000, 0x1),
            desc(EFI_ACPI_RECLAIM_MEMORY, 0xBF00_0000, 0x1),
            desc(0x7 /* ConventionalMemory */, 0x20_0000, 0x1),
        ];
        let mut list = MappingList::new();
        let next_virt =
            map_efi_memory(&mut list, PagingMode::LongMode4Level, &descriptors, 0xFFFF_8000_0000_0000, classify_efi_type)
                .unwrap();

        // BootServicesData -> FirmwareTemporary, identity mapped.
        assert_eq!(list.get_virtual(0x10_0000), Some(0x10_0000));
        // ACPIReclaim -> SpecialMemory, mapped at the bumped virtual cursor.
        assert_eq!(list.get_virtual(0xBF00_0000), Some(0xFFFF_8000_0000_0000));
        // ConventionalMemory -> Free, no virtual mapping.
        assert_eq!(list.get_virtual(0x20_0000), None);
        assert_eq!(next_virt, 0xFFFF_8000_0000_0000 + 0x1000);

        // Forced identity maps for page 0 and legacy VRAM/BIOS.
        assert_eq!(list.get_virtual(0), Some(0));
        assert_eq!(list.get_virtual(0xA0000), Some(0xA0000));
    }

    #[test]
    fn reserved_descriptors_are_skipped_entirely() {
        let descriptors = [desc(EFI_RESERVED_MEMORY_TYPE, 0x5000_0000, 4)];
        let mut list = MappingList::new();
        map_efi_memory(&mut list, PagingMode::LongMode4Level, &descriptors, 0xFFFF_8000_0000_0000, classify_efi_type)
            .unwrap();
        assert!(list.iter().all(|m| !m.contains_physical(0x5000_0000)));
    }

    #[test]
    fn clips_addresses_above_four_gib_in_legacy_mode() {
        let descriptors = [desc(0x7, 0x1_0001_0000, 1)];
        let mut list = MappingList::new();
        map_efi_memory(&mut list, PagingMode::Legacy2Level, &descriptors, 0xC000_0000, classify_efi_type).unwrap();
        assert!(list.iter().all(|m| !m.contains_physical(0x1_0001_0000)));
    }
}
