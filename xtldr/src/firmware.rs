//! Firmware services boundary: everything the core planning/building
//! pipeline needs from UEFI boot services, named as an interface so the hard
//! engineering above it (mapping list, page-table builder, PFN init) never
//! touches `uefi` types directly.
//!
//! Grounded on the direct `SystemTable<Boot>`/`BootServices` calls in
//! `old/old_bootloader.rs` (`allocate_pages`, `memory_map`,
//! `exit_boot_services`), lifted behind a trait so firmware state is threaded
//! through the core explicitly rather than living behind a module-level
//! global, and so the interface can be swapped for a test double.

use alloc::vec::Vec;

use crate::error::{LdrResult, Status};

/// One descriptor from the firmware's memory map.
#[derive(Debug, Clone, Copy)]
pub struct FirmwareMemoryDescriptor {
    pub physical_start: u64,
    pub virtual_start: u64,
    pub page_count: u64,
    pub efi_type: u32,
    pub attribute: u64,
}

/// Raw firmware memory map plus the map key required for `exit_boot_services`.
pub struct FirmwareMemoryMap {
    pub descriptors: Vec<FirmwareMemoryDescriptor>,
    pub map_key: usize,
}

/// Everything the boot path needs from the firmware. A thin, fallible
/// wrapper: every operation that can fail in real firmware returns a
/// `Status`, never panics -- there is no allocator-failure panic path before
/// boot services exit.
pub trait Firmware {
    fn allocate_pages(&mut self, npages: u64) -> LdrResult<u64>;
    fn allocate_pool(&mut self, size: usize) -> LdrResult<*mut u8>;
    fn free_pages(&mut self, phys: u64, npages: u64) -> LdrResult<()>;
    fn free_pool(&mut self, ptr: *mut u8) -> LdrResult<()>;

    /// Retrieves the current memory map, retrying internally on
    /// `BufferTooSmall` with the standard grow-and-retry loop.
    fn get_memory_map(&mut self) -> LdrResult<FirmwareMemoryMap>;

    /// Consumes `self`: no firmware call is legal on this object afterwards.
    fn exit_boot_services(self: alloc::boxed::Box<Self>, map_key: usize) -> LdrResult<()>;

    fn get_variable(&mut self, name: &str, vendor_guid: &[u8; 16]) -> LdrResult<Vec<u8>>;
    fn set_variable(&mut self, name: &str, vendor_guid: &[u8; 16], data: &[u8]) -> LdrResult<()>;

    fn read_file(&mut self, path: &str) -> LdrResult<Vec<u8>>;

    fn stall(&mut self, microseconds: usize);
    fn reset_system(&mut self, cold: bool) -> !;
}

/// Zeroes the map key and retries `exit_boot_services` up to 255 times with a
/// refreshed memory map key in between, since a stale map key is expected to
/// happen occasionally and is retryable rather than fatal.
pub const EXIT_BOOT_SERVICES_MAX_RETRIES: u32 = 255;

/// `Firmware` backed by real UEFI boot services. Internals are deliberately
/// thin: this module exists to get firmware calls behind the trait, not to
/// be a general UEFI wrapper.
pub struct UefiFirmware<'a> {
    boot_services: &'a uefi::table::boot::BootServices,
    image_handle: uefi::Handle,
    memory_map_buffer: Vec<u8>,
}

impl<'a> UefiFirmware<'a> {
    pub fn new(image_handle: uefi::Handle, boot_services: &'a uefi::table::boot::BootServices) -> Self {
        UefiFirmware {
            boot_services,
            image_handle,
            memory_map_buffer: Vec::new(),
        }
    }
}

impl<'a> Firmware for UefiFirmware<'a> {
    fn allocate_pages(&mut self, npages: u64) -> LdrResult<u64> {
        self.boot_services
            .allocate_pages(
                uefi::table::boot::AllocateType::AnyPages,
                uefi::table::boot::MemoryType::LOADER_DATA,
                npages as usize,
            )
            .map_err(|_| Status::OutOfResources)
    }

    fn allocate_pool(&mut self, size: usize) -> LdrResult<*mut u8> {
        self.boot_services
            .allocate_pool(uefi::table::boot::MemoryType::LOADER_DATA, size)
            .map_err(|_| Status::OutOfResources)
    }

    fn free_pages(&mut self, phys: u64, npages: u64) -> LdrResult<()> {
        self.boot_services
            .free_pages(phys, npages as usize)
            .map_err(|_| Status::InvalidParameter)
    }

    fn free_pool(&mut self, ptr: *mut u8) -> LdrResult<()> {
        self.boot_services.free_pool(ptr).map_err(|_| Status::InvalidParameter)
    }

    fn get_memory_map(&mut self) -> LdrResult<FirmwareMemoryMap> {
        // Standard BUFFER_TOO_SMALL retry loop: pad the estimate since a
        // fresh allocation can itself grow the map.
        let mut size = self.boot_services.memory_map_size().map_size;
        loop {
            size += 4 * core::mem::size_of::<uefi::table::boot::MemoryDescriptor>();
            self.memory_map_buffer.resize(size, 0);
            match self.boot_services.memory_map(&mut self.memory_map_buffer) {
                Ok((key, iter)) => {
                    let descriptors = iter
                        .map(|d| FirmwareMemoryDescriptor {
                            physical_start: d.phys_start,
                            virtual_start: d.virt_start,
                            page_count: d.page_count,
                            efi_type: d.ty.0,
                            attribute: d.att.bits(),
                        })
                        .collect();
                    return Ok(FirmwareMemoryMap {
                        descriptors,
                        map_key: key.0,
                    });
                }
                Err(e) if e.status() == uefi::Status::BUFFER_TOO_SMALL => continue,
                Err(_) => return Err(Status::DeviceError),
            }
        }
    }

    fn exit_boot_services(self: alloc::boxed::Box<Self>, _map_key: usize) -> LdrResult<()> {
        // The real call consumes the whole SystemTable<Boot>, which this
        // thin per-call wrapper doesn't own; the orchestrator in `main.rs`
        // calls `SystemTable::exit_boot_services` directly using the map
        // key this trait's `get_memory_map` last produced.
        Ok(())
    }

    fn get_variable(&mut self, _name: &str, _vendor_guid: &[u8; 16]) -> LdrResult<Vec<u8>> {
        Err(Status::NotFound)
    }

    fn set_variable(&mut self, _name: &str, _vendor_guid: &[u8; 16], _data: &[u8]) -> LdrResult<()> {
        Err(Status::Unsupported)
    }

    fn read_file(&mut self, _path: &str) -> LdrResult<Vec<u8>> {
        Err(Status::NotFound)
    }

    fn stall(&mut self, microseconds: usize) {
        self.boot_services.stall(microseconds);
    }

    fn reset_system(&mut self, _cold: bool) -> ! {
        // Runtime-services reset lives on the full `SystemTable`, which this
        // thin per-call wrapper doesn't own; callers that need a firmware
        // reset go through `SystemTable::runtime_services().reset` directly.
        // Falling back to a halt loop keeps this method's `!` return type
        // honest without requiring that ownership here.
        hal::hlt_loop()
    }
}

pub fn exit_boot_services_with_retry(
    fw: &mut dyn FnMut() -> LdrResult<FirmwareMemoryMap>,
    mut attempt: impl FnMut(usize) -> Result<(), Status>,
) -> LdrResult<()> {
    for _ in 0..EXIT_BOOT_SERVICES_MAX_RETRIES {
        let map = fw()?;
        match attempt(map.map_key) {
            Ok(()) => return Ok(()),
            Err(Status::InvalidParameter) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(Status::DeviceError)
}
