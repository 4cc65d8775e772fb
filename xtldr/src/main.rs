//! `xtldr`: the ExectOS UEFI boot loader. Walks the firmware memory map,
//! plans the kernel's address space, builds its page tables, loads and maps
//! the kernel image, fills the handoff block, exits boot services, and jumps
//! to the kernel entry point.
//!
//! Grounded on `old/old_bootloader.rs`'s `efi_main` for the overall shape
//! (configure framebuffer first so earlier log output survives, read the
//! kernel file, build/map, exit boot services as late as possible, jump) --
//! modernized from that file's `Completion`/`.expect_success()` calling
//! convention to `uefi` 0.14's `Result`-returning one, matching the rest of
//! this crate's `LdrResult` idiom.

#![no_std]
#![no_main]
#![feature(abi_efiapi)]

extern crate alloc;

mod acpi;
mod config;
mod console;
mod error;
mod firmware;
mod handoff;
mod pagetable;
mod peloader;
mod planner;

use alloc::string::String;
use alloc::vec::Vec;

use log::{info, warn};
use raw_cpuid::CpuId;
use uefi::prelude::*;
use uefi::proto::console::gop::{GraphicsOutput, PixelFormat as GopPixelFormat};
use uefi::proto::media::file::{File, FileAttribute, FileInfo, FileMode, FileType};
use uefi::proto::loaded_image::LoadedImage;
use uefi::table::boot::{AllocateType, MemoryDescriptor, MemoryType};
use uefi::table::cfg::{ACPI2_GUID, ACPI_GUID};

use hal::pte::Xpa;
use hal::PagingMode;

use error::Status as LdrStatus;
use firmware::{Firmware, UefiFirmware};
use handoff::{APIC_BASE_VA, KSEG0_BASE, KSEG0_KERNEL_BASE};
use pagetable::{PageAllocator, PageMap};
use xtoskrnl::handoff::{FramebufferInfo, FramebufferProtocol, PixelFormat, SELF_MAP_BASE_VA};
use xtoskrnl::mm::mapping::{LoaderMemoryType, MappingList};

const PAGE_SIZE: u64 = 0x1000;
const KERNEL_PATH: &str = "\\EXECTOS\\XTOSKRNL.EXE";
const CONFIG_PATH: &str = "\\EXECTOS\\XTLDR.INI";

/// Adapts the firmware's page allocator to `pagetable::PageAllocator`, the
/// narrow interface the page-table builder needs.
struct FirmwarePageAllocator<'a> {
    boot_services: &'a uefi::table::boot::BootServices,
}

impl<'a> PageAllocator for FirmwarePageAllocator<'a> {
    fn allocate_zeroed_page(&mut self) -> error::LdrResult<u64> {
        let phys = self
            .boot_services
            .allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, 1)
            .map_err(|_| LdrStatus::OutOfResources)?;
        unsafe { core::ptr::write_bytes(phys as *mut u8, 0, PAGE_SIZE as usize) };
        Ok(phys)
    }
}

/// Picks the widest paging mode this CPU supports: 5-level (LA57) if CPUID
/// leaf 7 advertises it, otherwise the universally-available 4-level mode.
/// Both are the same `Xpa` PTE backend -- only the level count, which
/// `PageMapInfo`/`PageMap` already treat as runtime data, differs.
fn select_paging_mode() -> PagingMode {
    let has_la57 = CpuId::new()
        .get_extended_feature_info()
        .map(|f| f.has_la57())
        .unwrap_or(false);
    if has_la57 {
        PagingMode::LongMode5Level
    } else {
        PagingMode::LongMode4Level
    }
}

#[no_mangle]
pub extern "efiapi" fn efi_main(image: Handle, mut st: SystemTable<Boot>) -> Status {
    if uefi_services::init(&mut st).is_err() {
        return Status::DEVICE_ERROR;
    }
    let _ = st.stdout().reset(false);

    let framebuffer = configure_framebuffer(&mut st);
    info!("framebuffer configured");

    let rev = st.uefi_revision();
    if rev.major() < 2 {
        warn!("running on an untested pre-2.0 UEFI revision");
    }

    let cli_options = read_load_options(&image, &st);
    let cli_pairs = config::parse_cli_options(&cli_options);

    let config_text = match read_whole_file(&image, &st, CONFIG_PATH) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            warn!("XTLDR.INI not found, falling back to defaults");
            String::new()
        }
    };
    let (mut loader_config, _boot_entries) = match config::parse_ini(&config_text) {
        Ok(sections) => config::extract_loader_section(sections),
        Err(_) => (config::LoaderConfig::default(), Vec::new()),
    };
    config::apply_cli_overrides(&mut loader_config, &cli_pairs);

    let debug_target = loader_config
        .debug
        .as_deref()
        .map(console::parse_debug_option)
        .transpose()
        .unwrap_or(Ok(console::DebugTarget::None))
        .unwrap_or(console::DebugTarget::None);
    let _serial = console::init_serial(debug_target);

    let rsdp = locate_rsdp(&st);
    if let Some(rsdp_ptr) = rsdp {
        match unsafe { acpi::locate_root_table(rsdp_ptr) } {
            Ok(loc) => info!("ACPI root table located ({})", if loc.is_xsdt { "XSDT" } else { "RSDT" }),
            Err(_) => warn!("ACPI root table checksum failed"),
        }
    } else {
        warn!("no ACPI configuration table entry found");
    }

    let mode = select_paging_mode();

    let kernel_bytes = match read_whole_file(&image, &st, KERNEL_PATH) {
        Ok(bytes) => bytes,
        Err(_) => return Status::NOT_FOUND,
    };
    let loaded = match peloader::load_image(&kernel_bytes) {
        Ok(loaded) => loaded,
        Err(_) => return Status::LOAD_ERROR,
    };

    let boot_services = st.boot_services();

    let kernel_pages = (loaded.image_size as u64 + PAGE_SIZE - 1) / PAGE_SIZE;
    let kernel_phys = match boot_services.allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, kernel_pages as usize)
    {
        Ok(p) => p,
        Err(_) => return Status::OUT_OF_RESOURCES,
    };
    unsafe {
        core::ptr::copy_nonoverlapping(loaded.image.as_ptr(), kernel_phys as *mut u8, loaded.image.len());
    }

    let (loader_base, loader_size) = match loaded_image_bounds(&image, boot_services) {
        Ok(v) => v,
        Err(_) => return Status::LOAD_ERROR,
    };

    let mut mappings = MappingList::new();
    let kernel_region_top = KSEG0_BASE + KSEG0_KERNEL_BASE + kernel_pages * PAGE_SIZE;

    let descriptors = match fetch_memory_map(&image, boot_services) {
        Ok(d) => d,
        Err(_) => return Status::DEVICE_ERROR,
    };

    let mut next_virt = match planner::map_efi_memory(&mut mappings, mode, &descriptors, kernel_region_top, planner::classify_efi_type)
    {
        Ok(v) => v,
        Err(_) => return Status::DEVICE_ERROR,
    };

    let kernel_virt = KSEG0_BASE + KSEG0_KERNEL_BASE;
    if mappings.insert(kernel_virt, kernel_phys, kernel_pages, LoaderMemoryType::SystemCode) != xtoskrnl::mm::mapping::MapStatus::Success
    {
        return Status::DEVICE_ERROR;
    }

    let mut alloc = FirmwarePageAllocator { boot_services };

    let page_map = match PageMap::<Xpa>::build(mode, SELF_MAP_BASE_VA, &mut alloc) {
        Ok(pm) => pm,
        Err(_) => return Status::OUT_OF_RESOURCES,
    };

    if page_map
        .map_fixed_regions(&mut mappings, loader_base, Some((loader_base, loader_size)), &mut alloc)
        .is_err()
    {
        return Status::DEVICE_ERROR;
    }

    let block_phys = match handoff::allocate_init_block(&mut alloc) {
        Ok(p) => p,
        Err(_) => return Status::OUT_OF_RESOURCES,
    };

    let efi_runtime_services = core::ptr::NonNull::new(st.runtime_services() as *const _ as *mut u8);

    unsafe {
        if handoff::fill_init_block(block_phys, framebuffer, efi_runtime_services, &cli_options, mode.level()).is_err() {
            return Status::DEVICE_ERROR;
        }
    }

    let block_virt = match handoff::map_init_block(&page_map, &mut mappings, block_phys, &mut next_virt, &mut alloc) {
        Ok(v) => v,
        Err(_) => return Status::DEVICE_ERROR,
    };

    if let Some(fb) = framebuffer {
        if fb.initialized {
            if handoff::map_framebuffer(
                &page_map,
                &mut mappings,
                block_phys,
                fb.address,
                fb.buffer_size,
                &mut next_virt,
                &mut alloc,
            )
            .is_err()
            {
                return Status::DEVICE_ERROR;
            }
        }
    }

    match handoff::map_apic(&page_map, &mut mappings) {
        Ok(()) => handoff::ensure_apic_enabled(),
        Err(_) => warn!("local APIC not present or unmappable"),
    }

    if unsafe { handoff::publish_mapping_list(&page_map, &mut mappings, block_phys, &mut next_virt, &mut alloc) }.is_err() {
        return Status::DEVICE_ERROR;
    }

    let entry_virt = kernel_virt + loaded.entry_point_rva as u64;

    info!("exiting boot services");
    let mut est_size = boot_services.memory_map_size().map_size + 8 * core::mem::size_of::<MemoryDescriptor>();
    let mut mmap_buf = alloc::vec![0u8; est_size];
    if boot_services.memory_map(&mut mmap_buf).is_err() {
        est_size += 4 * core::mem::size_of::<MemoryDescriptor>();
        mmap_buf.resize(est_size, 0);
        if boot_services.memory_map(&mut mmap_buf).is_err() {
            return Status::DEVICE_ERROR;
        }
    }

    let _runtime_table = match st.exit_boot_services(image, &mut mmap_buf) {
        Ok((runtime_table, _iter)) => runtime_table,
        Err(_) => return Status::DEVICE_ERROR,
    };

    // SAFETY: page_map.root_phys is a fully populated, self-mapped root
    // table whose mappings cover the kernel image, its handoff block, the
    // framebuffer and APIC (if present), and the loader's own identity
    // mapping, which the CPU still executes from until the jump below.
    unsafe {
        handoff::switch_to_new_page_map(page_map.root_phys);
        handoff::jump_to_kernel(entry_virt, block_virt);
    }
}

/// Selects and activates a GOP mode close to a 1920x1080 target (or the
/// closest available, falling back to whatever mode is already active if no
/// GOP is present), returning the resulting framebuffer description.
fn configure_framebuffer(st: &mut SystemTable<Boot>) -> Option<FramebufferInfo> {
    let gop = unsafe { st.boot_services().locate_protocol::<GraphicsOutput>().ok()?.get().as_mut()? };

    let target = (1920usize, 1080usize);
    let best = gop
        .modes()
        .filter(|m| m.info().pixel_format() != GopPixelFormat::BltOnly)
        .min_by_key(|m| {
            let (w, h) = m.info().resolution();
            let dw = if w > target.0 { w - target.0 } else { target.0 - w };
            let dh = if h > target.1 { h - target.1 } else { target.1 - h };
            dw + dh
        });
    if let Some(mode) = best {
        let _ = gop.set_mode(&mode);
    }

    let mode_info = gop.current_mode_info();
    let (width, height) = mode_info.resolution();
    let stride = mode_info.stride();
    let pixel_format = match mode_info.pixel_format() {
        GopPixelFormat::Rgb => PixelFormat::Rgba,
        GopPixelFormat::Bgr => PixelFormat::Bgra,
        _ => PixelFormat::Bgra,
    };

    let mut fb = gop.frame_buffer();
    Some(FramebufferInfo {
        initialized: true,
        protocol: FramebufferProtocol::Gop,
        address: fb.as_mut_ptr() as u64,
        buffer_size: fb.size() as u64,
        width: width as u32,
        height: height as u32,
        pitch: (stride * 4) as u32,
        bpp: 32,
        pixel_format,
    })
}

/// Reads the raw `LoadedImage` command-line options string, empty if none
/// was supplied.
fn read_load_options(image: &Handle, st: &SystemTable<Boot>) -> String {
    let loaded_image = unsafe {
        match st.boot_services().handle_protocol::<LoadedImage>(*image) {
            Ok(cell) => &mut *cell.get(),
            Err(_) => return String::new(),
        }
    };
    match loaded_image.load_options_as_bytes() {
        Some(bytes) => String::from_utf8_lossy(bytes).trim_matches(char::from(0)).into(),
        None => String::new(),
    }
}

/// Reads the loader image's own base address and size from its
/// `LoadedImage` protocol instance, for `map_fixed_regions`'s identity
/// mapping of the loader's own code.
fn loaded_image_bounds(image: &Handle, boot_services: &uefi::table::boot::BootServices) -> error::LdrResult<(u64, u64)> {
    let loaded_image = unsafe {
        boot_services
            .handle_protocol::<LoadedImage>(*image)
            .map_err(|_| LdrStatus::NotFound)
            .map(|cell| &mut *cell.get())?
    };
    let (base, size) = loaded_image.info();
    Ok((base as u64, size))
}

/// Opens the image's own filesystem volume and reads `path` in full.
fn read_whole_file(image: &Handle, st: &SystemTable<Boot>, path: &str) -> error::LdrResult<Vec<u8>> {
    let boot_services = st.boot_services();
    let sfs = boot_services
        .get_image_file_system(*image)
        .map_err(|_| LdrStatus::NotFound)?;
    let mut root = unsafe { &mut *sfs.interface.get() }.open_volume().map_err(|_| LdrStatus::DeviceError)?;

    let handle = root
        .open(path, FileMode::Read, FileAttribute::READ_ONLY)
        .map_err(|_| LdrStatus::NotFound)?;

    match handle.into_type().map_err(|_| LdrStatus::DeviceError)? {
        FileType::Regular(mut file) => {
            // Probe the required buffer size first: FileInfo's variable-length
            // filename means a fixed guess risks BufferTooSmall.
            let mut probe = [0u8; 0];
            let needed = match file.get_info::<FileInfo>(&mut probe) {
                Err(e) => e.data().copied().ok_or(LdrStatus::DeviceError)?,
                Ok(_) => 0,
            };
            let mut info_buf = alloc::vec![0u8; needed.max(256)];
            let info = file.get_info::<FileInfo>(&mut info_buf).map_err(|_| LdrStatus::DeviceError)?;
            let size = info.file_size() as usize;
            let mut buf = alloc::vec![0u8; size];
            file.read(&mut buf).map_err(|_| LdrStatus::DeviceError)?;
            Ok(buf)
        }
        FileType::Dir(_) => Err(LdrStatus::InvalidParameter),
    }
}

/// Fetches the firmware's current memory map through the `Firmware` trait,
/// retrying internally on `BufferTooSmall`.
fn fetch_memory_map(
    image: &Handle,
    boot_services: &uefi::table::boot::BootServices,
) -> error::LdrResult<Vec<firmware::FirmwareMemoryDescriptor>> {
    let mut fw = UefiFirmware::new(*image, boot_services);
    Ok(fw.get_memory_map()?.descriptors)
}

/// Finds the firmware's RSDP pointer from the system table's configuration
/// table, preferring the ACPI 2.0 GUID over the ACPI 1.0 one.
fn locate_rsdp(st: &SystemTable<Boot>) -> Option<*const u8> {
    let mut acpi1 = None;
    for entry in st.config_table() {
        if entry.guid == ACPI2_GUID {
            return Some(entry.address as *const u8);
        }
        if entry.guid == ACPI_GUID {
            acpi1 = Some(entry.address as *const u8);
        }
    }
    acpi1
}
