//! Kernel entry point.
//!
//! Grounded on `kernel/src/kernel.rs`'s `_start` -> `main()` shape: take the
//! handoff payload, stand up the heap, then run kernel-proper setup. The
//! bootboot/SMP per-CPU-ticket scheme in `kernel/src/init.rs` has no
//! counterpart on this handoff path -- `xtldr` hands control to exactly one
//! CPU, in long mode or protected mode with paging already live, and the
//! init block already carries everything `_start` needs instead of a
//! `bootboot` global.

#![no_std]
#![no_main]
#![feature(alloc_error_handler)]

extern crate alloc;

use core::alloc::Layout;
use core::panic::PanicInfo;

use linked_list_allocator::LockedHeap;
use log::info;

use hal::pagemap::info_for;
use hal::pte::{Basic, Xpa};
use hal::{hlt_loop, PagingMode};

use libxtoskrnl::handoff::{InitializationBlock, FramebufferProtocol, SELF_MAP_BASE_VA, KERNEL_SCAN_TOP_INDEX_COUNT};
use libxtoskrnl::mm::mapping::{MemoryMapping, MappingList};
use libxtoskrnl::mm::pfn::PfnDatabase;
use libxtoskrnl::mm::scanner;
use libxtoskrnl::out::framebuffer::{FrameBuffer, PixelFormat as FbPixelFormat};
use libxtoskrnl::out::terminal::TERM1;
use libxtoskrnl::sync::{RaiseRunLevel, RunLevel};
use libxtoskrnl::{cfg, logger};

/// Initial kernel heap size. Backed by a static BSS region rather than
/// pages handed out by the PFN database: the database isn't built yet when
/// the heap is needed for its own `Vec<Pfn>` arena.
const HEAP_SIZE: usize = 0x40_0000;

static mut HEAP_MEM: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[alloc_error_handler]
fn alloc_error_handler(layout: Layout) -> ! {
    panic!("kernel heap exhausted requesting {:?}", layout)
}

const PAGE_SIZE: u64 = 0x1000;

#[no_mangle]
pub extern "sysv64" fn _start(init_block: *const InitializationBlock) -> ! {
    // SAFETY: init_block is xtldr's handoff block, mapped and populated
    // before the jump into this entry point.
    unsafe { ALLOCATOR.lock().init(HEAP_MEM.as_mut_ptr(), HEAP_SIZE) };

    logger::init();

    // SAFETY: see above; the block outlives this function (nothing frees it).
    let block = unsafe { &*init_block };
    cfg::init_boot_cfg(block.kernel_parameters_str());

    init_console(block);

    info!(
        "xtoskrnl: init block v{}/{}, {} bytes, paging level {}",
        block.block_version, block.protocol_version, block.block_size, block.paging_level
    );

    let mapping_list = reconstruct_mapping_list(block);
    info!(
        "xtoskrnl: {} mapping entries, {} bytes of physical coverage",
        mapping_list.mappings_count(),
        mapping_list.total_coverage_bytes()
    );

    let total_pages = mapping_list
        .iter()
        .map(|m: &MemoryMapping| m.physical_end() / PAGE_SIZE)
        .max()
        .unwrap_or(0);

    let mode = PagingMode::from_level(block.paging_level)
        .unwrap_or_else(|| panic!("unrecognised paging level {} in handoff block", block.paging_level));

    // PFN database construction and the page-table scan both mutate shared
    // kernel memory-management state and run with interrupts logically
    // quiesced, matching the one-shot, early-boot initialization C7 and C8
    // are specified under.
    let info = info_for(mode, SELF_MAP_BASE_VA);

    let _runlevel = RaiseRunLevel::to(RunLevel::DispatchLevel);
    let mut pfn_db = PfnDatabase::init(&mapping_list, total_pages, &info);
    info!(
        "xtoskrnl: pfn database: {} pages, {} free, {} bad",
        pfn_db.highest_page(),
        pfn_db.free_page_count(),
        pfn_db.bad_page_count()
    );

    if mode.is_xpa() {
        scanner::scan::<Xpa>(&info, &mut pfn_db, KERNEL_SCAN_TOP_INDEX_COUNT);
    } else {
        scanner::scan::<Basic>(&info, &mut pfn_db, KERNEL_SCAN_TOP_INDEX_COUNT);
    }
    drop(_runlevel);

    info!(
        "xtoskrnl: page-table scan complete, {} frames still free",
        pfn_db.free_page_count()
    );

    hlt_loop();
}

/// Reconstructs the kernel's own `MappingList` from the raw array the
/// loader published, per `handoff::MemoryMapHandoff`'s contract.
fn reconstruct_mapping_list(block: &InitializationBlock) -> MappingList {
    // SAFETY: entries, if present, were written by xtldr::handoff::publish_mapping_list
    // and mapped into this address space before the jump to _start.
    let entries = unsafe { block.memory_map.as_slice() };
    MappingList::from_entries(entries)
}

/// Points `out::terminal::TERM1` at the loader-provided framebuffer, if any.
/// Console output (`print!`/`println!`) still routes through UART only
/// (`out::mod.rs`'s `__print`); this just makes the framebuffer terminal
/// available once that wiring catches up.
fn init_console(block: &InitializationBlock) {
    let fb = &block.loader_information.framebuffer;
    if !fb.initialized || fb.protocol != FramebufferProtocol::Gop {
        return;
    }
    let format = match fb.pixel_format {
        libxtoskrnl::handoff::PixelFormat::Rgba => FbPixelFormat::RGBA,
        libxtoskrnl::handoff::PixelFormat::Bgra => FbPixelFormat::BGRA,
        libxtoskrnl::handoff::PixelFormat::Argb => FbPixelFormat::ARGB,
        libxtoskrnl::handoff::PixelFormat::Abgr => FbPixelFormat::ABGR,
    };
    // SAFETY: fb.address is a virtual address xtldr already mapped read/write
    // for fb.buffer_size bytes before handoff.
    unsafe {
        TERM1.lock().fb = FrameBuffer::new(
            fb.address as *mut u8,
            fb.width as usize,
            fb.height as usize,
            fb.pitch as usize,
            format,
        );
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    log::error!("kernel panic: {}", info);
    hlt_loop();
}
