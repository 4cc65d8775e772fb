//! Kernel handoff ABI.
//!
//! `InitializationBlock` is the single argument passed from `xtldr` to the
//! kernel entry point. It is built, zeroed, and populated by the loader's
//! `handoff` module and consumed here. Field layout is grouped by concern
//! (`loader_information`, `firmware_information`, kernel parameter string)
//! rather than freezing exact byte offsets -- the ABI is opaque to the caller
//! side unless compatibility with a prior build is required, which it is not
//! here.
//!
//! Grounded on `libkernel::BootPayload` (`kernel/src/kernel.rs`): a plain
//! data struct built by the loader and consumed by the kernel's `_start`,
//! generalized from UEFI-specific fields (`SystemTable`, raw ELF bytes) to
//! architecture-neutral fields.

use core::ptr::NonNull;

use crate::mm::mapping::MemoryMapping;

/// Bumped whenever `InitializationBlock`'s layout changes in an incompatible way.
pub const INIT_BLOCK_VERSION: u32 = 1;
/// Bumped whenever the loader/kernel handoff calling convention changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Virtual base the kernel image and its KSEG0-relative structures
/// (init block, framebuffer, APIC page) are mapped at. Shared between the
/// loader, which builds the mapping, and the kernel, which must compute the
/// same addresses to locate its own structures without depending on a
/// pointer field for everything.
pub const KSEG0_BASE: u64 = 0xFFFF_8000_0000_0000;
/// Kernel image offset within the KSEG0 window.
pub const KSEG0_KERNEL_BASE: u64 = 0x0000_0100_0000;
/// Well-known virtual address for the mapped local APIC register page.
pub const APIC_BASE_VA: u64 = KSEG0_BASE + 0x0000_0F00_0000;
/// Virtual base of the recursive self-map, installed by the loader's
/// page-table builder and relied on by the kernel's page-table scanner to
/// compute `PageMapInfo`.
pub const SELF_MAP_BASE_VA: u64 = 0xFFFF_F680_0000_0000;
/// Upper bound (exclusive) on the top-level (PML4/PML5/PD) index the page-
/// table scanner walks. `KSEG0_BASE` and `APIC_BASE_VA` both land at index
/// 256; the self-map's own recursive slot lives at index 493 and must never
/// be walked as an ordinary entry, so 257 safely covers every mapping the
/// loader creates without reaching it.
pub const KERNEL_SCAN_TOP_INDEX_COUNT: usize = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferProtocol {
    None,
    /// UEFI Graphics Output Protocol framebuffer, already linear and mapped.
    Gop,
}

#[derive(Debug, Clone, Copy)]
pub enum PixelFormat {
    Rgba,
    Bgra,
    Argb,
    Abgr,
}

/// Framebuffer descriptor, mapped into kernel virtual address space by the
/// loader before handoff.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    pub initialized: bool,
    pub protocol: FramebufferProtocol,
    /// Virtual address of the framebuffer, valid only once `initialized`.
    pub address: u64,
    pub buffer_size: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub bpp: u8,
    pub pixel_format: PixelFormat,
}

impl FramebufferInfo {
    pub const fn uninitialized() -> Self {
        FramebufferInfo {
            initialized: false,
            protocol: FramebufferProtocol::None,
            address: 0,
            buffer_size: 0,
            width: 0,
            height: 0,
            pitch: 0,
            bpp: 0,
            pixel_format: PixelFormat::Bgra,
        }
    }
}

/// Loader-provided callback the kernel may use before it has its own
/// console driver running.
pub type DebugPrintFn = extern "sysv64" fn(*const u8, usize);

#[derive(Clone, Copy)]
pub struct LoaderInformation {
    pub debug_print: Option<DebugPrintFn>,
    pub framebuffer: FramebufferInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareType {
    Efi,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub struct EfiFirmwareInformation {
    pub version: u32,
    /// Physical or virtual address of `EFI_RUNTIME_SERVICES`, if retained.
    pub runtime_services: Option<NonNull<u8>>,
}

#[derive(Clone, Copy)]
pub struct FirmwareInformation {
    pub firmware_type: FirmwareType,
    pub efi: Option<EfiFirmwareInformation>,
}

/// Maximum length of the kernel command-line parameter string copied into
/// the block.
pub const MAX_KERNEL_PARAMETERS: usize = 512;

/// Describes the finished firmware memory map / mapping list the loader
/// built while planning kernel address space, as a raw array the kernel
/// reconstructs into its own `MappingList` (`mm::mapping::MappingList::from_entries`).
/// Not part of the original distilled handoff contract, but required for the
/// kernel side of PFN database initialization to see the same picture of
/// physical memory the loader already classified -- adding it is the kind of
/// ABI extension the "opaque to the caller side unless compatibility is
/// required" clause above anticipates.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct MemoryMapHandoff {
    /// Virtual address of the first `MemoryMapping` in a contiguous array.
    pub entries: Option<NonNull<MemoryMapping>>,
    pub count: usize,
}

impl MemoryMapHandoff {
    pub const fn empty() -> Self {
        MemoryMapHandoff { entries: None, count: 0 }
    }

    /// Reconstructs a borrowed slice view of the entries, or an empty slice
    /// if the loader never populated the field.
    ///
    /// # Safety
    /// `entries` must still point at `count` live, loader-allocated
    /// `MemoryMapping` values, valid for the duration of the borrow.
    pub unsafe fn as_slice<'a>(&self) -> &'a [MemoryMapping] {
        match self.entries {
            Some(ptr) => core::slice::from_raw_parts(ptr.as_ptr(), self.count),
            None => &[],
        }
    }
}

// SAFETY: the pointed-to array is handed across the boot/kernel boundary by
// raw pointer, never aliased concurrently (single-threaded handoff).
unsafe impl Send for MemoryMapHandoff {}
unsafe impl Sync for MemoryMapHandoff {}

/// The handoff structure itself. One instance is allocated, zeroed, filled,
/// and mapped by the loader; the kernel's entry point receives its virtual
/// address as its sole argument.
#[repr(C)]
pub struct InitializationBlock {
    pub block_size: u32,
    pub block_version: u32,
    pub protocol_version: u32,
    /// Paging mode/level the loader built the live page tables in, so the
    /// kernel can pick the matching `hal::pte::PteOps` backend and construct
    /// the same `PageMapInfo` the loader used.
    pub paging_level: u8,
    pub loader_information: LoaderInformation,
    pub firmware_information: FirmwareInformation,
    pub memory_map: MemoryMapHandoff,
    pub kernel_parameters: [u8; MAX_KERNEL_PARAMETERS],
    pub kernel_parameters_len: usize,
}

impl InitializationBlock {
    /// Size rounded up to a whole number of 4 KiB pages.
    pub const fn size_in_pages() -> u64 {
        let size = core::mem::size_of::<InitializationBlock>() as u64;
        (size + 0xFFF) / 0x1000
    }

    pub fn kernel_parameters_str(&self) -> &str {
        core::str::from_utf8(&self.kernel_parameters[..self.kernel_parameters_len]).unwrap_or("")
    }
}

// SAFETY: InitializationBlock is handed across the boot/kernel boundary by raw
// pointer, never aliased concurrently (single-threaded handoff).
unsafe impl Send for InitializationBlock {}
unsafe impl Sync for InitializationBlock {}
