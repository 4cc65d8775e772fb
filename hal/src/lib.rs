//! Architecture abstraction layer for i686 and amd64. Houses CPU register access, port I/O,
//! segmentation/interrupt descriptor plumbing, and the arch-dispatched paging core shared by
//! `xtldr` and `xtoskrnl`: the PTE ADT (`pte`), paging address arithmetic (`pagemap`), and the
//! atomic primitive library (`atomic`).
//!
//! This exists primarily out of a challenge to not use Phillip Opperman's x86_64 crate or Gerd
//! Zellweger's x86 crate, in order to facilitate learning and understanding of the details that
//! come with writing for the x86 family directly, and reinforce that through writing what is
//! otherwise admittedly partially redundant, less thoroughly documented, and untested code.

#![no_std]

#![feature(ptr_to_from_bits)]
#![feature(slice_ptr_get)]
#![feature(abi_x86_interrupt)]

pub mod registers;
pub mod interrupts;
pub mod segmentation;
pub mod paging;
pub mod ports;
pub mod pte;
pub mod pagemap;
pub mod atomic;

/// Paging mode a `PageMap` is built for. Drives which `PteOps` backend and which
/// shift constants (`pagemap::PageMapInfo`) are used; the algorithms above this
/// line are identical across all four, only the constants differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    /// i686, no PAE: 2-level, 32-bit PTEs, 4 KiB-mapped PDE covers 4 MiB.
    Legacy2Level,
    /// i686 PAE: 3-level, 64-bit PTEs, 4-entry PDPT.
    Pae3Level,
    /// amd64 long mode: 4-level, 64-bit PTEs.
    LongMode4Level,
    /// amd64 long mode w/ LA57: 5-level, 64-bit PTEs.
    LongMode5Level,
}

impl PagingMode {
    /// Number of paging levels this mode walks, matching `PageMap::page_map_level`.
    pub const fn level(self) -> u8 {
        match self {
            PagingMode::Legacy2Level => 2,
            PagingMode::Pae3Level => 3,
            PagingMode::LongMode4Level => 4,
            PagingMode::LongMode5Level => 5,
        }
    }

    /// Whether this mode uses 64-bit (PAE or long-mode) PTEs, commonly called "XPA".
    pub const fn is_xpa(self) -> bool {
        !matches!(self, PagingMode::Legacy2Level)
    }

    pub const fn from_level(level: u8) -> Option<Self> {
        match level {
            2 => Some(PagingMode::Legacy2Level),
            3 => Some(PagingMode::Pae3Level),
            4 => Some(PagingMode::LongMode4Level),
            5 => Some(PagingMode::LongMode5Level),
            _ => None,
        }
    }
}



// memory protection levels

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrivLvl {
    /// Operating System
    Ring0 = 0b00,
    Ring1 = 0b01,
    Ring2 = 0b10,
    /// Userland
    Ring3 = 0b11,
}

impl PrivLvl {
    #[inline]
    pub const fn from_bits(from: u8) -> Self {
        match from {
            0b00 => PrivLvl::Ring0,
            0b01 => PrivLvl::Ring1,
            0b10 => PrivLvl::Ring2,
            0b11 => PrivLvl::Ring3,
            _ => panic!("Invalid x86 priviledge level"),
        }
    }

    #[inline]
    pub const fn to_bits(self) -> u8 {
        self as u8
    }

    pub const fn is_userland(self) -> bool {
        matches!(self, PrivLvl::Ring3)
    }
}



// instructions

pub fn hlt() {
    unsafe {
        core::arch::asm!("hlt", options(nostack, nomem, preserves_flags)); 
    }
}
pub fn hlt_loop() -> ! {
    loop {
        unsafe {
            core::arch::asm!("hlt", options(nostack, nomem, preserves_flags)); 
        }
    }
}
