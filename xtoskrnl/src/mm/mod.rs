//! Kernel memory subsystem core: the mapping-list data model shared with the
//! loader (C1), PFN database initialization (C7), and the page-table scanner
//! (C8).

pub mod mapping;
pub mod pfn;
pub mod scanner;
