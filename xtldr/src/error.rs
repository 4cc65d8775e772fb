//! Loader error taxonomy.
//!
//! `old/old_bootloader.rs` reports boot-time failures with `uefi::Status`
//! directly and `.expect_success(msg)`/`panic!` at call sites. The original
//! ExectOS sources instead thread a return-code convention through every
//! routine (`EFI_STATUS`/`STATUS_EFI_INVALID_PARAMETER` in `xtldr/memory.c`);
//! this `Status` enum takes that shape -- every fallible loader operation
//! returns `Result<T, Status>` -- while staying idiomatic Rust rather than an
//! integer code.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    InvalidParameter,
    OutOfResources,
    NotFound,
    DeviceError,
    Unsupported,
    CrcError,
    LoadError,
    BufferTooSmall,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Status::Success => "success",
            Status::InvalidParameter => "invalid parameter",
            Status::OutOfResources => "out of resources",
            Status::NotFound => "not found",
            Status::DeviceError => "device error",
            Status::Unsupported => "unsupported",
            Status::CrcError => "CRC mismatch",
            Status::LoadError => "image load error",
            Status::BufferTooSmall => "buffer too small",
        };
        f.write_str(msg)
    }
}

pub type LdrResult<T> = Result<T, Status>;

impl From<uefi::Status> for Status {
    fn from(status: uefi::Status) -> Self {
        match status {
            uefi::Status::SUCCESS => Status::Success,
            uefi::Status::INVALID_PARAMETER => Status::InvalidParameter,
            uefi::Status::OUT_OF_RESOURCES => Status::OutOfResources,
            uefi::Status::NOT_FOUND => Status::NotFound,
            uefi::Status::DEVICE_ERROR => Status::DeviceError,
            uefi::Status::BUFFER_TOO_SMALL => Status::BufferTooSmall,
            uefi::Status::UNSUPPORTED => Status::Unsupported,
            _ => Status::DeviceError,
        }
    }
}
