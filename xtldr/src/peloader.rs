//! Minimal PE/COFF kernel image loader.
//!
//! Grounded on `xtldr/modules/pecoff/pecoff.c` from the original ExectOS
//! sources (`PeLoadImage`/`PepValidateImageHeaders`/section-copy loop):
//! validate the DOS stub and `PE\0\0` signature, read `SizeOfImage` from the
//! optional header, copy each section to its `VirtualAddress` offset within
//! a fresh page-aligned allocation (zero-filling the tail when
//! `VirtualSize` exceeds `SizeOfRawData`), then hand back the entry RVA.
//! Unlike the original, this loader does not perform base relocation: the
//! kernel image is always linked for (and loaded at) its preferred base.

use alloc::vec::Vec;

use crate::error::{LdrResult, Status};

const DOS_SIGNATURE: u16 = 0x5A4D; // "MZ"
const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
const IMAGE_FILE_EXECUTABLE: u16 = 0x0002;
const PE32_PLUS_MAGIC: u16 = 0x020B;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct SectionHeader {
    name: [u8; 8],
    virtual_size: u32,
    virtual_address: u32,
    size_of_raw_data: u32,
    pointer_to_raw_data: u32,
    pointer_to_relocations: u32,
    pointer_to_linenumbers: u32,
    number_of_relocations: u16,
    number_of_linenumbers: u16,
    characteristics: u32,
}

/// Result of successfully loading a PE/COFF image: where its pages live and
/// where execution should resume.
pub struct LoadedImage {
    /// Page-aligned buffer the image was copied into.
    pub image: Vec<u8>,
    pub image_size: u32,
    pub entry_point_rva: u32,
    pub machine: u16,
    pub image_base: u64,
}

fn read_u16(data: &[u8], off: usize) -> LdrResult<u16> {
    data.get(off..off + 2)
        .map(|s| u16::from_le_bytes([s[0], s[1]]))
        .ok_or(Status::LoadError)
}

fn read_u32(data: &[u8], off: usize) -> LdrResult<u32> {
    data.get(off..off + 4)
        .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or(Status::LoadError)
}

fn read_u64(data: &[u8], off: usize) -> LdrResult<u64> {
    data.get(off..off + 8)
        .map(|s| u64::from_le_bytes(s.try_into().unwrap()))
        .ok_or(Status::LoadError)
}

/// Loads a kernel image already read into `raw` (the file's on-disk bytes,
/// not yet relocated or section-expanded).
pub fn load_image(raw: &[u8]) -> LdrResult<LoadedImage> {
    if raw.len() < 0x40 || read_u16(raw, 0)? != DOS_SIGNATURE {
        return Err(Status::LoadError);
    }
    let pe_offset = read_u32(raw, 0x3C)? as usize;
    if read_u32(raw, pe_offset)? != PE_SIGNATURE {
        return Err(Status::LoadError);
    }

    let coff_header = pe_offset + 4;
    let machine = read_u16(raw, coff_header)?;
    let number_of_sections = read_u16(raw, coff_header + 2)?;
    let size_of_optional_header = read_u16(raw, coff_header + 16)?;
    let characteristics = read_u16(raw, coff_header + 18)?;

    if characteristics & IMAGE_FILE_EXECUTABLE == 0 {
        return Err(Status::LoadError);
    }

    let optional_header = coff_header + 20;
    let magic = read_u16(raw, optional_header)?;
    let is_pe32_plus = magic == PE32_PLUS_MAGIC;

    // AddressOfEntryPoint and SizeOfImage live at the same offsets in both
    // PE32 and PE32+ optional headers; only ImageBase's width differs.
    let entry_point_rva = read_u32(raw, optional_header + 16)?;
    let image_base_offset = optional_header + 24;
    let image_base = if is_pe32_plus {
        read_u64(raw, image_base_offset)?
    } else {
        read_u32(raw, image_base_offset)? as u64
    };
    let size_of_image_offset = if is_pe32_plus {
        optional_header + 56
    } else {
        optional_header + 56
    };
    let image_size = read_u32(raw, size_of_image_offset)?;
    let size_of_headers = read_u32(raw, optional_header + 60)?;

    let mut image = alloc::vec![0u8; image_size as usize];
    let headers_len = (size_of_headers as usize).min(raw.len()).min(image.len());
    image[..headers_len].copy_from_slice(&raw[..headers_len]);

    let section_table_offset = optional_header + size_of_optional_header as usize;
    for i in 0..number_of_sections as usize {
        let base = section_table_offset + i * core::mem::size_of::<SectionHeader>();
        if base + 40 > raw.len() {
            return Err(Status::LoadError);
        }
        let virtual_size = read_u32(raw, base + 8)?;
        let virtual_address = read_u32(raw, base + 12)? as usize;
        let size_of_raw_data = read_u32(raw, base + 16)?;
        let pointer_to_raw_data = read_u32(raw, base + 20)? as usize;

        let section_size = if size_of_raw_data < virtual_size {
            size_of_raw_data
        } else {
            virtual_size
        } as usize;

        if section_size > 0 && pointer_to_raw_data != 0 {
            let src = raw
                .get(pointer_to_raw_data..pointer_to_raw_data + section_size)
                .ok_or(Status::LoadError)?;
            let dst = image
                .get_mut(virtual_address..virtual_address + section_size)
                .ok_or(Status::LoadError)?;
            dst.copy_from_slice(src);
        }

        let virtual_size = virtual_size as usize;
        if section_size < virtual_size {
            let dst = image
                .get_mut(virtual_address + section_size..virtual_address + virtual_size)
                .ok_or(Status::LoadError)?;
            dst.fill(0);
        }
    }

    Ok(LoadedImage {
        image,
        image_size,
        entry_point_rva,
        machine,
        image_base,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_pe(entry_rva: u32, image_size: u32, is_pe32_plus: bool) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; 0x200];
        buf[0] = b'M';
        buf[1] = b'Z';
        let pe_offset = 0x80usize;
        buf[0x3C..0x40].copy_from_slice(&(pe_offset as u32).to_le_bytes());
        buf[pe_offset..pe_offset + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
        let coff = pe_offset + 4;
        buf[coff..coff + 2].copy_from_slice(&0x8664u16.to_le_bytes()); // machine
        buf[coff + 2..coff + 4].copy_from_slice(&0u16.to_le_bytes()); // sections
        let opt_hdr_size = 112u16;
        buf[coff + 16..coff + 18].copy_from_slice(&opt_hdr_size.to_le_bytes());
        buf[coff + 18..coff + 20].copy_from_slice(&IMAGE_FILE_EXECUTABLE.to_le_bytes());
        let opt = coff + 20;
        let magic = if is_pe32_plus { PE32_PLUS_MAGIC } else { 0x010Bu16 };
        buf[opt..opt + 2].copy_from_slice(&magic.to_le_bytes());
        buf[opt + 16..opt + 20].copy_from_slice(&entry_rva.to_le_bytes());
        buf[opt + 56..opt + 60].copy_from_slice(&image_size.to_le_bytes());
        buf[opt + 60..opt + 64].copy_from_slice(&0x200u32.to_le_bytes()); // SizeOfHeaders
        buf
    }

    #[test]
    fn rejects_missing_dos_signature() {
        let buf = alloc::vec![0u8; 0x200];
        assert!(matches!(load_image(&buf), Err(Status::LoadError)));
    }

    #[test]
    fn parses_entry_point_and_image_size() {
        let buf = minimal_pe(0x1000, 0x4000, true);
        let loaded = load_image(&buf).expect("valid minimal PE");
        assert_eq!(loaded.entry_point_rva, 0x1000);
        assert_eq!(loaded.image_size, 0x4000);
        assert_eq!(loaded.image.len(), 0x4000);
        assert_eq!(loaded.machine, 0x8664);
    }

    #[test]
    fn rejects_non_executable_images() {
        let mut buf = minimal_pe(0x1000, 0x4000, true);
        let coff = 0x84;
        buf[coff + 18..coff + 20].copy_from_slice(&0u16.to_le_bytes());
        assert!(matches!(load_image(&buf), Err(Status::LoadError)));
    }
}
