//! Minimal PE header reader.
//!
//! Only what segment discovery needs: the DOS and NT signatures, the COFF file header, the
//! size of the image and the section table. Fields are read little-endian from a byte
//! slice, so the same code serves a live mapped image and a buffer built in tests.

use crate::error::{Error, Result};

pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const OPTIONAL_MAGIC_PE32: u16 = 0x10B;
pub const OPTIONAL_MAGIC_PE32_PLUS: u16 = 0x20B;

// Section characteristics
pub const IMAGE_SCN_CNT_CODE: u32 = 0x0000_0020;
pub const IMAGE_SCN_CNT_INITIALIZED_DATA: u32 = 0x0000_0040;
pub const IMAGE_SCN_MEM_EXECUTE: u32 = 0x2000_0000;
pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

const DOS_HEADER_SIZE: usize = 0x40;
const E_LFANEW_OFFSET: usize = 0x3C;
const FILE_HEADER_SIZE: usize = 20;
const SECTION_HEADER_SIZE: usize = 40;
/// Offset of `SizeOfImage` inside both optional header variants
const SIZE_OF_IMAGE_OFFSET: usize = 56;
/// Offset of `SizeOfHeaders` inside both optional header variants
const SIZE_OF_HEADERS_OFFSET: usize = 60;

/// One entry of the section table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    /// Section name trimmed at the first NUL.
    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    fn parse(raw: &[u8]) -> Self {
        let mut name = [0u8; 8];
        name.copy_from_slice(&raw[..8]);
        Self {
            name,
            virtual_size: read_u32(raw, 8),
            virtual_address: read_u32(raw, 12),
            size_of_raw_data: read_u32(raw, 16),
            pointer_to_raw_data: read_u32(raw, 20),
            characteristics: read_u32(raw, 36),
        }
    }
}

/// Parsed NT headers.
#[derive(Debug, Clone)]
pub struct PeHeaders {
    pub machine: u16,
    pub is_64bit: bool,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub sections: Vec<SectionHeader>,
}

impl PeHeaders {
    /// Parse headers from the first bytes of an image.
    ///
    /// `bytes` must cover the DOS header, the NT headers and the whole section table.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let invalid = |message: String| Error::InvalidImage { base: 0, message };

        if bytes.len() < DOS_HEADER_SIZE {
            return Err(invalid(format!(
                "headers too small: {} bytes, need {}",
                bytes.len(),
                DOS_HEADER_SIZE
            )));
        }
        if read_u16(bytes, 0) != DOS_MAGIC {
            return Err(invalid("invalid DOS signature".to_string()));
        }

        let pe_offset = read_u32(bytes, E_LFANEW_OFFSET) as usize;
        let file_header_start = pe_offset + 4;
        let optional_start = file_header_start + FILE_HEADER_SIZE;
        if bytes.len() < optional_start {
            return Err(invalid(format!(
                "NT headers at {:#x} exceed {} header bytes",
                pe_offset,
                bytes.len()
            )));
        }
        if read_u32(bytes, pe_offset) != PE_SIGNATURE {
            return Err(invalid(format!("invalid PE signature at {:#x}", pe_offset)));
        }

        let machine = read_u16(bytes, file_header_start);
        let number_of_sections = read_u16(bytes, file_header_start + 2) as usize;
        let size_of_optional = read_u16(bytes, file_header_start + 16) as usize;

        let sections_start = optional_start + size_of_optional;
        let sections_end = sections_start + number_of_sections * SECTION_HEADER_SIZE;
        if size_of_optional < SIZE_OF_HEADERS_OFFSET + 4 || bytes.len() < sections_end {
            return Err(invalid(format!(
                "truncated headers: section table ends at {:#x}, have {:#x}",
                sections_end,
                bytes.len()
            )));
        }

        let is_64bit = match read_u16(bytes, optional_start) {
            OPTIONAL_MAGIC_PE32_PLUS => true,
            OPTIONAL_MAGIC_PE32 => false,
            other => return Err(invalid(format!("unknown optional header magic {:#x}", other))),
        };

        let sections = bytes[sections_start..sections_end]
            .chunks_exact(SECTION_HEADER_SIZE)
            .map(SectionHeader::parse)
            .collect();

        Ok(Self {
            machine,
            is_64bit,
            size_of_image: read_u32(bytes, optional_start + SIZE_OF_IMAGE_OFFSET),
            size_of_headers: read_u32(bytes, optional_start + SIZE_OF_HEADERS_OFFSET),
            sections,
        })
    }

    /// Lay a PE file out the way the loader maps it: headers at 0, each section's raw
    /// data at its virtual address, the rest of `SizeOfImage` zeroed.
    ///
    /// No relocations or imports are applied.
    pub fn map_file(file: &[u8]) -> Result<(Self, Vec<u8>)> {
        let headers = Self::parse(file)?;
        let invalid = |message: String| Error::InvalidImage { base: 0, message };

        let mut image = vec![0u8; headers.size_of_image as usize];
        let header_len = (headers.size_of_headers as usize)
            .min(file.len())
            .min(image.len());
        image[..header_len].copy_from_slice(&file[..header_len]);

        for section in &headers.sections {
            let len = match section.virtual_size {
                0 => section.size_of_raw_data,
                virtual_size => section.size_of_raw_data.min(virtual_size),
            } as usize;
            let raw = section.pointer_to_raw_data as usize;
            let va = section.virtual_address as usize;
            if len == 0 {
                continue;
            }
            let src = file.get(raw..raw + len).ok_or_else(|| {
                invalid(format!("section {} raw data beyond end of file", section.name_str()))
            })?;
            let dst = image.get_mut(va..va + len).ok_or_else(|| {
                invalid(format!("section {} beyond SizeOfImage", section.name_str()))
            })?;
            dst.copy_from_slice(src);
        }

        Ok((headers, image))
    }

    /// Parse the headers of an image mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at a mapped PE image whose header pages are readable.
    pub unsafe fn from_mapped(base: usize) -> Result<Self> {
        if base == 0 {
            return Err(Error::NullAddress("image base"));
        }
        let ptr = base as *const u8;

        // SAFETY: the DOS header is always mapped at the image base.
        let dos = unsafe { std::slice::from_raw_parts(ptr, DOS_HEADER_SIZE) };
        if read_u16(dos, 0) != DOS_MAGIC {
            return Err(Error::InvalidImage {
                base,
                message: "invalid DOS signature".to_string(),
            });
        }

        let pe_offset = read_u32(dos, E_LFANEW_OFFSET) as usize;
        let nt_len = pe_offset + 4 + FILE_HEADER_SIZE;
        // SAFETY: e_lfanew points inside the header page of a valid image.
        let nt = unsafe { std::slice::from_raw_parts(ptr, nt_len) };
        let number_of_sections = read_u16(nt, pe_offset + 6) as usize;
        let size_of_optional = read_u16(nt, pe_offset + 20) as usize;

        let total = nt_len + size_of_optional + number_of_sections * SECTION_HEADER_SIZE;
        // SAFETY: the loader maps the whole header block, section table included.
        let headers = unsafe { std::slice::from_raw_parts(ptr, total) };
        Self::parse(headers).map_err(|e| match e {
            Error::InvalidImage { message, .. } => Error::InvalidImage { base, message },
            other => other,
        })
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Builds small PE images in memory for tests.
#[cfg(test)]
pub(crate) mod builder {
    use super::*;

    pub const PE_OFFSET: usize = 0x80;
    pub const OPTIONAL_SIZE: usize = 0xF0;

    /// `(name, virtual address, virtual size, characteristics)`
    pub type SectionSpec<'a> = (&'a str, u32, u32, u32);

    /// Lay out headers followed by a zeroed image of `size_of_image` bytes.
    pub fn build_image(size_of_image: usize, sections: &[SectionSpec<'_>]) -> Vec<u8> {
        let mut image = vec![0u8; size_of_image];
        image[0..2].copy_from_slice(&DOS_MAGIC.to_le_bytes());
        image[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4]
            .copy_from_slice(&(PE_OFFSET as u32).to_le_bytes());
        image[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());

        let fh = PE_OFFSET + 4;
        image[fh..fh + 2].copy_from_slice(&0x8664u16.to_le_bytes());
        image[fh + 2..fh + 4].copy_from_slice(&(sections.len() as u16).to_le_bytes());
        image[fh + 16..fh + 18].copy_from_slice(&(OPTIONAL_SIZE as u16).to_le_bytes());

        let opt = fh + FILE_HEADER_SIZE;
        image[opt..opt + 2].copy_from_slice(&OPTIONAL_MAGIC_PE32_PLUS.to_le_bytes());
        image[opt + SIZE_OF_IMAGE_OFFSET..opt + SIZE_OF_IMAGE_OFFSET + 4]
            .copy_from_slice(&(size_of_image as u32).to_le_bytes());
        image[opt + SIZE_OF_HEADERS_OFFSET..opt + SIZE_OF_HEADERS_OFFSET + 4]
            .copy_from_slice(&0x400u32.to_le_bytes());

        let mut at = opt + OPTIONAL_SIZE;
        for &(name, va, vsize, characteristics) in sections {
            let raw = &mut image[at..at + SECTION_HEADER_SIZE];
            raw[..name.len()].copy_from_slice(name.as_bytes());
            raw[8..12].copy_from_slice(&vsize.to_le_bytes());
            raw[12..16].copy_from_slice(&va.to_le_bytes());
            raw[36..40].copy_from_slice(&characteristics.to_le_bytes());
            at += SECTION_HEADER_SIZE;
        }
        image
    }
}
