//! An executable file laid out as the loader would map it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use relpatch::image::PeHeaders;
use relpatch::{ProcessImage, Version};
use tracing::debug;

pub struct MappedFile {
    path: PathBuf,
    headers: PeHeaders,
    bytes: Vec<u8>,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let (headers, bytes) = PeHeaders::map_file(&file)
            .with_context(|| format!("mapping {}", path.display()))?;
        debug!(
            "Mapped {} ({} sections, {:#x} bytes)",
            path.display(),
            headers.sections.len(),
            bytes.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            headers,
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn headers(&self) -> &PeHeaders {
        &self.headers
    }

    /// Segments and addresses as they would appear with the image loaded at `base`.
    pub fn image(&self, base: usize, version: Version) -> ProcessImage {
        ProcessImage::from_headers(base, version, &self.headers).with_filename(&self.path)
    }

    /// `len` bytes starting `rva` bytes into the image.
    pub fn bytes_at(&self, rva: usize, len: usize) -> Result<&[u8]> {
        match rva.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(&self.bytes[rva..end]),
            _ => bail!(
                "+0x{:X}..+0x{:X} lies outside the image (0x{:X} bytes)",
                rva,
                rva.saturating_add(len),
                self.bytes.len()
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    const PE_OFFSET: usize = 0x80;
    const OPTIONAL_SIZE: usize = 0xF0;

    /// Smallest PE32+ file with one executable `.text` section at RVA 0x1000 whose raw
    /// data starts at file offset 0x200.
    pub(crate) fn write_exe(dir: &Path, code: &[u8]) -> PathBuf {
        let mut file = vec![0u8; 0x200 + code.len().max(1)];
        file[0..2].copy_from_slice(b"MZ");
        file[0x3C..0x40].copy_from_slice(&(PE_OFFSET as u32).to_le_bytes());
        file[PE_OFFSET..PE_OFFSET + 4].copy_from_slice(b"PE\0\0");

        let fh = PE_OFFSET + 4;
        file[fh..fh + 2].copy_from_slice(&0x8664u16.to_le_bytes());
        file[fh + 2..fh + 4].copy_from_slice(&1u16.to_le_bytes());
        file[fh + 16..fh + 18].copy_from_slice(&(OPTIONAL_SIZE as u16).to_le_bytes());

        let opt = fh + 20;
        file[opt..opt + 2].copy_from_slice(&0x20Bu16.to_le_bytes());
        file[opt + 56..opt + 60].copy_from_slice(&0x2000u32.to_le_bytes());
        file[opt + 60..opt + 64].copy_from_slice(&0x200u32.to_le_bytes());

        let sh = opt + OPTIONAL_SIZE;
        file[sh..sh + 5].copy_from_slice(b".text");
        file[sh + 8..sh + 12].copy_from_slice(&0x1000u32.to_le_bytes());
        file[sh + 12..sh + 16].copy_from_slice(&0x1000u32.to_le_bytes());
        file[sh + 16..sh + 20].copy_from_slice(&(code.len() as u32).to_le_bytes());
        file[sh + 20..sh + 24].copy_from_slice(&0x200u32.to_le_bytes());
        file[sh + 36..sh + 40].copy_from_slice(&0x6000_0020u32.to_le_bytes());

        file[0x200..0x200 + code.len()].copy_from_slice(code);

        let path = dir.join("Host.exe");
        std::fs::write(&path, file).unwrap();
        path
    }

    #[test]
    fn test_open_maps_text_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_exe(dir.path(), &[0xE8, 0x11, 0x22, 0x33, 0x44]);

        let file = MappedFile::open(&path).unwrap();
        assert_eq!(file.bytes_at(0x1000, 5).unwrap(), &[0xE8, 0x11, 0x22, 0x33, 0x44]);
        assert_eq!(file.headers().sections.len(), 1);

        let image = file.image(0x1_4000_0000, Version::new(1, 0, 0, 0));
        let text = image.require(relpatch::SegmentName::TextX).unwrap();
        assert_eq!(text.address(), 0x1_4000_1000);
        assert_eq!(image.filename(), path.as_path());
    }

    #[test]
    fn test_bytes_at_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let file = MappedFile::open(&write_exe(dir.path(), &[0xC3])).unwrap();
        assert!(file.bytes_at(0x1FFF, 1).is_ok());
        assert!(file.bytes_at(0x1FFF, 2).is_err());
        assert!(file.bytes_at(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_open_rejects_non_pe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"hello").unwrap();
        assert!(MappedFile::open(&path).is_err());
    }
}
