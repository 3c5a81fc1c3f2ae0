//! Discovery of the host executable: base address, build version and named segments.

pub mod pe;
mod segment;

use std::path::{Path, PathBuf};

use strum::{EnumCount, IntoEnumIterator};
use tracing::debug;

use crate::error::{Error, Result};
use crate::version::Version;
pub use pe::{PeHeaders, SectionHeader};
pub use segment::{Segment, SegmentName};

/// The executable image this process was started from.
///
/// Built once at attach time and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct ProcessImage {
    base: usize,
    size: usize,
    version: Version,
    filename: PathBuf,
    segments: [Segment; SegmentName::COUNT],
}

impl ProcessImage {
    /// Attach to the executable of the current process.
    #[cfg(target_os = "windows")]
    pub fn attach() -> Result<Self> {
        let (base, path) = platform::module_handle()?;
        let version = platform::file_version(&path)?;
        let filename = path.file_name().map(PathBuf::from).unwrap_or(path.clone());

        // SAFETY: `base` is the handle of our own, fully loaded executable.
        let mut image = unsafe { Self::from_mapped(base, version)? };
        image.filename = filename;
        tracing::info!(
            "Attached to {} {} at {:#x}",
            image.filename.display(),
            image.version,
            image.base
        );
        Ok(image)
    }

    #[cfg(not(target_os = "windows"))]
    pub fn attach() -> Result<Self> {
        Err(Error::Unsupported("attaching to the host executable"))
    }

    /// Build an image description from a PE mapped at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at a PE image laid out as the loader maps it, whose header pages
    /// stay readable for the duration of the call.
    pub unsafe fn from_mapped(base: usize, version: Version) -> Result<Self> {
        // SAFETY: forwarded to the caller.
        let headers = unsafe { PeHeaders::from_mapped(base)? };
        Ok(Self::from_headers(base, version, &headers))
    }

    /// Build an image description from already parsed headers.
    pub fn from_headers(base: usize, version: Version, headers: &PeHeaders) -> Self {
        let segments = load_segments(base, &headers.sections);
        for name in SegmentName::iter() {
            let seg = segments[name.index()];
            if seg.is_present() {
                debug!(
                    "Segment {:<6} {:#x}..{:#x} ({:#x} bytes)",
                    name,
                    seg.address(),
                    seg.end(),
                    seg.size()
                );
            }
        }

        Self {
            base,
            size: headers.size_of_image as usize,
            version,
            filename: PathBuf::new(),
            segments,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<PathBuf>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn base(&self) -> usize {
        self.base
    }

    /// `SizeOfImage` from the optional header.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Copy of the recorded segment; zero-valued when the image has no such section.
    pub fn segment(&self, name: SegmentName) -> Segment {
        self.segments[name.index()]
    }

    /// The segment, or a layout error when the image does not have it.
    pub fn require(&self, name: SegmentName) -> Result<Segment> {
        let seg = self.segment(name);
        if seg.is_present() {
            Ok(seg)
        } else {
            Err(Error::SegmentMissing(name))
        }
    }

    /// First recorded segment containing `address`.
    pub fn segment_of(&self, address: usize) -> Option<(SegmentName, Segment)> {
        SegmentName::iter()
            .map(|name| (name, self.segment(name)))
            .find(|(_, seg)| seg.contains(address))
    }

    /// Present segments in table order.
    pub fn segments(&self) -> impl Iterator<Item = (SegmentName, Segment)> + '_ {
        SegmentName::iter()
            .map(|name| (name, self.segment(name)))
            .filter(|(_, seg)| seg.is_present())
    }

    pub fn contains(&self, address: usize) -> bool {
        (self.base..self.base + self.size).contains(&address)
    }
}

/// Assign sections to the expected segment table.
///
/// Each section lands in the first expected segment it satisfies that is still empty;
/// sections that satisfy nothing are ignored.
fn load_segments(base: usize, sections: &[SectionHeader]) -> [Segment; SegmentName::COUNT] {
    let mut segments = [Segment::default(); SegmentName::COUNT];
    for section in sections {
        let slot = SegmentName::iter().find(|name| {
            !segments[name.index()].is_present()
                && name.matches(&section.name, section.characteristics)
        });
        if let Some(name) = slot {
            segments[name.index()] = Segment::new(
                base,
                base + section.virtual_address as usize,
                section.virtual_size as usize,
            );
        }
    }
    segments
}

#[cfg(target_os = "windows")]
mod platform {
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use std::path::{Path, PathBuf};

    use windows::Win32::Foundation::HMODULE;
    use windows::Win32::Storage::FileSystem::{
        GetFileVersionInfoSizeW, GetFileVersionInfoW, VerQueryValueW,
    };
    use windows::Win32::System::LibraryLoader::{GetModuleFileNameW, GetModuleHandleW};
    use windows::core::{PCWSTR, w};

    use crate::error::{Error, Result};
    use crate::version::Version;

    const MAX_PATH_LEN: usize = 4096;

    pub fn module_handle() -> Result<(usize, PathBuf)> {
        // SAFETY: a null name asks for the executable of the calling process.
        let handle: HMODULE = unsafe { GetModuleHandleW(PCWSTR::null()) }
            .map_err(|e| Error::ModuleHandle(e.to_string()))?;
        if handle.is_invalid() {
            return Err(Error::ModuleHandle("null module handle".to_string()));
        }

        let mut buf = vec![0u16; MAX_PATH_LEN];
        // SAFETY: the buffer is writable for its whole length.
        let len = unsafe { GetModuleFileNameW(handle, &mut buf) } as usize;
        if len == 0 {
            return Err(Error::ModuleHandle(
                windows::core::Error::from_win32().to_string(),
            ));
        }
        let path = PathBuf::from(std::ffi::OsString::from_wide(&buf[..len]));
        Ok((handle.0 as usize, path))
    }

    pub fn file_version(path: &Path) -> Result<Version> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        let name = PCWSTR(wide.as_ptr());
        let failed = || Error::VersionInfo(path.display().to_string());

        // SAFETY: `name` is NUL-terminated and outlives the call.
        let size = unsafe { GetFileVersionInfoSizeW(name, None) } as usize;
        if size == 0 {
            return Err(failed());
        }

        let mut block = vec![0u8; size];
        // SAFETY: `block` is writable for `size` bytes.
        unsafe { GetFileVersionInfoW(name, 0, size as u32, block.as_mut_ptr().cast()) }
            .map_err(|_| failed())?;

        let mut value: *mut std::ffi::c_void = std::ptr::null_mut();
        let mut value_len = 0u32;
        // SAFETY: `block` holds the version resource read above.
        let found = unsafe {
            VerQueryValueW(
                block.as_ptr().cast(),
                w!("\\StringFileInfo\\040904B0\\ProductVersion"),
                &mut value,
                &mut value_len,
            )
        };
        if !found.as_bool() || value.is_null() {
            return Err(failed());
        }

        // SAFETY: VerQueryValueW returned `value_len` UTF-16 units inside `block`.
        let units =
            unsafe { std::slice::from_raw_parts(value as *const u16, value_len as usize) };
        let text = String::from_utf16_lossy(units);
        Version::parse(text.trim_end_matches('\0')).map_err(|_| failed())
    }
}
