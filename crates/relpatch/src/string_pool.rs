//! Read-only view of the host's interned string pool entries.
//!
//! An entry is either a leaf, whose header is followed by the characters, or a shallow
//! entry forwarding to another entry. The header's last word is a length for leaves and a
//! pointer for shallow entries; [`PoolEntry::decode`] tells the two apart from the flags.

use std::ptr::NonNull;

/// In-memory header, `0x18` bytes.
#[repr(C)]
#[derive(Debug)]
pub struct RawEntry {
    pub left: *const RawEntry,
    pub flags: u16,
    pub crc: u16,
    _pad: u32,
    /// Leaf: character count. Shallow: address of the next entry.
    pub link: usize,
}

impl RawEntry {
    pub const SHALLOW: u16 = 1 << 14;
    pub const WIDE: u16 = 1 << 15;
    pub const REF_COUNT_MASK: u16 = 0x3FFF;

    pub const fn leaf(flags: u16, length: u32) -> Self {
        Self {
            left: std::ptr::null(),
            flags: flags & !Self::SHALLOW,
            crc: 0,
            _pad: 0,
            link: length as usize,
        }
    }

    pub fn shallow(flags: u16, next: *const RawEntry) -> Self {
        Self {
            left: std::ptr::null(),
            flags: flags | Self::SHALLOW,
            crc: 0,
            _pad: 0,
            link: next as usize,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Shallow entry forwarding elsewhere; `None` when the pointer is null.
    Next(Option<NonNull<RawEntry>>),
    /// Leaf holding this many characters.
    Length(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Narrow,
    Wide,
}

/// Decoded header of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEntry {
    entry: NonNull<RawEntry>,
    pub width: Width,
    pub ref_count: u16,
    pub crc: u16,
    pub link: Link,
}

impl PoolEntry {
    /// # Safety
    ///
    /// `entry` must be null or point at a live pool entry.
    pub unsafe fn decode(entry: *const RawEntry) -> Option<Self> {
        let entry = NonNull::new(entry.cast_mut())?;
        // SAFETY: forwarded to the caller.
        let raw = unsafe { entry.as_ref() };

        let width = if raw.flags & RawEntry::WIDE != 0 {
            Width::Wide
        } else {
            Width::Narrow
        };
        let link = if raw.flags & RawEntry::SHALLOW != 0 {
            Link::Next(NonNull::new(raw.link as *mut RawEntry))
        } else {
            Link::Length(raw.link as u32)
        };

        Some(Self {
            entry,
            width,
            ref_count: raw.flags & RawEntry::REF_COUNT_MASK,
            crc: raw.crc,
            link,
        })
    }

    pub fn is_shallow(&self) -> bool {
        matches!(self.link, Link::Next(_))
    }

    pub fn address(&self) -> usize {
        self.entry.as_ptr() as usize
    }

    /// Follow shallow links until a leaf, or `None` if a link is null.
    ///
    /// # Safety
    ///
    /// Every entry along the chain must be live.
    pub unsafe fn resolve_leaf(&self) -> Option<PoolEntry> {
        let mut current = *self;
        loop {
            match current.link {
                Link::Length(_) => return Some(current),
                // SAFETY: forwarded to the caller.
                Link::Next(next) => current = unsafe { Self::decode(next?.as_ptr())? },
            }
        }
    }

    /// Character count of the leaf this entry resolves to, 0 if unresolvable.
    ///
    /// # Safety
    ///
    /// Same requirements as [`PoolEntry::resolve_leaf`].
    pub unsafe fn length(&self) -> u32 {
        // SAFETY: forwarded to the caller.
        match unsafe { self.resolve_leaf() } {
            Some(PoolEntry {
                link: Link::Length(len),
                ..
            }) => len,
            _ => 0,
        }
    }

    /// Narrow characters of the resolved leaf; `None` for wide strings.
    ///
    /// # Safety
    ///
    /// Same requirements as [`PoolEntry::resolve_leaf`], and the leaf's characters must
    /// stay alive and unchanged for `'a`.
    pub unsafe fn as_narrow<'a>(&self) -> Option<&'a [u8]> {
        // SAFETY: forwarded to the caller.
        let (data, len) = unsafe { self.leaf_data(Width::Narrow)? };
        // SAFETY: the leaf header is followed by `len` narrow characters.
        Some(unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) })
    }

    /// Wide characters of the resolved leaf; `None` for narrow strings.
    ///
    /// # Safety
    ///
    /// Same requirements as [`PoolEntry::as_narrow`].
    pub unsafe fn as_wide<'a>(&self) -> Option<&'a [u16]> {
        // SAFETY: forwarded to the caller.
        let (data, len) = unsafe { self.leaf_data(Width::Wide)? };
        // SAFETY: the leaf header is followed by `len` wide characters.
        Some(unsafe { std::slice::from_raw_parts(data.cast::<u16>(), len) })
    }

    /// # Safety
    ///
    /// Same requirements as [`PoolEntry::as_narrow`].
    pub unsafe fn to_string_lossy(&self) -> Option<String> {
        // SAFETY: forwarded to the caller.
        unsafe {
            match self.resolve_leaf()?.width {
                Width::Narrow => self
                    .as_narrow()
                    .map(|s| String::from_utf8_lossy(s).into_owned()),
                Width::Wide => self.as_wide().map(String::from_utf16_lossy),
            }
        }
    }

    unsafe fn leaf_data(&self, width: Width) -> Option<(*const u8, usize)> {
        // SAFETY: forwarded to the caller.
        let leaf = unsafe { self.resolve_leaf()? };
        let Link::Length(len) = leaf.link else {
            return None;
        };
        if leaf.width != width {
            return None;
        }
        // SAFETY: characters start right after the header.
        let data = unsafe { leaf.entry.as_ptr().add(1) }.cast::<u8>();
        Some((data.cast_const(), len as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[repr(C)]
    struct NarrowLeaf {
        header: RawEntry,
        data: [u8; 8],
    }

    #[repr(C)]
    struct WideLeaf {
        header: RawEntry,
        data: [u16; 4],
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(size_of::<RawEntry>(), 0x18);
        assert_eq!(offset_of!(RawEntry, flags), 0x08);
        assert_eq!(offset_of!(RawEntry, crc), 0x0A);
        assert_eq!(offset_of!(RawEntry, link), 0x10);
    }

    #[test]
    fn test_narrow_leaf() {
        let leaf = NarrowLeaf {
            header: RawEntry::leaf(3, 5),
            data: *b"hello\0\0\0",
        };
        let entry = unsafe { PoolEntry::decode(&leaf.header) }.unwrap();
        assert!(!entry.is_shallow());
        assert_eq!(entry.ref_count, 3);
        unsafe {
            assert_eq!(entry.length(), 5);
            assert_eq!(entry.as_narrow(), Some(&b"hello"[..]));
            assert_eq!(entry.as_wide(), None);
            assert_eq!(entry.to_string_lossy().as_deref(), Some("hello"));
        }
    }

    #[test]
    fn test_shallow_chain_resolves_to_leaf() {
        let leaf = WideLeaf {
            header: RawEntry::leaf(RawEntry::WIDE | 1, 2),
            data: [u16::from(b'o'), u16::from(b'k'), 0, 0],
        };
        let middle = RawEntry::shallow(0, &leaf.header);
        let top = RawEntry::shallow(2, &middle);

        let entry = unsafe { PoolEntry::decode(&top) }.unwrap();
        assert!(entry.is_shallow());
        unsafe {
            let resolved = entry.resolve_leaf().unwrap();
            assert_eq!(resolved.address(), &leaf.header as *const RawEntry as usize);
            assert_eq!(resolved.width, Width::Wide);
            assert_eq!(entry.length(), 2);
            assert_eq!(entry.as_narrow(), None);
            assert_eq!(entry.to_string_lossy().as_deref(), Some("ok"));
        }
    }

    #[test]
    fn test_null_links() {
        assert!(unsafe { PoolEntry::decode(std::ptr::null()) }.is_none());

        let dangling = RawEntry::shallow(0, std::ptr::null());
        let entry = unsafe { PoolEntry::decode(&dangling) }.unwrap();
        unsafe {
            assert!(entry.resolve_leaf().is_none());
            assert_eq!(entry.length(), 0);
            assert!(entry.as_narrow().is_none());
        }
    }
}
