use std::fmt;
use std::ptr::NonNull;

use crate::error::Result;

/// Page protection value, numbered like the Windows `PAGE_*` constants.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Protection(pub u32);

impl Protection {
    pub const NOACCESS: Self = Self(0x01);
    pub const READONLY: Self = Self(0x02);
    pub const READWRITE: Self = Self(0x04);
    pub const WRITECOPY: Self = Self(0x08);
    pub const EXECUTE: Self = Self(0x10);
    pub const EXECUTE_READ: Self = Self(0x20);
    pub const EXECUTE_READWRITE: Self = Self(0x40);
    pub const EXECUTE_WRITECOPY: Self = Self(0x80);

    pub fn is_executable(&self) -> bool {
        self.0 & (0x10 | 0x20 | 0x40 | 0x80) != 0
    }

    pub fn is_writable(&self) -> bool {
        self.0 & (0x04 | 0x08 | 0x40 | 0x80) != 0
    }
}

impl fmt::Debug for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::NOACCESS => "NOACCESS",
            Self::READONLY => "READONLY",
            Self::READWRITE => "READWRITE",
            Self::WRITECOPY => "WRITECOPY",
            Self::EXECUTE => "EXECUTE",
            Self::EXECUTE_READ => "EXECUTE_READ",
            Self::EXECUTE_READWRITE => "EXECUTE_READWRITE",
            Self::EXECUTE_WRITECOPY => "EXECUTE_WRITECOPY",
            _ => return write!(f, "Protection({:#x})", self.0),
        };
        f.write_str(name)
    }
}

/// Page-level primitives the writer and the trampoline are built on.
///
/// The system implementation talks to the OS; tests substitute an in-memory
/// implementation that only tracks protection state.
pub trait MemoryBackend: Send + Sync {
    fn page_size(&self) -> usize;

    /// Change protection of every page touching `[address, address + len)`.
    ///
    /// Returns the protection the first page had before the call.
    fn protect(&self, address: usize, len: usize, protection: Protection) -> Result<Protection>;

    /// Current protection of the page containing `address`.
    fn query(&self, address: usize) -> Result<Protection>;

    /// Reserve and commit `size` bytes of read-write-execute memory, as close to `near`
    /// as the platform allows.
    fn allocate_executable(&self, near: usize, size: usize) -> Result<NonNull<u8>>;

    /// Release memory returned by [`MemoryBackend::allocate_executable`].
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must come from a previous allocation on this backend, and nothing
    /// may execute or reference the region afterwards.
    unsafe fn release(&self, ptr: NonNull<u8>, size: usize);

    fn flush_instructions(&self, _address: usize, _len: usize) {}
}
