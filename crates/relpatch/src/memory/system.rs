//! Backend that operates on the current process through the OS.

use std::ptr::NonNull;

use super::backend::{MemoryBackend, Protection};
use crate::error::{Error, Result};
#[cfg(target_os = "windows")]
use crate::error::ProtectStage;

#[cfg(target_os = "windows")]
use windows::Win32::System::{
    Diagnostics::Debug::FlushInstructionCache,
    Memory::{
        MEM_COMMIT, MEM_FREE, MEM_RELEASE, MEM_RESERVE, MEMORY_BASIC_INFORMATION,
        PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS, VirtualAlloc, VirtualFree, VirtualProtect,
        VirtualQuery,
    },
    SystemInformation::{GetSystemInfo, SYSTEM_INFO},
    Threading::GetCurrentProcess,
};

/// Allocation granularity used when probing for memory near the image.
#[cfg(target_os = "windows")]
const GRANULARITY: usize = 0x10000;

/// Slightly less than 2 GiB so any address in the window is rel32-reachable.
#[cfg(target_os = "windows")]
const SEARCH_RANGE: usize = 0x7FFF_0000;

/// The current process, as seen by the OS memory manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

#[cfg(target_os = "windows")]
impl SystemMemory {
    fn query_info(address: usize) -> Option<MEMORY_BASIC_INFORMATION> {
        let mut mbi = MEMORY_BASIC_INFORMATION::default();
        // SAFETY: VirtualQuery only inspects the address space.
        let result = unsafe {
            VirtualQuery(
                Some(address as *const _),
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        (result != 0).then_some(mbi)
    }

    fn try_allocate_at(address: usize, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: allocating at a free, granularity-aligned address has no other effect.
        let ptr = unsafe {
            VirtualAlloc(
                Some(address as *const _),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        NonNull::new(ptr.cast::<u8>())
    }

    /// Walk free regions within rel32 reach of `near`, lowest address first.
    fn allocate_near(near: usize, size: usize) -> Option<NonNull<u8>> {
        let low = near.saturating_sub(SEARCH_RANGE).max(GRANULARITY) & !(GRANULARITY - 1);
        let high = near.saturating_add(SEARCH_RANGE);

        let mut address = low;
        while address < high {
            let mbi = Self::query_info(address)?;
            let region_base = mbi.BaseAddress as usize;
            let region_end = region_base + mbi.RegionSize;

            if mbi.State == MEM_FREE {
                let candidate = (region_base + GRANULARITY - 1) & !(GRANULARITY - 1);
                if candidate + size <= region_end && candidate.abs_diff(near) < SEARCH_RANGE {
                    if let Some(ptr) = Self::try_allocate_at(candidate, size) {
                        return Some(ptr);
                    }
                }
            }

            if region_end <= address {
                break;
            }
            address = region_end;
        }

        None
    }
}

#[cfg(target_os = "windows")]
impl MemoryBackend for SystemMemory {
    fn page_size(&self) -> usize {
        let mut info = SYSTEM_INFO::default();
        // SAFETY: GetSystemInfo fills the provided struct.
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    fn protect(&self, address: usize, len: usize, protection: Protection) -> Result<Protection> {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        // SAFETY: changing protection does not touch the bytes themselves.
        unsafe {
            VirtualProtect(
                address as *const _,
                len,
                PAGE_PROTECTION_FLAGS(protection.0),
                &mut old,
            )
        }
        .map_err(|e| Error::ProtectionFailure {
            address,
            len,
            stage: ProtectStage::Unprotect,
            message: e.to_string(),
        })?;

        Ok(Protection(old.0))
    }

    fn query(&self, address: usize) -> Result<Protection> {
        Self::query_info(address)
            .map(|mbi| Protection(mbi.Protect.0))
            .ok_or_else(|| Error::ProtectionFailure {
                address,
                len: 0,
                stage: ProtectStage::Query,
                message: "VirtualQuery failed".to_string(),
            })
    }

    fn allocate_executable(&self, near: usize, size: usize) -> Result<NonNull<u8>> {
        if near != 0 {
            if let Some(ptr) = Self::allocate_near(near, size) {
                return Ok(ptr);
            }
            tracing::warn!("No free region within rel32 range of {:#x}", near);
        }

        // SAFETY: letting the OS choose the address.
        let ptr = unsafe {
            VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE)
        };
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| Error::AllocationFailed {
            size,
            message: windows::core::Error::from_win32().to_string(),
        })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: guaranteed by the caller; MEM_RELEASE requires a zero size.
        if let Err(e) = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) } {
            tracing::warn!("VirtualFree({:p}) failed: {}", ptr, e);
        }
    }

    fn flush_instructions(&self, address: usize, len: usize) {
        // SAFETY: flushing is advisory and never faults.
        let _ = unsafe {
            FlushInstructionCache(GetCurrentProcess(), Some(address as *const _), len)
        };
    }
}

#[cfg(not(target_os = "windows"))]
impl MemoryBackend for SystemMemory {
    fn page_size(&self) -> usize {
        0x1000
    }

    fn protect(&self, _address: usize, _len: usize, _protection: Protection) -> Result<Protection> {
        Err(Error::Unsupported("page protection"))
    }

    fn query(&self, _address: usize) -> Result<Protection> {
        Err(Error::Unsupported("page query"))
    }

    fn allocate_executable(&self, _near: usize, _size: usize) -> Result<NonNull<u8>> {
        Err(Error::Unsupported("executable allocation"))
    }

    unsafe fn release(&self, _ptr: NonNull<u8>, _size: usize) {}
}
