use std::sync::Arc;

use tracing::trace;

use super::backend::{MemoryBackend, Protection};
use super::system::SystemMemory;
use crate::error::{Error, ProtectStage, Result};

/// The only path through which the engine mutates process memory.
///
/// Each operation makes the target pages read-write-execute, performs the mutation and
/// restores every page to the protection it had before the call. The sequence is not synchronized
/// against other threads executing the bytes being written; callers patch before the
/// host's own threads reach the patched code.
#[derive(Clone)]
pub struct ProtectedWriter {
    backend: Arc<dyn MemoryBackend>,
}

impl ProtectedWriter {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self { backend }
    }

    /// Writer over the current process.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemMemory))
    }

    pub fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    /// Copy `bytes` to `address`.
    ///
    /// # Safety
    ///
    /// `address..address + bytes.len()` must be mapped in this process and no other thread
    /// may be executing or accessing it.
    pub unsafe fn write(&self, address: usize, bytes: &[u8]) -> Result<()> {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.with_unprotected(address, bytes.len(), |dst| {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            })
        }
    }

    /// Set `count` bytes at `address` to `value`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`ProtectedWriter::write`].
    pub unsafe fn fill(&self, address: usize, value: u8, count: usize) -> Result<()> {
        // SAFETY: forwarded to the caller.
        unsafe {
            self.with_unprotected(address, count, |dst| {
                std::ptr::write_bytes(dst, value, count);
            })
        }
    }

    /// Write the in-memory representation of `value`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`ProtectedWriter::write`].
    pub unsafe fn write_value<T: Copy>(&self, address: usize, value: &T) -> Result<()> {
        // SAFETY: `T: Copy` has no drop glue and `value` is valid for its size.
        let bytes = unsafe {
            std::slice::from_raw_parts((value as *const T).cast::<u8>(), std::mem::size_of::<T>())
        };
        unsafe { self.write(address, bytes) }
    }

    /// Write a contiguous sequence of values.
    ///
    /// # Safety
    ///
    /// Same requirements as [`ProtectedWriter::write`].
    pub unsafe fn write_slice<T: Copy>(&self, address: usize, values: &[T]) -> Result<()> {
        // SAFETY: the slice is contiguous and `T: Copy`.
        let bytes = unsafe {
            std::slice::from_raw_parts(values.as_ptr().cast::<u8>(), std::mem::size_of_val(values))
        };
        unsafe { self.write(address, bytes) }
    }

    /// Read a value without changing protection.
    ///
    /// # Safety
    ///
    /// `address` must be readable for `size_of::<T>()` bytes and hold a valid `T`.
    pub unsafe fn read_value<T: Copy>(&self, address: usize) -> Result<T> {
        if address == 0 {
            return Err(Error::NullAddress("read source"));
        }
        // SAFETY: forwarded to the caller.
        Ok(unsafe { std::ptr::read_unaligned(address as *const T) })
    }

    unsafe fn with_unprotected<F>(&self, address: usize, len: usize, mutate: F) -> Result<()>
    where
        F: FnOnce(*mut u8),
    {
        if len == 0 {
            return Ok(());
        }
        if address == 0 {
            return Err(Error::NullAddress("write target"));
        }

        let runs = self.protection_runs(address, len)?;

        self.backend
            .protect(address, len, Protection::EXECUTE_READWRITE)
            .map_err(|e| e.at_stage(ProtectStage::Unprotect))?;

        mutate(address as *mut u8);

        let mut restored = Ok(());
        for run in &runs {
            if let Err(e) = self.backend.protect(run.start, run.len, run.protection) {
                if restored.is_ok() {
                    restored = Err(e.at_stage(ProtectStage::Restore));
                }
            }
        }
        restored?;

        if runs.iter().any(|run| run.protection.is_executable()) {
            self.backend.flush_instructions(address, len);
        }

        trace!(
            "Wrote {} bytes at {:#x} ({} protection run(s), first {:?})",
            len,
            address,
            runs.len(),
            runs[0].protection
        );
        Ok(())
    }

    /// Current protection of `address..address + len`, one entry per stretch of pages that
    /// share it.
    fn protection_runs(&self, address: usize, len: usize) -> Result<Vec<ProtectionRun>> {
        let page = self.backend.page_size().max(1);
        let end = address
            .checked_add(len)
            .ok_or_else(|| Error::ProtectionFailure {
                address,
                len,
                stage: ProtectStage::Query,
                message: "range wraps the address space".to_string(),
            })?;
        let mut runs: Vec<ProtectionRun> = Vec::new();
        let mut start = address;

        while start < end {
            let page_end = (start - start % page).saturating_add(page).min(end);
            let protection = self
                .backend
                .query(start)
                .map_err(|e| e.at_stage(ProtectStage::Query))?;
            match runs.last_mut() {
                Some(run) if run.protection == protection => run.len += page_end - start,
                _ => runs.push(ProtectionRun {
                    start,
                    len: page_end - start,
                    protection,
                }),
            }
            start = page_end;
        }

        Ok(runs)
    }
}

/// Pages of a write target that share one protection.
#[derive(Debug, Clone, Copy)]
struct ProtectionRun {
    start: usize,
    len: usize,
    protection: Protection,
}

impl std::fmt::Debug for ProtectedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedWriter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::mock::MockMemory;

    fn writer_over(buf: &[u8], protection: Protection) -> (ProtectedWriter, Arc<MockMemory>) {
        let mock = Arc::new(MockMemory::new());
        mock.map(buf.as_ptr() as usize, buf.len(), protection);
        (ProtectedWriter::new(mock.clone()), mock)
    }

    #[test]
    fn test_write_restores_protection() {
        let mut buf = vec![0u8; 64];
        let addr = buf.as_mut_ptr() as usize;
        let (writer, mock) = writer_over(&buf, Protection::EXECUTE_READ);

        let before = mock.query(addr).unwrap();
        unsafe { writer.write(addr + 4, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap() };
        let after = mock.query(addr).unwrap();

        assert_eq!(before, after);
        assert_eq!(&buf[4..8], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(mock.protect_calls(), 2);
    }

    #[test]
    fn test_fill() {
        let mut buf = vec![0xAAu8; 16];
        let addr = buf.as_mut_ptr() as usize;
        let (writer, _mock) = writer_over(&buf, Protection::READONLY);

        unsafe { writer.fill(addr + 2, 0x90, 4).unwrap() };
        assert_eq!(&buf[..8], &[0xAA, 0xAA, 0x90, 0x90, 0x90, 0x90, 0xAA, 0xAA]);
    }

    #[test]
    fn test_write_value_and_slice() {
        let mut buf = vec![0u8; 32];
        let addr = buf.as_mut_ptr() as usize;
        let (writer, _mock) = writer_over(&buf, Protection::READWRITE);

        unsafe {
            writer.write_value(addr, &0x1122_3344u32).unwrap();
            writer.write_slice(addr + 8, &[0xABCDu16, 0x0102]).unwrap();
            assert_eq!(writer.read_value::<u32>(addr).unwrap(), 0x1122_3344);
        }
        assert_eq!(&buf[..4], &0x1122_3344u32.to_ne_bytes());
        assert_eq!(&buf[8..10], &0xABCDu16.to_ne_bytes());
        assert_eq!(&buf[10..12], &0x0102u16.to_ne_bytes());
    }

    #[test]
    fn test_unprotect_failure_skips_write() {
        let mut buf = vec![0u8; 8];
        let addr = buf.as_mut_ptr() as usize;
        let (writer, mock) = writer_over(&buf, Protection::EXECUTE_READ);
        mock.deny(addr);

        let err = unsafe { writer.write(addr, &[1, 2, 3, 4]) }.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtectionFailure);
        assert!(matches!(
            err,
            Error::ProtectionFailure {
                stage: ProtectStage::Unprotect,
                ..
            }
        ));
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_restore_failure_reported() {
        let mut buf = vec![0u8; 8];
        let addr = buf.as_mut_ptr() as usize;
        let (writer, mock) = writer_over(&buf, Protection::EXECUTE_READ);
        mock.deny_after(addr, 1);

        let err = unsafe { writer.write(addr, &[9]) }.unwrap_err();
        assert!(matches!(
            err,
            Error::ProtectionFailure {
                stage: ProtectStage::Restore,
                ..
            }
        ));
        assert_eq!(buf[0], 9);
    }

    #[test]
    fn test_write_across_pages_restores_each_page() {
        const PAGE: usize = 0x1000;
        let mut buf = vec![0u8; 3 * PAGE];
        let start = buf.as_mut_ptr() as usize;
        let base = (start + PAGE - 1) & !(PAGE - 1);

        let mock = Arc::new(MockMemory::new());
        mock.map(base, PAGE, Protection::EXECUTE_READ);
        mock.map(base + PAGE, PAGE, Protection::READONLY);
        let writer = ProtectedWriter::new(mock.clone());

        unsafe { writer.write(base + 0xFFE, &[1, 2, 3, 4]).unwrap() };

        assert_eq!(mock.query(base).unwrap(), Protection::EXECUTE_READ);
        assert_eq!(mock.query(base + PAGE).unwrap(), Protection::READONLY);
        let off = base - start + 0xFFE;
        assert_eq!(&buf[off..off + 4], &[1, 2, 3, 4]);
        // one unprotect, one restore per page
        assert_eq!(mock.protect_calls(), 3);
    }

    #[test]
    fn test_write_across_same_protection_pages_restores_once() {
        const PAGE: usize = 0x1000;
        let mut buf = vec![0u8; 3 * PAGE];
        let start = buf.as_mut_ptr() as usize;
        let base = (start + PAGE - 1) & !(PAGE - 1);
        let (writer, mock) = writer_over(&buf, Protection::EXECUTE_READ);

        unsafe { writer.fill(base + PAGE - 2, 0xCC, 4).unwrap() };

        assert_eq!(mock.query(base).unwrap(), Protection::EXECUTE_READ);
        assert_eq!(mock.query(base + PAGE).unwrap(), Protection::EXECUTE_READ);
        assert_eq!(mock.protect_calls(), 2);
    }

    #[test]
    fn test_write_to_unmapped_page_fails_before_mutating() {
        let mut buf = vec![0u8; 8];
        let addr = buf.as_mut_ptr() as usize;
        let writer = ProtectedWriter::new(Arc::new(MockMemory::new()));

        let err = unsafe { writer.write(addr, &[5]) }.unwrap_err();
        assert!(matches!(
            err,
            Error::ProtectionFailure {
                stage: ProtectStage::Query,
                ..
            }
        ));
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn test_null_and_empty_writes() {
        let (writer, _mock) = writer_over(&[0u8; 1], Protection::READWRITE);
        assert!(unsafe { writer.write(0x1234, &[]) }.is_ok());
        assert!(matches!(
            unsafe { writer.write(0, &[1]) },
            Err(Error::NullAddress(_))
        ));
    }
}
