//! In-memory backend for tests.
//!
//! Bytes live in ordinary heap buffers owned by the test; the mock only tracks page
//! protection and hands out executable regions from a pool the test registers.

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::Mutex;

use super::backend::{MemoryBackend, Protection};
use crate::error::{Error, ProtectStage, Result};

const PAGE_SIZE: usize = 0x1000;

#[derive(Default)]
struct MockState {
    pages: BTreeMap<usize, Protection>,
    /// page -> number of protect calls still allowed before failing
    denied: HashMap<usize, usize>,
    pool: Option<(usize, usize)>,
    pool_used: usize,
    protect_calls: usize,
    released: Vec<usize>,
}

#[derive(Default)]
pub struct MockMemory {
    state: Mutex<MockState>,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `[address, address + len)` with the given protection.
    pub fn map(&self, address: usize, len: usize, protection: Protection) {
        let mut state = self.state.lock().unwrap();
        for page in pages(address, len) {
            state.pages.insert(page, protection);
        }
    }

    /// Make every protect call on the page containing `address` fail.
    pub fn deny(&self, address: usize) {
        self.deny_after(address, 0);
    }

    /// Allow `allowed` more protect calls on the page, then fail.
    pub fn deny_after(&self, address: usize, allowed: usize) {
        let mut state = self.state.lock().unwrap();
        state.denied.insert(address / PAGE_SIZE, allowed);
    }

    /// Serve executable allocations from `[address, address + len)`.
    pub fn set_pool(&self, address: usize, len: usize) {
        let mut state = self.state.lock().unwrap();
        state.pool = Some((address, len));
        state.pool_used = 0;
    }

    pub fn protect_calls(&self) -> usize {
        self.state.lock().unwrap().protect_calls
    }

    pub fn released(&self) -> Vec<usize> {
        self.state.lock().unwrap().released.clone()
    }
}

fn pages(address: usize, len: usize) -> impl Iterator<Item = usize> {
    let first = address / PAGE_SIZE;
    let last = (address + len.max(1) - 1) / PAGE_SIZE;
    first..=last
}

impl MemoryBackend for MockMemory {
    fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    fn protect(&self, address: usize, len: usize, protection: Protection) -> Result<Protection> {
        let mut state = self.state.lock().unwrap();
        state.protect_calls += 1;

        let failure = |message: &str| Error::ProtectionFailure {
            address,
            len,
            stage: ProtectStage::Unprotect,
            message: message.to_string(),
        };

        let mut old = None;
        for page in pages(address, len) {
            if let Some(allowed) = state.denied.get_mut(&page) {
                if *allowed == 0 {
                    return Err(failure("access denied"));
                }
                *allowed -= 1;
            }
            let current = *state
                .pages
                .get(&page)
                .ok_or_else(|| failure("page not mapped"))?;
            old.get_or_insert(current);
        }

        for page in pages(address, len) {
            state.pages.insert(page, protection);
        }

        old.ok_or_else(|| failure("empty range"))
    }

    fn query(&self, address: usize) -> Result<Protection> {
        let state = self.state.lock().unwrap();
        state
            .pages
            .get(&(address / PAGE_SIZE))
            .copied()
            .ok_or_else(|| Error::ProtectionFailure {
                address,
                len: 0,
                stage: ProtectStage::Query,
                message: "page not mapped".to_string(),
            })
    }

    fn allocate_executable(&self, _near: usize, size: usize) -> Result<NonNull<u8>> {
        let address = {
            let mut state = self.state.lock().unwrap();
            let (base, len) = state.pool.ok_or_else(|| Error::AllocationFailed {
                size,
                message: "no pool registered".to_string(),
            })?;
            if state.pool_used + size > len {
                return Err(Error::AllocationFailed {
                    size,
                    message: "pool exhausted".to_string(),
                });
            }
            let address = base + state.pool_used;
            state.pool_used += size;
            address
        };

        self.map(address, size, Protection::EXECUTE_READWRITE);
        NonNull::new(address as *mut u8).ok_or(Error::NullAddress("mock pool"))
    }

    unsafe fn release(&self, ptr: NonNull<u8>, _size: usize) {
        self.state.lock().unwrap().released.push(ptr.as_ptr() as usize);
    }
}
