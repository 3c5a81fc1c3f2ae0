//! Executable scratch region for call-site and jump redirection.
//!
//! Stubs are bump-allocated and never freed individually. An owned region is released
//! when the trampoline is dropped; a region adopted from the host loader is left alone.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::memory::{MemoryBackend, ProtectedWriter};
use crate::memory::layout::{
    DISP_SIZE, POINTER_SIZE, abs_jump, displacement, filler, indirect, rel32,
    resolve_displacement,
};
use crate::offset::Pattern;

/// What a redirected instruction used to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalCall {
    /// Address of the patched instruction
    pub site: usize,
    /// Absolute address the instruction reached before patching
    pub target: usize,
    /// Displacement the instruction held before patching
    pub displacement: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchKind {
    Call,
    Jump,
}

impl BranchKind {
    fn rel32_opcode(self) -> u8 {
        match self {
            Self::Call => rel32::CALL,
            Self::Jump => rel32::JMP,
        }
    }

    fn indirect_modrm(self) -> u8 {
        match self {
            Self::Call => indirect::CALL_MODRM,
            Self::Jump => indirect::JMP_MODRM,
        }
    }

    fn site_pattern(self, size: usize) -> Pattern {
        let mut bytes = Vec::with_capacity(size);
        if size == rel32::SIZE {
            bytes.push(Some(self.rel32_opcode()));
        } else {
            bytes.push(Some(indirect::OPCODE));
            bytes.push(Some(self.indirect_modrm()));
        }
        bytes.resize(size, None);
        Pattern::from_bytes(&bytes)
    }
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Call => f.write_str("call"),
            Self::Jump => f.write_str("jmp"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Region {
    base: usize,
    capacity: usize,
    owned: bool,
}

pub struct Trampoline {
    name: String,
    writer: ProtectedWriter,
    region: Option<Region>,
    used: usize,
    /// target -> absolute jump stub
    jump_stubs: HashMap<usize, usize>,
    /// target -> pointer slot
    pointer_slots: HashMap<usize, usize>,
}

impl Trampoline {
    /// An empty trampoline; give it memory with [`Trampoline::create`] or
    /// [`Trampoline::set_external`].
    pub fn new(name: impl Into<String>, writer: ProtectedWriter) -> Self {
        Self {
            name: name.into(),
            writer,
            region: None,
            used: 0,
            jump_stubs: HashMap::new(),
            pointer_slots: HashMap::new(),
        }
    }

    /// Allocate and own `capacity` bytes of executable memory within rel32 reach of `near`.
    pub fn create(&mut self, capacity: usize, near: usize) -> Result<()> {
        if capacity == 0 {
            return Err(Error::AllocationFailed {
                size: 0,
                message: "zero-sized trampoline".to_string(),
            });
        }

        let ptr = self.writer.backend().allocate_executable(near, capacity)?;
        let base = ptr.as_ptr() as usize;
        // SAFETY: the region was just allocated for us and nothing references it yet.
        unsafe { self.writer.fill(base, filler::INT3, capacity)? };

        self.adopt(Region {
            base,
            capacity,
            owned: true,
        });
        info!(
            "{}: allocated {} bytes of trampoline space at {:#x}",
            self.name, capacity, base
        );
        Ok(())
    }

    /// Use a buffer supplied by someone else, typically the host loader's branch pool.
    ///
    /// # Safety
    ///
    /// `buffer..buffer + capacity` must be executable memory reserved for this trampoline
    /// that outlives it. It is never freed from here.
    pub unsafe fn set_external(&mut self, buffer: usize, capacity: usize) -> Result<()> {
        if buffer == 0 {
            return Err(Error::NullAddress("trampoline buffer"));
        }
        self.adopt(Region {
            base: buffer,
            capacity,
            owned: false,
        });
        info!(
            "{}: using {} bytes of external trampoline space at {:#x}",
            self.name, capacity, buffer
        );
        Ok(())
    }

    fn adopt(&mut self, region: Region) {
        self.release();
        self.region = Some(region);
        self.used = 0;
        self.jump_stubs.clear();
        self.pointer_slots.clear();
    }

    /// Free an owned region, unless stubs were placed in it.
    ///
    /// Redirected sites keep jumping into a used region for the life of the process, so
    /// such a region is left mapped.
    fn release(&mut self) {
        let Some(region) = self.region.take() else {
            return;
        };
        if !region.owned {
            return;
        }
        if self.used > 0 {
            debug!(
                "{}: keeping trampoline at {:#x} mapped ({} bytes of live stubs)",
                self.name, region.base, self.used
            );
            return;
        }
        if let Some(ptr) = std::ptr::NonNull::new(region.base as *mut u8) {
            debug!("{}: releasing trampoline at {:#x}", self.name, region.base);
            // SAFETY: we allocated the region and nothing was ever placed in it.
            unsafe { self.writer.backend().release(ptr, region.capacity) };
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> Option<usize> {
        self.region.map(|r| r.base)
    }

    pub fn capacity(&self) -> usize {
        self.region.map_or(0, |r| r.capacity)
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.capacity() - self.used
    }

    pub fn is_owned(&self) -> bool {
        self.region.is_some_and(|r| r.owned)
    }

    /// Reserve `size` bytes and return their address.
    pub fn allocate(&mut self, size: usize) -> Result<usize> {
        let address = self.next_address(size)?;
        self.used += size;
        debug!(
            "{}: allocated {} bytes at {:#x} ({}/{} used)",
            self.name,
            size,
            address,
            self.used,
            self.capacity()
        );
        Ok(address)
    }

    /// Address the next `size`-byte allocation would get, without taking it.
    fn next_address(&self, size: usize) -> Result<usize> {
        let region = self.region.ok_or(Error::CapacityExhausted {
            requested: size,
            remaining: 0,
            capacity: 0,
        })?;

        if size > self.remaining() {
            return Err(Error::CapacityExhausted {
                requested: size,
                remaining: self.remaining(),
                capacity: region.capacity,
            });
        }

        Ok(region.base + self.used)
    }

    /// Redirect the call at `site` to `target` and return the original call.
    ///
    /// `N = 5` expects `E8 rel32`, `N = 6` expects `FF 15 disp32`.
    ///
    /// # Safety
    ///
    /// `site` must be mapped code that no other thread is executing, and `target` must be
    /// a function compatible with the original callee.
    pub unsafe fn write_call<const N: usize>(
        &mut self,
        site: usize,
        target: usize,
    ) -> Result<OriginalCall> {
        const { assert!(N == 5 || N == 6, "call sites are 5 or 6 bytes") };
        // SAFETY: forwarded to the caller.
        unsafe { self.redirect(BranchKind::Call, N, site, target) }
    }

    /// Redirect the jump at `site` to `target` and return the original jump.
    ///
    /// `N = 5` expects `E9 rel32`, `N = 6` expects `FF 25 disp32`.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Trampoline::write_call`].
    pub unsafe fn write_branch<const N: usize>(
        &mut self,
        site: usize,
        target: usize,
    ) -> Result<OriginalCall> {
        const { assert!(N == 5 || N == 6, "branch sites are 5 or 6 bytes") };
        // SAFETY: forwarded to the caller.
        unsafe { self.redirect(BranchKind::Jump, N, site, target) }
    }

    unsafe fn redirect(
        &mut self,
        kind: BranchKind,
        size: usize,
        site: usize,
        target: usize,
    ) -> Result<OriginalCall> {
        // SAFETY: the caller guarantees `site` is mapped code.
        unsafe { kind.site_pattern(size).verify(site)? };

        let disp_at = site + size - DISP_SIZE;
        let end = site + size;
        // SAFETY: the pattern above covered the displacement bytes.
        let old_disp: i32 = unsafe { self.writer.read_value(disp_at)? };
        let old_dest = resolve_displacement(end, old_disp);

        let (original, existing, needed) = if size == rel32::SIZE {
            (old_dest, self.jump_stubs.get(&target).copied(), abs_jump::SIZE)
        } else {
            // SAFETY: a RIP-relative indirect branch reads its target from `old_dest`.
            let original: usize = unsafe { self.writer.read_value(old_dest)? };
            (original, self.pointer_slots.get(&target).copied(), POINTER_SIZE)
        };

        // Range-check against where the stub will live before spending space on it.
        let via = match existing {
            Some(via) => via,
            None => self.next_address(needed)?,
        };
        let new_disp = displacement(end, via).ok_or(Error::DisplacementOutOfRange {
            from: end,
            to: via,
        })?;

        let placed = if size == rel32::SIZE {
            self.jump_stub(target)?
        } else {
            self.pointer_slot(target)?
        };
        debug_assert_eq!(placed, via);

        // SAFETY: forwarded to the caller.
        unsafe { self.writer.write_value(disp_at, &new_disp)? };

        info!(
            "{}: {} at {:#x} now reaches {:#x} via {:#x} (was {:#x})",
            self.name, kind, site, target, via, original
        );
        Ok(OriginalCall {
            site,
            target: original,
            displacement: old_disp,
        })
    }

    /// `jmp [rip+0]; dq target`, shared by every site redirected to `target`.
    fn jump_stub(&mut self, target: usize) -> Result<usize> {
        if let Some(&stub) = self.jump_stubs.get(&target) {
            return Ok(stub);
        }

        let stub = self.allocate(abs_jump::SIZE)?;
        let mut code = [0u8; abs_jump::SIZE];
        code[..abs_jump::PREFIX.len()].copy_from_slice(&abs_jump::PREFIX);
        code[abs_jump::PREFIX.len()..].copy_from_slice(&(target as u64).to_le_bytes());
        // SAFETY: `stub` was just carved out of our executable region.
        unsafe { self.writer.write(stub, &code)? };

        self.jump_stubs.insert(target, stub);
        Ok(stub)
    }

    /// Pointer-sized slot holding `target`, shared by every site redirected to it.
    fn pointer_slot(&mut self, target: usize) -> Result<usize> {
        if let Some(&slot) = self.pointer_slots.get(&target) {
            return Ok(slot);
        }

        let slot = self.allocate(POINTER_SIZE)?;
        // SAFETY: `slot` was just carved out of our executable region.
        unsafe { self.writer.write_value(slot, &target)? };

        self.pointer_slots.insert(target, slot);
        Ok(slot)
    }
}

impl Drop for Trampoline {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Trampoline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trampoline")
            .field("name", &self.name)
            .field("base", &self.base().map(|b| format!("{:#x}", b)))
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .field("owned", &self.is_owned())
            .finish()
    }
}
