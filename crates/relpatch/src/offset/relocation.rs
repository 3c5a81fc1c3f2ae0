use std::fmt;
use std::marker::PhantomData;
use std::mem::{MaybeUninit, size_of};
use std::ptr::NonNull;

use tracing::debug;

use super::call::{Args, CallingConvention, FnSignature, ReturnKind, Returnable};
use super::table::{Id, SelectedTable};
use crate::error::{Error, Result};
use crate::image::ProcessImage;
use crate::memory::ProtectedWriter;
use crate::memory::layout::POINTER_SIZE;

/// Raw offset from the image base, resolved on every use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(usize);

impl Offset {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> usize {
        self.0
    }

    pub fn address(&self, image: &ProcessImage) -> usize {
        image.base().wrapping_add(self.0)
    }

    pub const fn add(self, disp: isize) -> Self {
        Self(self.0.wrapping_add_signed(disp))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Typed, non-owning view of an absolute address in the host.
///
/// `T` only describes how the address is meant to be used; nothing is read until one of
/// the accessors is called.
pub struct Relocation<T> {
    address: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Relocation<T> {
    pub const fn new(address: usize) -> Self {
        Self {
            address,
            _marker: PhantomData,
        }
    }

    pub fn from_offset(image: &ProcessImage, offset: Offset) -> Self {
        Self::new(offset.address(image))
    }

    /// Resolve `id` through the table selected for the running build.
    pub fn from_id(image: &ProcessImage, table: &SelectedTable<'_>, id: Id) -> Result<Self> {
        let offset = table.offset(id)?;
        let reloc = Self::from_offset(image, offset);
        debug!(
            "Resolved ID {} to {:#x} (offset {})",
            id, reloc.address, offset
        );
        Ok(reloc)
    }

    /// Same relocation moved by `disp` bytes, e.g. to reach an instruction inside a function.
    pub const fn add(self, disp: isize) -> Self {
        Self::new(self.address.wrapping_add_signed(disp))
    }

    pub const fn address(&self) -> usize {
        self.address
    }

    pub fn offset(&self, image: &ProcessImage) -> usize {
        self.address.wrapping_sub(image.base())
    }

    pub const fn cast<U>(self) -> Relocation<U> {
        Relocation::new(self.address)
    }

    /// The address as a pointer, unchecked.
    pub fn get(&self) -> *mut T {
        self.address as *mut T
    }

    pub fn as_ptr(&self) -> Result<NonNull<T>> {
        NonNull::new(self.get()).ok_or(Error::NullAddress("relocation pointer"))
    }

    /// Read the `T` stored at the address.
    ///
    /// # Safety
    ///
    /// The address must hold a valid, readable `T`.
    pub unsafe fn read(&self) -> Result<T>
    where
        T: Copy,
    {
        let ptr = self.as_ptr()?;
        // SAFETY: forwarded to the caller.
        Ok(unsafe { ptr.as_ptr().read_unaligned() })
    }

    /// Reinterpret the address as a function pointer type `F`.
    ///
    /// # Safety
    ///
    /// `F` must be a function pointer type matching the code at the address.
    pub unsafe fn as_fn<F: Copy>(&self) -> Result<F> {
        const { assert!(size_of::<F>() == size_of::<usize>()) };
        if self.address == 0 {
            return Err(Error::NullAddress("relocation function"));
        }
        // SAFETY: sizes are equal and the caller vouches for the signature.
        Ok(unsafe { std::mem::transmute_copy::<usize, F>(&self.address) })
    }

    /// Call the address as a plain function.
    ///
    /// # Safety
    ///
    /// The address must be a function taking `args` and returning `R`.
    pub unsafe fn invoke<A: Args, R>(&self, args: A) -> Result<R> {
        self.as_ptr()?;
        debug!(
            "Invoking {:#x} as {}",
            self.address,
            FnSignature::function::<A, R>()
        );
        // SAFETY: forwarded to the caller.
        Ok(unsafe { args.call(self.address) })
    }

    /// Call the address as a member function of `receiver` under the host convention.
    ///
    /// # Safety
    ///
    /// The address must be a member function of `C` taking `args` and returning `R`.
    pub unsafe fn invoke_method<C, A: Args, R: Returnable>(
        &self,
        receiver: *mut C,
        args: A,
    ) -> Result<R> {
        // SAFETY: forwarded to the caller.
        unsafe { self.invoke_method_with(&CallingConvention::host(), receiver, args) }
    }

    /// [`Relocation::invoke_method`] under an explicit convention.
    ///
    /// # Safety
    ///
    /// Same requirements as [`Relocation::invoke_method`], with `convention` describing
    /// the callee.
    pub unsafe fn invoke_method_with<C, A: Args, R: Returnable>(
        &self,
        convention: &CallingConvention,
        receiver: *mut C,
        args: A,
    ) -> Result<R> {
        self.as_ptr()?;
        let signature = FnSignature::method::<A, R>(convention);
        debug!(
            "Invoking {:#x} as {} ({})",
            self.address, signature, convention.name
        );

        match signature.ret {
            // SAFETY: forwarded to the caller.
            ReturnKind::Void | ReturnKind::Register => unsafe {
                Ok(args.call_method(self.address, receiver))
            },
            ReturnKind::Indirect { .. } => {
                let mut out = MaybeUninit::<R>::uninit();
                // SAFETY: the callee constructs `R` in `out` and returns where it lives.
                unsafe {
                    let result = args.call_method_indirect(
                        self.address,
                        receiver,
                        out.as_mut_ptr(),
                        convention.hidden_return,
                    );
                    let result = NonNull::new(result).ok_or(Error::NullAddress("call result"))?;
                    Ok(result.as_ptr().read())
                }
            }
        }
    }
}

impl Relocation<usize> {
    fn slot(&self, index: usize) -> Result<usize> {
        self.as_ptr()?;
        Ok(self.address + POINTER_SIZE * index)
    }

    /// Current value of virtual table slot `index`.
    ///
    /// # Safety
    ///
    /// The address must be a virtual table with more than `index` entries.
    pub unsafe fn read_vfunc(&self, index: usize) -> Result<usize> {
        let slot = self.slot(index)?;
        // SAFETY: forwarded to the caller.
        Ok(unsafe { (slot as *const usize).read_unaligned() })
    }

    /// Point virtual table slot `index` at `new` and return what it held before.
    ///
    /// # Safety
    ///
    /// The address must be a virtual table with more than `index` entries, and `new` must
    /// be a function compatible with the slot.
    pub unsafe fn write_vfunc(
        &self,
        writer: &ProtectedWriter,
        index: usize,
        new: usize,
    ) -> Result<usize> {
        let slot = self.slot(index)?;
        // SAFETY: forwarded to the caller.
        unsafe {
            let old = (slot as *const usize).read_unaligned();
            writer.write_value(slot, &new)?;
            debug!(
                "Vtable {:#x}[{}]: {:#x} -> {:#x}",
                self.address, index, old, new
            );
            Ok(old)
        }
    }
}

impl<T> Clone for Relocation<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Relocation<T> {}

impl<T> PartialEq for Relocation<T> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl<T> Eq for Relocation<T> {}

impl<T> fmt::Debug for Relocation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relocation")
            .field("address", &format_args!("{:#x}", self.address))
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}
