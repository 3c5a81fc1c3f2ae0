//! Calling an address resolved at runtime.
//!
//! Plain functions are called through an `extern "C"` pointer and the compiler applies the
//! platform ABI. Member functions differ from C functions in one way that matters here:
//! where the hidden result pointer goes when the return value does not come back in a
//! register. [`CallingConvention`] describes that per platform and [`FnSignature`] records
//! the decision for a given call.

use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

/// Types that can come back from a called address.
///
/// `TRIVIAL` is false for types the callee constructs in place (anything with a
/// destructor, copy constructor or vtable on the callee's side); those are always returned
/// through a hidden pointer.
pub trait Returnable {
    const TRIVIAL: bool;
}

macro_rules! trivially_returnable {
    ($($ty:ty),* $(,)?) => {
        $(impl Returnable for $ty {
            const TRIVIAL: bool = true;
        })*
    };
}

trivially_returnable!(
    (), bool, u8, i8, u16, i16, u32, i32, u64, i64, u128, i128, usize, isize, f32, f64
);

impl<T> Returnable for *const T {
    const TRIVIAL: bool = true;
}

impl<T> Returnable for *mut T {
    const TRIVIAL: bool = true;
}

impl<T> Returnable for Option<NonNull<T>> {
    const TRIVIAL: bool = true;
}

/// Where a hidden result pointer is passed relative to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiddenReturn {
    /// `f(this, out, args...)`
    AfterReceiver,
    /// `f(out, this, args...)`
    BeforeReceiver,
}

/// How a value comes back from a member call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnKind {
    Void,
    Register,
    Indirect { size: usize },
}

/// Per-platform rules for member-function returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallingConvention {
    pub name: &'static str,
    /// Sizes a trivially copyable value may have and still be returned in registers
    pub register_return_sizes: &'static [usize],
    pub hidden_return: HiddenReturn,
}

impl CallingConvention {
    /// Microsoft x64
    pub const WIN64: Self = Self {
        name: "win64",
        register_return_sizes: &[1, 2, 4, 8],
        hidden_return: HiddenReturn::AfterReceiver,
    };

    /// System V AMD64 with the Itanium C++ ABI
    pub const SYSV64: Self = Self {
        name: "sysv64",
        register_return_sizes: &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16],
        hidden_return: HiddenReturn::BeforeReceiver,
    };

    /// Convention of the platform this crate is compiled for.
    pub const fn host() -> Self {
        if cfg!(target_os = "windows") {
            Self::WIN64
        } else {
            Self::SYSV64
        }
    }

    pub fn classify(&self, size: usize, trivial: bool) -> ReturnKind {
        if size == 0 {
            ReturnKind::Void
        } else if trivial && self.register_return_sizes.contains(&size) {
            ReturnKind::Register
        } else {
            ReturnKind::Indirect { size }
        }
    }

    pub fn return_kind<R: Returnable>(&self) -> ReturnKind {
        self.classify(size_of::<R>(), R::TRIVIAL)
    }
}

/// Shape of one call, decided before the call is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FnSignature {
    pub receiver: bool,
    pub params: usize,
    pub ret: ReturnKind,
}

impl FnSignature {
    pub fn function<A: Args, R>() -> Self {
        Self {
            receiver: false,
            params: A::COUNT,
            ret: if size_of::<R>() == 0 {
                ReturnKind::Void
            } else {
                ReturnKind::Register
            },
        }
    }

    pub fn method<A: Args, R: Returnable>(convention: &CallingConvention) -> Self {
        Self {
            receiver: true,
            params: A::COUNT,
            ret: convention.return_kind::<R>(),
        }
    }

    /// Arguments actually passed, receiver and hidden pointer included.
    pub fn arity(&self) -> usize {
        let hidden = matches!(self.ret, ReturnKind::Indirect { .. }) && self.receiver;
        self.params + usize::from(self.receiver) + usize::from(hidden)
    }
}

impl fmt::Display for FnSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let receiver = if self.receiver { "this, " } else { "" };
        let ret = match self.ret {
            ReturnKind::Void => "void".to_string(),
            ReturnKind::Register => "reg".to_string(),
            ReturnKind::Indirect { size } => format!("out[{}]", size),
        };
        write!(f, "fn({}{} args) -> {}", receiver, self.params, ret)
    }
}

/// Argument tuples that can be passed to a raw address.
///
/// Implemented for tuples of up to six elements. Every element is passed as-is under the
/// C calling convention, so elements should be FFI-safe.
pub trait Args: Sized {
    const COUNT: usize;

    /// # Safety
    ///
    /// `address` must be a function taking exactly these arguments and returning `R`.
    unsafe fn call<R>(self, address: usize) -> R;

    /// # Safety
    ///
    /// `address` must take `receiver` followed by these arguments and return `R` in
    /// registers.
    unsafe fn call_method<C, R>(self, address: usize, receiver: *mut C) -> R;

    /// # Safety
    ///
    /// `address` must take the receiver and `out` in the order `hidden` describes, then
    /// these arguments, and return a pointer to the constructed `R`.
    unsafe fn call_method_indirect<C, R>(
        self,
        address: usize,
        receiver: *mut C,
        out: *mut R,
        hidden: HiddenReturn,
    ) -> *mut R;
}

macro_rules! count {
    () => { 0 };
    ($head:ident $($tail:ident)*) => { 1 + count!($($tail)*) };
}

macro_rules! impl_args {
    ($($ty:ident $arg:ident),*) => {
        impl<$($ty),*> Args for ($($ty,)*) {
            const COUNT: usize = count!($($ty)*);

            unsafe fn call<R>(self, address: usize) -> R {
                let ($($arg,)*) = self;
                // SAFETY: the caller vouches for the signature at `address`.
                unsafe {
                    let f: unsafe extern "C" fn($($ty),*) -> R =
                        std::mem::transmute_copy(&address);
                    f($($arg),*)
                }
            }

            unsafe fn call_method<C, R>(self, address: usize, receiver: *mut C) -> R {
                let ($($arg,)*) = self;
                // SAFETY: the caller vouches for the signature at `address`.
                unsafe {
                    let f: unsafe extern "C" fn(*mut C, $($ty),*) -> R =
                        std::mem::transmute_copy(&address);
                    f(receiver, $($arg),*)
                }
            }

            unsafe fn call_method_indirect<C, R>(
                self,
                address: usize,
                receiver: *mut C,
                out: *mut R,
                hidden: HiddenReturn,
            ) -> *mut R {
                let ($($arg,)*) = self;
                // SAFETY: the caller vouches for the signature at `address`; both
                // parameter orders are pointer-sized.
                unsafe {
                    match hidden {
                        HiddenReturn::AfterReceiver => {
                            let f: unsafe extern "C" fn(*mut C, *mut R, $($ty),*) -> *mut R =
                                std::mem::transmute_copy(&address);
                            f(receiver, out, $($arg),*)
                        }
                        HiddenReturn::BeforeReceiver => {
                            let f: unsafe extern "C" fn(*mut R, *mut C, $($ty),*) -> *mut R =
                                std::mem::transmute_copy(&address);
                            f(out, receiver, $($arg),*)
                        }
                    }
                }
            }
        }
    };
}

impl_args!();
impl_args!(A a);
impl_args!(A a, B b);
impl_args!(A a, B b, C2 c);
impl_args!(A a, B b, C2 c, D d);
impl_args!(A a, B b, C2 c, D d, E e);
impl_args!(A a, B b, C2 c, D d, E e, F f2);

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Big {
        a: u64,
        b: u64,
        c: u64,
    }

    impl Returnable for Big {
        const TRIVIAL: bool = true;
    }

    struct Tracked(u32);

    impl Drop for Tracked {
        fn drop(&mut self) {}
    }

    impl Returnable for Tracked {
        const TRIVIAL: bool = false;
    }

    #[test]
    fn test_win64_classification() {
        let cc = CallingConvention::WIN64;
        assert_eq!(cc.return_kind::<()>(), ReturnKind::Void);
        assert_eq!(cc.return_kind::<bool>(), ReturnKind::Register);
        assert_eq!(cc.return_kind::<u64>(), ReturnKind::Register);
        assert_eq!(cc.return_kind::<*mut u8>(), ReturnKind::Register);
        assert_eq!(cc.return_kind::<u128>(), ReturnKind::Indirect { size: 16 });
        assert_eq!(cc.return_kind::<Big>(), ReturnKind::Indirect { size: 24 });
        assert_eq!(cc.return_kind::<Tracked>(), ReturnKind::Indirect { size: 4 });
        assert_eq!(cc.classify(3, true), ReturnKind::Indirect { size: 3 });
    }

    #[test]
    fn test_sysv_classification() {
        let cc = CallingConvention::SYSV64;
        assert_eq!(cc.return_kind::<u128>(), ReturnKind::Register);
        assert_eq!(cc.return_kind::<Big>(), ReturnKind::Indirect { size: 24 });
        assert_eq!(cc.return_kind::<Tracked>(), ReturnKind::Indirect { size: 4 });
    }

    #[test]
    fn test_signature_arity() {
        let sig = FnSignature::method::<(u32, u32), Big>(&CallingConvention::WIN64);
        assert_eq!(sig.arity(), 4);
        assert_eq!(sig.to_string(), "fn(this, 2 args) -> out[24]");

        let sig = FnSignature::method::<(), bool>(&CallingConvention::WIN64);
        assert_eq!(sig.arity(), 1);

        let sig = FnSignature::function::<(i32, i32, i32), ()>();
        assert_eq!(sig.arity(), 3);
        assert_eq!(sig.ret, ReturnKind::Void);
    }

    extern "C" fn add3(a: i32, b: i32, c: i32) -> i32 {
        a + b + c
    }

    #[test]
    fn test_direct_call() {
        let result: i32 = unsafe { (1, 2, 3).call(add3 as usize) };
        assert_eq!(result, 6);
    }

    extern "C" fn fill_after(this: *mut u64, out: *mut Big, x: u64) -> *mut Big {
        unsafe {
            out.write(Big {
                a: *this,
                b: x,
                c: *this + x,
            });
        }
        out
    }

    extern "C" fn fill_before(out: *mut Big, this: *mut u64, x: u64) -> *mut Big {
        fill_after(this, out, x)
    }

    #[test]
    fn test_indirect_orders() {
        let mut receiver = 40u64;
        for (address, hidden) in [
            (fill_after as usize, HiddenReturn::AfterReceiver),
            (fill_before as usize, HiddenReturn::BeforeReceiver),
        ] {
            let mut out = std::mem::MaybeUninit::<Big>::uninit();
            let ptr = unsafe {
                (2u64,).call_method_indirect(address, &mut receiver, out.as_mut_ptr(), hidden)
            };
            assert_eq!(ptr, out.as_mut_ptr());
            let big = unsafe { out.assume_init() };
            assert_eq!((big.a, big.b, big.c), (40, 2, 42));
        }
    }
}
