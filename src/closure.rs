//! Owned, arity-specialized closures with call-at-most-once semantics.
//!
//! spec.md §4.8 calls for closure values that can be moved across the C
//! ABI, called exactly once, and safely dropped (deallocating captured
//! environment) without ever invoking the body if they're cancelled before
//! being called. A hand-rolled vtable/trampoline would reimplement exactly
//! what `Box<dyn FnOnce(..) -> R + Send>` already gives for free in safe
//! Rust — dropping a `Box<dyn FnOnce>` deallocates its captured
//! environment without invoking the closure, and calling it consumes the
//! box so a second call is a compile error, not a runtime check. This
//! module is therefore a thin, arity-specialized wrapper around that
//! built-in behavior (documented as an Open Question resolution in
//! DESIGN.md) rather than unsafe hand-rolled vtables; `ffi.rs` is where the
//! arity-erasure the C ABI actually needs happens, at the FFI boundary
//! where it's unavoidable.

use std::fmt;

macro_rules! define_closure {
    ($name:ident, $doc:expr, ($($arg:ident : $ty:ident),*)) => {
        #[doc = $doc]
        pub struct $name<$($ty,)* R> {
            inner: Option<Box<dyn FnOnce($($ty),*) -> R + Send>>,
        }

        impl<$($ty,)* R> $name<$($ty,)* R> {
            pub fn new<F>(f: F) -> Self
            where
                F: FnOnce($($ty),*) -> R + Send + 'static,
            {
                Self { inner: Some(Box::new(f)) }
            }

            /// Call the closure, consuming it. Calling twice is a compile
            /// error (the value is moved), matching "exactly once".
            pub fn call(mut self, $($arg: $ty),*) -> R {
                let f = self.inner.take().expect("closure body missing");
                f($($arg),*)
            }

            /// `true` until the closure is called or dropped.
            pub fn is_armed(&self) -> bool {
                self.inner.is_some()
            }
        }

        impl<$($ty,)* R> fmt::Debug for $name<$($ty,)* R> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("armed", &self.is_armed())
                    .finish()
            }
        }
    };
}

define_closure!(Closure0, "A zero-argument owned closure.", ());
define_closure!(Closure1, "A one-argument owned closure.", (a: A));
define_closure!(Closure2, "A two-argument owned closure.", (a: A, b: B));
define_closure!(Closure3, "A three-argument owned closure.", (a: A, b: B, c: C));
