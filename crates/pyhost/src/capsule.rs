//! Host values owned by interpreter capsule objects.
//!
//! A capsule keeps a boxed Rust value alive for as long as the interpreter references it, and
//! drops the box from the capsule destructor.

use std::ffi::{CStr, c_void};

use crate::{
    error::Error,
    ffi::{self, ObjectPtr},
    gil::GilGuard,
    object::Owned,
};

/// A type that can live inside a capsule. `NAME` doubles as the capsule's type tag.
pub(crate) trait CapsuleData: Send + Sync + 'static {
    const NAME: &'static CStr;
}

/// Moves `value` into a new capsule.
pub(crate) fn new<'g, T: CapsuleData>(gil: &'g GilGuard<'_>, value: T) -> Result<Owned<'g>, Error> {
    let raw = Box::into_raw(Box::new(value)).cast::<c_void>();
    // SAFETY: GIL held; `T::NAME` is static so it outlives the capsule.
    let capsule = unsafe { (gil.api().PyCapsule_New)(raw, T::NAME.as_ptr(), Some(destroy::<T>)) };
    if capsule.is_null() {
        // SAFETY: the capsule was not created, so the box is still ours.
        drop(unsafe { Box::from_raw(raw.cast::<T>()) });
        return Err(gil.take_error());
    }
    gil.own(capsule)
}

/// Borrows the value inside `capsule` if it is a live `T` capsule.
///
/// Clears the error indicator when it is not, so callers can fall back quietly.
///
/// # Safety
/// The GIL must be held, and the returned reference must not outlive the capsule.
pub(crate) unsafe fn get<'c, T: CapsuleData>(capsule: ObjectPtr) -> Option<&'c T> {
    let api = ffi::api()?;
    // SAFETY: caller holds the GIL.
    unsafe {
        if capsule.is_null() || (api.Py_IsNone)(capsule) != 0 {
            return None;
        }
        let raw = (api.PyCapsule_GetPointer)(capsule, T::NAME.as_ptr());
        if raw.is_null() {
            (api.PyErr_Clear)();
            return None;
        }
        Some(&*raw.cast::<T>())
    }
}

unsafe extern "C" fn destroy<T: CapsuleData>(capsule: ObjectPtr) {
    let Some(api) = ffi::api() else {
        return;
    };
    // SAFETY: the interpreter calls this with the GIL held, once, for a capsule created by `new::<T>`.
    unsafe {
        let raw = (api.PyCapsule_GetPointer)(capsule, T::NAME.as_ptr());
        if raw.is_null() {
            (api.PyErr_Clear)();
        } else {
            drop(Box::from_raw(raw.cast::<T>()));
        }
    }
}
