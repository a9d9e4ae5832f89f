//! GIL acquisition for host threads.
//!
//! Every host thread that touches the interpreter gets one persistent `PyThreadState`, created
//! on first use and reused forever after. Creating and destroying a thread state per acquisition
//! would discard thread-local interpreter state between calls, and mixing the
//! `PyGILState_*` API with explicit thread states is unreliable in embedded interpreters.
//!
//! [`GilGuard`] is re-entrant per thread: nested guards only bump a thread-local depth, and only
//! the outermost guard restores and saves the thread state.

use std::{
    cell::Cell,
    collections::HashMap,
    ffi::{CStr, c_int},
    marker::PhantomData,
    ptr::NonNull,
    sync::{Mutex, PoisonError},
    thread::{self, ThreadId},
};

use crate::{
    error::Error,
    exception,
    ffi::{InterpreterRaw, ObjectPtr, PyApi, PySsize, ThreadStateRaw},
    object::{Owned, PyObject},
    python::Shared,
};

thread_local! {
    /// How many live guards this thread holds.
    static GIL_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// `PyInterpreterState *`, only passed back to `PyThreadState_New`.
pub(crate) struct InterpreterHandle(pub(crate) InterpreterRaw);

// SAFETY: the interpreter state pointer is never dereferenced on the Rust side.
unsafe impl Send for InterpreterHandle {}
// SAFETY: as above.
unsafe impl Sync for InterpreterHandle {}

struct ThreadStateHandle(NonNull<std::ffi::c_void>);

// SAFETY: a thread state is only ever restored by the thread it was created for.
unsafe impl Send for ThreadStateHandle {}

/// Persistent thread states keyed by host thread.
#[derive(Default)]
pub(crate) struct ThreadStates {
    states: Mutex<HashMap<ThreadId, ThreadStateHandle>>,
}

impl ThreadStates {
    /// Records the thread state of the thread that started the interpreter.
    pub(crate) fn register_current(&self, state: ThreadStateRaw) {
        if let Some(state) = NonNull::new(state) {
            self.lock().insert(thread::current().id(), ThreadStateHandle(state));
        }
    }

    /// Returns this thread's state, calling `create` for a new one on first use.
    ///
    /// The map lock is never held while waiting for the GIL.
    fn for_current_thread(&self, create: impl FnOnce() -> ThreadStateRaw) -> Result<ThreadStateRaw, Error> {
        let id = thread::current().id();
        let mut states = self.lock();
        if let Some(state) = states.get(&id) {
            return Ok(state.0.as_ptr());
        }
        let state = NonNull::new(create())
            .ok_or_else(|| Error::Bridge(format!("could not create a Python thread state for {id:?}")))?;
        log::debug!("created Python thread state for {id:?}");
        states.insert(id, ThreadStateHandle(state));
        Ok(state.as_ptr())
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ThreadId, ThreadStateHandle>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof that the current thread holds the GIL.
///
/// Not `Send`: the GIL belongs to the thread that acquired it.
pub(crate) struct GilGuard<'py> {
    shared: &'py Shared,
    outermost: bool,
    _not_send: PhantomData<*mut ()>,
}

impl<'py> GilGuard<'py> {
    /// Blocks until this thread holds the GIL.
    ///
    /// Fails only if this thread has no thread state yet and the interpreter cannot create one.
    pub(crate) fn acquire(shared: &'py Shared) -> Result<Self, Error> {
        let depth = GIL_DEPTH.get();
        if depth == 0 {
            let state = shared.thread_states.for_current_thread(|| {
                // SAFETY: PyThreadState_New does not require the GIL and the interpreter is live.
                unsafe { (shared.api.PyThreadState_New)(shared.interpreter.0) }
            })?;
            // SAFETY: `state` is non-null, belongs to this thread and is not active on any thread.
            unsafe { (shared.api.PyEval_RestoreThread)(state) };
        }
        GIL_DEPTH.set(depth + 1);
        Ok(Self {
            shared,
            outermost: depth == 0,
            _not_send: PhantomData,
        })
    }

    pub(crate) fn api(&self) -> &'static PyApi {
        self.shared.api
    }

    pub(crate) fn shared(&self) -> &'py Shared {
        self.shared
    }

    /// Takes ownership of a new reference, turning null into the pending Python exception.
    pub(crate) fn own(&self, ptr: ObjectPtr) -> Result<Owned<'_>, Error> {
        self.own_opt(ptr).ok_or_else(|| self.take_error())
    }

    /// Takes ownership of a new reference without consulting the error indicator.
    pub(crate) fn own_opt(&self, ptr: ObjectPtr) -> Option<Owned<'_>> {
        // SAFETY: the caller passes a new reference (or null), and we hold the GIL.
        NonNull::new(ptr).map(|ptr| unsafe { Owned::from_new_ref(self, ptr) })
    }

    /// Adds a reference to a borrowed pointer and takes ownership of it.
    pub(crate) fn borrow(&self, ptr: ObjectPtr) -> Result<Owned<'_>, Error> {
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(self.take_error());
        };
        // SAFETY: `ptr` is a live borrowed reference and we hold the GIL.
        unsafe {
            (self.api().Py_IncRef)(ptr.as_ptr());
            Ok(Owned::from_new_ref(self, ptr))
        }
    }

    /// Creates a host handle for a borrowed pointer.
    pub(crate) fn handle(&self, ptr: ObjectPtr) -> Result<PyObject, Error> {
        self.borrow(ptr).map(Owned::into_object)
    }

    /// Maps the C API's `-1` failure status to the pending exception.
    pub(crate) fn check(&self, status: c_int) -> Result<c_int, Error> {
        if status == -1 { Err(self.take_error()) } else { Ok(status) }
    }

    /// As [`check`](Self::check), for `Py_ssize_t` results.
    pub(crate) fn check_size(&self, size: PySsize) -> Result<usize, Error> {
        usize::try_from(size).map_err(|_| self.take_error())
    }

    /// Whether an exception is pending.
    pub(crate) fn error_pending(&self) -> bool {
        // SAFETY: GIL held.
        !unsafe { (self.api().PyErr_Occurred)() }.is_null()
    }

    /// Clears and captures the pending exception.
    pub(crate) fn take_error(&self) -> Error {
        exception::fetch(self)
    }

    pub(crate) fn import(&self, name: &CStr) -> Result<Owned<'_>, Error> {
        // SAFETY: GIL held, `name` is NUL-terminated.
        self.own(unsafe { (self.api().PyImport_ImportModule)(name.as_ptr()) })
    }

    /// Looks up a name in the interpreter's `builtins` namespace.
    pub(crate) fn builtin(&self, name: &CStr) -> Result<Owned<'_>, Error> {
        let builtins = self.builtins()?;
        // SAFETY: GIL held; returns a borrowed reference or null without setting an error.
        let item = unsafe { (self.api().PyDict_GetItemString)(builtins.as_ptr(), name.as_ptr()) };
        if item.is_null() {
            return Err(Error::Bridge(format!("builtin {name:?} is missing")));
        }
        self.borrow(item)
    }

    /// The `builtins` module dictionary.
    pub(crate) fn builtins(&self) -> Result<Owned<'_>, Error> {
        // SAFETY: GIL held; returns a borrowed reference.
        let builtins = unsafe { (self.api().PyEval_GetBuiltins)() };
        if builtins.is_null() {
            return Err(Error::Bridge("interpreter has no builtins".to_owned()));
        }
        self.borrow(builtins)
    }

    /// A new reference to `None`.
    pub(crate) fn none(&self) -> Result<Owned<'_>, Error> {
        // SAFETY: GIL held; an empty format string builds `None`.
        self.own(unsafe { (self.api().Py_BuildValue)(c"".as_ptr()) })
    }

    pub(crate) fn new_str(&self, text: &str) -> Result<Owned<'_>, Error> {
        let len = PySsize::try_from(text.len()).map_err(|_| Error::Bridge("string too long".to_owned()))?;
        // SAFETY: GIL held; the bytes are valid UTF-8 of the given length.
        self.own(unsafe { (self.api().PyUnicode_FromStringAndSize)(text.as_ptr().cast(), len) })
    }

    /// Copies a `str` object's contents.
    pub(crate) fn string(&self, ptr: ObjectPtr) -> Result<String, Error> {
        let mut len: PySsize = 0;
        // SAFETY: GIL held; on success the buffer stays valid while `ptr` is alive.
        let data = unsafe { (self.api().PyUnicode_AsUTF8AndSize)(ptr, &raw mut len) };
        if data.is_null() {
            return Err(self.take_error());
        }
        // SAFETY: the interpreter reported `len` bytes at `data`.
        let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), self.check_size(len)?) };
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub(crate) fn is_instance(&self, ptr: ObjectPtr, class: &Owned<'_>) -> Result<bool, Error> {
        // SAFETY: GIL held, both pointers are live.
        let status = unsafe { (self.api().PyObject_IsInstance)(ptr, class.as_ptr()) };
        Ok(self.check(status)? == 1)
    }

    /// Sets `dict[key] = value` for a string key.
    pub(crate) fn dict_set(&self, dict: ObjectPtr, key: &CStr, value: ObjectPtr) -> Result<(), Error> {
        // SAFETY: GIL held; the dict does not steal `value`.
        let status = unsafe { (self.api().PyDict_SetItemString)(dict, key.as_ptr(), value) };
        self.check(status).map(drop)
    }
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        GIL_DEPTH.set(GIL_DEPTH.get().saturating_sub(1));
        if self.outermost {
            // SAFETY: this guard restored the thread state, so this thread holds the GIL.
            unsafe { (self.shared.api.PyEval_SaveThread)() };
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ptr::{self, NonNull};

    use super::*;

    #[test]
    fn thread_states_are_created_once_per_thread() {
        let states = ThreadStates::default();
        let fake = NonNull::<std::ffi::c_void>::dangling().as_ptr();
        assert_eq!(states.for_current_thread(|| fake).unwrap(), fake);
        let reused = states.for_current_thread(|| panic!("state should be reused")).unwrap();
        assert_eq!(reused, fake);

        thread::scope(|scope| {
            scope.spawn(|| {
                let err = states.for_current_thread(ptr::null_mut).unwrap_err();
                assert!(matches!(err, Error::Bridge(_)), "unexpected error: {err}");
            });
        });
        assert_eq!(states.len(), 1);
    }
}
