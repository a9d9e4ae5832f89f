use std::{
    ffi::CStr,
    fmt,
    hash::{Hash, Hasher},
    mem::ManuallyDrop,
    ptr::{self, NonNull},
    sync::Arc,
};

use crate::{
    error::Error,
    ffi::{ObjectPtr, PyObjectRaw, PySsize},
    gil::GilGuard,
    janitor::ReleaseQueue,
};

/// A host-side handle to a Python object.
///
/// Owns one strong reference for the handle's lifetime. Clones share that reference. When the
/// last clone is dropped the reference is released on the janitor thread, so dropping a handle
/// never blocks on the GIL and is safe from any thread. After the session shuts down, dropping
/// a handle does nothing.
///
/// Equality and hashing are by object identity.
#[derive(Clone)]
pub struct PyObject {
    resource: Arc<ObjectResource>,
}

struct ObjectResource {
    ptr: NonNull<PyObjectRaw>,
    queue: Arc<ReleaseQueue>,
}

// SAFETY: the pointer is only dereferenced by the interpreter with the GIL held; dropping it goes
// through the janitor queue.
unsafe impl Send for ObjectResource {}
// SAFETY: as above, the handle exposes no unsynchronised access to the object.
unsafe impl Sync for ObjectResource {}

impl Drop for ObjectResource {
    fn drop(&mut self) {
        self.queue.release(self.ptr);
    }
}

impl PyObject {
    /// Wraps a strong reference the caller owns.
    ///
    /// # Safety
    /// `ptr` must be a live object and the caller must transfer exactly one strong reference.
    pub(crate) unsafe fn from_owned_ptr(queue: &Arc<ReleaseQueue>, ptr: NonNull<PyObjectRaw>) -> Self {
        Self {
            resource: Arc::new(ObjectResource {
                ptr,
                queue: Arc::clone(queue),
            }),
        }
    }

    pub(crate) fn as_ptr(&self) -> ObjectPtr {
        self.resource.ptr.as_ptr()
    }

    /// The object's address, useful only for diagnostics and identity checks.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.resource.ptr.as_ptr() as usize as u64
    }
}

impl fmt::Debug for PyObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PyObject({:#x})", self.addr())
    }
}

impl PartialEq for PyObject {
    fn eq(&self, other: &Self) -> bool {
        self.resource.ptr == other.resource.ptr
    }
}

impl Eq for PyObject {}

impl Hash for PyObject {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resource.ptr.hash(state);
    }
}

/// A strong reference scoped to a held GIL.
///
/// Temporaries created while the GIL is held are released on drop directly, without going
/// through the janitor. [`into_object`](Self::into_object) turns one into a host handle.
pub(crate) struct Owned<'g> {
    ptr: NonNull<PyObjectRaw>,
    gil: &'g GilGuard<'g>,
}

impl<'g> Owned<'g> {
    /// # Safety
    /// `ptr` must be a new (owned) reference and `gil` must be held by this thread.
    pub(crate) unsafe fn from_new_ref(gil: &'g GilGuard<'g>, ptr: NonNull<PyObjectRaw>) -> Self {
        Self { ptr, gil }
    }

    pub(crate) fn as_ptr(&self) -> ObjectPtr {
        self.ptr.as_ptr()
    }

    /// Gives up ownership without releasing, for C API calls that steal a reference.
    pub(crate) fn into_ptr(self) -> ObjectPtr {
        ManuallyDrop::new(self).ptr.as_ptr()
    }

    /// Transfers the reference into a handle that outlives the GIL.
    pub(crate) fn into_object(self) -> PyObject {
        let gil = self.gil;
        let ptr = ManuallyDrop::new(self).ptr;
        // SAFETY: the reference owned by `self` moves into the handle.
        unsafe { PyObject::from_owned_ptr(&gil.shared().queue, ptr) }
    }

    pub(crate) fn getattr(&self, name: &CStr) -> Result<Owned<'g>, Error> {
        self.getattr_opt(name).ok_or_else(|| self.gil.take_error())
    }

    /// As [`getattr`](Self::getattr), leaving any error pending.
    pub(crate) fn getattr_opt(&self, name: &CStr) -> Option<Owned<'g>> {
        // SAFETY: GIL held, `name` is NUL-terminated.
        let attr = unsafe { (self.gil.api().PyObject_GetAttrString)(self.as_ptr(), name.as_ptr()) };
        self.gil.own_opt(attr)
    }

    pub(crate) fn setattr(&self, name: &CStr, value: ObjectPtr) -> Result<(), Error> {
        // SAFETY: GIL held; the value is not stolen.
        let status = unsafe { (self.gil.api().PyObject_SetAttrString)(self.as_ptr(), name.as_ptr(), value) };
        self.gil.check(status).map(drop)
    }

    /// Calls the object with positional arguments.
    pub(crate) fn call(&self, args: &[ObjectPtr]) -> Result<Owned<'g>, Error> {
        self.call_opt(args).ok_or_else(|| self.gil.take_error())
    }

    /// As [`call`](Self::call), leaving any error pending.
    pub(crate) fn call_opt(&self, args: &[ObjectPtr]) -> Option<Owned<'g>> {
        let api = self.gil.api();
        let len = PySsize::try_from(args.len()).ok()?;
        // SAFETY: GIL held; each argument gains a reference that the tuple then steals.
        unsafe {
            let tuple = self.gil.own_opt((api.PyTuple_New)(len))?;
            for (index, &arg) in args.iter().enumerate() {
                (api.Py_IncRef)(arg);
                if (api.PyTuple_SetItem)(tuple.as_ptr(), index as PySsize, arg) != 0 {
                    return None;
                }
            }
            self.gil.own_opt((api.PyObject_Call)(self.as_ptr(), tuple.as_ptr(), ptr::null_mut()))
        }
    }

    pub(crate) fn call0(&self) -> Result<Owned<'g>, Error> {
        // SAFETY: GIL held.
        let result = unsafe { (self.gil.api().PyObject_CallNoArgs)(self.as_ptr()) };
        self.gil.own(result)
    }
}

impl Drop for Owned<'_> {
    fn drop(&mut self) {
        // SAFETY: GIL held for `'g`, and this value owns one reference.
        unsafe { (self.gil.api().Py_DecRef)(self.ptr.as_ptr()) };
    }
}
