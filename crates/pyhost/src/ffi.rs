//! Dynamic loading of the Python shared library and the table of C API entry points.
//!
//! Nothing links against libpython at build time. [`Library::open`] loads it through
//! `libloading` with global symbol visibility (so C extension modules imported later can resolve
//! interpreter symbols), and [`PyApi::load`] resolves every function the bridge calls. A missing symbol is a load error.
//!
//! Only stable-ABI entry points are used, so any CPython 3.10+ shared library works.

use std::{
    ffi::{c_char, c_int, c_long, c_longlong, c_void},
    mem::ManuallyDrop,
    path::Path,
    ptr::NonNull,
    sync::OnceLock,
};

use crate::error::LoadError;

/// Opaque `PyObject`. Only ever handled by pointer.
#[repr(C)]
pub(crate) struct PyObjectRaw {
    _private: [u8; 0],
}

/// Raw `PyObject *`.
pub(crate) type ObjectPtr = *mut PyObjectRaw;
/// Raw `PyThreadState *`.
pub(crate) type ThreadStateRaw = *mut c_void;
/// Raw `PyInterpreterState *`.
pub(crate) type InterpreterRaw = *mut c_void;
/// `Py_ssize_t`.
pub(crate) type PySsize = isize;
/// `PyCapsule_Destructor`.
pub(crate) type CapsuleDestructor = unsafe extern "C" fn(ObjectPtr);

/// `wchar_t` as the interpreter's path setters expect it.
#[cfg(windows)]
pub(crate) type WideChar = u16;
/// `wchar_t` as the interpreter's path setters expect it.
#[cfg(not(windows))]
pub(crate) type WideChar = u32;

/// Encodes `text` as a NUL-terminated wide string.
pub(crate) fn wide_string(text: &str) -> Box<[WideChar]> {
    #[cfg(windows)]
    let units: Vec<WideChar> = text.encode_utf16().chain(std::iter::once(0)).collect();
    #[cfg(not(windows))]
    let units: Vec<WideChar> = text.chars().map(u32::from).chain(std::iter::once(0)).collect();
    units.into_boxed_slice()
}

/// A loaded shared library.
///
/// The library is never unloaded: function pointers resolved from it are stored in a
/// process-wide table and the interpreter cannot be torn down and restarted anyway.
pub(crate) struct Library {
    inner: ManuallyDrop<libloading::Library>,
}

impl Library {
    /// Loads the library at `path` with immediate binding and global symbol visibility.
    pub(crate) fn open(path: &Path) -> Result<Self, LoadError> {
        // SAFETY: loading libpython runs no initialisers that depend on host state.
        #[cfg(unix)]
        let loaded = unsafe {
            use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
            UnixLibrary::open(Some(path), RTLD_NOW | RTLD_GLOBAL).map(libloading::Library::from)
        };
        // SAFETY: as above.
        #[cfg(windows)]
        let loaded = unsafe { libloading::os::windows::Library::new(path).map(libloading::Library::from) };
        loaded
            .map(|library| Self {
                inner: ManuallyDrop::new(library),
            })
            .map_err(|err| LoadError::OpenLibrary {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })
    }

    /// Resolves `name`, failing if the library does not export it.
    pub(crate) fn symbol(&self, name: &'static str) -> Result<NonNull<c_void>, LoadError> {
        // SAFETY: the symbol is only read as an address here; callers give it its real type.
        let address = unsafe { self.inner.get::<*mut c_void>(name.as_bytes()) }
            .map_err(|_| LoadError::MissingSymbol(name))?;
        NonNull::new(*address).ok_or(LoadError::MissingSymbol(name))
    }
}

/// Declares the function table and its loader in one place so the two cannot drift apart.
macro_rules! python_api {
    ($($name:ident: fn($($arg:ty),* $(,)?) $(-> $ret:ty)?;)*) => {
        /// Resolved CPython C API entry points. Field names are the C symbol names.
        #[expect(non_snake_case, reason = "fields mirror the C API symbol names")]
        pub(crate) struct PyApi {
            $(pub(crate) $name: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
            /// `Py_BuildValue` is variadic; the bridge only calls it with an empty format to get `None`.
            pub(crate) Py_BuildValue: unsafe extern "C" fn(*const c_char, ...) -> ObjectPtr,
        }

        impl PyApi {
            /// Resolves every entry point from `library`.
            pub(crate) fn load(library: &Library) -> Result<Self, LoadError> {
                Ok(Self {
                    $(
                        // SAFETY: the symbol is the C function of this name, whose ABI matches the declared type.
                        $name: unsafe {
                            std::mem::transmute::<*mut c_void, unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                                library.symbol(stringify!($name))?.as_ptr(),
                            )
                        },
                    )*
                    // SAFETY: as above.
                    Py_BuildValue: unsafe {
                        std::mem::transmute::<*mut c_void, unsafe extern "C" fn(*const c_char, ...) -> ObjectPtr>(
                            library.symbol("Py_BuildValue")?.as_ptr(),
                        )
                    },
                })
            }
        }
    };
}

python_api! {
    Py_InitializeEx: fn(c_int);
    Py_SetPythonHome: fn(*const WideChar);
    Py_SetProgramName: fn(*const WideChar);
    Py_IncRef: fn(ObjectPtr);
    Py_DecRef: fn(ObjectPtr);
    Py_IsNone: fn(ObjectPtr) -> c_int;
    Py_IsTrue: fn(ObjectPtr) -> c_int;
    Py_IsFalse: fn(ObjectPtr) -> c_int;
    PyInterpreterState_Get: fn() -> InterpreterRaw;
    PyThreadState_New: fn(InterpreterRaw) -> ThreadStateRaw;
    PyEval_RestoreThread: fn(ThreadStateRaw);
    PyEval_SaveThread: fn() -> ThreadStateRaw;
    PyEval_GetBuiltins: fn() -> ObjectPtr;
    PyEval_EvalCode: fn(ObjectPtr, ObjectPtr, ObjectPtr) -> ObjectPtr;
    PyErr_Fetch: fn(*mut ObjectPtr, *mut ObjectPtr, *mut ObjectPtr);
    PyErr_NormalizeException: fn(*mut ObjectPtr, *mut ObjectPtr, *mut ObjectPtr);
    PyErr_Occurred: fn() -> ObjectPtr;
    PyErr_Clear: fn();
    PyImport_ImportModule: fn(*const c_char) -> ObjectPtr;
    PyModule_GetDict: fn(ObjectPtr) -> ObjectPtr;
    PyObject_Call: fn(ObjectPtr, ObjectPtr, ObjectPtr) -> ObjectPtr;
    PyObject_CallNoArgs: fn(ObjectPtr) -> ObjectPtr;
    PyObject_GetAttrString: fn(ObjectPtr, *const c_char) -> ObjectPtr;
    PyObject_SetAttrString: fn(ObjectPtr, *const c_char, ObjectPtr) -> c_int;
    PyObject_SetItem: fn(ObjectPtr, ObjectPtr, ObjectPtr) -> c_int;
    PyObject_IsInstance: fn(ObjectPtr, ObjectPtr) -> c_int;
    PyObject_Repr: fn(ObjectPtr) -> ObjectPtr;
    PyObject_Str: fn(ObjectPtr) -> ObjectPtr;
    PyObject_GetIter: fn(ObjectPtr) -> ObjectPtr;
    PyIter_Next: fn(ObjectPtr) -> ObjectPtr;
    PyBool_FromLong: fn(c_long) -> ObjectPtr;
    PyLong_FromLongLong: fn(c_longlong) -> ObjectPtr;
    PyLong_FromString: fn(*const c_char, *mut *mut c_char, c_int) -> ObjectPtr;
    PyLong_FromVoidPtr: fn(*mut c_void) -> ObjectPtr;
    PyLong_AsLongLongAndOverflow: fn(ObjectPtr, *mut c_int) -> c_longlong;
    PyFloat_FromDouble: fn(f64) -> ObjectPtr;
    PyFloat_AsDouble: fn(ObjectPtr) -> f64;
    PyUnicode_FromStringAndSize: fn(*const c_char, PySsize) -> ObjectPtr;
    PyUnicode_AsUTF8AndSize: fn(ObjectPtr, *mut PySsize) -> *const c_char;
    PyBytes_FromStringAndSize: fn(*const c_char, PySsize) -> ObjectPtr;
    PyBytes_AsStringAndSize: fn(ObjectPtr, *mut *mut c_char, *mut PySsize) -> c_int;
    PyList_New: fn(PySsize) -> ObjectPtr;
    PyList_Size: fn(ObjectPtr) -> PySsize;
    PyList_GetItem: fn(ObjectPtr, PySsize) -> ObjectPtr;
    PyList_SetItem: fn(ObjectPtr, PySsize, ObjectPtr) -> c_int;
    PyTuple_New: fn(PySsize) -> ObjectPtr;
    PyTuple_Size: fn(ObjectPtr) -> PySsize;
    PyTuple_GetItem: fn(ObjectPtr, PySsize) -> ObjectPtr;
    PyTuple_SetItem: fn(ObjectPtr, PySsize, ObjectPtr) -> c_int;
    PyDict_New: fn() -> ObjectPtr;
    PyDict_Copy: fn(ObjectPtr) -> ObjectPtr;
    PyDict_SetItem: fn(ObjectPtr, ObjectPtr, ObjectPtr) -> c_int;
    PyDict_SetItemString: fn(ObjectPtr, *const c_char, ObjectPtr) -> c_int;
    PyDict_GetItemString: fn(ObjectPtr, *const c_char) -> ObjectPtr;
    PyDict_Contains: fn(ObjectPtr, ObjectPtr) -> c_int;
    PyDict_Next: fn(ObjectPtr, *mut PySsize, *mut ObjectPtr, *mut ObjectPtr) -> c_int;
    PySet_New: fn(ObjectPtr) -> ObjectPtr;
    PySet_Add: fn(ObjectPtr, ObjectPtr) -> c_int;
    PyCapsule_New: fn(*mut c_void, *const c_char, Option<CapsuleDestructor>) -> ObjectPtr;
    PyCapsule_GetPointer: fn(ObjectPtr, *const c_char) -> *mut c_void;
}

/// Process-wide table, published once the library has loaded.
///
/// Callbacks entered from Python (output writes, capsule destructors, mailbox sends) have no
/// session reference of their own and reach the interpreter through this.
static API: OnceLock<PyApi> = OnceLock::new();

/// Publishes the table; a table published earlier wins and is returned.
pub(crate) fn publish(api: PyApi) -> &'static PyApi {
    API.get_or_init(|| api)
}

/// The published table, if the library has been loaded.
pub(crate) fn api() -> Option<&'static PyApi> {
    API.get()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_strings_are_nul_terminated() {
        let wide = wide_string("/usr");
        assert_eq!(wide.len(), 5);
        assert_eq!(wide.last(), Some(&0));
        assert_eq!(wide[0], WideChar::from(b'/'));
    }

    #[test]
    fn opening_a_missing_library_reports_the_path() {
        let Err(err) = Library::open(Path::new("/definitely/not/here/libpython9.99.so")) else {
            panic!("loading a nonexistent library should fail");
        };
        let message = err.to_string();
        assert!(message.contains("libpython9.99"), "unexpected message: {message}");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn symbols_resolve_by_name() {
        let library = Library::open(Path::new("libc.so.6")).unwrap();
        assert!(library.symbol("strlen").is_ok());
        assert_eq!(
            library.symbol("Py_NotARealFunction").unwrap_err(),
            LoadError::MissingSymbol("Py_NotARealFunction")
        );
    }
}
