use std::{
    path::Path,
    ptr::{self, NonNull},
    sync::{
        Arc, Mutex, MutexGuard, OnceLock, PoisonError,
        atomic::{AtomicU8, Ordering},
    },
    thread::JoinHandle,
};

use ahash::AHashSet;

use crate::{
    compile::{CodeCache, CodeHash},
    config::InitConfig,
    convert,
    error::{Error, LoadError, UsageError},
    eval::{self, EvalOutput, Globals},
    exception,
    ffi::{self, Library, ObjectPtr, PyApi, PySsize, WideChar},
    gil::{GilGuard, InterpreterHandle, ThreadStates},
    io::{self, Outputs, SessionLink},
    janitor::{self, ReleaseQueue},
    mailbox::{Mailbox, MailboxRegistry},
    object::PyObject,
    scope::{self, ScopeAnalysis},
    value::{Decoded, Value},
};

/// Process-wide init guard: the interpreter can be started once per process.
static INIT_STATE: AtomicU8 = AtomicU8::new(UNINITIALIZED);
const UNINITIALIZED: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;

/// Session state shared by the [`Python`] context, the janitor thread and every guard.
pub(crate) struct Shared {
    pub(crate) api: &'static PyApi,
    pub(crate) interpreter: InterpreterHandle,
    pub(crate) thread_states: ThreadStates,
    pub(crate) queue: Arc<ReleaseQueue>,
    pub(crate) cache: CodeCache,
    pub(crate) mailboxes: Arc<MailboxRegistry>,
    /// Serialises janitor decrefs against shutdown.
    lifecycle: Mutex<()>,
    builtin_names: OnceLock<AHashSet<String>>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    /// The interpreter keeps pointers to these for its whole life.
    _home: Box<[WideChar]>,
    _program: Box<[WideChar]>,
}

impl Shared {
    pub(crate) fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A handle to the embedded interpreter session.
///
/// Created once per process by [`Python::init`]. Cheap to clone and safe to share between
/// threads; every method may be called from any thread and blocks until the GIL is available.
/// The GIL is never held across calls, so host threads interleave at call granularity (or finer,
/// when interpreter code releases the GIL itself).
#[derive(Clone)]
pub struct Python {
    shared: Arc<Shared>,
}

impl Python {
    /// Loads the interpreter library and starts the interpreter.
    ///
    /// Fails with [`UsageError::AlreadyInitialized`] if an interpreter was already started in this
    /// process, even if that session has since been shut down. Failures before the interpreter
    /// starts (an invalid config, unusable paths, a library that does not load) leave the process
    /// free to try again with a different configuration.
    ///
    /// Once `Py_InitializeEx` has run the process counts as initialized, even if the setup that
    /// follows (starting the janitor, extending `sys.path`, setting environment variables,
    /// installing the IO overrides) fails and no session is returned: CPython cannot be
    /// initialized twice in one process.
    pub fn init(config: InitConfig) -> Result<Self, Error> {
        if INIT_STATE
            .compare_exchange(UNINITIALIZED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(UsageError::AlreadyInitialized.into());
        }
        match Self::load(&config) {
            Ok(api) => {
                INIT_STATE.store(STARTED, Ordering::Release);
                Self::start(api, &config)
            }
            Err(err) => {
                INIT_STATE.store(UNINITIALIZED, Ordering::Release);
                Err(err)
            }
        }
    }

    fn load(config: &InitConfig) -> Result<&'static PyApi, Error> {
        config
            .validate()
            .map_err(|e| UsageError::InvalidArgument(e.to_string()))?;
        check_paths(config)?;
        log::debug!("loading Python library {}", config.library_path.display());
        // never closed: the library stays mapped for the life of the process
        let library = Library::open(&config.library_path)?;
        Ok(ffi::publish(PyApi::load(&library)?))
    }

    fn start(api: &'static PyApi, config: &InitConfig) -> Result<Self, Error> {
        let home = ffi::wide_string(path_str(&config.home)?);
        let program = ffi::wide_string(path_str(&config.executable)?);
        // SAFETY: called once per process before the interpreter starts; the wide strings are kept
        // alive in `Shared` for the rest of the process.
        let (interpreter, main_state) = unsafe {
            (api.Py_SetPythonHome)(home.as_ptr());
            (api.Py_SetProgramName)(program.as_ptr());
            (api.Py_InitializeEx)(0);
            let interpreter = (api.PyInterpreterState_Get)();
            (interpreter, (api.PyEval_SaveThread)())
        };
        log::debug!("Python interpreter started");

        let (queue, receiver) = ReleaseQueue::new();
        let thread_states = ThreadStates::default();
        thread_states.register_current(main_state);
        let shared = Arc::new(Shared {
            api,
            interpreter: InterpreterHandle(interpreter),
            thread_states,
            queue: Arc::clone(&queue),
            cache: CodeCache::default(),
            mailboxes: Arc::new(MailboxRegistry::default()),
            lifecycle: Mutex::new(()),
            builtin_names: OnceLock::new(),
            janitor: Mutex::new(None),
            _home: home,
            _program: program,
        });
        let handle = janitor::spawn(Arc::clone(&shared), receiver)
            .map_err(|e| Error::Bridge(format!("failed to start the janitor thread: {e}")))?;
        *shared.janitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let python = Self { shared };
        python.configure(config)?;
        Ok(python)
    }

    /// Extends `sys.path`, applies the environment overrides, and installs the IO overrides.
    fn configure(&self, config: &InitConfig) -> Result<(), Error> {
        let gil = GilGuard::acquire(&self.shared)?;
        let api = gil.api();

        let sys_path = gil.import(c"sys")?.getattr(c"path")?;
        let append = sys_path.getattr(c"append")?;
        for path in &config.sys_paths {
            let entry = gil.new_str(path_str(path)?)?;
            append.call(&[entry.as_ptr()])?;
        }

        if !config.env.is_empty() {
            let environ = gil.import(c"os")?.getattr(c"environ")?;
            for (key, value) in &config.env {
                let key = gil.new_str(key)?;
                let value = gil.new_str(value)?;
                // SAFETY: GIL held; os.environ does not steal the references.
                gil.check(unsafe { (api.PyObject_SetItem)(environ.as_ptr(), key.as_ptr(), value.as_ptr()) })?;
            }
        }

        io::install(
            &gil,
            SessionLink {
                queue: Arc::clone(&self.shared.queue),
                mailboxes: Arc::clone(&self.shared.mailboxes),
            },
        )
    }

    fn ensure_live(&self) -> Result<(), Error> {
        if self.shared.queue.is_live() {
            Ok(())
        } else {
            Err(UsageError::NotInitialized.into())
        }
    }

    fn with_gil<T>(&self, f: impl FnOnce(&GilGuard<'_>) -> Result<T, Error>) -> Result<T, Error> {
        self.ensure_live()?;
        let gil = GilGuard::acquire(&self.shared)?;
        f(&gil)
    }

    /// Runs `source` in a fresh module namespace seeded with `globals`.
    ///
    /// If the snippet ends with an expression statement its value is returned as `result`.
    /// `globals` in the output holds the names the snippet bound. Output written to
    /// `sys.stdout`/`sys.stderr` during the call has been delivered to `outputs` by the time this
    /// returns.
    pub fn eval(&self, source: &str, globals: &Globals, outputs: &Outputs) -> Result<EvalOutput, Error> {
        self.eval_with_hash(source, CodeHash::of(source), globals, outputs)
    }

    /// As [`eval`](Self::eval), with a precomputed cache key for `source`.
    pub fn eval_with_hash(
        &self,
        source: &str,
        hash: CodeHash,
        globals: &Globals,
        outputs: &Outputs,
    ) -> Result<EvalOutput, Error> {
        self.ensure_live()?;
        eval::run(&self.shared, source, hash, globals, outputs)
    }

    /// `repr(object)`.
    pub fn repr(&self, object: &PyObject) -> Result<String, Error> {
        self.with_gil(|gil| {
            // SAFETY: GIL held.
            let text = gil.own(unsafe { (gil.api().PyObject_Repr)(object.as_ptr()) })?;
            gil.string(text.as_ptr())
        })
    }

    /// `str(object)`.
    pub fn str(&self, object: &PyObject) -> Result<String, Error> {
        self.with_gil(|gil| {
            // SAFETY: GIL held.
            let text = gil.own(unsafe { (gil.api().PyObject_Str)(object.as_ptr()) })?;
            gil.string(text.as_ptr())
        })
    }

    /// `type(object).__name__`.
    pub fn type_name(&self, object: &PyObject) -> Result<String, Error> {
        self.with_gil(|gil| {
            let name = gil.borrow(object.as_ptr())?.getattr(c"__class__")?.getattr(c"__name__")?;
            gil.string(name.as_ptr())
        })
    }

    /// Renders an exception triple with `traceback.format_exception`.
    pub fn format_exception(
        &self,
        ptype: &PyObject,
        pvalue: Option<&PyObject>,
        ptraceback: Option<&PyObject>,
    ) -> Result<Vec<String>, Error> {
        self.with_gil(|gil| {
            let pvalue = pvalue.map(|value| gil.borrow(value.as_ptr())).transpose()?;
            let ptraceback = ptraceback.map(|tb| gil.borrow(tb.as_ptr())).transpose()?;
            exception::format(gil, ptype.as_ptr(), pvalue.as_ref(), ptraceback.as_ref())
                .ok_or_else(|| Error::Bridge("traceback.format_exception failed".to_owned()))
        })
    }

    /// Schedules a decref of a raw object address, as if a handle owning it had been dropped.
    ///
    /// # Safety
    /// `address` must be a live Python object on which the caller owns one strong reference,
    /// which this call consumes.
    pub unsafe fn decref_raw(&self, address: u64) {
        if let Some(ptr) = usize::try_from(address).ok().and_then(|a| NonNull::new(a as ObjectPtr)) {
            self.shared.queue.release(ptr);
        }
    }

    /// Statically determines the names `source` reads and binds, treating the interpreter's
    /// builtins as always available.
    pub fn analyze(&self, source: &str) -> Result<ScopeAnalysis, Error> {
        let builtins = self.builtin_names()?;
        Ok(scope::analyze(source, |name| builtins.contains(name))?)
    }

    fn builtin_names(&self) -> Result<&AHashSet<String>, Error> {
        if let Some(names) = self.shared.builtin_names.get() {
            return Ok(names);
        }
        let names = self.with_gil(|gil| {
            let api = gil.api();
            let builtins = gil.builtins()?;
            let mut names = AHashSet::new();
            let mut position: PySsize = 0;
            let mut key: ObjectPtr = ptr::null_mut();
            let mut value: ObjectPtr = ptr::null_mut();
            // SAFETY: GIL held; borrowed references, dict not mutated during iteration.
            while unsafe { (api.PyDict_Next)(builtins.as_ptr(), &raw mut position, &raw mut key, &raw mut value) } != 0 {
                names.insert(gil.string(key)?);
            }
            Ok(names)
        })?;
        Ok(self.shared.builtin_names.get_or_init(|| names))
    }

    /// Encodes a host value as a Python object.
    pub fn encode(&self, value: &Value) -> Result<PyObject, Error> {
        self.with_gil(|gil| convert::encode(gil, value))
    }

    /// Decodes one level of `object`.
    pub fn decode_once(&self, object: &PyObject) -> Result<Decoded, Error> {
        self.with_gil(|gil| convert::decode_once(gil, object))
    }

    /// Decodes `object` completely.
    pub fn decode(&self, object: &PyObject) -> Result<Value, Error> {
        self.with_gil(|gil| convert::decode(gil, object))
    }

    pub fn none(&self) -> Result<PyObject, Error> {
        self.encode(&Value::None)
    }

    pub fn bool(&self, value: bool) -> Result<PyObject, Error> {
        self.encode(&Value::Bool(value))
    }

    pub fn int(&self, value: i64) -> Result<PyObject, Error> {
        self.encode(&Value::Int(value))
    }

    pub fn float(&self, value: f64) -> Result<PyObject, Error> {
        self.encode(&Value::Float(value))
    }

    pub fn string(&self, value: &str) -> Result<PyObject, Error> {
        self.encode(&Value::Str(value.to_owned()))
    }

    pub fn bytes(&self, value: &[u8]) -> Result<PyObject, Error> {
        self.encode(&Value::Bytes(value.to_vec()))
    }

    /// A `list` holding the given objects.
    pub fn list(&self, items: &[PyObject]) -> Result<PyObject, Error> {
        self.encode(&Value::List(items.iter().cloned().map(Value::Object).collect()))
    }

    /// A `tuple` holding the given objects.
    pub fn tuple(&self, items: &[PyObject]) -> Result<PyObject, Error> {
        self.encode(&Value::Tuple(items.iter().cloned().map(Value::Object).collect()))
    }

    /// A `set` holding the given objects.
    pub fn set(&self, items: &[PyObject]) -> Result<PyObject, Error> {
        self.encode(&Value::Set(items.iter().cloned().map(Value::Object).collect()))
    }

    /// A `dict` built from key/value pairs, later keys overwriting earlier ones.
    pub fn dict(&self, pairs: &[(PyObject, PyObject)]) -> Result<PyObject, Error> {
        self.encode(&Value::Dict(
            pairs
                .iter()
                .map(|(key, value)| (Value::Object(key.clone()), Value::Object(value.clone())))
                .collect(),
        ))
    }

    /// Opens a mailbox that interpreter code can send to with `pyhost.send_tagged_object`.
    #[must_use]
    pub fn new_mailbox(&self) -> Mailbox {
        self.shared.mailboxes.open()
    }

    /// Blocks until every release and output queued before this call has been processed.
    pub fn ping(&self) {
        self.shared.queue.ping();
    }

    /// Whether the session still accepts calls.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.shared.queue.is_live()
    }

    /// Stops the session. Pending output is delivered first; afterwards every call fails with
    /// [`UsageError::NotInitialized`] and dropping handles does nothing.
    ///
    /// The interpreter itself is left to be torn down with the process, since objects owned by
    /// interpreter threads may still be running. A new session cannot be started.
    pub fn shutdown(&self) {
        if !self.is_live() {
            return;
        }
        self.shared.queue.ping();
        {
            let _lifecycle = self.shared.lock_lifecycle();
            self.shared.queue.mark_dead();
        }
        self.shared.queue.stop();
        let handle = self.shared.janitor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::warn!("janitor thread panicked");
        }
        log::debug!("Python session shut down");
    }

    /// Number of host threads that have been given an interpreter thread state.
    #[must_use]
    pub fn thread_state_count(&self) -> usize {
        self.shared.thread_states.len()
    }

    /// Number of distinct snippets compiled so far.
    #[must_use]
    pub fn cached_code_count(&self) -> usize {
        self.shared.cache.len()
    }
}

impl std::fmt::Debug for Python {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Python")
            .field("live", &self.is_live())
            .field("thread_states", &self.thread_state_count())
            .field("cached_code", &self.cached_code_count())
            .finish()
    }
}

impl PyObject {
    /// `repr(self)`, via `python`.
    pub fn repr(&self, python: &Python) -> Result<String, Error> {
        python.repr(self)
    }

    /// `str(self)`, via `python`.
    pub fn str(&self, python: &Python) -> Result<String, Error> {
        python.str(self)
    }

    pub fn type_name(&self, python: &Python) -> Result<String, Error> {
        python.type_name(self)
    }

    pub fn decode_once(&self, python: &Python) -> Result<Decoded, Error> {
        python.decode_once(self)
    }

    pub fn decode(&self, python: &Python) -> Result<Value, Error> {
        python.decode(self)
    }
}

fn path_str(path: &Path) -> Result<&str, Error> {
    path.to_str()
        .ok_or_else(|| LoadError::InvalidPath(path.to_path_buf()).into())
}

/// Checks up front that every path handed to the interpreter is valid UTF-8.
fn check_paths(config: &InitConfig) -> Result<(), Error> {
    for path in [&config.home, &config.executable].into_iter().chain(&config.sys_paths) {
        path_str(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn non_utf8_paths_are_rejected_before_startup() {
        use std::{ffi::OsStr, os::unix::ffi::OsStrExt, path::PathBuf};

        let config = InitConfig::new("/lib/libpython3.so", "/usr", "/usr/bin/python3");
        assert!(check_paths(&config).is_ok());

        let bad = PathBuf::from(OsStr::from_bytes(b"/opt/\xff"));
        let err = check_paths(&config.clone().sys_path(bad.clone())).unwrap_err();
        assert!(
            matches!(err, Error::Load(LoadError::InvalidPath(ref path)) if *path == bad),
            "unexpected error: {err}"
        );
    }
}
