use std::{
    ffi::CStr,
    ptr,
    sync::Arc,
    thread::{self, ThreadId},
};

use indexmap::IndexMap;

use crate::{
    capsule::{self, CapsuleData},
    compile::{CodeHash, Compiled},
    error::Error,
    ffi::{ObjectPtr, PySsize},
    gil::GilGuard,
    io::{OutputSink, Outputs, Stream},
    janitor::ReleaseQueue,
    object::{Owned, PyObject},
    python::Shared,
};

/// Names bound to objects, in the scope's iteration order.
pub type Globals = IndexMap<String, PyObject>;

/// Key under which each evaluation's context capsule is stored in its globals.
const CONTEXT_KEY: &CStr = c"__pyhost_eval_context__";

/// Result of one evaluation.
#[derive(Debug, Clone)]
pub struct EvalOutput {
    /// Value of the trailing expression, if the snippet ended with one.
    pub result: Option<PyObject>,
    /// Names the snippet bound, excluding caller-supplied names still bound to the object the
    /// caller passed.
    pub globals: Globals,
}

/// Where an evaluation's output goes. Owned by a capsule in the evaluation's globals, so it
/// lives as long as any function or thread created by the evaluation.
pub(crate) struct EvalContext {
    outputs: Outputs,
    origin: ThreadId,
    queue: Arc<ReleaseQueue>,
}

impl CapsuleData for EvalContext {
    const NAME: &'static CStr = c"pyhost.eval_context";
}

impl EvalContext {
    pub(crate) fn forward(&self, stream: Stream, text: String) {
        if thread::current().id() != self.origin {
            log::trace!("output from an interpreter thread outliving its evaluation");
        }
        let sink: Arc<dyn OutputSink> = Arc::clone(self.outputs.sink(stream));
        self.queue.forward_output(text, sink);
    }
}

/// Runs a compiled snippet in a fresh `__main__` module.
///
/// Acquires the GIL for the whole run and pings the janitor after releasing it, so that output
/// written during the run has reached its sinks when this returns.
pub(crate) fn run(
    shared: &Shared,
    source: &str,
    hash: CodeHash,
    globals: &Globals,
    outputs: &Outputs,
) -> Result<EvalOutput, Error> {
    let compiled = shared.cache.compile_or_get(shared, source, hash)?;
    // the guard drops before the ping, so the janitor can take the GIL
    let outcome = GilGuard::acquire(shared).and_then(|gil| run_locked(&gil, &compiled, globals, outputs));
    shared.queue.ping();
    outcome
}

fn run_locked(gil: &GilGuard<'_>, compiled: &Compiled, globals: &Globals, outputs: &Outputs) -> Result<EvalOutput, Error> {
    let api = gil.api();
    let name = gil.new_str("__main__")?;
    let module = gil.import(c"types")?.getattr(c"ModuleType")?.call(&[name.as_ptr()])?;
    // SAFETY: GIL held; returns a borrowed reference to the module's namespace.
    let scope = gil.borrow(unsafe { (api.PyModule_GetDict)(module.as_ptr()) })?;

    let builtins = gil.builtins()?;
    gil.dict_set(scope.as_ptr(), c"__builtins__", builtins.as_ptr())?;
    let context = EvalContext {
        outputs: outputs.clone(),
        origin: thread::current().id(),
        queue: Arc::clone(&gil.shared().queue),
    };
    let context = capsule::new(gil, context)?;
    gil.dict_set(scope.as_ptr(), CONTEXT_KEY, context.as_ptr())?;

    // pickle and friends look classes up through sys.modules["__main__"]; concurrent
    // evaluations overwrite each other's binding
    let modules = gil.import(c"sys")?.getattr(c"modules")?;
    gil.dict_set(modules.as_ptr(), c"__main__", module.as_ptr())?;

    // SAFETY: GIL held.
    let initial = gil.own(unsafe { (api.PyDict_Copy)(scope.as_ptr()) })?;
    for (name, value) in globals {
        let key = gil.new_str(name)?;
        // SAFETY: GIL held; the dict does not steal either reference.
        gil.check(unsafe { (api.PyDict_SetItem)(scope.as_ptr(), key.as_ptr(), value.as_ptr()) })?;
    }

    if let Some(body) = &compiled.body {
        // SAFETY: GIL held; `body` is a code object and `scope` a dict.
        gil.own(unsafe { (api.PyEval_EvalCode)(body.as_ptr(), scope.as_ptr(), scope.as_ptr()) })?;
    }
    let result = match &compiled.expr {
        // SAFETY: as above.
        Some(expr) => Some(gil.own(unsafe { (api.PyEval_EvalCode)(expr.as_ptr(), scope.as_ptr(), scope.as_ptr()) })?),
        None => None,
    };

    Ok(EvalOutput {
        result: result.map(Owned::into_object),
        globals: bound_names(gil, &scope, &initial, globals)?,
    })
}

/// Collects the string keys of `scope` that are absent from `initial`, skipping caller-supplied
/// names whose value is still the very object the caller passed in.
fn bound_names(gil: &GilGuard<'_>, scope: &Owned<'_>, initial: &Owned<'_>, supplied: &Globals) -> Result<Globals, Error> {
    let api = gil.api();
    let str_class = gil.builtin(c"str")?;
    let mut bound = Globals::new();
    let mut position: PySsize = 0;
    let mut key: ObjectPtr = ptr::null_mut();
    let mut value: ObjectPtr = ptr::null_mut();
    // SAFETY: GIL held; PyDict_Next yields borrowed references and nothing below mutates `scope`.
    while unsafe { (api.PyDict_Next)(scope.as_ptr(), &raw mut position, &raw mut key, &raw mut value) } != 0 {
        // SAFETY: GIL held.
        if gil.check(unsafe { (api.PyDict_Contains)(initial.as_ptr(), key) })? == 1 {
            continue;
        }
        if !gil.is_instance(key, &str_class)? {
            continue;
        }
        let name = gil.string(key)?;
        if supplied.get(&name).is_some_and(|original| original.as_ptr() == value) {
            continue;
        }
        bound.insert(name, gil.handle(value)?);
    }
    Ok(bound)
}
