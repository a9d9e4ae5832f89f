//! Compilation of snippets into a statement block plus an optional trailing expression, cached
//! by content hash for the life of the session.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use md5::{Digest, Md5};

use crate::{error::Error, gil::GilGuard, object::PyObject, python::Shared};

/// MD5 digest of a snippet's source text, the compilation cache key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeHash([u8; 16]);

impl CodeHash {
    #[must_use]
    pub fn of(source: &str) -> Self {
        let digest = Md5::digest(source.as_bytes());
        let mut bytes = [0; 16];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for CodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl fmt::Debug for CodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeHash({self})")
    }
}

/// Compiled form of one snippet. At least one part is present unless the snippet was empty.
#[derive(Debug)]
pub(crate) struct Compiled {
    /// Every statement except a trailing expression statement, compiled in `exec` mode.
    pub(crate) body: Option<PyObject>,
    /// The trailing expression statement, compiled in `eval` mode.
    pub(crate) expr: Option<PyObject>,
}

/// Append-only map from source hash to compiled code. Entries are never evicted.
///
/// The map lock is only held for lookups and inserts, never while the GIL is held.
#[derive(Default)]
pub(crate) struct CodeCache {
    entries: Mutex<HashMap<CodeHash, Arc<Compiled>>>,
}

impl CodeCache {
    /// Returns the cached code for `hash`, compiling `source` on a miss.
    ///
    /// Compilation happens outside the map lock, so two threads may compile the same snippet
    /// concurrently; the first to insert wins and the other's result is dropped.
    pub(crate) fn compile_or_get(&self, shared: &Shared, source: &str, hash: CodeHash) -> Result<Arc<Compiled>, Error> {
        if let Some(compiled) = self.lock().get(&hash) {
            return Ok(Arc::clone(compiled));
        }
        log::debug!("compiling snippet {hash}");
        let compiled = {
            let gil = GilGuard::acquire(shared)?;
            split_compile(&gil, source)?
        };
        let mut entries = self.lock();
        Ok(Arc::clone(entries.entry(hash).or_insert_with(|| Arc::new(compiled))))
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CodeHash, Arc<Compiled>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parses `source`, splits off a trailing expression statement and compiles both parts.
fn split_compile(gil: &GilGuard<'_>, source: &str) -> Result<Compiled, Error> {
    let api = gil.api();
    let ast = gil.import(c"ast")?;
    let compile = gil.builtin(c"compile")?;
    let code = gil.new_str(source)?;
    let filename = gil.new_str("<string>")?;
    let exec_mode = gil.new_str("exec")?;

    let module = ast
        .getattr(c"parse")?
        .call(&[code.as_ptr(), filename.as_ptr(), exec_mode.as_ptr()])?;
    let body = module.getattr(c"body")?;
    // SAFETY: GIL held, `body` is a list.
    let mut len = gil.check_size(unsafe { (api.PyList_Size)(body.as_ptr()) })?;

    let mut expr = None;
    if len > 0 {
        // SAFETY: GIL held, index in bounds; the item is borrowed.
        let last = gil.borrow(unsafe { (api.PyList_GetItem)(body.as_ptr(), (len - 1) as isize) })?;
        let expr_class = ast.getattr(c"Expr")?;
        if gil.is_instance(last.as_ptr(), &expr_class)? {
            body.getattr(c"pop")?.call0()?;
            len -= 1;
            let expression = ast.getattr(c"Expression")?.call(&[last.getattr(c"value")?.as_ptr()])?;
            for attr in [c"lineno", c"col_offset", c"end_col_offset"] {
                expression.setattr(attr, last.getattr(attr)?.as_ptr())?;
            }
            let eval_mode = gil.new_str("eval")?;
            let compiled = compile.call(&[expression.as_ptr(), filename.as_ptr(), eval_mode.as_ptr()])?;
            expr = Some(compiled.into_object());
        }
    }

    let body = if len > 0 {
        let compiled = compile.call(&[module.as_ptr(), filename.as_ptr(), exec_mode.as_ptr()])?;
        Some(compiled.into_object())
    } else {
        None
    };
    Ok(Compiled { body, expr })
}
