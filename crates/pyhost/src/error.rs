use std::{fmt, path::PathBuf};

use crate::object::PyObject;

/// Any failure surfaced by the bridge.
#[derive(Debug, Clone)]
pub enum Error {
    /// The host misused the API (second init, use after shutdown, bad argument).
    Usage(UsageError),
    /// Python code raised, or a C API call failed with an exception set.
    Python(Box<PyException>),
    /// The shared library could not be loaded or is missing an entry point.
    Load(LoadError),
    /// Source handed to the scope analyzer does not parse.
    Syntax(SyntaxError),
    /// The interpreter violated an invariant the bridge relies on.
    Bridge(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usage(e) => write!(f, "{e}"),
            Self::Python(e) => write!(f, "{e}"),
            Self::Load(e) => write!(f, "{e}"),
            Self::Syntax(e) => write!(f, "{e}"),
            Self::Bridge(msg) => write!(f, "bridge error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<UsageError> for Error {
    fn from(error: UsageError) -> Self {
        Self::Usage(error)
    }
}

impl From<PyException> for Error {
    fn from(error: PyException) -> Self {
        Self::Python(Box::new(error))
    }
}

impl From<LoadError> for Error {
    fn from(error: LoadError) -> Self {
        Self::Load(error)
    }
}

impl From<SyntaxError> for Error {
    fn from(error: SyntaxError) -> Self {
        Self::Syntax(error)
    }
}

/// API misuse by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageError {
    /// `Python::init` was called after the interpreter had already been started in this process.
    AlreadyInitialized,
    /// The session was shut down; no further interpreter calls are possible.
    NotInitialized,
    /// An argument could not be handed to the interpreter.
    InvalidArgument(String),
}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "Python interpreter has already been initialized"),
            Self::NotInitialized => write!(f, "Python interpreter has not been initialized"),
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl std::error::Error for UsageError {}

/// Failure to load the interpreter library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// A configured path cannot be passed to the platform loader or the interpreter.
    InvalidPath(PathBuf),
    /// The platform loader rejected the library.
    OpenLibrary { path: PathBuf, reason: String },
    /// The library does not export a required C API function.
    MissingSymbol(&'static str),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPath(path) => write!(f, "invalid path: {}", path.display()),
            Self::OpenLibrary { path, reason } => {
                write!(f, "failed to load Python library {}: {reason}", path.display())
            }
            Self::MissingSymbol(name) => write!(f, "failed to load symbol: {name}"),
        }
    }
}

impl std::error::Error for LoadError {}

/// A parse failure reported by the scope analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub message: String,
    /// 1-based line of the error.
    pub line: usize,
    /// 1-based column (in characters) of the error.
    pub column: usize,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyntaxError: {} (line {}, column {})", self.message, self.line, self.column)
    }
}

impl std::error::Error for SyntaxError {}

/// A Python exception captured from the interpreter.
///
/// Holds the exception triple as handles so the host can inspect or re-raise it, together with
/// the traceback text rendered by `traceback.format_exception` at the time it was caught.
#[derive(Debug, Clone)]
pub struct PyException {
    pub(crate) ptype: PyObject,
    pub(crate) pvalue: Option<PyObject>,
    pub(crate) ptraceback: Option<PyObject>,
    pub(crate) type_name: String,
    pub(crate) lines: Vec<String>,
}

impl PyException {
    /// The exception class, e.g. `NameError`.
    #[must_use]
    pub fn ptype(&self) -> &PyObject {
        &self.ptype
    }

    /// The exception instance, if the interpreter provided one.
    #[must_use]
    pub fn pvalue(&self) -> Option<&PyObject> {
        self.pvalue.as_ref()
    }

    /// The traceback object, absent for exceptions raised outside any frame.
    #[must_use]
    pub fn ptraceback(&self) -> Option<&PyObject> {
        self.ptraceback.as_ref()
    }

    /// `__name__` of the exception class.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Rendered traceback lines, each normally ending in a newline.
    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// The final `Type: message` line of the traceback.
    #[must_use]
    pub fn message(&self) -> &str {
        self.lines
            .iter()
            .rev()
            .map(|line| line.trim_end())
            .find(|line| !line.is_empty())
            .unwrap_or(&self.type_name)
    }
}

impl fmt::Display for PyException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: String = self.lines.concat();
        write!(f, "{}", text.trim_end())
    }
}

impl std::error::Error for PyException {}
