use std::{
    ffi::{c_char, c_int, c_void},
    fmt,
    io::{self, Write as _},
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    capsule::{self, CapsuleData},
    error::Error,
    eval::EvalContext,
    ffi::ObjectPtr,
    gil::GilGuard,
    janitor::ReleaseQueue,
    mailbox::{self, MailboxRegistry},
};

/// Destination for text written to `sys.stdout` or `sys.stderr` by interpreter code.
///
/// Sinks are invoked from the janitor thread, one write at a time, in the order the interpreter
/// wrote. A sink attached to an evaluation keeps receiving output from interpreter threads
/// started during that evaluation, even after it returned.
pub trait OutputSink: Send + Sync {
    /// Called once per `write()` call made by interpreter code.
    fn write(&self, text: &str);
}

/// Sink that writes through to the host process's own stdout or stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdOutput {
    Stdout,
    Stderr,
}

impl OutputSink for StdOutput {
    fn write(&self, text: &str) {
        // host stream failures are not the interpreter's problem, drop the text
        let _ = match self {
            Self::Stdout => {
                let mut out = io::stdout().lock();
                out.write_all(text.as_bytes()).and_then(|()| out.flush())
            }
            Self::Stderr => io::stderr().lock().write_all(text.as_bytes()),
        };
    }
}

/// Sink that collects everything written into a string.
#[derive(Debug, Default)]
pub struct CollectOutput {
    buffer: Mutex<String>,
}

impl CollectOutput {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of everything collected so far.
    #[must_use]
    pub fn output(&self) -> String {
        self.lock().clone()
    }

    /// Takes everything collected so far, leaving the buffer empty.
    pub fn take(&self) -> String {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, String> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputSink for CollectOutput {
    fn write(&self, text: &str) {
        self.lock().push_str(text);
    }
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOutput;

impl OutputSink for NoOutput {
    fn write(&self, _text: &str) {}
}

/// The pair of sinks an evaluation writes to.
#[derive(Clone)]
pub struct Outputs {
    pub stdout: Arc<dyn OutputSink>,
    pub stderr: Arc<dyn OutputSink>,
}

impl Outputs {
    pub fn new(stdout: Arc<dyn OutputSink>, stderr: Arc<dyn OutputSink>) -> Self {
        Self { stdout, stderr }
    }

    /// Write through to the host's stdout and stderr.
    #[must_use]
    pub fn std() -> Self {
        Self::new(Arc::new(StdOutput::Stdout), Arc::new(StdOutput::Stderr))
    }

    /// Discard all output.
    #[must_use]
    pub fn discard() -> Self {
        Self::new(Arc::new(NoOutput), Arc::new(NoOutput))
    }

    /// Send both streams to the same sink.
    pub fn merged(sink: Arc<dyn OutputSink>) -> Self {
        Self::new(Arc::clone(&sink), sink)
    }

    pub(crate) fn sink(&self, stream: Stream) -> &Arc<dyn OutputSink> {
        match stream {
            Stream::Stdout => &self.stdout,
            Stream::Stderr => &self.stderr,
        }
    }
}

impl Default for Outputs {
    fn default() -> Self {
        Self::std()
    }
}

impl fmt::Debug for Outputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outputs").finish_non_exhaustive()
    }
}

/// Which interpreter stream a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn from_kind(kind: c_int) -> Self {
        if kind == 1 { Self::Stderr } else { Self::Stdout }
    }

    /// Where output goes when no evaluation can be attributed to it.
    fn fallback(self) -> StdOutput {
        match self {
            Self::Stdout => StdOutput::Stdout,
            Self::Stderr => StdOutput::Stderr,
        }
    }
}

/// Session-wide state reachable from interpreter callbacks that have no evaluation context.
pub(crate) struct SessionLink {
    pub(crate) queue: Arc<ReleaseQueue>,
    pub(crate) mailboxes: Arc<MailboxRegistry>,
}

impl CapsuleData for SessionLink {
    const NAME: &'static std::ffi::CStr = c"pyhost.session";
}

/// Interpreter-side plumbing installed once at startup.
///
/// Replaces `sys.stdout` and `sys.stderr` with text streams that hand every write to
/// [`write_output`], together with the evaluation context found by walking the calling frames
/// (the outermost frame whose globals carry one wins, so threads started by an evaluation keep
/// writing to its sinks). `sys.stdin` is replaced by a stream whose reads raise. Also registers
/// the `pyhost` module used to send objects to host mailboxes.
const BOOTSTRAP: &str = r#"
import ctypes
import io
import sys
import types

_CONTEXT_KEY = "__pyhost_eval_context__"

_write = ctypes.PYFUNCTYPE(
    None, ctypes.c_char_p, ctypes.c_size_t, ctypes.py_object, ctypes.py_object, ctypes.c_int
)(_write_address)
_send = ctypes.PYFUNCTYPE(
    ctypes.c_int,
    ctypes.c_char_p,
    ctypes.c_size_t,
    ctypes.c_char_p,
    ctypes.c_size_t,
    ctypes.py_object,
    ctypes.py_object,
)(_send_address)


def _eval_context():
    found = None
    frame = sys._getframe(1)
    while frame is not None:
        context = frame.f_globals.get(_CONTEXT_KEY)
        if context is not None:
            found = context
        frame = frame.f_back
    return found


class _Output(io.TextIOBase):
    def __init__(self, kind):
        self._kind = kind

    def writable(self):
        return True

    def write(self, string):
        if not isinstance(string, str):
            raise TypeError(f"write() argument must be str, not {type(string).__name__}")
        data = string.encode("utf-8", "replace")
        _write(data, len(data), _eval_context(), _session, self._kind)
        return len(string)


class _Input(io.TextIOBase):
    def readable(self):
        return True

    def read(self, size=-1):
        raise RuntimeError("stdin not supported")

    def readline(self, size=-1):
        raise RuntimeError("stdin not supported")

    def readlines(self, hint=-1):
        raise RuntimeError("stdin not supported")


class Mailbox:
    """A host mailbox that interpreter code can send tagged objects to."""

    __slots__ = ("id",)

    def __init__(self, id):
        self.id = bytes(id)

    def __eq__(self, other):
        return isinstance(other, Mailbox) and other.id == self.id

    def __hash__(self):
        return hash(self.id)

    def __repr__(self):
        return f"<pyhost.Mailbox {int.from_bytes(self.id, 'little')}>"


def send_tagged_object(mailbox, tag, obj):
    """Sends obj to the host mailbox, labelled with tag."""
    if not isinstance(mailbox, Mailbox):
        raise TypeError("send_tagged_object() expects a pyhost.Mailbox")
    if not isinstance(tag, str):
        raise TypeError("send_tagged_object() expects a str tag")
    tag_bytes = tag.encode("utf-8")
    if not _send(mailbox.id, len(mailbox.id), tag_bytes, len(tag_bytes), obj, _session):
        raise RuntimeError("mailbox is closed")


Mailbox.__module__ = "pyhost"
send_tagged_object.__module__ = "pyhost"
_module = types.ModuleType("pyhost")
_module.Mailbox = Mailbox
_module.send_tagged_object = send_tagged_object
sys.modules["pyhost"] = _module

sys.stdout = _Output(0)
sys.stderr = _Output(1)
sys.stdin = _Input()
"#;

/// Runs [`BOOTSTRAP`] with the callback addresses and the session link in its globals.
pub(crate) fn install(gil: &GilGuard<'_>, link: SessionLink) -> Result<(), Error> {
    let api = gil.api();
    let globals = gil.own(
        // SAFETY: GIL held.
        unsafe { (api.PyDict_New)() },
    )?;
    let builtins = gil.builtins()?;
    gil.dict_set(globals.as_ptr(), c"__builtins__", builtins.as_ptr())?;

    let write_address = write_output as *const () as *mut c_void;
    let send_address = mailbox::send_tagged_object as *const () as *mut c_void;
    for (name, address) in [(c"_write_address", write_address), (c"_send_address", send_address)] {
        // SAFETY: GIL held; the address is only ever turned back into the same function pointer by ctypes.
        let address = gil.own(unsafe { (api.PyLong_FromVoidPtr)(address) })?;
        gil.dict_set(globals.as_ptr(), name, address.as_ptr())?;
    }
    let link = capsule::new(gil, link)?;
    gil.dict_set(globals.as_ptr(), c"_session", link.as_ptr())?;

    let exec = gil.builtin(c"exec")?;
    let source = gil.new_str(BOOTSTRAP)?;
    exec.call(&[source.as_ptr(), globals.as_ptr()])?;
    log::debug!("installed stdout/stderr/stdin overrides and the pyhost module");
    Ok(())
}

/// Target of `_Output.write`. Runs on whichever interpreter thread wrote, with the GIL held.
unsafe extern "C" fn write_output(data: *const c_char, len: usize, context: ObjectPtr, session: ObjectPtr, kind: c_int) {
    if data.is_null() || len == 0 {
        return;
    }
    // SAFETY: ctypes passes the buffer of a bytes object of length `len`.
    let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) };
    let text = String::from_utf8_lossy(bytes).into_owned();
    let stream = Stream::from_kind(kind);
    // SAFETY: the GIL is held and both capsules are kept alive by the calling frames.
    let (context, link) = unsafe { (capsule::get::<EvalContext>(context), capsule::get::<SessionLink>(session)) };
    if let Some(context) = context {
        context.forward(stream, text);
    } else if let Some(link) = link {
        link.queue.forward_output(text, Arc::new(stream.fallback()));
    } else {
        stream.fallback().write(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_output_accumulates_and_takes() {
        let sink = CollectOutput::new();
        sink.write("hello ");
        sink.write("world\n");
        assert_eq!(sink.output(), "hello world\n");
        assert_eq!(sink.take(), "hello world\n");
        assert_eq!(sink.output(), "");
    }

    #[test]
    fn merged_outputs_share_one_sink() {
        let sink = Arc::new(CollectOutput::new());
        let outputs = Outputs::merged(sink.clone());
        outputs.sink(Stream::Stdout).write("out ");
        outputs.sink(Stream::Stderr).write("err");
        assert_eq!(sink.output(), "out err");
    }

    #[test]
    fn unknown_stream_kinds_go_to_stdout() {
        assert_eq!(Stream::from_kind(0), Stream::Stdout);
        assert_eq!(Stream::from_kind(1), Stream::Stderr);
        assert_eq!(Stream::from_kind(7), Stream::Stdout);
    }
}
