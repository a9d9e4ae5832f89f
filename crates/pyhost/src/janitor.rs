//! The janitor: one background thread that owns every interpreter interaction the host did not
//! ask for explicitly.
//!
//! Handles may be dropped on any thread, including threads that must not block on the GIL, so a
//! drop only enqueues a [`JanitorMessage::Decref`]. Output written by Python code is forwarded
//! the same way so that sinks are always invoked from one place and in write order.

use std::{
    fmt,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
};

use crate::{ffi::PyObjectRaw, gil::GilGuard, io::OutputSink, python::Shared};

/// Work items processed by the janitor, strictly in arrival order.
pub(crate) enum JanitorMessage {
    /// Drop one strong reference.
    Decref(RawRef),
    /// Deliver captured output to its sink.
    Output { text: String, sink: Arc<dyn OutputSink> },
    /// Acknowledge once every earlier message has been processed.
    Ping(mpsc::SyncSender<()>),
    /// Exit the janitor loop.
    Stop,
}

impl fmt::Debug for JanitorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decref(raw) => write!(f, "Decref({:p})", raw.0),
            Self::Output { text, .. } => write!(f, "Output({text:?})"),
            Self::Ping(_) => write!(f, "Ping"),
            Self::Stop => write!(f, "Stop"),
        }
    }
}

/// A strong reference in transit to the janitor.
pub(crate) struct RawRef(pub(crate) NonNull<PyObjectRaw>);

// SAFETY: the pointer is only dereferenced by the interpreter, with the GIL held, on the janitor thread.
unsafe impl Send for RawRef {}

/// Sending side of the janitor queue, shared by every handle.
pub(crate) struct ReleaseQueue {
    live: AtomicBool,
    sender: Sender<JanitorMessage>,
}

impl ReleaseQueue {
    pub(crate) fn new() -> (Arc<Self>, Receiver<JanitorMessage>) {
        let (sender, receiver) = mpsc::channel();
        let queue = Self {
            live: AtomicBool::new(true),
            sender,
        };
        (Arc::new(queue), receiver)
    }

    /// Whether the interpreter still accepts work.
    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn mark_dead(&self) {
        self.live.store(false, Ordering::Release);
    }

    /// Schedules one decref. A no-op once the session has shut down.
    pub(crate) fn release(&self, ptr: NonNull<PyObjectRaw>) {
        if !self.is_live() {
            return;
        }
        if self.sender.send(JanitorMessage::Decref(RawRef(ptr))).is_err() {
            log::warn!("janitor is gone, leaking Python reference {ptr:p}");
        }
    }

    /// Schedules delivery of `text` to `sink`.
    pub(crate) fn forward_output(&self, text: String, sink: Arc<dyn OutputSink>) {
        if let Err(mpsc::SendError(message)) = self.sender.send(JanitorMessage::Output { text, sink }) {
            // no janitor to order against, write straight through
            if let JanitorMessage::Output { text, sink } = message {
                sink.write(&text);
            }
        }
    }

    /// Blocks until every message queued before this call has been processed.
    ///
    /// Must not be called while holding the GIL: the janitor may need it to drain the queue.
    pub(crate) fn ping(&self) {
        let (ack, done) = mpsc::sync_channel(1);
        if self.sender.send(JanitorMessage::Ping(ack)).is_ok() {
            // an Err here means the janitor exited, so there is nothing left to wait for
            let _ = done.recv();
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.sender.send(JanitorMessage::Stop);
    }
}

/// Starts the janitor thread.
pub(crate) fn spawn(shared: Arc<Shared>, receiver: Receiver<JanitorMessage>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("pyhost-janitor".to_owned())
        .spawn(move || run(&shared, &receiver))
}

fn run(shared: &Shared, receiver: &Receiver<JanitorMessage>) {
    log::debug!("janitor started");
    for message in receiver {
        match message {
            JanitorMessage::Decref(raw) => decref(shared, &raw),
            JanitorMessage::Output { text, sink } => sink.write(&text),
            JanitorMessage::Ping(ack) => {
                let _ = ack.send(());
            }
            JanitorMessage::Stop => break,
        }
    }
    log::debug!("janitor stopped");
}

fn decref(shared: &Shared, raw: &RawRef) {
    // shutdown holds the lifecycle lock while flipping the live flag, so a decref either runs
    // entirely before shutdown or observes the dead flag
    let _lifecycle = shared.lock_lifecycle();
    if !shared.queue.is_live() {
        return;
    }
    let gil = match GilGuard::acquire(shared) {
        Ok(gil) => gil,
        Err(err) => {
            log::error!("leaking a reference: {err}");
            return;
        }
    };
    // SAFETY: the GIL is held and `raw` carries a strong reference owned by the dropped handle.
    unsafe { (gil.api().Py_DecRef)(raw.0.as_ptr()) };
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recorder(Mutex<Vec<String>>);

    impl OutputSink for Recorder {
        fn write(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_owned());
        }
    }

    #[test]
    fn release_after_shutdown_enqueues_nothing() {
        let (queue, receiver) = ReleaseQueue::new();
        queue.mark_dead();
        queue.release(NonNull::dangling());
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn output_is_forwarded_in_order() {
        let (queue, receiver) = ReleaseQueue::new();
        let sink = Arc::new(Recorder(Mutex::new(Vec::new())));
        queue.forward_output("a".to_owned(), sink.clone());
        queue.forward_output("b".to_owned(), sink.clone());
        queue.stop();
        for message in receiver {
            match message {
                JanitorMessage::Output { text, sink } => sink.write(&text),
                JanitorMessage::Stop => break,
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert_eq!(*sink.0.lock().unwrap(), ["a", "b"]);
    }

    #[test]
    fn output_without_a_janitor_is_written_directly() {
        let (queue, receiver) = ReleaseQueue::new();
        drop(receiver);
        let sink = Arc::new(Recorder(Mutex::new(Vec::new())));
        queue.forward_output("direct".to_owned(), sink.clone());
        assert_eq!(*sink.0.lock().unwrap(), ["direct"]);
    }

    #[test]
    fn ping_returns_when_janitor_is_gone() {
        let (queue, receiver) = ReleaseQueue::new();
        drop(receiver);
        queue.ping();
    }
}
