//! Host mailboxes that interpreter code can address.
//!
//! A [`Mailbox`] is the host end of a channel. Its [`MailboxId`] encodes to a `pyhost.Mailbox`
//! instance, and `pyhost.send_tagged_object(mailbox, tag, obj)` called from interpreter code
//! delivers a [`TaggedObject`] to it.

use std::{
    collections::HashMap,
    ffi::{c_char, c_int},
    fmt,
    ptr::NonNull,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    },
    time::Duration,
};

use crate::{capsule, ffi, ffi::ObjectPtr, io::SessionLink, object::PyObject};

/// Identity of a host mailbox, stable for the mailbox's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxId(u64);

impl MailboxId {
    /// The raw byte representation carried by `pyhost.Mailbox` instances.
    #[must_use]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    /// Parses the representation produced by [`to_bytes`](Self::to_bytes).
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(|bytes| Self(u64::from_le_bytes(bytes)))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mailbox#{}", self.0)
    }
}

/// An object sent from interpreter code, with the tag it was sent under.
#[derive(Debug, Clone)]
pub struct TaggedObject {
    pub tag: String,
    pub object: PyObject,
}

/// Live mailboxes of one session.
#[derive(Default)]
pub(crate) struct MailboxRegistry {
    next_id: AtomicU64,
    senders: Mutex<HashMap<MailboxId, Sender<TaggedObject>>>,
}

impl MailboxRegistry {
    pub(crate) fn open(self: &Arc<Self>) -> Mailbox {
        let id = MailboxId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel();
        self.lock().insert(id, sender);
        Mailbox {
            id,
            receiver,
            registry: Arc::clone(self),
        }
    }

    /// Delivers `message`, returning false if the mailbox is closed.
    pub(crate) fn deliver(&self, id: MailboxId, message: TaggedObject) -> bool {
        let senders = self.lock();
        senders.get(&id).is_some_and(|sender| sender.send(message).is_ok())
    }

    fn close(&self, id: MailboxId) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<MailboxId, Sender<TaggedObject>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Receiving end of a mailbox. Dropping it closes the mailbox; later sends raise in the sender.
pub struct Mailbox {
    id: MailboxId,
    receiver: Receiver<TaggedObject>,
    registry: Arc<MailboxRegistry>,
}

impl Mailbox {
    #[must_use]
    pub fn id(&self) -> MailboxId {
        self.id
    }

    /// Blocks until a message arrives.
    pub fn recv(&self) -> Option<TaggedObject> {
        self.receiver.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<TaggedObject> {
        match self.receiver.recv_timeout(timeout) {
            Ok(message) => Some(message),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<TaggedObject> {
        match self.receiver.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

impl fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mailbox").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.registry.close(self.id);
    }
}

/// Target of `pyhost.send_tagged_object`. Runs with the GIL held; returns 1 when delivered.
pub(crate) unsafe extern "C" fn send_tagged_object(
    id: *const c_char,
    id_len: usize,
    tag: *const c_char,
    tag_len: usize,
    object: ObjectPtr,
    session: ObjectPtr,
) -> c_int {
    let (Some(api), Some(object)) = (ffi::api(), NonNull::new(object)) else {
        return 0;
    };
    if id.is_null() || tag.is_null() {
        return 0;
    }
    // SAFETY: GIL held; ctypes passes bytes buffers of the given lengths and a live session capsule.
    let (link, id, tag) = unsafe {
        (
            capsule::get::<SessionLink>(session),
            std::slice::from_raw_parts(id.cast::<u8>(), id_len),
            std::slice::from_raw_parts(tag.cast::<u8>(), tag_len),
        )
    };
    let (Some(link), Some(id)) = (link, MailboxId::from_bytes(id)) else {
        return 0;
    };
    // SAFETY: GIL held; the new reference is handed to the handle.
    let object = unsafe {
        (api.Py_IncRef)(object.as_ptr());
        PyObject::from_owned_ptr(&link.queue, object)
    };
    let message = TaggedObject {
        tag: String::from_utf8_lossy(tag).into_owned(),
        object,
    };
    c_int::from(link.mailboxes.deliver(id, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_round_trip_through_bytes() {
        let id = MailboxId(0x0102_0304_0506_0708);
        assert_eq!(MailboxId::from_bytes(&id.to_bytes()), Some(id));
        assert_eq!(MailboxId::from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn mailboxes_get_distinct_ids_and_close_on_drop() {
        let registry = Arc::new(MailboxRegistry::default());
        let first = registry.open();
        let second = registry.open();
        assert_ne!(first.id(), second.id());
        let id = first.id();
        drop(first);
        assert!(!registry.lock().contains_key(&id));
        assert!(registry.lock().contains_key(&second.id()));
    }
}
