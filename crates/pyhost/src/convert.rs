//! Marshaling between [`Value`] and interpreter objects. Every function here requires the GIL.

use std::{
    ffi::{CString, c_char, c_int, c_long},
    ptr,
};

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::{
    error::{Error, UsageError},
    ffi::{ObjectPtr, PySsize},
    gil::GilGuard,
    mailbox::MailboxId,
    object::{Owned, PyObject},
    value::{Decoded, Value},
};

/// Encodes `value` as a new interpreter object.
pub(crate) fn encode(gil: &GilGuard<'_>, value: &Value) -> Result<PyObject, Error> {
    match value {
        Value::Object(object) => Ok(object.clone()),
        other => encode_owned(gil, other).map(Owned::into_object),
    }
}

fn encode_owned<'g>(gil: &'g GilGuard<'_>, value: &Value) -> Result<Owned<'g>, Error> {
    let api = gil.api();
    // SAFETY: GIL held for every constructor call below; each returns a new reference or null.
    unsafe {
        match value {
            Value::None => gil.none(),
            Value::Bool(b) => gil.own((api.PyBool_FromLong)(c_long::from(*b))),
            Value::Int(i) => gil.own((api.PyLong_FromLongLong)(*i)),
            Value::BigInt(big) => encode_big_int(gil, big),
            Value::Float(f) => gil.own((api.PyFloat_FromDouble)(*f)),
            Value::Str(s) => gil.new_str(s),
            Value::Bytes(b) => gil.own((api.PyBytes_FromStringAndSize)(b.as_ptr().cast(), ssize(b.len())?)),
            Value::List(items) => {
                let list = gil.own((api.PyList_New)(ssize(items.len())?))?;
                for (index, item) in items.iter().enumerate() {
                    let item = encode_owned(gil, item)?;
                    // steals the item reference, even on failure
                    gil.check((api.PyList_SetItem)(list.as_ptr(), ssize(index)?, item.into_ptr()))?;
                }
                Ok(list)
            }
            Value::Tuple(items) => {
                let tuple = gil.own((api.PyTuple_New)(ssize(items.len())?))?;
                for (index, item) in items.iter().enumerate() {
                    let item = encode_owned(gil, item)?;
                    gil.check((api.PyTuple_SetItem)(tuple.as_ptr(), ssize(index)?, item.into_ptr()))?;
                }
                Ok(tuple)
            }
            Value::Dict(pairs) => {
                let dict = gil.own((api.PyDict_New)())?;
                for (key, value) in pairs {
                    let key = encode_owned(gil, key)?;
                    let value = encode_owned(gil, value)?;
                    gil.check((api.PyDict_SetItem)(dict.as_ptr(), key.as_ptr(), value.as_ptr()))?;
                }
                Ok(dict)
            }
            Value::Set(items) => {
                let set = gil.own((api.PySet_New)(ptr::null_mut()))?;
                for item in items {
                    let item = encode_owned(gil, item)?;
                    gil.check((api.PySet_Add)(set.as_ptr(), item.as_ptr()))?;
                }
                Ok(set)
            }
            Value::Object(object) => gil.borrow(object.as_ptr()),
            Value::Mailbox(id) => encode_mailbox(gil, *id),
        }
    }
}

fn encode_big_int<'g>(gil: &'g GilGuard<'_>, big: &BigInt) -> Result<Owned<'g>, Error> {
    if let Some(small) = big.to_i64() {
        // SAFETY: GIL held.
        return gil.own(unsafe { (gil.api().PyLong_FromLongLong)(small) });
    }
    let text = CString::new(big.to_str_radix(36)).map_err(|e| Error::Bridge(e.to_string()))?;
    // SAFETY: GIL held; `text` is NUL-terminated base-36 digits with an optional sign.
    gil.own(unsafe { (gil.api().PyLong_FromString)(text.as_ptr(), ptr::null_mut(), 36) })
}

fn encode_mailbox<'g>(gil: &'g GilGuard<'_>, id: MailboxId) -> Result<Owned<'g>, Error> {
    let class = mailbox_class(gil)?;
    let bytes = id.to_bytes();
    // SAFETY: GIL held.
    let raw = gil.own(unsafe { (gil.api().PyBytes_FromStringAndSize)(bytes.as_ptr().cast(), ssize(bytes.len())?) })?;
    class.call(&[raw.as_ptr()])
}

fn mailbox_class<'g>(gil: &'g GilGuard<'_>) -> Result<Owned<'g>, Error> {
    gil.import(c"pyhost")?.getattr(c"Mailbox")
}

/// Classifies `object` one level deep.
pub(crate) fn decode_once(gil: &GilGuard<'_>, object: &PyObject) -> Result<Decoded, Error> {
    let api = gil.api();
    let ptr = object.as_ptr();
    // SAFETY: GIL held and `ptr` is kept alive by `object` for the duration of this call.
    unsafe {
        if (api.Py_IsNone)(ptr) != 0 {
            return Ok(Decoded::None);
        }
        if (api.Py_IsTrue)(ptr) != 0 {
            return Ok(Decoded::Bool(true));
        }
        if (api.Py_IsFalse)(ptr) != 0 {
            return Ok(Decoded::Bool(false));
        }
    }

    let builtins = Builtins::load(gil)?;
    if gil.is_instance(ptr, &builtins.int)? {
        return decode_int(gil, ptr);
    }
    if gil.is_instance(ptr, &builtins.float)? {
        // SAFETY: GIL held, `ptr` is a float.
        let value = unsafe { (api.PyFloat_AsDouble)(ptr) };
        if value == -1.0 && gil.error_pending() {
            return Err(gil.take_error());
        }
        return Ok(Decoded::Float(value));
    }
    if gil.is_instance(ptr, &builtins.tuple)? {
        // SAFETY: GIL held, `ptr` is a tuple; items are borrowed.
        let len = gil.check_size(unsafe { (api.PyTuple_Size)(ptr) })?;
        let items = (0..len)
            .map(|index| gil.handle(unsafe { (api.PyTuple_GetItem)(ptr, index as PySsize) }))
            .collect::<Result<_, _>>()?;
        return Ok(Decoded::Tuple(items));
    }
    if gil.is_instance(ptr, &builtins.list)? {
        // SAFETY: GIL held, `ptr` is a list; items are borrowed.
        let len = gil.check_size(unsafe { (api.PyList_Size)(ptr) })?;
        let items = (0..len)
            .map(|index| gil.handle(unsafe { (api.PyList_GetItem)(ptr, index as PySsize) }))
            .collect::<Result<_, _>>()?;
        return Ok(Decoded::List(items));
    }
    if gil.is_instance(ptr, &builtins.dict)? {
        return decode_dict(gil, ptr);
    }
    if gil.is_instance(ptr, &builtins.str)? {
        return gil.string(ptr).map(Decoded::Str);
    }
    if gil.is_instance(ptr, &builtins.bytes)? {
        return decode_bytes(gil, ptr);
    }
    if gil.is_instance(ptr, &builtins.set)? || gil.is_instance(ptr, &builtins.frozenset)? {
        return decode_set(gil, ptr);
    }
    let mailbox = mailbox_class(gil)?;
    if gil.is_instance(ptr, &mailbox)? {
        let id = gil.borrow(ptr)?.getattr(c"id")?;
        let bytes = bytes_of(gil, id.as_ptr())?;
        let id = MailboxId::from_bytes(&bytes)
            .ok_or_else(|| UsageError::InvalidArgument("malformed pyhost.Mailbox id".to_owned()))?;
        return Ok(Decoded::Mailbox(id));
    }
    Ok(Decoded::Opaque(object.clone()))
}

/// Decodes `object` completely, keeping unmapped objects as [`Value::Object`].
pub(crate) fn decode(gil: &GilGuard<'_>, object: &PyObject) -> Result<Value, Error> {
    let decode_all = |items: Vec<PyObject>| items.iter().map(|item| decode(gil, item)).collect::<Result<Vec<_>, _>>();
    Ok(match decode_once(gil, object)? {
        Decoded::None => Value::None,
        Decoded::Bool(b) => Value::Bool(b),
        Decoded::Int(i) => Value::Int(i),
        Decoded::BigInt(text) => Value::BigInt(
            text.parse::<BigInt>()
                .map_err(|e| Error::Bridge(format!("interpreter produced an invalid integer {text:?}: {e}")))?,
        ),
        Decoded::Float(f) => Value::Float(f),
        Decoded::Str(s) => Value::Str(s),
        Decoded::Bytes(b) => Value::Bytes(b),
        Decoded::Mailbox(id) => Value::Mailbox(id),
        Decoded::Tuple(items) => Value::Tuple(decode_all(items)?),
        Decoded::List(items) => Value::List(decode_all(items)?),
        Decoded::Set(items) => Value::Set(decode_all(items)?),
        Decoded::Dict(pairs) => Value::Dict(
            pairs
                .iter()
                .map(|(key, value)| Ok((decode(gil, key)?, decode(gil, value)?)))
                .collect::<Result<_, Error>>()?,
        ),
        Decoded::Opaque(object) => Value::Object(object),
    })
}

fn decode_int(gil: &GilGuard<'_>, ptr: ObjectPtr) -> Result<Decoded, Error> {
    let api = gil.api();
    let mut overflow: c_int = 0;
    // SAFETY: GIL held, `ptr` is an int.
    let value = unsafe { (api.PyLong_AsLongLongAndOverflow)(ptr, &raw mut overflow) };
    if value == -1 && gil.error_pending() {
        return Err(gil.take_error());
    }
    if overflow == 0 {
        return Ok(Decoded::Int(value));
    }
    // SAFETY: GIL held.
    let text = gil.own(unsafe { (api.PyObject_Str)(ptr) })?;
    gil.string(text.as_ptr()).map(Decoded::BigInt)
}

fn decode_dict(gil: &GilGuard<'_>, ptr: ObjectPtr) -> Result<Decoded, Error> {
    let api = gil.api();
    let mut pairs = Vec::new();
    let mut position: PySsize = 0;
    let mut key: ObjectPtr = ptr::null_mut();
    let mut value: ObjectPtr = ptr::null_mut();
    // SAFETY: GIL held; PyDict_Next yields borrowed references and the dict is not mutated meanwhile.
    while unsafe { (api.PyDict_Next)(ptr, &raw mut position, &raw mut key, &raw mut value) } != 0 {
        pairs.push((gil.handle(key)?, gil.handle(value)?));
    }
    Ok(Decoded::Dict(pairs))
}

fn decode_bytes(gil: &GilGuard<'_>, ptr: ObjectPtr) -> Result<Decoded, Error> {
    bytes_of(gil, ptr).map(Decoded::Bytes)
}

fn bytes_of(gil: &GilGuard<'_>, ptr: ObjectPtr) -> Result<Vec<u8>, Error> {
    let mut data: *mut c_char = ptr::null_mut();
    let mut len: PySsize = 0;
    // SAFETY: GIL held; on success `data` points at `len` bytes owned by the object.
    gil.check(unsafe { (gil.api().PyBytes_AsStringAndSize)(ptr, &raw mut data, &raw mut len) })?;
    let len = gil.check_size(len)?;
    // SAFETY: see above.
    Ok(unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len) }.to_vec())
}

fn decode_set(gil: &GilGuard<'_>, ptr: ObjectPtr) -> Result<Decoded, Error> {
    let api = gil.api();
    // SAFETY: GIL held.
    let iterator = gil.own(unsafe { (api.PyObject_GetIter)(ptr) })?;
    let mut items = Vec::new();
    // SAFETY: GIL held; PyIter_Next returns new references and null at the end or on error.
    while let Some(item) = gil.own_opt(unsafe { (api.PyIter_Next)(iterator.as_ptr()) }) {
        items.push(item.into_object());
    }
    if gil.error_pending() {
        return Err(gil.take_error());
    }
    Ok(Decoded::Set(items))
}

/// The builtin types checked while decoding.
struct Builtins<'g> {
    int: Owned<'g>,
    float: Owned<'g>,
    tuple: Owned<'g>,
    list: Owned<'g>,
    dict: Owned<'g>,
    str: Owned<'g>,
    bytes: Owned<'g>,
    set: Owned<'g>,
    frozenset: Owned<'g>,
}

impl<'g> Builtins<'g> {
    fn load(gil: &'g GilGuard<'_>) -> Result<Self, Error> {
        Ok(Self {
            int: gil.builtin(c"int")?,
            float: gil.builtin(c"float")?,
            tuple: gil.builtin(c"tuple")?,
            list: gil.builtin(c"list")?,
            dict: gil.builtin(c"dict")?,
            str: gil.builtin(c"str")?,
            bytes: gil.builtin(c"bytes")?,
            set: gil.builtin(c"set")?,
            frozenset: gil.builtin(c"frozenset")?,
        })
    }
}

fn ssize(len: usize) -> Result<PySsize, Error> {
    PySsize::try_from(len).map_err(|_| Error::Bridge(format!("length {len} does not fit Py_ssize_t")))
}
