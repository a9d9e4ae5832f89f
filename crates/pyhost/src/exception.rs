//! Capturing the interpreter's error indicator as a [`PyException`].

use std::ptr;

use crate::{
    error::{Error, PyException},
    ffi::ObjectPtr,
    gil::GilGuard,
    object::Owned,
};

/// Clears the error indicator and returns it as an [`Error`].
pub(crate) fn fetch(gil: &GilGuard<'_>) -> Error {
    let api = gil.api();
    let mut ptype: ObjectPtr = ptr::null_mut();
    let mut pvalue: ObjectPtr = ptr::null_mut();
    let mut ptraceback: ObjectPtr = ptr::null_mut();
    // SAFETY: GIL held; the out-pointers receive new references (or null) and the indicator is cleared.
    unsafe {
        (api.PyErr_Fetch)(&raw mut ptype, &raw mut pvalue, &raw mut ptraceback);
        if !ptype.is_null() {
            (api.PyErr_NormalizeException)(&raw mut ptype, &raw mut pvalue, &raw mut ptraceback);
        }
    }
    let ptype = gil.own_opt(ptype);
    let pvalue = gil.own_opt(pvalue);
    let ptraceback = gil.own_opt(ptraceback);
    let Some(ptype) = ptype else {
        return Error::Bridge("a Python API call failed without setting an exception".to_owned());
    };

    let type_name = type_name(gil, &ptype).unwrap_or_else(|| "Exception".to_owned());
    let lines = format(gil, ptype.as_ptr(), pvalue.as_ref(), ptraceback.as_ref())
        .unwrap_or_else(|| vec![format!("{type_name}: <exception could not be rendered>\n")]);
    log::debug!("captured Python exception {type_name}");

    PyException {
        ptype: ptype.into_object(),
        pvalue: pvalue.map(Owned::into_object),
        ptraceback: ptraceback.map(Owned::into_object),
        type_name,
        lines,
    }
    .into()
}

/// Renders an exception triple with `traceback.format_exception`.
///
/// Never consults [`fetch`], so a failure while rendering cannot recurse; it is cleared and
/// reported as `None` instead.
pub(crate) fn format(
    gil: &GilGuard<'_>,
    ptype: ObjectPtr,
    pvalue: Option<&Owned<'_>>,
    ptraceback: Option<&Owned<'_>>,
) -> Option<Vec<String>> {
    let rendered = try_format(gil, ptype, pvalue, ptraceback);
    if rendered.is_none() {
        // SAFETY: GIL held.
        unsafe { (gil.api().PyErr_Clear)() };
    }
    rendered
}

fn try_format(
    gil: &GilGuard<'_>,
    ptype: ObjectPtr,
    pvalue: Option<&Owned<'_>>,
    ptraceback: Option<&Owned<'_>>,
) -> Option<Vec<String>> {
    let api = gil.api();
    // SAFETY: GIL held for every call below; all pointers passed are live.
    unsafe {
        let traceback = gil.own_opt((api.PyImport_ImportModule)(c"traceback".as_ptr()))?;
        let format_exception = gil.own_opt((api.PyObject_GetAttrString)(traceback.as_ptr(), c"format_exception".as_ptr()))?;
        let none = gil.own_opt((api.Py_BuildValue)(c"".as_ptr()))?;
        let value = pvalue.map_or(none.as_ptr(), Owned::as_ptr);
        let tb = ptraceback.map_or(none.as_ptr(), Owned::as_ptr);
        let lines = format_exception.call_opt(&[ptype, value, tb])?;
        let len = usize::try_from((api.PyList_Size)(lines.as_ptr())).ok()?;
        let mut rendered = Vec::with_capacity(len);
        for index in 0..len {
            let item = (api.PyList_GetItem)(lines.as_ptr(), index as isize);
            let mut size = 0;
            let data = (api.PyUnicode_AsUTF8AndSize)(item, &raw mut size);
            if data.is_null() {
                return None;
            }
            let bytes = std::slice::from_raw_parts(data.cast::<u8>(), usize::try_from(size).ok()?);
            rendered.push(String::from_utf8_lossy(bytes).into_owned());
        }
        Some(rendered)
    }
}

fn type_name(gil: &GilGuard<'_>, ptype: &Owned<'_>) -> Option<String> {
    let name = ptype.getattr_opt(c"__name__")?;
    let mut size = 0;
    // SAFETY: GIL held; `name` is alive for the duration of the copy.
    unsafe {
        let data = (gil.api().PyUnicode_AsUTF8AndSize)(name.as_ptr(), &raw mut size);
        if data.is_null() {
            (gil.api().PyErr_Clear)();
            return None;
        }
        let bytes = std::slice::from_raw_parts(data.cast::<u8>(), usize::try_from(size).ok()?);
        Some(String::from_utf8_lossy(bytes).into_owned())
    }
}
