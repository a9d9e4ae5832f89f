use std::fmt::{self, Write};

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::{mailbox::MailboxId, object::PyObject};

/// A host value that can be encoded into a Python object, or decoded from one.
///
/// `Object` is the escape hatch in both directions: encoding it passes the existing Python object
/// through unchanged, and decoding yields it for anything without a structural mapping.
///
/// `Set` keeps the interpreter's iteration order, which is arbitrary; compare sets
/// order-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    /// An `int` that fits in 64 bits.
    Int(i64),
    /// An `int` of any size. Decoding produces this only for values outside `i64`.
    BigInt(BigInt),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Self>),
    Tuple(Vec<Self>),
    /// `dict`, in insertion order.
    Dict(Vec<(Self, Self)>),
    /// `set` or `frozenset`; encodes as `set`.
    Set(Vec<Self>),
    /// An interpreter object kept by reference.
    Object(PyObject),
    /// A host mailbox, seen by interpreter code as a `pyhost.Mailbox`.
    Mailbox(MailboxId),
}

impl Value {
    /// Normalizes a big integer that fits in `i64` to `Int`.
    #[must_use]
    pub fn int(value: impl Into<BigInt>) -> Self {
        let value = value.into();
        match value.to_i64() {
            Some(small) => Self::Int(small),
            None => Self::BigInt(value),
        }
    }

    /// Python-style representation. `Object` values show as their address since rendering them
    /// needs the interpreter; use `Python::repr` for that.
    #[must_use]
    pub fn py_repr(&self) -> String {
        let mut out = String::new();
        // writing to a String cannot fail
        let _ = self.repr_fmt(&mut out);
        out
    }

    fn repr_fmt(&self, f: &mut impl Write) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(v) => write!(f, "{v}"),
            Self::BigInt(v) => write!(f, "{v}"),
            Self::Float(v) => float_repr_fmt(*v, f),
            Self::Str(s) => string_repr_fmt(s, f),
            Self::Bytes(b) => bytes_repr_fmt(b, f),
            Self::List(items) => sequence_fmt(f, '[', items, ']'),
            Self::Tuple(items) => {
                if let [single] = items.as_slice() {
                    f.write_char('(')?;
                    single.repr_fmt(f)?;
                    f.write_str(",)")
                } else {
                    sequence_fmt(f, '(', items, ')')
                }
            }
            Self::Dict(pairs) => {
                f.write_char('{')?;
                for (index, (key, value)) in pairs.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    key.repr_fmt(f)?;
                    f.write_str(": ")?;
                    value.repr_fmt(f)?;
                }
                f.write_char('}')
            }
            Self::Set(items) if items.is_empty() => f.write_str("set()"),
            Self::Set(items) => sequence_fmt(f, '{', items, '}'),
            Self::Object(object) => write!(f, "<object at {:#x}>", object.addr()),
            Self::Mailbox(id) => write!(f, "<pyhost.Mailbox {}>", id.as_u64()),
        }
    }

    /// Natural JSON mapping, with `$`-tagged objects for values JSON has no type for:
    ///
    /// - `None` → `null`, `Bool` → `true`/`false`, `Int` and finite `Float` → number
    /// - `BigInt` → `{"$bigint": "12345..."}`
    /// - non-finite `Float` → `null`
    /// - `Bytes` → `{"$bytes": [...]}`
    /// - `Tuple` → `{"$tuple": [...]}`, `Set` → `{"$set": [...]}`
    /// - `Dict` → JSON object, with non-string keys rendered by repr
    /// - `Object` → `{"$object": address}`, `Mailbox` → `{"$mailbox": id}`
    #[must_use]
    pub fn to_json_value(&self) -> serde_json::Value {
        use serde_json::{Value as JV, json};
        match self {
            Self::None => JV::Null,
            Self::Bool(b) => JV::Bool(*b),
            Self::Int(i) => json!(i),
            Self::BigInt(bi) => json!({"$bigint": bi.to_string()}),
            Self::Float(f) => {
                if f.is_finite() {
                    json!(f)
                } else {
                    JV::Null
                }
            }
            Self::Str(s) => JV::String(s.clone()),
            Self::Bytes(b) => json!({"$bytes": b}),
            Self::List(items) => JV::Array(items.iter().map(Self::to_json_value).collect()),
            Self::Tuple(items) => json!({"$tuple": items.iter().map(Self::to_json_value).collect::<Vec<_>>()}),
            Self::Dict(pairs) => {
                let map: serde_json::Map<String, JV> = pairs
                    .iter()
                    .map(|(k, v)| {
                        let key = match k {
                            Self::Str(s) => s.clone(),
                            other => other.py_repr(),
                        };
                        (key, v.to_json_value())
                    })
                    .collect();
                JV::Object(map)
            }
            Self::Set(items) => json!({"$set": items.iter().map(Self::to_json_value).collect::<Vec<_>>()}),
            Self::Object(object) => json!({"$object": object.addr()}),
            Self::Mailbox(id) => json!({"$mailbox": id.as_u64()}),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            other => other.repr_fmt(f),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<BigInt> for Value {
    fn from(value: BigInt) -> Self {
        Self::int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<PyObject> for Value {
    fn from(value: PyObject) -> Self {
        Self::Object(value)
    }
}

impl From<MailboxId> for Value {
    fn from(value: MailboxId) -> Self {
        Self::Mailbox(value)
    }
}

impl<T: Into<Self>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// One level of decoding: containers hold handles to their items, not decoded values.
#[derive(Debug, Clone, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Decoded {
    None,
    Bool(bool),
    Int(i64),
    /// An `int` outside `i64`, as base-10 text.
    BigInt(String),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Mailbox(MailboxId),
    Tuple(Vec<PyObject>),
    List(Vec<PyObject>),
    Dict(Vec<(PyObject, PyObject)>),
    /// `set` or `frozenset`.
    Set(Vec<PyObject>),
    /// No structural mapping; the object itself.
    Opaque(PyObject),
}

impl Decoded {
    /// Short name of the variant, e.g. `"big_int"` or `"opaque"`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.into()
    }
}

fn sequence_fmt(f: &mut impl Write, open: char, items: &[Value], close: char) -> fmt::Result {
    f.write_char(open)?;
    for (index, item) in items.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        item.repr_fmt(f)?;
    }
    f.write_char(close)
}

fn float_repr_fmt(value: f64, f: &mut impl Write) -> fmt::Result {
    if value.is_nan() {
        return f.write_str("nan");
    }
    if value.is_infinite() {
        return f.write_str(if value > 0.0 { "inf" } else { "-inf" });
    }
    // shortest round-trip digits either way; the exponent picks the notation like `float.__repr__`
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return write!(f, "{mantissa}e{sign}{:02}", exponent.unsigned_abs());
    }
    let fixed = value.to_string();
    f.write_str(&fixed)?;
    if !fixed.contains('.') {
        f.write_str(".0")?;
    }
    Ok(())
}

fn string_repr_fmt(s: &str, f: &mut impl Write) -> fmt::Result {
    let quote = if s.contains('\'') && !s.contains('"') { '"' } else { '\'' };
    f.write_char(quote)?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\t' => f.write_str("\\t")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            c if c == quote => {
                f.write_char('\\')?;
                f.write_char(c)?;
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => write!(f, "\\x{:02x}", c as u32)?,
            c => f.write_char(c)?,
        }
    }
    f.write_char(quote)
}

fn bytes_repr_fmt(bytes: &[u8], f: &mut impl Write) -> fmt::Result {
    let has_single = bytes.contains(&b'\'');
    let has_double = bytes.contains(&b'"');
    let quote = if has_single && !has_double { '"' } else { '\'' };

    f.write_char('b')?;
    f.write_char(quote)?;
    for &byte in bytes {
        match byte {
            b'\\' => f.write_str("\\\\")?,
            b'\t' => f.write_str("\\t")?,
            b'\n' => f.write_str("\\n")?,
            b'\r' => f.write_str("\\r")?,
            b'\'' if quote == '\'' => f.write_str("\\'")?,
            b'"' if quote == '"' => f.write_str("\\\"")?,
            0x20..=0x7e => f.write_char(byte as char)?,
            _ => write!(f, "\\x{byte:02x}")?,
        }
    }
    f.write_char(quote)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn big_ints_that_fit_are_normalized() {
        assert_eq!(Value::int(BigInt::from(42)), Value::Int(42));
        let big = BigInt::from(1u128 << 70);
        assert_eq!(Value::int(big.clone()), Value::BigInt(big));
    }

    #[test]
    fn repr_matches_python() {
        let value = Value::Dict(vec![
            (Value::from("a"), Value::List(vec![Value::Int(1), Value::Float(2.0)])),
            (Value::Int(3), Value::Tuple(vec![Value::None])),
            (Value::from("it's"), Value::Bytes(vec![0, b'a', 0xff])),
        ]);
        assert_eq!(value.py_repr(), r#"{'a': [1, 2.0], 3: (None,), "it's": b'\x00a\xff'}"#);
        assert_eq!(Value::Set(vec![]).py_repr(), "set()");
        assert_eq!(Value::Float(f64::NEG_INFINITY).py_repr(), "-inf");
        assert_eq!(Value::from("tab\there").py_repr(), r"'tab\there'");
    }

    #[test]
    fn float_repr_switches_to_exponents_like_python() {
        let cases = [
            (1e20, "1e+20"),
            (1e16, "1e+16"),
            (1e15, "1000000000000000.0"),
            (123.456, "123.456"),
            (0.0001, "0.0001"),
            (0.00001, "1e-05"),
            (-2.5e-7, "-2.5e-07"),
            (-0.0, "-0.0"),
            (f64::MAX, "1.7976931348623157e+308"),
            (5e-324, "5e-324"),
        ];
        for (value, expected) in cases {
            assert_eq!(Value::Float(value).py_repr(), expected, "repr of {value:e}");
        }
    }

    #[test]
    fn display_leaves_strings_unquoted() {
        assert_eq!(Value::from("plain").to_string(), "plain");
        assert_eq!(Value::Bool(true).to_string(), "True");
    }

    #[test]
    fn json_mapping_tags_non_json_types() {
        let value = Value::List(vec![
            Value::Tuple(vec![Value::Int(1)]),
            Value::BigInt(BigInt::from(1u128 << 70)),
            Value::Float(f64::NAN),
            Value::Dict(vec![(Value::Int(1), Value::from("x"))]),
        ]);
        assert_eq!(
            value.to_json_value(),
            serde_json::json!([{"$tuple": [1]}, {"$bigint": "1180591620717411303424"}, null, {"1": "x"}])
        );
    }

    #[test]
    fn decoded_kind_names() {
        assert_eq!(Decoded::BigInt("1".to_owned()).kind(), "big_int");
        assert_eq!(Decoded::None.kind(), "none");
    }
}
