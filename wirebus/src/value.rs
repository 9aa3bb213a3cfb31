//! The dynamic D-Bus value model.

use std::os::fd::OwnedFd;

use crate::names::ObjectPath;
use crate::signature::{Signature, Type};
use crate::Result;

/// A single D-Bus value.
///
/// A `Value` carrying a [`Value::Fd`] owns the descriptor: dropping the value
/// closes it. Duplication of values is therefore explicit, via
/// [`Value::deep_dup`].
#[derive(Debug)]
pub enum Value {
    U8(u8),
    Bool(bool),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    ObjectPath(ObjectPath),
    Signature(Signature),
    /// An owned file descriptor, transmitted out-of-band via `SCM_RIGHTS`.
    Fd(OwnedFd),
    /// An array with an explicit element type, so that empty arrays keep
    /// their signature.
    Array(Type, Vec<Value>),
    /// Specialization of `ay`; compares equal to the equivalent `Array`.
    Bytes(Vec<u8>),
    /// An array of dict entries with a basic key type.
    Dict {
        key: Type,
        value: Type,
        entries: Vec<(Value, Value)>,
    },
    Struct(Vec<Value>),
    Variant(Box<Value>),
}

impl Value {
    /// The single complete type of this value.
    pub fn ty(&self) -> Type {
        match self {
            Value::U8(_) => Type::Byte,
            Value::Bool(_) => Type::Bool,
            Value::I16(_) => Type::Int16,
            Value::U16(_) => Type::Uint16,
            Value::I32(_) => Type::Int32,
            Value::U32(_) => Type::Uint32,
            Value::I64(_) => Type::Int64,
            Value::U64(_) => Type::Uint64,
            Value::F64(_) => Type::Double,
            Value::Str(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::Fd(_) => Type::UnixFd,
            Value::Array(elem, _) => Type::Array(Box::new(elem.clone())),
            Value::Bytes(_) => Type::Array(Box::new(Type::Byte)),
            Value::Dict { key, value, .. } => {
                Type::Dict(Box::new(key.clone()), Box::new(value.clone()))
            }
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::ty).collect()),
            Value::Variant(_) => Type::Variant,
        }
    }

    /// Wrap a value in a variant.
    pub fn variant(value: Value) -> Value {
        Value::Variant(Box::new(value))
    }

    /// The signature of a value sequence, e.g. a message body.
    pub fn signature_of(values: &[Value]) -> Signature {
        Signature::new(values.iter().map(Value::ty).collect())
    }

    /// The number of file descriptors carried in this value.
    pub(crate) fn count_fds(&self) -> usize {
        match self {
            Value::Fd(_) => 1,
            Value::Array(_, values) | Value::Struct(values) => {
                values.iter().map(Value::count_fds).sum()
            }
            Value::Dict { entries, .. } => entries
                .iter()
                .map(|(k, v)| k.count_fds() + v.count_fds())
                .sum(),
            Value::Variant(inner) => inner.count_fds(),
            _ => 0,
        }
    }

    /// Duplicate this value, giving every contained file descriptor a fresh
    /// kernel handle. Subtrees that cannot carry descriptors are cloned
    /// without further inspection.
    pub fn deep_dup(&self) -> Result<Value> {
        if !self.ty().contains_fds() {
            return Ok(self.clone_fd_free());
        }

        let value = match self {
            Value::Fd(fd) => Value::Fd(fd.try_clone()?),
            Value::Array(elem, values) => Value::Array(
                elem.clone(),
                values
                    .iter()
                    .map(Value::deep_dup)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Dict {
                key,
                value,
                entries,
            } => Value::Dict {
                key: key.clone(),
                value: value.clone(),
                entries: entries
                    .iter()
                    .map(|(k, v)| Ok((k.deep_dup()?, v.deep_dup()?)))
                    .collect::<Result<Vec<_>>>()?,
            },
            Value::Struct(fields) => Value::Struct(
                fields
                    .iter()
                    .map(Value::deep_dup)
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Variant(inner) => Value::Variant(Box::new(inner.deep_dup()?)),
            // Everything else was handled by the fd-free fast path above.
            _ => unreachable!("basic fd-free value on the slow path"),
        };

        Ok(value)
    }

    // Precondition: `!self.ty().contains_fds()`.
    fn clone_fd_free(&self) -> Value {
        match self {
            Value::U8(v) => Value::U8(*v),
            Value::Bool(v) => Value::Bool(*v),
            Value::I16(v) => Value::I16(*v),
            Value::U16(v) => Value::U16(*v),
            Value::I32(v) => Value::I32(*v),
            Value::U32(v) => Value::U32(*v),
            Value::I64(v) => Value::I64(*v),
            Value::U64(v) => Value::U64(*v),
            Value::F64(v) => Value::F64(*v),
            Value::Str(v) => Value::Str(v.clone()),
            Value::ObjectPath(v) => Value::ObjectPath(v.clone()),
            Value::Signature(v) => Value::Signature(v.clone()),
            Value::Bytes(v) => Value::Bytes(v.clone()),
            Value::Array(elem, values) => Value::Array(
                elem.clone(),
                values.iter().map(Value::clone_fd_free).collect(),
            ),
            Value::Dict {
                key,
                value,
                entries,
            } => Value::Dict {
                key: key.clone(),
                value: value.clone(),
                entries: entries
                    .iter()
                    .map(|(k, v)| (k.clone_fd_free(), v.clone_fd_free()))
                    .collect(),
            },
            Value::Struct(fields) => {
                Value::Struct(fields.iter().map(Value::clone_fd_free).collect())
            }
            Value::Fd(_) | Value::Variant(_) => {
                unreachable!("fd-bearing value on the fd-free path")
            }
        }
    }
}

/// Identify the open file behind a descriptor, so that equality can compare
/// descriptors by what they point at rather than by handle number.
fn fd_identity(fd: &OwnedFd) -> Option<(u64, u64)> {
    rustix::fs::fstat(fd)
        .ok()
        .map(|st| (st.st_dev as u64, st.st_ino as u64))
}

fn bytes_eq_array(bytes: &[u8], elem: &Type, values: &[Value]) -> bool {
    *elem == Type::Byte
        && bytes.len() == values.len()
        && bytes
            .iter()
            .zip(values)
            .all(|(b, v)| matches!(v, Value::U8(x) if x == b))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::ObjectPath(a), Value::ObjectPath(b)) => a == b,
            (Value::Signature(a), Value::Signature(b)) => a == b,
            (Value::Fd(a), Value::Fd(b)) => match (fd_identity(a), fd_identity(b)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Bytes(bytes), Value::Array(elem, values))
            | (Value::Array(elem, values), Value::Bytes(bytes)) => {
                bytes_eq_array(bytes, elem, values)
            }
            (Value::Array(ea, va), Value::Array(eb, vb)) => ea == eb && va == vb,
            (
                Value::Dict {
                    key: ka,
                    value: va,
                    entries: ea,
                },
                Value::Dict {
                    key: kb,
                    value: vb,
                    entries: eb,
                },
            ) => ka == kb && va == vb && ea == eb,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            (Value::Variant(a), Value::Variant(b)) => a == b,
            _ => false,
        }
    }
}

macro_rules! from_impl {
    ($($ty:ty => $variant:ident,)*) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Value {
                    Value::$variant(v)
                }
            }
        )*
    };
}

from_impl! {
    u8 => U8,
    bool => Bool,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    i64 => I64,
    u64 => U64,
    f64 => F64,
    String => Str,
    ObjectPath => ObjectPath,
    Signature => Signature,
    OwnedFd => Fd,
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Str(v.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Type;

    #[test]
    fn types() {
        assert_eq!(Value::I32(1).ty(), Type::Int32);
        assert_eq!(Value::Bytes(vec![1]).ty().to_string(), "ay");
        assert_eq!(
            Value::Array(Type::String, vec![]).ty().to_string(),
            "as"
        );
        assert_eq!(
            Value::Struct(vec![Value::U8(1), Value::Str("x".into())])
                .ty()
                .to_string(),
            "(ys)"
        );
        assert_eq!(
            Value::Dict {
                key: Type::String,
                value: Type::Variant,
                entries: vec![],
            }
            .ty()
            .to_string(),
            "a{sv}"
        );
        assert_eq!(
            Value::signature_of(&[Value::I32(7), Value::variant(Value::Bool(true))]).to_string(),
            "iv"
        );
    }

    #[test]
    fn bytes_equal_byte_array() {
        let bytes = Value::Bytes(vec![1, 2, 3]);
        let array = Value::Array(
            Type::Byte,
            vec![Value::U8(1), Value::U8(2), Value::U8(3)],
        );
        assert_eq!(bytes, array);
        assert_ne!(bytes, Value::Array(Type::Byte, vec![Value::U8(1)]));
    }

    #[test]
    fn deep_dup_fd_free() {
        let v = Value::Struct(vec![
            Value::I32(-4),
            Value::Array(Type::String, vec![Value::Str("a".into())]),
        ]);
        assert_eq!(v.deep_dup().unwrap(), v);
    }

    #[test]
    fn deep_dup_duplicates_fds() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = OwnedFd::from(file);
        let v = Value::Struct(vec![Value::U8(1), Value::Fd(fd)]);

        let dup = v.deep_dup().unwrap();
        // Same open file, so the values compare equal...
        assert_eq!(dup, v);
        // ...through distinct handles.
        let raw = |val: &Value| match val {
            Value::Struct(fields) => match &fields[1] {
                Value::Fd(fd) => {
                    use std::os::fd::AsRawFd;
                    fd.as_raw_fd()
                }
                _ => panic!("expected fd"),
            },
            _ => panic!("expected struct"),
        };
        assert_ne!(raw(&v), raw(&dup));
    }
}
