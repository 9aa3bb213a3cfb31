use std::os::fd::OwnedFd;

use super::{Endian, MAX_ARRAY_LENGTH};
use crate::names::ObjectPath;
use crate::signature::{Signature, Type};
use crate::utils::padding_for_n_bytes;
use crate::value::Value;
use crate::{Error, Result};

/// A bounds-checked cursor over one marshaled message.
///
/// Alignment is computed relative to the start of the buffer, so the buffer
/// must begin at a message boundary. File descriptors referenced by `h`
/// values are resolved against `fds` by duplication; [`Reader::finish_fds`]
/// reports descriptors the message never referenced.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    endian: Endian,
    fds: &'a [OwnedFd],
    fds_used: Vec<bool>,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8], endian: Endian, fds: &'a [OwnedFd]) -> Self {
        Reader {
            buf,
            pos: 0,
            endian,
            fds,
            fds_used: vec![false; fds.len()],
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn set_position(&mut self, pos: usize) {
        debug_assert!(pos <= self.buf.len());
        self.pos = pos;
    }

    pub fn error(&self, reason: impl Into<String>) -> Error {
        Error::decode(reason, self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| self.error("unexpected end of message"))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Advance over padding to a multiple of `align`. Padding content is
    /// ignored, but it must be present in the buffer.
    pub fn align(&mut self, align: usize) -> Result<()> {
        let padding = padding_for_n_bytes(self.pos, align);
        self.take(padding)?;
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.align(4)?;
        let bytes = self.take(4)?;
        Ok(self.endian.read_u32(bytes))
    }

    fn read_bool(&mut self) -> Result<bool> {
        self.align(4)?;
        let at = self.pos;
        let bytes = self.take(4)?;
        match self.endian.read_u32(bytes) {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(Error::decode(format!("invalid boolean value: {v}"), at)),
        }
    }

    fn read_str_raw(&mut self, len: usize) -> Result<&'a str> {
        let at = self.pos;
        let bytes = self.take(len + 1)?;
        if bytes[len] != 0 {
            return Err(Error::decode("string is not NUL-terminated", at + len));
        }
        std::str::from_utf8(&bytes[..len])
            .map_err(|_| Error::decode("string is not valid UTF-8", at))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        Ok(self.read_str_raw(len)?.to_owned())
    }

    fn read_object_path(&mut self) -> Result<ObjectPath> {
        let len = self.read_u32()? as usize;
        let at = self.pos;
        let s = self.read_str_raw(len)?;
        ObjectPath::try_from(s).map_err(|e| Error::decode(e.to_string(), at))
    }

    pub fn read_signature(&mut self) -> Result<Signature> {
        let len = self.read_u8()? as usize;
        let at = self.pos;
        let s = self.read_str_raw(len)?;
        Signature::parse(s).map_err(|reason| Error::decode(reason, at))
    }

    fn read_fd(&mut self) -> Result<OwnedFd> {
        self.align(4)?;
        let at = self.pos;
        let bytes = self.take(4)?;
        let index = self.endian.read_u32(bytes) as usize;
        let fd = self.fds.get(index).ok_or_else(|| {
            Error::decode(format!("file descriptor index {index} out of range"), at)
        })?;
        self.fds_used[index] = true;
        Ok(fd.try_clone()?)
    }

    /// Decode one value of the given type at the cursor.
    pub fn read_value(&mut self, ty: &Type) -> Result<Value> {
        let value = match ty {
            Type::Byte => Value::U8(self.read_u8()?),
            Type::Bool => Value::Bool(self.read_bool()?),
            Type::Int16 => {
                self.align(2)?;
                let bytes = self.take(2)?;
                Value::I16(self.endian.read_i16(bytes))
            }
            Type::Uint16 => {
                self.align(2)?;
                let bytes = self.take(2)?;
                Value::U16(self.endian.read_u16(bytes))
            }
            Type::Int32 => {
                self.align(4)?;
                let bytes = self.take(4)?;
                Value::I32(self.endian.read_i32(bytes))
            }
            Type::Uint32 => Value::U32(self.read_u32()?),
            Type::Int64 => {
                self.align(8)?;
                let bytes = self.take(8)?;
                Value::I64(self.endian.read_i64(bytes))
            }
            Type::Uint64 => {
                self.align(8)?;
                let bytes = self.take(8)?;
                Value::U64(self.endian.read_u64(bytes))
            }
            Type::Double => {
                self.align(8)?;
                let bytes = self.take(8)?;
                Value::F64(self.endian.read_f64(bytes))
            }
            Type::String => Value::Str(self.read_string()?),
            Type::ObjectPath => Value::ObjectPath(self.read_object_path()?),
            Type::Signature => Value::Signature(self.read_signature()?),
            Type::UnixFd => Value::Fd(self.read_fd()?),
            Type::Array(elem) => {
                let end = self.read_array_header(elem.alignment())?;
                if **elem == Type::Byte {
                    let bytes = self.take(end - self.pos)?;
                    Value::Bytes(bytes.to_vec())
                } else {
                    let mut values = Vec::new();
                    while self.pos < end {
                        values.push(self.read_value(elem)?);
                    }
                    self.check_array_end(end)?;
                    Value::Array((**elem).clone(), values)
                }
            }
            Type::Dict(key, value) => {
                let end = self.read_array_header(8)?;
                let mut entries = Vec::new();
                while self.pos < end {
                    self.align(8)?;
                    let k = self.read_value(key)?;
                    let v = self.read_value(value)?;
                    entries.push((k, v));
                }
                self.check_array_end(end)?;
                Value::Dict {
                    key: (**key).clone(),
                    value: (**value).clone(),
                    entries,
                }
            }
            Type::Struct(fields) => {
                self.align(8)?;
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.read_value(field)?);
                }
                Value::Struct(values)
            }
            Type::Variant => {
                let at = self.pos;
                let signature = self.read_signature()?;
                let inner = match signature.types() {
                    [ty] => self.read_value(ty)?,
                    _ => {
                        return Err(Error::decode(
                            "variant signature is not a single complete type",
                            at,
                        ));
                    }
                };
                Value::variant(inner)
            }
        };

        Ok(value)
    }

    /// Decode one variant at the cursor.
    pub fn read_variant(&mut self) -> Result<Value> {
        self.read_value(&Type::Variant)
    }

    // Reads the length word and the padding to the first element; returns
    // the end offset of the element region.
    fn read_array_header(&mut self, elem_alignment: usize) -> Result<usize> {
        self.align(4)?;
        let at = self.pos;
        let bytes = self.take(4)?;
        let len = self.endian.read_u32(bytes) as usize;
        if len > MAX_ARRAY_LENGTH {
            return Err(Error::decode(
                format!("array length {len} exceeds limit"),
                at,
            ));
        }
        self.align(elem_alignment)?;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| self.error("array extends past end of message"))?;
        Ok(end)
    }

    fn check_array_end(&self, end: usize) -> Result<()> {
        if self.pos != end {
            return Err(self.error("array elements overrun the declared length"));
        }
        Ok(())
    }

    /// Verify that every out-of-band descriptor was referenced by the body.
    pub fn finish_fds(&self) -> Result<()> {
        if let Some(index) = self.fds_used.iter().position(|used| !used) {
            return Err(self.error(format!("file descriptor {index} was never referenced")));
        }
        Ok(())
    }
}
