use std::os::fd::OwnedFd;

use super::{Endian, MAX_ARRAY_LENGTH};
use crate::signature::MAX_SIGNATURE_LENGTH;
use crate::utils::padding_for_n_bytes;
use crate::value::Value;
use crate::Error;

/// Failure modes of the fixed-capacity writer.
///
/// `Full` is retryable: the writer mutates nothing but the buffer handed to
/// it, so the caller grows the buffer and re-runs the whole encode.
#[derive(Debug)]
pub(crate) enum WriteError {
    Full,
    Error(Error),
}

impl From<Error> for WriteError {
    fn from(e: Error) -> Self {
        WriteError::Error(e)
    }
}

impl From<std::io::Error> for WriteError {
    fn from(e: std::io::Error) -> Self {
        WriteError::Error(Error::InputOutput(e))
    }
}

type WriteResult<T = ()> = std::result::Result<T, WriteError>;

/// A cursor writing marshaled values into a fixed-capacity buffer.
///
/// Descriptors written as `h` values are duplicated into an internal array in
/// index order; the caller transmits them out-of-band.
pub(crate) struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
    endian: Endian,
    fds: Vec<OwnedFd>,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8], endian: Endian) -> Self {
        Writer {
            buf,
            pos: 0,
            endian,
            fds: Vec::new(),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn num_fds(&self) -> usize {
        self.fds.len()
    }

    pub fn into_fds(self) -> Vec<OwnedFd> {
        self.fds
    }

    fn reserve(&mut self, n: usize) -> WriteResult<&mut [u8]> {
        let end = self.pos.checked_add(n).ok_or(WriteError::Full)?;
        if end > self.buf.len() {
            return Err(WriteError::Full);
        }
        let slot = &mut self.buf[self.pos..end];
        self.pos = end;
        Ok(slot)
    }

    /// Zero-pad to a multiple of `align`.
    pub fn align(&mut self, align: usize) -> WriteResult {
        let padding = padding_for_n_bytes(self.pos, align);
        self.reserve(padding)?.fill(0);
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> WriteResult {
        self.reserve(1)?[0] = v;
        Ok(())
    }

    pub fn put_u32(&mut self, v: u32) -> WriteResult {
        self.align(4)?;
        let endian = self.endian;
        endian.write_u32(self.reserve(4)?, v);
        Ok(())
    }

    /// Patch a u32 previously written at `at`.
    pub fn put_u32_at(&mut self, at: usize, v: u32) {
        let endian = self.endian;
        endian.write_u32(&mut self.buf[at..at + 4], v);
    }

    fn put_slice(&mut self, bytes: &[u8]) -> WriteResult {
        self.reserve(bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn put_string(&mut self, s: &str) -> WriteResult {
        if s.as_bytes().contains(&0) {
            return Err(Error::Encode("string contains a NUL byte".into()).into());
        }
        let len = u32::try_from(s.len())
            .map_err(|_| Error::Encode("string too long".into()))?;
        self.put_u32(len)?;
        self.put_slice(s.as_bytes())?;
        self.put_u8(0)
    }

    pub fn put_signature(&mut self, s: &str) -> WriteResult {
        if s.len() > MAX_SIGNATURE_LENGTH {
            return Err(Error::Encode(format!("signature `{s}` exceeds 255 characters")).into());
        }
        self.put_u8(s.len() as u8)?;
        self.put_slice(s.as_bytes())?;
        self.put_u8(0)
    }

    /// Marshal one value at the cursor.
    pub fn write_value(&mut self, value: &Value) -> WriteResult {
        match value {
            Value::U8(v) => self.put_u8(*v)?,
            Value::Bool(v) => self.put_u32(*v as u32)?,
            Value::I16(v) => {
                self.align(2)?;
                let endian = self.endian;
                endian.write_i16(self.reserve(2)?, *v);
            }
            Value::U16(v) => {
                self.align(2)?;
                let endian = self.endian;
                endian.write_u16(self.reserve(2)?, *v);
            }
            Value::I32(v) => {
                self.align(4)?;
                let endian = self.endian;
                endian.write_i32(self.reserve(4)?, *v);
            }
            Value::U32(v) => self.put_u32(*v)?,
            Value::I64(v) => {
                self.align(8)?;
                let endian = self.endian;
                endian.write_i64(self.reserve(8)?, *v);
            }
            Value::U64(v) => {
                self.align(8)?;
                let endian = self.endian;
                endian.write_u64(self.reserve(8)?, *v);
            }
            Value::F64(v) => {
                self.align(8)?;
                let endian = self.endian;
                endian.write_f64(self.reserve(8)?, *v);
            }
            Value::Str(s) => self.put_string(s)?,
            Value::ObjectPath(path) => self.put_string(path.as_str())?,
            Value::Signature(sig) => self.put_signature(&sig.to_string())?,
            Value::Fd(fd) => {
                let index = u32::try_from(self.fds.len())
                    .map_err(|_| Error::Encode("too many file descriptors".into()))?;
                let dup = fd.try_clone()?;
                self.put_u32(index)?;
                self.fds.push(dup);
            }
            Value::Bytes(bytes) => {
                if bytes.len() > MAX_ARRAY_LENGTH {
                    return Err(Error::Encode("array exceeds 2^26 bytes".into()).into());
                }
                self.put_u32(bytes.len() as u32)?;
                self.put_slice(bytes)?;
            }
            Value::Array(elem, values) => {
                let patch = self.begin_array(elem.alignment())?;
                for v in values {
                    if v.ty() != *elem {
                        return Err(Error::Encode(format!(
                            "array element of type `{}` does not match element type `{elem}`",
                            v.ty()
                        ))
                        .into());
                    }
                    self.write_value(v)?;
                }
                self.end_array(patch)?;
            }
            Value::Dict {
                key,
                value,
                entries,
            } => {
                if !key.is_basic() {
                    return Err(
                        Error::Encode("dict entry key must be a basic type".into()).into()
                    );
                }
                let patch = self.begin_array(8)?;
                for (k, v) in entries {
                    if k.ty() != *key || v.ty() != *value {
                        return Err(Error::Encode(
                            "dict entry does not match the declared key/value types".into(),
                        )
                        .into());
                    }
                    self.align(8)?;
                    self.write_value(k)?;
                    self.write_value(v)?;
                }
                self.end_array(patch)?;
            }
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err(Error::Encode("empty struct is not allowed".into()).into());
                }
                self.align(8)?;
                for field in fields {
                    self.write_value(field)?;
                }
            }
            Value::Variant(inner) => {
                self.put_signature(&inner.ty().to_string())?;
                self.write_value(inner)?;
            }
        }

        Ok(())
    }

    // Writes the length word (patched later) and pads to the element
    // alignment; returns (length slot, element region start).
    fn begin_array(&mut self, elem_alignment: usize) -> WriteResult<(usize, usize)> {
        self.align(4)?;
        let len_slot = self.pos;
        self.put_u32(0)?;
        self.align(elem_alignment)?;
        Ok((len_slot, self.pos))
    }

    fn end_array(&mut self, (len_slot, start): (usize, usize)) -> WriteResult {
        let len = self.pos - start;
        if len > MAX_ARRAY_LENGTH {
            return Err(Error::Encode("array exceeds 2^26 bytes".into()).into());
        }
        self.put_u32_at(len_slot, len as u32);
        Ok(())
    }
}
