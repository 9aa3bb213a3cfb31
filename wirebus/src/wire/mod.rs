//! Alignment-correct, endian-parametric marshaling of D-Bus values.
//!
//! The reader accepts both byte orders, since the peer picks the order of
//! every message it sends; the writer normally emits host order. Both operate
//! on in-memory buffers and never touch the socket.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

mod reader;
mod writer;

pub(crate) use reader::Reader;
pub(crate) use writer::{WriteError, Writer};

/// Arrays are capped at 2^26 bytes of element data by the D-Bus spec.
pub(crate) const MAX_ARRAY_LENGTH: usize = 1 << 26;

/// The byte order of a marshaled message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// The host byte order.
    pub const NATIVE: Endian = if cfg!(target_endian = "big") {
        Endian::Big
    } else {
        Endian::Little
    };
}

macro_rules! endian_dispatch {
    ($($read:ident / $write:ident -> $ty:ty,)*) => {
        impl Endian {
            $(
                pub(crate) fn $read(self, buf: &[u8]) -> $ty {
                    match self {
                        Endian::Little => LittleEndian::$read(buf),
                        Endian::Big => BigEndian::$read(buf),
                    }
                }

                pub(crate) fn $write(self, buf: &mut [u8], v: $ty) {
                    match self {
                        Endian::Little => LittleEndian::$write(buf, v),
                        Endian::Big => BigEndian::$write(buf, v),
                    }
                }
            )*
        }
    };
}

endian_dispatch! {
    read_u16 / write_u16 -> u16,
    read_i16 / write_i16 -> i16,
    read_u32 / write_u32 -> u32,
    read_i32 / write_i32 -> i32,
    read_u64 / write_u64 -> u64,
    read_i64 / write_i64 -> i64,
    read_f64 / write_f64 -> f64,
}
