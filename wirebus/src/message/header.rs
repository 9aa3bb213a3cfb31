use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering::SeqCst};

use enumflags2::{bitflags, BitFlags};

use crate::wire::Endian;
use crate::{Error, Result};

pub(crate) const PRIMARY_HEADER_SIZE: usize = 12;
pub(crate) const MIN_MESSAGE_SIZE: usize = PRIMARY_HEADER_SIZE + 4;
pub(crate) const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024; // 128 MiB

/// D-Bus code for endianness.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EndianSig {
    /// The D-Bus message is in big-endian (network) byte order.
    Big = b'B',

    /// The D-Bus message is in little-endian byte order.
    Little = b'l',
}

impl TryFrom<u8> for EndianSig {
    type Error = Error;

    fn try_from(val: u8) -> Result<EndianSig> {
        match val {
            b'B' => Ok(EndianSig::Big),
            b'l' => Ok(EndianSig::Little),
            _ => Err(Error::decode(
                format!("invalid endianness flag: 0x{val:02x}"),
                0,
            )),
        }
    }
}

#[cfg(target_endian = "big")]
/// Signature of the target's native endian.
pub const NATIVE_ENDIAN_SIG: EndianSig = EndianSig::Big;
#[cfg(target_endian = "little")]
/// Signature of the target's native endian.
pub const NATIVE_ENDIAN_SIG: EndianSig = EndianSig::Little;

impl From<Endian> for EndianSig {
    fn from(endian: Endian) -> Self {
        match endian {
            Endian::Little => EndianSig::Little,
            Endian::Big => EndianSig::Big,
        }
    }
}

impl From<EndianSig> for Endian {
    fn from(sig: EndianSig) -> Self {
        match sig {
            EndianSig::Little => Endian::Little,
            EndianSig::Big => Endian::Big,
        }
    }
}

/// Message header representing the D-Bus type of the message.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Method call. This message type may prompt a reply (and typically does).
    MethodCall = 1,
    /// A reply to a method call.
    MethodReturn = 2,
    /// An error in response to a method call.
    Error = 3,
    /// Signal emission.
    Signal = 4,
}

impl TryFrom<u8> for Type {
    type Error = Error;

    fn try_from(val: u8) -> Result<Type> {
        match val {
            1 => Ok(Type::MethodCall),
            2 => Ok(Type::MethodReturn),
            3 => Ok(Type::Error),
            4 => Ok(Type::Signal),
            _ => Err(Error::decode(format!("invalid message type: {val}"), 1)),
        }
    }
}

/// Pre-defined flags that can be passed in the message header.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Flags {
    /// This message does not expect method return replies or error replies,
    /// even if it is of a type that can have a reply; the reply should be
    /// omitted.
    NoReplyExpected = 0x1,
    /// The bus must not launch an owner for the destination name in response
    /// to this message.
    NoAutoStart = 0x2,
    /// The caller is prepared to wait for interactive authorization, which
    /// might take a considerable time to complete.
    AllowInteractiveAuth = 0x4,
}

/// The fixed 16-byte header present in every D-Bus message.
///
/// The fields-array length word technically follows the primary header on
/// the wire; [`PrimaryHeader::read`] returns it separately because the
/// receiver needs both to size the rest of the message.
#[derive(Clone, Debug)]
pub struct PrimaryHeader {
    endian_sig: EndianSig,
    msg_type: Type,
    flags: BitFlags<Flags>,
    protocol_version: u8,
    body_len: u32,
    serial_num: NonZeroU32,
}

impl PrimaryHeader {
    /// Parse the fixed header from the first [`MIN_MESSAGE_SIZE`] bytes of a
    /// message. Returns the header and the length of the header-fields array.
    pub(crate) fn read(buf: &[u8]) -> Result<(PrimaryHeader, u32)> {
        if buf.len() < MIN_MESSAGE_SIZE {
            return Err(Error::decode("message shorter than the fixed header", buf.len()));
        }

        let endian_sig = EndianSig::try_from(buf[0])?;
        let endian = Endian::from(endian_sig);
        let msg_type = Type::try_from(buf[1])?;
        // Unknown flag bits must be ignored.
        let flags = BitFlags::from_bits_truncate(buf[2]);
        if buf[3] != 1 {
            return Err(Error::decode(
                format!("invalid protocol version: {}", buf[3]),
                3,
            ));
        }
        let body_len = endian.read_u32(&buf[4..8]);
        let serial_num = NonZeroU32::new(endian.read_u32(&buf[8..12]))
            .ok_or_else(|| Error::decode("message serial is zero", 8))?;
        let fields_len = endian.read_u32(&buf[12..16]);

        let header = PrimaryHeader {
            endian_sig,
            msg_type,
            flags,
            protocol_version: 1,
            body_len,
            serial_num,
        };
        Ok((header, fields_len))
    }

    /// D-Bus code for endian encoding of the message.
    pub fn endian_sig(&self) -> EndianSig {
        self.endian_sig
    }

    /// The message type.
    pub fn msg_type(&self) -> Type {
        self.msg_type
    }

    /// The message flags.
    pub fn flags(&self) -> BitFlags<Flags> {
        self.flags
    }

    /// The major version of the protocol the message is compliant to.
    ///
    /// Currently only `1` is valid.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// The byte length of the message body.
    pub fn body_len(&self) -> u32 {
        self.body_len
    }

    /// The serial number of the message.
    ///
    /// This is used to match a reply to a method call.
    pub fn serial_num(&self) -> NonZeroU32 {
        self.serial_num
    }
}

static SERIAL_NUM: AtomicU32 = AtomicU32::new(1);

/// Assign the next process-wide message serial. Never zero.
pub(crate) fn next_serial() -> NonZeroU32 {
    loop {
        if let Some(serial) = NonZeroU32::new(SERIAL_NUM.fetch_add(1, SeqCst)) {
            return serial;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_header_rejects_bad_version() {
        let mut buf = [0u8; 16];
        buf[0] = b'l';
        buf[1] = 1;
        buf[3] = 2;
        buf[8] = 1;
        match PrimaryHeader::read(&buf) {
            Err(Error::Decode { reason, offset }) => {
                assert_eq!(reason, "invalid protocol version: 2");
                assert_eq!(offset, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn primary_header_parses_both_orders() {
        let mut buf = [0u8; 16];
        buf[0] = b'B';
        buf[1] = 4;
        buf[2] = 0x2;
        buf[3] = 1;
        buf[4..8].copy_from_slice(&42u32.to_be_bytes());
        buf[8..12].copy_from_slice(&7u32.to_be_bytes());
        buf[12..16].copy_from_slice(&13u32.to_be_bytes());

        let (header, fields_len) = PrimaryHeader::read(&buf).unwrap();
        assert_eq!(header.endian_sig(), EndianSig::Big);
        assert_eq!(header.msg_type(), Type::Signal);
        assert_eq!(header.flags(), Flags::NoAutoStart);
        assert_eq!(header.body_len(), 42);
        assert_eq!(header.serial_num().get(), 7);
        assert_eq!(fields_len, 13);
    }

    #[test]
    fn unknown_flag_bits_are_masked() {
        let mut buf = [0u8; 16];
        buf[0] = b'l';
        buf[1] = 2;
        buf[2] = 0xf1;
        buf[3] = 1;
        buf[8] = 1;
        let (header, _) = PrimaryHeader::read(&buf).unwrap();
        assert_eq!(header.flags(), Flags::NoReplyExpected);
    }

    #[test]
    fn serials_are_distinct_and_nonzero() {
        let a = next_serial();
        let b = next_serial();
        assert_ne!(a, b);
    }
}
