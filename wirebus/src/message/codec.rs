//! The message-level codec: fixed header, header-fields array, body.
//!
//! Both functions are pure: they operate on byte buffers and descriptor
//! arrays, never on sockets. The transport layer calls them for every
//! message; they are public so that framing can be tested peer-independently.

use std::num::NonZeroU32;
use std::os::fd::OwnedFd;

use crate::names::{BusName, ErrorName, InterfaceName, MemberName, ObjectPath};
use crate::signature::Signature;
use crate::utils::padding_for_8_bytes;
use crate::value::Value;
use crate::wire::{Endian, Reader, WriteError, Writer};
use crate::{Error, Result};

use super::header::{EndianSig, PrimaryHeader, MAX_MESSAGE_SIZE, MIN_MESSAGE_SIZE};
use super::{FieldCode, Kind, Message, Type};

/// Marshal a message in host byte order.
///
/// Consumes the message; the descriptors owned by its body come back in the
/// out-of-band array, in index order.
pub fn encode_message(msg: Message) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
    encode_message_to(msg, Endian::NATIVE)
}

/// Marshal a message in an explicitly chosen byte order.
pub fn encode_message_to(msg: Message, endian: Endian) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
    let mut buf = Vec::new();
    let (len, fds) = encode_message_into(&msg, endian, &mut buf)?;
    buf.truncate(len);
    Ok((buf, fds))
}

/// Marshal into a caller-owned buffer, growing it whenever the fixed-capacity
/// writer reports it full. The transport retains the buffer across calls.
pub(crate) fn encode_message_into(
    msg: &Message,
    endian: Endian,
    buf: &mut Vec<u8>,
) -> Result<(usize, Vec<OwnedFd>)> {
    if buf.is_empty() {
        buf.resize(1024, 0);
    }

    loop {
        match encode_once(msg, endian, buf) {
            Ok(done) => return Ok(done),
            Err(WriteError::Full) => {
                let grown = (buf.len() * 2).min(MAX_MESSAGE_SIZE);
                if grown == buf.len() {
                    return Err(Error::Encode("message size exceeds limit".into()));
                }
                buf.resize(grown, 0);
            }
            Err(WriteError::Error(e)) => return Err(e),
        }
    }
}

fn encode_once(
    msg: &Message,
    endian: Endian,
    buf: &mut [u8],
) -> Result<(usize, Vec<OwnedFd>), WriteError> {
    let mut w = Writer::new(buf, endian);

    w.put_u8(EndianSig::from(endian) as u8)?;
    w.put_u8(msg.kind.message_type() as u8)?;
    w.put_u8(msg.flags.bits())?;
    w.put_u8(1)?;
    let body_len_slot = w.position();
    w.put_u32(0)?;
    w.put_u32(msg.serial.get())?;
    let fields_len_slot = w.position();
    w.put_u32(0)?;

    w.align(8)?;
    let fields_start = w.position();

    match &msg.kind {
        Kind::MethodCall {
            path,
            interface,
            member,
        } => {
            put_field(&mut w, FieldCode::Path, Value::ObjectPath(path.clone()))?;
            if let Some(interface) = interface {
                put_field(
                    &mut w,
                    FieldCode::Interface,
                    Value::Str(interface.to_string()),
                )?;
            }
            put_field(&mut w, FieldCode::Member, Value::Str(member.to_string()))?;
        }
        Kind::MethodReturn { reply_serial } => {
            put_field(&mut w, FieldCode::ReplySerial, Value::U32(reply_serial.get()))?;
        }
        Kind::Error {
            reply_serial,
            error_name,
        } => {
            put_field(&mut w, FieldCode::ReplySerial, Value::U32(reply_serial.get()))?;
            put_field(
                &mut w,
                FieldCode::ErrorName,
                Value::Str(error_name.to_string()),
            )?;
        }
        Kind::Signal {
            path,
            interface,
            member,
        } => {
            put_field(&mut w, FieldCode::Path, Value::ObjectPath(path.clone()))?;
            put_field(
                &mut w,
                FieldCode::Interface,
                Value::Str(interface.to_string()),
            )?;
            put_field(&mut w, FieldCode::Member, Value::Str(member.to_string()))?;
        }
    }

    if let Some(destination) = &msg.destination {
        put_field(
            &mut w,
            FieldCode::Destination,
            Value::Str(destination.to_string()),
        )?;
    }
    if let Some(sender) = &msg.sender {
        put_field(&mut w, FieldCode::Sender, Value::Str(sender.to_string()))?;
    }

    let signature = Value::signature_of(&msg.body);
    if !signature.is_empty() {
        put_field(&mut w, FieldCode::Signature, Value::Signature(signature))?;
    }

    let num_fds: usize = msg.body.iter().map(Value::count_fds).sum();
    if num_fds > 0 {
        let num_fds = u32::try_from(num_fds)
            .map_err(|_| Error::Encode("too many file descriptors".into()))?;
        put_field(&mut w, FieldCode::UnixFds, Value::U32(num_fds))?;
    }

    let fields_len = w.position() - fields_start;
    w.put_u32_at(fields_len_slot, fields_len as u32);

    w.align(8)?;
    let body_start = w.position();
    for value in &msg.body {
        w.write_value(value)?;
    }
    let body_len = w.position() - body_start;
    w.put_u32_at(body_len_slot, body_len as u32);

    if w.position() > MAX_MESSAGE_SIZE {
        return Err(Error::Encode("message size exceeds limit".into()).into());
    }
    debug_assert_eq!(w.num_fds(), num_fds);

    let len = w.position();
    Ok((len, w.into_fds()))
}

// One header field: an 8-aligned (code, variant) struct.
fn put_field(w: &mut Writer<'_>, code: FieldCode, value: Value) -> Result<(), WriteError> {
    w.align(8)?;
    w.put_u8(code as u8)?;
    w.write_value(&Value::variant(value))
}

/// The complete on-the-wire size of a message, derived from its fixed header
/// and fields-array length. Fails when the size limit is exceeded, which the
/// receiver checks *before* reading the remainder.
pub(crate) fn total_message_size(header: &PrimaryHeader, fields_len: u32) -> Result<usize> {
    let header_len = MIN_MESSAGE_SIZE + fields_len as usize;
    let total = header_len + padding_for_8_bytes(header_len) + header.body_len() as usize;
    if total > MAX_MESSAGE_SIZE {
        return Err(Error::decode("message size exceeds limit", 4));
    }
    Ok(total)
}

#[derive(Default)]
struct DecodedFields {
    path: Option<ObjectPath>,
    interface: Option<InterfaceName>,
    member: Option<MemberName>,
    error_name: Option<ErrorName>,
    reply_serial: Option<NonZeroU32>,
    destination: Option<BusName>,
    sender: Option<BusName>,
    signature: Option<Signature>,
    unix_fds: Option<u32>,
}

/// Unmarshal one complete message.
///
/// `bytes` must hold exactly the message; trailing bytes are a hard error.
/// `fds` is the out-of-band descriptor array received alongside it; the
/// descriptors the body references come back duplicated into the message,
/// and the array is closed (also when decoding fails).
pub fn decode_message(bytes: &[u8], fds: Vec<OwnedFd>) -> Result<Message> {
    let (primary, fields_len) = PrimaryHeader::read(bytes)?;
    let total = total_message_size(&primary, fields_len)?;
    if bytes.len() != total {
        return Err(Error::decode(
            format!("message is {} bytes, header declares {total}", bytes.len()),
            bytes.len().min(total),
        ));
    }

    let endian = Endian::from(primary.endian_sig());
    let mut reader = Reader::new(bytes, endian, &fds);
    reader.set_position(MIN_MESSAGE_SIZE);

    let fields_end = MIN_MESSAGE_SIZE + fields_len as usize;
    let mut fields = DecodedFields::default();
    while reader.position() < fields_end {
        reader.align(8)?;
        let code = reader.read_u8()?;
        let at = reader.position();
        let variant = reader.read_variant()?;
        let value = match variant {
            Value::Variant(inner) => *inner,
            _ => unreachable!("read_variant returned a non-variant"),
        };
        fields.store(code, value, at)?;
    }
    if reader.position() != fields_end {
        return Err(reader.error("header fields overrun their declared length"));
    }
    reader.align(8)?;

    let signature = fields.signature.take().unwrap_or_default();
    if primary.body_len() > 0 && signature.is_empty() {
        return Err(Error::decode(
            "non-empty body without a SIGNATURE header field",
            fields_end,
        ));
    }

    let declared_fds = fields.unix_fds.unwrap_or(0) as usize;
    if declared_fds != fds.len() {
        return Err(Error::decode(
            format!(
                "file descriptor count mismatch: header says {declared_fds}, received {}",
                fds.len()
            ),
            fields_end,
        ));
    }

    let mut body = Vec::with_capacity(signature.types().len());
    for ty in signature.types() {
        body.push(reader.read_value(ty)?);
    }
    if reader.position() != total {
        return Err(reader.error("trailing bytes after message body"));
    }
    reader.finish_fds()?;

    let (kind, rest) = fields.into_kind(primary.msg_type(), fields_end)?;

    Ok(Message {
        flags: primary.flags(),
        serial: primary.serial_num(),
        sender: rest.sender,
        destination: rest.destination,
        kind,
        body,
    })
}

impl DecodedFields {
    fn store(&mut self, code: u8, value: Value, at: usize) -> Result<()> {
        let Some(code) = FieldCode::from_code(code) else {
            // Unknown codes are read and discarded.
            return Ok(());
        };

        match (code, value) {
            (FieldCode::Path, Value::ObjectPath(path)) => self.path = Some(path),
            (FieldCode::Interface, Value::Str(s)) => {
                self.interface = Some(parse_name(s, at)?);
            }
            (FieldCode::Member, Value::Str(s)) => {
                self.member = Some(parse_name(s, at)?);
            }
            (FieldCode::ErrorName, Value::Str(s)) => {
                self.error_name = Some(parse_name(s, at)?);
            }
            (FieldCode::ReplySerial, Value::U32(serial)) => {
                self.reply_serial = Some(
                    NonZeroU32::new(serial)
                        .ok_or_else(|| Error::decode("zero REPLY_SERIAL", at))?,
                );
            }
            (FieldCode::Destination, Value::Str(s)) => {
                self.destination = Some(parse_name(s, at)?);
            }
            (FieldCode::Sender, Value::Str(s)) => {
                self.sender = Some(parse_name(s, at)?);
            }
            (FieldCode::Signature, Value::Signature(signature)) => {
                self.signature = Some(signature);
            }
            (FieldCode::UnixFds, Value::U32(count)) => self.unix_fds = Some(count),
            (code, value) => {
                return Err(Error::decode(
                    format!(
                        "header field {code:?} has unexpected type `{}`",
                        value.ty()
                    ),
                    at,
                ));
            }
        }

        Ok(())
    }

    fn into_kind(mut self, msg_type: Type, at: usize) -> Result<(Kind, DecodedFields)> {
        let missing =
            |field: &str| Error::decode(format!("required header field {field} missing"), at);

        let kind = match msg_type {
            Type::MethodCall => Kind::MethodCall {
                path: self.path.take().ok_or_else(|| missing("PATH"))?,
                interface: self.interface.take(),
                member: self.member.take().ok_or_else(|| missing("MEMBER"))?,
            },
            Type::MethodReturn => Kind::MethodReturn {
                reply_serial: self
                    .reply_serial
                    .take()
                    .ok_or_else(|| missing("REPLY_SERIAL"))?,
            },
            Type::Error => Kind::Error {
                reply_serial: self
                    .reply_serial
                    .take()
                    .ok_or_else(|| missing("REPLY_SERIAL"))?,
                error_name: self
                    .error_name
                    .take()
                    .ok_or_else(|| missing("ERROR_NAME"))?,
            },
            Type::Signal => Kind::Signal {
                path: self.path.take().ok_or_else(|| missing("PATH"))?,
                interface: self.interface.take().ok_or_else(|| missing("INTERFACE"))?,
                member: self.member.take().ok_or_else(|| missing("MEMBER"))?,
            },
        };

        Ok((kind, self))
    }
}

fn parse_name<N>(s: String, at: usize) -> Result<N>
where
    N: TryFrom<String, Error = Error>,
{
    N::try_from(s).map_err(|e| Error::decode(e.to_string(), at))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Flags;
    use crate::signature::Type as ValueType;

    fn sample_call() -> Message {
        Message::method("/org/example/Obj", "Echo")
            .unwrap()
            .interface("org.example.Iface")
            .unwrap()
            .destination("org.example.Svc")
            .unwrap()
            .build(vec![Value::I32(42), Value::Str("hi".into())])
            .unwrap()
    }

    #[test]
    fn roundtrip_native() {
        let msg = sample_call();
        let expected = msg.deep_dup().unwrap();
        let (bytes, fds) = encode_message(msg).unwrap();
        assert!(fds.is_empty());

        let decoded = decode_message(&bytes, fds).unwrap();
        assert_eq!(decoded, expected);
    }

    #[test]
    fn roundtrip_both_orders() {
        for endian in [Endian::Little, Endian::Big] {
            let msg = Message::signal("/org/example/Obj", "org.example.Iface", "Level")
                .unwrap()
                .build(vec![Value::F64(3.14)])
                .unwrap();
            let expected = msg.deep_dup().unwrap();

            let (bytes, fds) = encode_message_to(msg, endian).unwrap();
            let decoded = decode_message(&bytes, fds).unwrap();
            assert_eq!(decoded, expected);
            match &decoded.body()[0] {
                Value::F64(v) => assert_eq!(*v, 3.14),
                other => panic!("unexpected body value {other:?}"),
            }
        }
    }

    #[test]
    fn roundtrip_all_kinds() {
        let call = sample_call();

        let reply = Message::method_reply(&call)
            .build(vec![Value::Bytes(vec![1, 2, 3])])
            .unwrap();
        let expected = reply.deep_dup().unwrap();
        let (bytes, fds) = encode_message(reply).unwrap();
        assert_eq!(decode_message(&bytes, fds).unwrap(), expected);

        let error = Message::method_error(&call, "org.example.Error.Failed")
            .unwrap()
            .build(vec![Value::Str("boom".into())])
            .unwrap();
        let expected = error.deep_dup().unwrap();
        let (bytes, fds) = encode_message(error).unwrap();
        assert_eq!(decode_message(&bytes, fds).unwrap(), expected);
    }

    #[test]
    fn roundtrip_preserves_flags_and_serial() {
        let msg = Message::method("/", "Ping")
            .unwrap()
            .with_flags(Flags::NoReplyExpected)
            .unwrap()
            .with_flags(Flags::NoAutoStart)
            .unwrap()
            .build(vec![])
            .unwrap();
        let serial = msg.serial();

        let (bytes, fds) = encode_message(msg).unwrap();
        let decoded = decode_message(&bytes, fds).unwrap();
        assert_eq!(decoded.serial(), serial);
        assert_eq!(decoded.flags(), Flags::NoReplyExpected | Flags::NoAutoStart);
    }

    #[test]
    fn complex_body_roundtrip() {
        let body = vec![
            Value::Dict {
                key: ValueType::String,
                value: ValueType::Variant,
                entries: vec![
                    (
                        Value::Str("level".into()),
                        Value::variant(Value::U32(3)),
                    ),
                    (
                        Value::Str("name".into()),
                        Value::variant(Value::Str("x".into())),
                    ),
                ],
            },
            Value::Array(
                ValueType::Struct(vec![ValueType::Int32, ValueType::String]),
                vec![
                    Value::Struct(vec![Value::I32(1), Value::Str("one".into())]),
                    Value::Struct(vec![Value::I32(2), Value::Str("two".into())]),
                ],
            ),
            Value::variant(Value::Struct(vec![Value::U64(9), Value::Bool(false)])),
        ];
        let msg = Message::method("/", "Load").unwrap().build(body).unwrap();
        let expected = msg.deep_dup().unwrap();

        let (bytes, fds) = encode_message(msg).unwrap();
        assert_eq!(decode_message(&bytes, fds).unwrap(), expected);
    }

    #[test]
    fn fd_indices_roundtrip() {
        let null = || {
            OwnedFd::from(std::fs::File::open("/dev/null").unwrap())
        };
        let msg = Message::method("/", "Take")
            .unwrap()
            .build(vec![Value::Fd(null()), Value::Fd(null())])
            .unwrap();
        let expected = msg.deep_dup().unwrap();

        let (bytes, fds) = encode_message(msg).unwrap();
        assert_eq!(fds.len(), 2);

        let decoded = decode_message(&bytes, fds).unwrap();
        assert_eq!(decoded, expected);
        assert_eq!(decoded.body().iter().map(Value::count_fds).sum::<usize>(), 2);
    }

    #[test]
    fn fd_count_mismatch_is_rejected() {
        let msg = Message::method("/", "Take")
            .unwrap()
            .build(vec![Value::Fd(OwnedFd::from(
                std::fs::File::open("/dev/null").unwrap(),
            ))])
            .unwrap();
        let (bytes, mut fds) = encode_message(msg).unwrap();
        fds.push(OwnedFd::from(std::fs::File::open("/dev/null").unwrap()));

        assert!(matches!(
            decode_message(&bytes, fds),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn protocol_version_is_checked() {
        let msg = Message::method("/", "Ping").unwrap().build(vec![]).unwrap();
        let (mut bytes, fds) = encode_message(msg).unwrap();
        bytes[3] = 2;

        match decode_message(&bytes, fds) {
            Err(Error::Decode { reason, offset }) => {
                assert_eq!(reason, "invalid protocol version: 2");
                assert_eq!(offset, 3);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn oversized_body_is_rejected_from_the_header_alone() {
        let msg = Message::method("/", "Ping").unwrap().build(vec![]).unwrap();
        let (mut bytes, fds) = encode_message(msg).unwrap();
        Endian::NATIVE.write_u32(&mut bytes[4..8], 1 << 27);

        match decode_message(&bytes, fds) {
            Err(Error::Decode { reason, .. }) => {
                assert_eq!(reason, "message size exceeds limit");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let msg = Message::method("/", "Ping")
            .unwrap()
            .build(vec![Value::U8(1)])
            .unwrap();
        let (mut bytes, fds) = encode_message(msg).unwrap();
        // Stretch the declared body length and append a stray byte.
        let body_len = Endian::NATIVE.read_u32(&bytes[4..8]);
        Endian::NATIVE.write_u32(&mut bytes[4..8], body_len + 1);
        bytes.push(0xaa);

        assert!(matches!(
            decode_message(&bytes, fds),
            Err(Error::Decode { .. })
        ));
    }

    #[test]
    fn required_fields_are_enforced() {
        // A signal without INTERFACE: craft by encoding a method call and
        // patching the type byte.
        let msg = Message::method("/org/example/Obj", "Name")
            .unwrap()
            .build(vec![])
            .unwrap();
        let (mut bytes, fds) = encode_message(msg).unwrap();
        bytes[1] = Type::Signal as u8;

        match decode_message(&bytes, fds) {
            Err(Error::Decode { reason, .. }) => {
                assert!(reason.contains("INTERFACE"), "got: {reason}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn unknown_header_fields_are_skipped() {
        // Append an unknown (code 200, variant u32) field by hand.
        let msg = Message::method("/", "Ping").unwrap().build(vec![]).unwrap();
        let serial = msg.serial();
        let (bytes, fds) = encode_message(msg).unwrap();

        let endian = Endian::NATIVE;
        let fields_len = endian.read_u32(&bytes[12..16]) as usize;
        let fields_end = 16 + fields_len;

        let mut patched = bytes[..fields_end].to_vec();
        // Pad the previous field to an 8-byte boundary, then code + variant.
        while patched.len() % 8 != 0 {
            patched.push(0);
        }
        patched.push(200);
        patched.extend_from_slice(b"\x01u\x00");
        while patched.len() % 4 != 0 {
            patched.push(0);
        }
        let mut word = [0u8; 4];
        endian.write_u32(&mut word, 7);
        patched.extend_from_slice(&word);

        let new_fields_len = (patched.len() - 16) as u32;
        endian.write_u32(&mut patched[12..16], new_fields_len);
        while patched.len() % 8 != 0 {
            patched.push(0);
        }

        let decoded = decode_message(&patched, fds).unwrap();
        assert_eq!(decoded.serial(), serial);
    }

    #[test]
    fn header_field_type_mismatch_is_rejected() {
        // PATH carrying a string instead of an object path.
        let msg = Message::method("/", "Ping").unwrap().build(vec![]).unwrap();
        let (bytes, fds) = encode_message(msg).unwrap();

        // Field region starts at 16: 8-aligned, code byte, then variant
        // signature "o". Swap the signature to "s".
        let mut patched = bytes.clone();
        assert_eq!(patched[16], FieldCode::Path as u8);
        assert_eq!(patched[18], b'o');
        patched[18] = b's';

        assert!(matches!(
            decode_message(&patched, fds),
            Err(Error::Decode { .. })
        ));
    }
}
