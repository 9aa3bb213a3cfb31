//! D-Bus messages and their binary codec.

use std::fmt;
use std::num::NonZeroU32;

use enumflags2::BitFlags;

use crate::names::{BusName, ErrorName, InterfaceName, MemberName, ObjectPath};
use crate::signature::Signature;
use crate::value::Value;
use crate::Result;

mod builder;
pub use builder::Builder;

mod codec;
pub use codec::{decode_message, encode_message, encode_message_to};
pub(crate) use codec::{encode_message_into, total_message_size};

mod field_code;
pub(crate) use field_code::FieldCode;

pub(crate) mod header;
pub use header::{EndianSig, Flags, PrimaryHeader, Type, NATIVE_ENDIAN_SIG};

/// What a message is: a call, a reply, an error reply, or a signal, together
/// with the header fields that kind of message requires.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    /// A method call on an object.
    MethodCall {
        path: ObjectPath,
        interface: Option<InterfaceName>,
        member: MemberName,
    },
    /// A successful reply to a method call.
    MethodReturn { reply_serial: NonZeroU32 },
    /// An error reply to a method call.
    Error {
        reply_serial: NonZeroU32,
        error_name: ErrorName,
    },
    /// A broadcast emitted from an object.
    Signal {
        path: ObjectPath,
        interface: InterfaceName,
        member: MemberName,
    },
}

impl Kind {
    /// The wire message type corresponding to this kind.
    pub fn message_type(&self) -> Type {
        match self {
            Kind::MethodCall { .. } => Type::MethodCall,
            Kind::MethodReturn { .. } => Type::MethodReturn,
            Kind::Error { .. } => Type::Error,
            Kind::Signal { .. } => Type::Signal,
        }
    }
}

/// A D-Bus message: header metadata plus a typed body.
///
/// **Note**: the message owns any file descriptors carried in its body and
/// closes them when dropped. Sending a message consumes it, descriptors
/// included; callers that need to keep them duplicate first (see
/// [`Message::deep_dup`]).
#[derive(Debug, PartialEq)]
pub struct Message {
    pub(crate) flags: BitFlags<Flags>,
    pub(crate) serial: NonZeroU32,
    pub(crate) sender: Option<BusName>,
    pub(crate) destination: Option<BusName>,
    pub(crate) kind: Kind,
    pub(crate) body: Vec<Value>,
}

impl Message {
    /// Create a builder for a message of type [`Type::MethodCall`].
    pub fn method<P, M>(path: P, method_name: M) -> Result<Builder>
    where
        P: TryInto<ObjectPath>,
        M: TryInto<MemberName>,
        P::Error: Into<crate::Error>,
        M::Error: Into<crate::Error>,
    {
        Ok(Builder::new(Kind::MethodCall {
            path: path.try_into().map_err(Into::into)?,
            interface: None,
            member: method_name.try_into().map_err(Into::into)?,
        }))
    }

    /// Create a builder for a message of type [`Type::Signal`].
    pub fn signal<P, I, M>(path: P, iface: I, signal_name: M) -> Result<Builder>
    where
        P: TryInto<ObjectPath>,
        I: TryInto<InterfaceName>,
        M: TryInto<MemberName>,
        P::Error: Into<crate::Error>,
        I::Error: Into<crate::Error>,
        M::Error: Into<crate::Error>,
    {
        Ok(Builder::new(Kind::Signal {
            path: path.try_into().map_err(Into::into)?,
            interface: iface.try_into().map_err(Into::into)?,
            member: signal_name.try_into().map_err(Into::into)?,
        }))
    }

    /// Create a builder for a message of type [`Type::MethodReturn`],
    /// replying to the given call.
    pub fn method_reply(call: &Message) -> Builder {
        let mut builder = Builder::new(Kind::MethodReturn {
            reply_serial: call.serial,
        });
        if let Some(sender) = &call.sender {
            builder = builder.destination_name(sender.clone());
        }
        builder
    }

    /// Create a builder for a message of type [`Type::Error`], replying to
    /// the given call.
    pub fn method_error<E>(call: &Message, name: E) -> Result<Builder>
    where
        E: TryInto<ErrorName>,
        E::Error: Into<crate::Error>,
    {
        let mut builder = Builder::new(Kind::Error {
            reply_serial: call.serial,
            error_name: name.try_into().map_err(Into::into)?,
        });
        if let Some(sender) = &call.sender {
            builder = builder.destination_name(sender.clone());
        }
        Ok(builder)
    }

    /// The message kind and its kind-specific header fields.
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// The wire message type.
    pub fn message_type(&self) -> Type {
        self.kind.message_type()
    }

    /// The message flags.
    pub fn flags(&self) -> BitFlags<Flags> {
        self.flags
    }

    /// The sender-assigned serial number.
    pub fn serial(&self) -> NonZeroU32 {
        self.serial
    }

    /// Unique name of the sending connection, if the bus filled it in.
    pub fn sender(&self) -> Option<&BusName> {
        self.sender.as_ref()
    }

    /// The name of the connection this message is intended for.
    pub fn destination(&self) -> Option<&BusName> {
        self.destination.as_ref()
    }

    /// The object to send a call to, or the object a signal is emitted from.
    pub fn path(&self) -> Option<&ObjectPath> {
        match &self.kind {
            Kind::MethodCall { path, .. } | Kind::Signal { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The interface to invoke a method call on, or that a signal is
    /// emitted from.
    pub fn interface(&self) -> Option<&InterfaceName> {
        match &self.kind {
            Kind::MethodCall { interface, .. } => interface.as_ref(),
            Kind::Signal { interface, .. } => Some(interface),
            _ => None,
        }
    }

    /// The member, either the method name or the signal name.
    pub fn member(&self) -> Option<&MemberName> {
        match &self.kind {
            Kind::MethodCall { member, .. } | Kind::Signal { member, .. } => Some(member),
            _ => None,
        }
    }

    /// The name of the error that occurred, for errors.
    pub fn error_name(&self) -> Option<&ErrorName> {
        match &self.kind {
            Kind::Error { error_name, .. } => Some(error_name),
            _ => None,
        }
    }

    /// The serial number of the message this message is a reply to.
    pub fn reply_serial(&self) -> Option<NonZeroU32> {
        match &self.kind {
            Kind::MethodReturn { reply_serial } | Kind::Error { reply_serial, .. } => {
                Some(*reply_serial)
            }
            _ => None,
        }
    }

    /// The body values, in order.
    pub fn body(&self) -> &[Value] {
        &self.body
    }

    /// Take the body, consuming the message.
    pub fn into_body(self) -> Vec<Value> {
        self.body
    }

    /// The signature of the body.
    pub fn body_signature(&self) -> Signature {
        Value::signature_of(&self.body)
    }

    /// Copy this message, giving every file descriptor in the body a fresh
    /// kernel handle.
    pub fn deep_dup(&self) -> Result<Message> {
        Ok(Message {
            flags: self.flags,
            serial: self.serial,
            sender: self.sender.clone(),
            destination: self.destination.clone(),
            kind: self.kind.clone(),
            body: self
                .body
                .iter()
                .map(Value::deep_dup)
                .collect::<Result<Vec<_>>>()?,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::MethodCall { member, .. } => write!(f, "Method call {member}")?,
            Kind::MethodReturn { reply_serial } => {
                write!(f, "Method return (reply to {reply_serial})")?;
            }
            Kind::Error { error_name, .. } => write!(f, "Error {error_name}")?,
            Kind::Signal { member, .. } => write!(f, "Signal {member}")?,
        }
        if let Some(sender) = &self.sender {
            write!(f, " from {sender}")?;
        }
        Ok(())
    }
}
