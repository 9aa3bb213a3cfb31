use enumflags2::BitFlags;

use crate::names::{BusName, InterfaceName};
use crate::signature::MAX_SIGNATURE_LENGTH;
use crate::value::Value;
use crate::{Error, Result};

use super::header::next_serial;
use super::{Flags, Kind, Message, Type};

/// A builder for [`Message`].
///
/// Obtained from the constructors on [`Message`]; `build` assigns the serial
/// number and produces the finished message.
#[derive(Clone, Debug)]
pub struct Builder {
    flags: BitFlags<Flags>,
    sender: Option<BusName>,
    destination: Option<BusName>,
    kind: Kind,
}

impl Builder {
    pub(super) fn new(kind: Kind) -> Self {
        Self {
            flags: BitFlags::empty(),
            sender: None,
            destination: None,
            kind,
        }
    }

    /// Add a flag to the message.
    ///
    /// Returns an error if the flag is invalid for the message type.
    pub fn with_flags(mut self, flag: Flags) -> Result<Self> {
        if self.kind.message_type() != Type::MethodCall
            && BitFlags::from_flag(flag).contains(Flags::NoReplyExpected)
        {
            return Err(Error::Encode(
                "NO_REPLY_EXPECTED is only valid on method calls".into(),
            ));
        }
        self.flags |= flag;
        Ok(self)
    }

    /// Set the name of the connection this message is intended for.
    pub fn destination<D>(self, destination: D) -> Result<Self>
    where
        D: TryInto<BusName>,
        D::Error: Into<Error>,
    {
        Ok(self.destination_name(destination.try_into().map_err(Into::into)?))
    }

    pub(super) fn destination_name(mut self, destination: BusName) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Set the unique name of the sending connection.
    ///
    /// Normally the bus fills this in; setting it is useful for peer-to-peer
    /// connections and tests.
    pub fn sender<S>(mut self, sender: S) -> Result<Self>
    where
        S: TryInto<BusName>,
        S::Error: Into<Error>,
    {
        self.sender = Some(sender.try_into().map_err(Into::into)?);
        Ok(self)
    }

    /// Set the interface to invoke the method on. Only valid for method
    /// calls; signals carry a mandatory interface from construction.
    pub fn interface<I>(mut self, iface: I) -> Result<Self>
    where
        I: TryInto<InterfaceName>,
        I::Error: Into<Error>,
    {
        match &mut self.kind {
            Kind::MethodCall { interface, .. } => {
                *interface = Some(iface.try_into().map_err(Into::into)?);
                Ok(self)
            }
            _ => Err(Error::Encode(
                "interface can only be set on a method call".into(),
            )),
        }
    }

    /// Build the [`Message`] with the given body.
    ///
    /// Pass an empty `Vec` for a message without a body.
    pub fn build(self, body: Vec<Value>) -> Result<Message> {
        let signature = Value::signature_of(&body);
        if signature.to_string().len() > MAX_SIGNATURE_LENGTH {
            return Err(Error::Encode(
                "body signature exceeds 255 characters".into(),
            ));
        }

        Ok(Message {
            flags: self.flags,
            serial: next_serial(),
            sender: self.sender,
            destination: self.destination,
            kind: self.kind,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_call_surface() {
        let msg = Message::method("/org/example/Obj", "Frobnicate")
            .unwrap()
            .interface("org.example.Iface")
            .unwrap()
            .destination("org.example.Svc")
            .unwrap()
            .with_flags(Flags::NoReplyExpected)
            .unwrap()
            .build(vec![Value::I32(1)])
            .unwrap();

        assert_eq!(msg.message_type(), Type::MethodCall);
        assert_eq!(msg.path().unwrap().as_str(), "/org/example/Obj");
        assert_eq!(msg.member().unwrap().as_str(), "Frobnicate");
        assert_eq!(msg.interface().unwrap().as_str(), "org.example.Iface");
        assert_eq!(msg.destination().unwrap().as_str(), "org.example.Svc");
        assert_eq!(msg.body_signature().to_string(), "i");
    }

    #[test]
    fn no_reply_expected_rejected_on_signals() {
        let builder = Message::signal("/", "org.example.Iface", "Changed").unwrap();
        assert!(builder.with_flags(Flags::NoReplyExpected).is_err());

        let builder = Message::signal("/", "org.example.Iface", "Changed").unwrap();
        assert!(builder.with_flags(Flags::NoAutoStart).is_ok());
    }

    #[test]
    fn replies_target_the_caller() {
        let call = Message::method("/", "Ping")
            .unwrap()
            .sender(":1.7")
            .unwrap()
            .build(vec![])
            .unwrap();

        let reply = Message::method_reply(&call).build(vec![]).unwrap();
        assert_eq!(reply.reply_serial(), Some(call.serial()));
        assert_eq!(reply.destination().unwrap().as_str(), ":1.7");

        let err = Message::method_error(&call, "org.example.Error.Failed")
            .unwrap()
            .build(vec![])
            .unwrap();
        assert_eq!(err.error_name().unwrap().as_str(), "org.example.Error.Failed");
        assert_eq!(err.reply_serial(), Some(call.serial()));
    }

    #[test]
    fn invalid_names_are_rejected() {
        assert!(Message::method("no-slash", "Ping").is_err());
        assert!(Message::method("/", "bad name").is_err());
        assert!(Message::signal("/", "NoDot", "Changed").is_err());
    }
}
