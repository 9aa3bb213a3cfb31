//! Validated D-Bus name types.
//!
//! Every name that can appear in a message header has its own newtype, so
//! that an invalid name is rejected when the message is built rather than
//! when the peer drops the connection.
//!
//! See [Message protocol names] in the D-Bus specification for the grammar.
//!
//! [Message protocol names]: https://dbus.freedesktop.org/doc/dbus-specification.html#message-protocol-names

use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

const MAX_NAME_LENGTH: usize = 255;

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident, $kind:literal, $validate:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(String);

        impl $name {
            /// The name as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match $validate(s) {
                    Ok(()) => Ok(Self(s.to_owned())),
                    Err(reason) => Err(Error::InvalidName {
                        kind: $kind,
                        name: s.to_owned(),
                        reason: reason.to_owned(),
                    }),
                }
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(s: &str) -> Result<Self> {
                s.parse()
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self> {
                match $validate(&s) {
                    Ok(()) => Ok(Self(s)),
                    Err(reason) => Err(Error::InvalidName {
                        kind: $kind,
                        name: s,
                        reason: reason.to_owned(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_type!(
    /// A well-known (`com.example.Svc`) or unique (`:1.42`) bus name.
    BusName,
    "bus name",
    validate_bus_name
);

name_type!(
    /// An interface name such as `org.freedesktop.DBus.Peer`.
    InterfaceName,
    "interface name",
    validate_interface_name
);

name_type!(
    /// A method or signal name within an interface.
    MemberName,
    "member name",
    validate_member_name
);

name_type!(
    /// An error name; follows the interface name grammar.
    ErrorName,
    "error name",
    validate_interface_name
);

name_type!(
    /// A slash-delimited object path such as `/org/example/Obj`.
    ObjectPath,
    "object path",
    validate_object_path
);

fn is_element_char(b: u8, allow_digit: bool, allow_hyphen: bool) -> bool {
    b.is_ascii_alphabetic()
        || b == b'_'
        || (allow_digit && b.is_ascii_digit())
        || (allow_hyphen && b == b'-')
}

fn validate_dotted(
    s: &str,
    digits_may_lead: bool,
    allow_hyphen: bool,
) -> Result<(), &'static str> {
    let mut elements = 0;
    for element in s.split('.') {
        let bytes = element.as_bytes();
        match bytes.first() {
            None => return Err("name contains an empty element"),
            Some(&b) if !is_element_char(b, digits_may_lead, allow_hyphen) => {
                return Err("element starts with an invalid character");
            }
            Some(_) => {}
        }
        if !bytes[1..]
            .iter()
            .all(|&b| is_element_char(b, true, allow_hyphen))
        {
            return Err("element contains an invalid character");
        }
        elements += 1;
    }
    if elements < 2 {
        return Err("name must contain at least two elements");
    }

    Ok(())
}

pub(crate) fn validate_interface_name(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("name is empty");
    }
    if s.len() > MAX_NAME_LENGTH {
        return Err("name exceeds 255 bytes");
    }

    validate_dotted(s, false, false)
}

pub(crate) fn validate_bus_name(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("name is empty");
    }
    if s.len() > MAX_NAME_LENGTH {
        return Err("name exceeds 255 bytes");
    }

    match s.strip_prefix(':') {
        // Unique names are assigned by the bus and their elements may start
        // with a digit.
        Some(rest) => validate_dotted(rest, true, true),
        None => validate_dotted(s, false, true),
    }
}

pub(crate) fn validate_member_name(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("name is empty");
    }
    if s.len() > MAX_NAME_LENGTH {
        return Err("name exceeds 255 bytes");
    }
    let bytes = s.as_bytes();
    if bytes[0].is_ascii_digit() {
        return Err("name starts with a digit");
    }
    if !bytes.iter().all(|&b| is_element_char(b, true, false)) {
        return Err("name contains an invalid character");
    }

    Ok(())
}

pub(crate) fn validate_object_path(s: &str) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("path is empty");
    }
    if !s.starts_with('/') {
        return Err("path does not start with `/`");
    }
    if s == "/" {
        return Ok(());
    }
    if s.ends_with('/') {
        return Err("path ends with `/`");
    }
    for element in s[1..].split('/') {
        if element.is_empty() {
            return Err("path contains an empty element");
        }
        if !element
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err("path element contains an invalid character");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name() {
        assert!(InterfaceName::try_from("org.freedesktop.DBus").is_ok());
        assert!(InterfaceName::try_from("a.b").is_ok());
        assert!(InterfaceName::try_from("NoDot").is_err());
        assert!(InterfaceName::try_from(".leading.Dot").is_err());
        assert!(InterfaceName::try_from("trailing.Dot.").is_err());
        assert!(InterfaceName::try_from("org.9digit.Lead").is_err());
        assert!(InterfaceName::try_from("org.has|pipe.X").is_err());
        assert!(InterfaceName::try_from("org.with-hyphen.X").is_err());

        let long = format!("a.{}", "b".repeat(300));
        assert!(InterfaceName::try_from(long.as_str()).is_err());
    }

    #[test]
    fn bus_name() {
        assert!(BusName::try_from("com.example.Svc").is_ok());
        assert!(BusName::try_from("com.example-corp.Svc").is_ok());
        assert!(BusName::try_from(":1.42").is_ok());
        assert!(BusName::try_from(":").is_err());
        assert!(BusName::try_from("single").is_err());
        assert!(BusName::try_from("com..example").is_err());
        assert!(BusName::try_from("9com.example").is_err());
    }

    #[test]
    fn member_name() {
        assert!(MemberName::try_from("Frobnicate").is_ok());
        assert!(MemberName::try_from("_private2").is_ok());
        assert!(MemberName::try_from("").is_err());
        assert!(MemberName::try_from("Has.Dot").is_err());
        assert!(MemberName::try_from("2Leading").is_err());
        assert!(MemberName::try_from("bad char").is_err());
    }

    #[test]
    fn object_path() {
        assert!(ObjectPath::try_from("/").is_ok());
        assert!(ObjectPath::try_from("/org/example/Obj").is_ok());
        assert!(ObjectPath::try_from("/_1/x").is_ok());
        assert!(ObjectPath::try_from("").is_err());
        assert!(ObjectPath::try_from("relative/path").is_err());
        assert!(ObjectPath::try_from("/trailing/").is_err());
        assert!(ObjectPath::try_from("//double").is_err());
        assert!(ObjectPath::try_from("/bad-char").is_err());
    }
}
