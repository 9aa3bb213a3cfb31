use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// The globally unique identifier of a server endpoint.
///
/// A GUID is 16 bytes, reported by the server as 32 lowercase hex characters
/// in the `OK` line of the authentication handshake and in the optional
/// `guid=` key of an address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Guid(String);

impl Guid {
    /// The GUID as a hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Guid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::Handshake(format!("invalid server GUID `{s}`")));
        }

        Ok(Guid(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let guid: Guid = "0123456789abcdef0123456789abcdef".parse().unwrap();
        assert_eq!(guid.as_str(), "0123456789abcdef0123456789abcdef");

        // Uppercase input is normalized.
        let guid: Guid = "0123456789ABCDEF0123456789ABCDEF".parse().unwrap();
        assert_eq!(guid.as_str(), "0123456789abcdef0123456789abcdef");

        assert!("0123".parse::<Guid>().is_err());
        assert!("0123456789abcdef0123456789abcdeg".parse::<Guid>().is_err());
        assert!("0123456789abcdef0123456789abcdef0".parse::<Guid>().is_err());
    }
}
