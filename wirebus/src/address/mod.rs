//! D-Bus address handling.
//!
//! Server addresses consist of a transport name followed by a colon, and
//! then an optional, comma-separated list of keys and values in the form
//! `key=value`, with values percent-encoded. Several such addresses,
//! separated by semicolons, form a candidate list that is tried in order.
//!
//! See also:
//!
//! * [Server addresses] in the D-Bus specification.
//!
//! [Server addresses]: https://dbus.freedesktop.org/doc/dbus-specification.html#addresses

pub mod transport;

use std::collections::HashMap;
use std::str::FromStr;
use std::{env, fmt};

use crate::{Error, Guid, Result};

use self::transport::Stream;
pub use self::transport::Transport;

/// A bus address: one candidate endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Address {
    guid: Option<Guid>,
    transport: Transport,
}

impl Address {
    /// Create a new `Address` from a `Transport`.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            guid: None,
        }
    }

    /// The transport details for this address.
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// The server GUID this address claims, if any.
    pub fn guid(&self) -> Option<&Guid> {
        self.guid.as_ref()
    }

    pub(crate) fn connect(&self) -> Result<Stream> {
        self.transport.connect()
    }

    /// Candidate addresses for the session bus, respecting the
    /// `DBUS_SESSION_BUS_ADDRESS` environment variable. If it is not set,
    /// fall back to `$XDG_RUNTIME_DIR/bus`.
    pub fn session() -> Result<Vec<Self>> {
        match env::var("DBUS_SESSION_BUS_ADDRESS") {
            Ok(val) => parse_list(&val),
            _ => {
                let runtime_dir = env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| {
                    format!("/run/user/{}", rustix::process::geteuid().as_raw())
                });

                parse_list(&format!("unix:path={runtime_dir}/bus"))
            }
        }
    }

    /// Candidate addresses for the system bus, respecting the
    /// `DBUS_SYSTEM_BUS_ADDRESS` environment variable. If it is not set,
    /// fall back to the well-known socket path.
    pub fn system() -> Result<Vec<Self>> {
        match env::var("DBUS_SYSTEM_BUS_ADDRESS") {
            Ok(val) => parse_list(&val),
            _ => parse_list("unix:path=/var/run/dbus/system_bus_socket"),
        }
    }

    /// Candidate addresses for the bus that activated this process, from the
    /// `DBUS_STARTER_ADDRESS` environment variable. Unlike the session and
    /// system buses there is no fallback: outside of D-Bus activation the
    /// variable is simply absent.
    pub fn starter() -> Result<Vec<Self>> {
        match env::var("DBUS_STARTER_ADDRESS") {
            Ok(val) => parse_list(&val),
            _ => Err(Error::Address(
                "DBUS_STARTER_ADDRESS is not set".to_owned(),
            )),
        }
    }
}

/// Parse a semicolon-separated candidate list, in the order it is to be
/// tried.
pub fn parse_list(addresses: &str) -> Result<Vec<Address>> {
    let mut list = Vec::new();
    for address in addresses.split(';') {
        if address.is_empty() {
            continue;
        }
        list.push(address.parse()?);
    }
    if list.is_empty() {
        return Err(Error::Address("empty address list".to_owned()));
    }

    Ok(list)
}

impl FromStr for Address {
    type Err = Error;

    /// Parse a single D-Bus address.
    fn from_str(address: &str) -> Result<Self> {
        let col = address
            .find(':')
            .ok_or_else(|| Error::Address("address has no colon".to_owned()))?;
        let transport = &address[..col];
        let mut options = HashMap::new();

        if address.len() > col + 1 {
            for kv in address[col + 1..].split(',') {
                let (k, v) = match kv.find('=') {
                    Some(eq) => (&kv[..eq], percent_decode(&kv[eq + 1..])?),
                    None => {
                        return Err(Error::Address(
                            "missing = when parsing key/value".to_owned(),
                        ))
                    }
                };
                if options.insert(k.to_owned(), v).is_some() {
                    return Err(Error::Address(format!(
                        "Key `{k}` specified multiple times"
                    )));
                }
            }
        }

        Ok(Self {
            guid: options
                .remove("guid")
                .map(|s| Guid::from_str(&s).map_err(|e| Error::Address(e.to_string())))
                .transpose()?,
            transport: Transport::from_options(transport, options)?,
        })
    }
}

impl TryFrom<&str> for Address {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::from_str(value)
    }
}

impl From<Transport> for Address {
    fn from(transport: Transport) -> Self {
        Self::new(transport)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.transport)
    }
}

fn percent_decode(value: &str) -> Result<String> {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|d| std::str::from_utf8(d).ok())
                    .and_then(|d| u8::from_str_radix(d, 16).ok())
                    .ok_or_else(|| {
                        Error::Address(format!("invalid percent escape in `{value}`"))
                    })?;
                decoded.push(hex);
                i += 3;
            }
            b => {
                decoded.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(decoded)
        .map_err(|_| Error::Address(format!("value `{value}` is not valid UTF-8")))
}
