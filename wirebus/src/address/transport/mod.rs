//! D-Bus transport information module.
//!
//! This module provides the transport information for D-Bus addresses: what
//! kind of endpoint an address names, and how to open a byte stream to it.

use std::collections::HashMap;
use std::fmt;
use std::net::TcpStream;
use std::os::unix::net::UnixStream;

use crate::{Error, Result};

mod autolaunch;
pub(crate) use autolaunch::launch;

mod tcp;
pub use tcp::{Family, Tcp};

mod unix;
pub use unix::{Unix, UnixSocket};

/// The transport properties of a D-Bus address.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Transport {
    /// A Unix domain socket.
    Unix(Unix),
    /// A TCP stream.
    Tcp(Tcp),
    /// Ask the platform launcher for a fresh address list and try that.
    Autolaunch,
}

impl Transport {
    pub(crate) fn connect(&self) -> Result<Stream> {
        match self {
            Transport::Unix(unix) => unix.connect().map(Stream::Unix),
            Transport::Tcp(tcp) => tcp.connect().map(Stream::Tcp),
            Transport::Autolaunch => Err(Error::Address(
                "autolaunch addresses are resolved through the launcher, not connected"
                    .to_owned(),
            )),
        }
    }

    // Helper for `FromStr` impl of `Address`.
    pub(super) fn from_options(
        transport: &str,
        options: HashMap<String, String>,
    ) -> Result<Self> {
        match transport {
            "unix" => Unix::from_options(options).map(Self::Unix),
            "tcp" => Tcp::from_options(options).map(Self::Tcp),
            "autolaunch" => Ok(Self::Autolaunch),
            _ => Err(Error::UnknownTransport(transport.to_owned())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Unix(unix) => write!(f, "{unix}"),
            Transport::Tcp(tcp) => write!(f, "{tcp}"),
            Transport::Autolaunch => write!(f, "autolaunch:"),
        }
    }
}

/// An open, connected byte stream to one endpoint.
#[derive(Debug)]
pub(crate) enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    /// Whether this stream can carry `SCM_RIGHTS` ancillary data.
    pub(crate) fn is_unix(&self) -> bool {
        matches!(self, Stream::Unix(_))
    }
}
