use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use crate::{Error, Result};

/// The socket family a `tcp:` address may force.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

impl Family {
    fn matches(self, addr: &SocketAddr) -> bool {
        match self {
            Family::Ipv4 => addr.is_ipv4(),
            Family::Ipv6 => addr.is_ipv6(),
        }
    }
}

/// A TCP transport in a D-Bus address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tcp {
    host: String,
    port: u16,
    family: Option<Family>,
}

impl Tcp {
    /// The DNS name or IP address of the peer.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The forced socket family, if any.
    pub fn family(&self) -> Option<Family> {
        self.family
    }

    pub(crate) fn connect(&self) -> Result<TcpStream> {
        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(Error::Connect)?;

        let mut last_err = None;
        for addr in addrs {
            if let Some(family) = self.family {
                if !family.matches(&addr) {
                    continue;
                }
            }
            match TcpStream::connect(addr) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(Error::Connect(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "host resolved to no usable address",
            )
        })))
    }

    pub(super) fn from_options(opts: HashMap<String, String>) -> Result<Self> {
        let host = opts
            .get("host")
            .ok_or_else(|| Error::Address("tcp: address is missing `host`".to_owned()))?
            .clone();
        let port = opts
            .get("port")
            .ok_or_else(|| Error::Address("tcp: address is missing `port`".to_owned()))?
            .parse()
            .map_err(|_| Error::Address("invalid tcp `port`".to_owned()))?;
        let family = match opts.get("family").map(String::as_str) {
            None => None,
            Some("ipv4") => Some(Family::Ipv4),
            Some("ipv6") => Some(Family::Ipv6),
            Some(other) => {
                return Err(Error::Address(format!("invalid tcp `family`: `{other}`")));
            }
        };

        Ok(Self { host, port, family })
    }
}

impl fmt::Display for Tcp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp:host={},port={}", self.host, self.port)?;
        match self.family {
            Some(Family::Ipv4) => write!(f, ",family=ipv4"),
            Some(Family::Ipv6) => write!(f, ",family=ipv6"),
            None => Ok(()),
        }
    }
}
