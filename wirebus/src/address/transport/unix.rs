use std::collections::HashMap;
use std::fmt;
#[cfg(target_os = "linux")]
use std::ffi::OsString;
use std::os::unix::net::{SocketAddr, UnixStream};
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use std::os::linux::net::SocketAddrExt;

use crate::{Error, Result};

/// A Unix domain socket transport in a D-Bus address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unix {
    path: UnixSocket,
}

impl Unix {
    /// Create a new Unix transport with the given path.
    pub fn new(path: UnixSocket) -> Self {
        Self { path }
    }

    /// The path.
    pub fn path(&self) -> &UnixSocket {
        &self.path
    }

    pub(crate) fn connect(&self) -> Result<UnixStream> {
        let addr = match &self.path {
            UnixSocket::File(path) => SocketAddr::from_pathname(path).map_err(Error::Connect)?,
            #[cfg(target_os = "linux")]
            UnixSocket::Abstract(name) => SocketAddr::from_abstract_name(name.as_encoded_bytes())
                .map_err(Error::Connect)?,
            // dir/tmpdir only make sense for a listening server; a client
            // cannot connect to them.
            UnixSocket::Dir(_) | UnixSocket::TmpDir(_) => {
                return Err(Error::Address(
                    "unix:dir/tmpdir are listening addresses".to_owned(),
                ));
            }
        };

        UnixStream::connect_addr(&addr).map_err(Error::Connect)
    }

    pub(super) fn from_options(opts: HashMap<String, String>) -> Result<Self> {
        let path = opts.get("path");
        let abs = opts.get("abstract");
        let dir = opts.get("dir");
        let tmpdir = opts.get("tmpdir");
        let path = match (path, abs, dir, tmpdir) {
            (Some(p), None, None, None) => UnixSocket::File(PathBuf::from(p)),
            #[cfg(target_os = "linux")]
            (None, Some(p), None, None) => UnixSocket::Abstract(OsString::from(p)),
            #[cfg(not(target_os = "linux"))]
            (None, Some(_), None, None) => {
                return Err(Error::Address(
                    "abstract sockets currently Linux-only".to_owned(),
                ));
            }
            (None, None, Some(p), None) => UnixSocket::Dir(PathBuf::from(p)),
            (None, None, None, Some(p)) => UnixSocket::TmpDir(PathBuf::from(p)),
            _ => {
                return Err(Error::Address("unix: address is invalid".to_owned()));
            }
        };

        Ok(Self::new(path))
    }
}

impl fmt::Display for Unix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            UnixSocket::File(path) => write!(f, "unix:path={}", path.display()),
            #[cfg(target_os = "linux")]
            UnixSocket::Abstract(name) => {
                write!(f, "unix:abstract={}", name.to_string_lossy())
            }
            UnixSocket::Dir(path) => write!(f, "unix:dir={}", path.display()),
            UnixSocket::TmpDir(path) => write!(f, "unix:tmpdir={}", path.display()),
        }
    }
}

/// A Unix domain socket path in a D-Bus address.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum UnixSocket {
    /// A path to a unix domain socket on the filesystem.
    File(PathBuf),
    /// A abstract unix domain socket name.
    #[cfg(target_os = "linux")]
    Abstract(OsString),
    /// A listenable address using the specified path, in which a socket file
    /// with a random file name starting with 'dbus-' will be created by the
    /// server. This address is only relevant to server implementations.
    Dir(PathBuf),
    /// The same as `Dir`, except that on platforms with abstract sockets,
    /// the server may attempt to create an abstract socket whose name starts
    /// with this directory instead of a path-based socket.
    TmpDir(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listening_only_keys_cannot_connect() {
        let unix = Unix::new(UnixSocket::TmpDir("/tmp".into()));
        assert!(matches!(unix.connect(), Err(Error::Address(_))));

        let unix = Unix::new(UnixSocket::Dir("/tmp".into()));
        assert!(matches!(unix.connect(), Err(Error::Address(_))));
    }

    #[test]
    fn missing_socket_file_is_a_connect_failure() {
        let unix = Unix::new(UnixSocket::File("/nonexistent/wirebus.sock".into()));
        match unix.connect() {
            Err(Error::Connect(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
