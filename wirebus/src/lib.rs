//! A client-side D-Bus transport and message codec.
//!
//! This crate covers the layer between a raw socket and a message
//! dispatcher: parsing bus addresses and connecting to one of them, running
//! the authentication handshake, and marshaling/unmarshaling D-Bus messages
//! (including out-of-band Unix file descriptors) over the authenticated
//! stream.
//!
//! ```no_run
//! use wirebus::{connection, Address, Capability, Transport};
//!
//! # fn main() -> wirebus::Result<()> {
//! let addresses = Address::session()?;
//! let (guid, mut conn) =
//!     connection::connect_authenticated(addresses, Capability::UnixFd.into(), None)?;
//! println!("connected to {guid}");
//!
//! let hello = wirebus::Message::method("/org/freedesktop/DBus", "Hello")?
//!     .interface("org.freedesktop.DBus")?
//!     .destination("org.freedesktop.DBus")?
//!     .build(vec![])?;
//! conn.send(hello)?;
//! let reply = conn.recv()?;
//! println!("got {reply}");
//! # Ok(())
//! # }
//! ```

mod error;
pub use error::{Error, Result};

pub mod address;
pub use address::Address;

mod guid;
pub use guid::Guid;

pub mod message;
pub use message::Message;

pub mod names;

pub mod signature;

pub mod value;
pub use value::Value;

pub mod wire;
pub use wire::Endian;

pub mod connection;
/// Alias for `connection` module, for convenience.
pub use connection as conn;
pub use connection::{
    connect_authenticated, loopback, AuthMechanism, Capability, Connection, Loopback, Transport,
};

mod utils;
pub use utils::FDS_MAX;
