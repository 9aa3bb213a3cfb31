//! Authenticated transports: connect, send, receive, shut down.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, OwnedFd};

use enumflags2::{bitflags, BitFlags};
use log::{debug, trace, warn};

use crate::address::{transport, Address};
use crate::message::{
    decode_message, encode_message_into, header::MIN_MESSAGE_SIZE, total_message_size,
    PrimaryHeader,
};
use crate::wire::Endian;
use crate::{Error, Guid, Message, Result};

pub mod socket;
pub use socket::{ReadHalf, WriteHalf};

pub(crate) mod handshake;
use handshake::{Authenticated, ClientHandshake};
pub use handshake::AuthMechanism;

/// An optional protocol feature negotiated during authentication.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Capability {
    /// Messages may carry Unix file descriptors out-of-band.
    UnixFd = 0b1,
}

/// An authenticated, message-oriented channel to a D-Bus peer.
///
/// At most one `recv` and one `send` may be outstanding at a time; the
/// transport does not lock internally.
pub trait Transport: Send + fmt::Debug {
    /// Receive the next message from the peer.
    fn recv(&mut self) -> Result<Message>;

    /// Send `msg` to the peer, consuming it (file descriptors included).
    fn send(&mut self, msg: Message) -> Result<()>;

    /// The capabilities both sides agreed on.
    fn capabilities(&self) -> BitFlags<Capability>;

    /// Tear the channel down. Idempotent; errors are logged, not returned.
    /// Every later operation fails with [`Error::Cancelled`].
    fn shutdown(&mut self);
}

/// Establish and authenticate a connection.
///
/// Candidates are tried left to right; `autolaunch` entries are expanded
/// in place through the platform launcher. The first fully authenticated
/// endpoint wins. When every candidate fails, the *first* failure is
/// returned (later candidates are often irrelevant fallbacks) and the rest
/// are logged at debug level.
pub fn connect_authenticated(
    addresses: Vec<Address>,
    requested: BitFlags<Capability>,
    mechanisms: Option<Vec<AuthMechanism>>,
) -> Result<(Guid, Connection)> {
    let mut queue: VecDeque<Address> = addresses.into();
    let mut first_error: Option<Error> = None;

    while let Some(address) = queue.pop_front() {
        if matches!(address.transport(), transport::Transport::Autolaunch) {
            match transport::launch() {
                Ok(expanded) => {
                    // The launcher's candidates take the failed entry's
                    // place in the queue, preserving overall order.
                    for (i, address) in expanded.into_iter().enumerate() {
                        queue.insert(i, address);
                    }
                }
                Err(e) => {
                    debug!("autolaunch failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
            continue;
        }

        match connect_one(&address, requested, mechanisms.clone()) {
            Ok(done) => return Ok(done),
            Err(e) => {
                debug!("connecting to {address} failed: {e}");
                first_error.get_or_insert(e);
            }
        }
    }

    Err(first_error.unwrap_or_else(|| Error::Address("no addresses to try".to_owned())))
}

fn connect_one(
    address: &Address,
    requested: BitFlags<Capability>,
    mechanisms: Option<Vec<AuthMechanism>>,
) -> Result<(Guid, Connection)> {
    trace!("connecting to {address}");
    let stream = address.connect()?;

    // FD passing is only meaningful over PF_UNIX; drop it from the
    // negotiation for anything else.
    let requested = if stream.is_unix() {
        requested
    } else {
        requested & !Capability::UnixFd
    };

    let (read, write) = socket::split(stream);
    let auth = ClientHandshake::new(
        read,
        write,
        mechanisms,
        address.guid().cloned(),
        requested.contains(Capability::UnixFd),
    )
    .perform()?;

    let guid = auth.guid.clone();
    Ok((guid, Connection::new(auth)))
}

/// Connect to the session bus.
pub fn session() -> Result<(Guid, Connection)> {
    connect_authenticated(Address::session()?, Capability::UnixFd.into(), None)
}

/// Connect to the system bus.
pub fn system() -> Result<(Guid, Connection)> {
    connect_authenticated(Address::system()?, Capability::UnixFd.into(), None)
}

/// A [`Transport`] over a connected, authenticated socket.
#[derive(Debug)]
pub struct Connection {
    socket_read: Option<Box<dyn ReadHalf>>,
    socket_write: Option<Box<dyn WriteHalf>>,
    capabilities: BitFlags<Capability>,
    guid: Guid,
    // Stream bytes received but not yet consumed, starting at a message
    // boundary.
    inbuf: Vec<u8>,
    // Encode scratch space, grown on demand and retained across sends.
    outbuf: Vec<u8>,
}

impl Connection {
    fn new(auth: Authenticated) -> Self {
        let capabilities = if auth.cap_unix_fd {
            Capability::UnixFd.into()
        } else {
            BitFlags::empty()
        };

        Self {
            socket_read: Some(auth.socket_read),
            socket_write: Some(auth.socket_write),
            capabilities,
            guid: auth.guid,
            inbuf: auth.already_received_bytes,
            outbuf: Vec::new(),
        }
    }

    /// The GUID of the server this connection is authenticated to.
    pub fn guid(&self) -> &Guid {
        &self.guid
    }

    fn close_halves(&mut self) {
        if let Some(mut write) = self.socket_write.take() {
            if let Err(e) = write.close() {
                warn!("failed to close socket: {e}");
            }
        }
        self.socket_read = None;
    }
}

impl Transport for Connection {
    fn recv(&mut self) -> Result<Message> {
        let read = self.socket_read.as_mut().ok_or(Error::Cancelled)?;

        let mut bytes = std::mem::take(&mut self.inbuf);
        let mut fds: Vec<OwnedFd> = Vec::new();
        let mut pos = bytes.len();

        // Complete the fixed header first; it sizes everything else.
        if pos < MIN_MESSAGE_SIZE {
            bytes.resize(MIN_MESSAGE_SIZE, 0);
            while pos < MIN_MESSAGE_SIZE {
                let (read_len, read_fds) = read.recvmsg(&mut bytes[pos..])?;
                fds.extend(read_fds);
                if read_len == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to receive message",
                    )
                    .into());
                }
                pos += read_len;
            }
        }

        let (primary, fields_len) = PrimaryHeader::read(&bytes)?;
        // Reject oversized messages before reading their body.
        let total = total_message_size(&primary, fields_len)?;

        if pos > total {
            self.inbuf = bytes.split_off(total);
        } else {
            bytes.resize(total, 0);
            while pos < total {
                let (read_len, read_fds) = read.recvmsg(&mut bytes[pos..])?;
                fds.extend(read_fds);
                if read_len == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to receive message",
                    )
                    .into());
                }
                pos += read_len;
            }
        }

        // A decode failure closes the received FDs (the codec owns them by
        // now) but leaves the stream open; the caller decides what next.
        let msg = decode_message(&bytes, fds)?;
        trace!("received message: {msg}");
        Ok(msg)
    }

    fn send(&mut self, msg: Message) -> Result<()> {
        if self.socket_write.is_none() {
            return Err(Error::Cancelled);
        }

        let (len, fds) = encode_message_into(&msg, Endian::NATIVE, &mut self.outbuf)?;
        if !fds.is_empty() && !self.capabilities.contains(Capability::UnixFd) {
            return Err(Error::Encode(
                "file descriptor passing was not negotiated".into(),
            ));
        }

        trace!("sending message: {msg}");
        let serial = msg.serial();
        drop(msg);

        let result = (|| {
            let write = self.socket_write.as_mut().ok_or(Error::Cancelled)?;
            let mut pos = 0;
            while pos < len {
                let fds: Vec<_> = if pos == 0 {
                    fds.iter().map(|f| f.as_fd()).collect()
                } else {
                    vec![]
                };
                pos += write.sendmsg(&self.outbuf[pos..len], &fds)?;
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                trace!("sent message with serial: {serial}");
                Ok(())
            }
            Err(e) => {
                // A partial write leaves the peer's stream desynchronized;
                // the only safe action is shutdown.
                self.shutdown();
                Err(e)
            }
        }
    }

    fn capabilities(&self) -> BitFlags<Capability> {
        self.capabilities
    }

    fn shutdown(&mut self) {
        self.close_halves();
        self.inbuf.clear();
    }
}

/// An in-memory [`Transport`] for tests: `send` parks a deep copy of the
/// message in a single-slot mailbox, `recv` takes it out. Sender and
/// receiver end up with independent file descriptors.
#[derive(Debug, Default)]
pub struct Loopback {
    slot: Option<Message>,
    closed: bool,
}

/// Create a loopback transport. Its capability set includes
/// [`Capability::UnixFd`] so descriptor paths can be exercised.
pub fn loopback() -> Loopback {
    Loopback::default()
}

impl Transport for Loopback {
    fn recv(&mut self) -> Result<Message> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        self.slot.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::WouldBlock, "loopback mailbox is empty").into()
        })
    }

    fn send(&mut self, msg: Message) -> Result<()> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        if self.slot.is_some() {
            return Err(
                io::Error::new(io::ErrorKind::WouldBlock, "loopback mailbox is full").into(),
            );
        }
        self.slot = Some(msg.deep_dup()?);
        Ok(())
    }

    fn capabilities(&self) -> BitFlags<Capability> {
        Capability::UnixFd.into()
    }

    fn shutdown(&mut self) {
        self.slot = None;
        self.closed = true;
    }
}
