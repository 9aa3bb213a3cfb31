//! The byte-stream seam under a connection.
//!
//! A connected stream is split into a read half and a write half so that a
//! receive and a send can be in flight at the same time from two threads.
//! The halves are trait objects; the crate ships implementations for Unix
//! domain sockets (with `SCM_RIGHTS` ancillary data) and TCP streams.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::mem::MaybeUninit;
use std::net::TcpStream;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags,
};

use crate::address::transport::Stream;
use crate::utils::FDS_MAX;

pub(crate) type RecvmsgResult = io::Result<(usize, Vec<OwnedFd>)>;

/// The read half of a socket.
///
/// `recvmsg` returns the number of bytes read (zero at end of stream) along
/// with any file descriptors that arrived as ancillary data.
pub trait ReadHalf: std::fmt::Debug + Send + Sync + 'static {
    fn recvmsg(&mut self, buf: &mut [u8]) -> RecvmsgResult;

    /// Supports passing file descriptors.
    fn can_pass_unix_fd(&self) -> bool {
        false
    }
}

/// The write half of a socket.
pub trait WriteHalf: std::fmt::Debug + Send + Sync + 'static {
    /// Attempt to send a message on the socket.
    ///
    /// On success, return the number of bytes written. There may be a
    /// partial write, in which case the caller is responsible for sending
    /// the remaining data by calling this method again until everything is
    /// written. If at least one byte has been written, then all the provided
    /// file descriptors will have been sent as well, and should not be
    /// provided again in subsequent calls.
    fn sendmsg(&mut self, buffer: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize>;

    /// Close the socket.
    ///
    /// After this call, it is valid for all reading and writing operations
    /// to fail.
    fn close(&mut self) -> io::Result<()>;

    /// Supports passing file descriptors.
    fn can_pass_unix_fd(&self) -> bool {
        false
    }

    /// The dbus daemon on `freebsd` and `dragonfly` requires the zero byte
    /// opening the handshake to arrive as a separate message with SCM_CREDS.
    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    fn send_zero_byte(&mut self) -> io::Result<Option<usize>> {
        Ok(None)
    }
}

/// Split a connected stream into its two halves.
pub(crate) fn split(stream: Stream) -> (Box<dyn ReadHalf>, Box<dyn WriteHalf>) {
    match stream {
        Stream::Unix(stream) => {
            let stream = Arc::new(stream);
            (
                Box::new(UnixStreamRead(stream.clone())),
                Box::new(UnixStreamWrite(stream)),
            )
        }
        Stream::Tcp(stream) => {
            let stream = Arc::new(stream);
            (
                Box::new(TcpStreamRead(stream.clone())),
                Box::new(TcpStreamWrite(stream)),
            )
        }
    }
}

#[derive(Debug)]
pub(crate) struct UnixStreamRead(Arc<UnixStream>);

impl ReadHalf for UnixStreamRead {
    fn recvmsg(&mut self, buf: &mut [u8]) -> RecvmsgResult {
        loop {
            match fd_recvmsg(&self.0, buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                v => break v,
            }
        }
    }

    fn can_pass_unix_fd(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub(crate) struct UnixStreamWrite(Arc<UnixStream>);

impl WriteHalf for UnixStreamWrite {
    fn sendmsg(&mut self, buffer: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        loop {
            match fd_sendmsg(&self.0, buffer, fds) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                v => break v,
            }
        }
    }

    fn close(&mut self) -> io::Result<()> {
        self.0.shutdown(std::net::Shutdown::Both)
    }

    fn can_pass_unix_fd(&self) -> bool {
        true
    }

    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
    fn send_zero_byte(&mut self) -> io::Result<Option<usize>> {
        send_zero_byte(&self.0).map(Some)
    }
}

fn fd_recvmsg(stream: &UnixStream, buffer: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buffer)];

    let mut space = [MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(FDS_MAX))];
    let mut cmsg_buffer = RecvAncillaryBuffer::new(&mut space);

    let msg = rustix::net::recvmsg(stream, &mut iov, &mut cmsg_buffer, RecvFlags::empty())?;

    let fds: Vec<_> = cmsg_buffer
        .drain()
        .filter_map(|cmsg| match cmsg {
            RecvAncillaryMessage::ScmRights(fds) => Some(fds),
            _ => None,
        })
        .flatten()
        .collect();

    Ok((msg.bytes, fds))
}

fn fd_sendmsg(stream: &UnixStream, buffer: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
    let iov = [IoSlice::new(buffer)];

    let mut space = if !fds.is_empty() {
        vec![MaybeUninit::uninit(); rustix::cmsg_space!(ScmRights(fds.len()))]
    } else {
        vec![]
    };

    let mut cmsg_buffer = SendAncillaryBuffer::new(&mut space);
    if !fds.is_empty() {
        cmsg_buffer.push(SendAncillaryMessage::ScmRights(fds));
    }

    match rustix::net::sendmsg(stream, &iov, &mut cmsg_buffer, SendFlags::empty())? {
        0 => Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "failed to write to socket",
        )),
        n => Ok(n),
    }
}

// Send the 0 byte as a separate SCM_CREDS message.
#[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
fn send_zero_byte(stream: &UnixStream) -> io::Result<usize> {
    use std::os::fd::AsRawFd;

    use nix::sys::socket;

    let iov = [std::io::IoSlice::new(b"\0")];
    socket::sendmsg::<()>(
        stream.as_raw_fd(),
        &iov,
        &[socket::ControlMessage::ScmCreds],
        socket::MsgFlags::empty(),
        None,
    )
    .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

#[derive(Debug)]
pub(crate) struct TcpStreamRead(Arc<TcpStream>);

impl ReadHalf for TcpStreamRead {
    fn recvmsg(&mut self, buf: &mut [u8]) -> RecvmsgResult {
        let len = (&*self.0).read(buf)?;
        Ok((len, vec![]))
    }
}

#[derive(Debug)]
pub(crate) struct TcpStreamWrite(Arc<TcpStream>);

impl WriteHalf for TcpStreamWrite {
    fn sendmsg(&mut self, buf: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
        if !fds.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fds cannot be sent with a tcp stream",
            ));
        }

        (&*self.0).write(buf)
    }

    fn close(&mut self) -> io::Result<()> {
        self.0.shutdown(std::net::Shutdown::Both)
    }
}
