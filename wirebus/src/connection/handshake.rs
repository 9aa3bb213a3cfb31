use std::collections::VecDeque;
use std::fmt;
use std::io::BufRead;
use std::path::PathBuf;
use std::str::FromStr;

use log::trace;

use crate::guid::Guid;
use crate::{Error, Result};

use super::socket::{ReadHalf, WriteHalf};

// Handshake lines longer than this are rejected outright.
const MAX_AUTH_LINE: usize = 16 * 1024;

/// Authentication mechanisms
///
/// See <https://dbus.freedesktop.org/doc/dbus-specification.html#auth-mechanisms>
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMechanism {
    /// This is the recommended authentication mechanism on platforms where
    /// credentials can be transferred out-of-band, in particular Unix
    /// platforms that can perform credentials-passing over the `unix:`
    /// transport.
    External,

    /// This mechanism is designed to establish that a client has the ability
    /// to read a private file owned by the user being authenticated.
    Cookie,

    /// Does not perform any authentication at all, and should not be
    /// accepted by message buses. However, it might sometimes be useful for
    /// non-message-bus uses of D-Bus.
    Anonymous,
}

impl AuthMechanism {
    /// The mechanisms tried when the caller does not pick: EXTERNAL, then
    /// ANONYMOUS.
    pub fn default_mechanisms() -> Vec<AuthMechanism> {
        vec![AuthMechanism::External, AuthMechanism::Anonymous]
    }
}

/// The result of a finalized client handshake.
///
/// Everything a connection needs to start exchanging messages: the socket
/// halves, the negotiated file-descriptor capability, the server GUID, and
/// any stream bytes read past the final handshake line.
#[derive(Debug)]
pub(crate) struct Authenticated {
    pub(crate) socket_read: Box<dyn ReadHalf>,
    pub(crate) socket_write: Box<dyn WriteHalf>,
    /// Whether file descriptor passing has been accepted by both sides
    pub(crate) cap_unix_fd: bool,
    pub(crate) guid: Guid,
    pub(crate) already_received_bytes: Vec<u8>,
}

/*
 * Client-side handshake logic
 */

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
enum ClientHandshakeStep {
    Init,
    MechanismInit,
    WaitingForData,
    WaitingForOK,
    WaitingForReject,
    WaitingForAgreeUnixFD,
    Done,
}

// The plain-text SASL profile authentication protocol described here:
// <https://dbus.freedesktop.org/doc/dbus-specification.html#auth-protocol>
//
// These are all the known commands, which can be parsed from or serialized
// to text.
#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
enum Command {
    Auth(AuthMechanism, Vec<u8>),
    Cancel,
    Begin,
    Data(Option<Vec<u8>>),
    Error(String),
    NegotiateUnixFD,
    Rejected(Vec<AuthMechanism>),
    Ok(Guid),
    AgreeUnixFD,
}

/// A client-side handshake in progress.
///
/// Runs exactly once per transport, strictly before any message flows. On
/// success it yields an [`Authenticated`] carrying the socket halves back to
/// the connection.
#[derive(Debug)]
pub(crate) struct ClientHandshake {
    common: HandshakeCommon,
    server_guid: Option<Guid>,
    guid: Option<Guid>,
    request_unix_fd: bool,
    step: ClientHandshakeStep,
}

impl ClientHandshake {
    /// Start a handshake on this client socket
    pub fn new(
        socket_read: Box<dyn ReadHalf>,
        socket_write: Box<dyn WriteHalf>,
        mechanisms: Option<Vec<AuthMechanism>>,
        server_guid: Option<Guid>,
        request_unix_fd: bool,
    ) -> ClientHandshake {
        let mechanisms = mechanisms.unwrap_or_else(AuthMechanism::default_mechanisms);

        ClientHandshake {
            common: HandshakeCommon::new(socket_read, socket_write, mechanisms.into()),
            server_guid,
            guid: None,
            request_unix_fd,
            step: ClientHandshakeStep::Init,
        }
    }

    fn mechanism_init(&mut self) -> Result<(ClientHandshakeStep, Command)> {
        use ClientHandshakeStep::*;
        let mech = *self.common.mechanism()?;
        match mech {
            AuthMechanism::Anonymous => Ok((
                WaitingForOK,
                Command::Auth(mech, b"wirebus".to_vec()),
            )),
            AuthMechanism::External => Ok((
                WaitingForOK,
                Command::Auth(mech, sasl_auth_id().into_bytes()),
            )),
            AuthMechanism::Cookie => Ok((
                WaitingForData,
                Command::Auth(mech, sasl_auth_id().into_bytes()),
            )),
        }
    }

    fn mechanism_data(&mut self, data: Vec<u8>) -> Result<(ClientHandshakeStep, Command)> {
        let mech = self.common.mechanism()?;
        match mech {
            AuthMechanism::Cookie => {
                let context = std::str::from_utf8(&data)
                    .map_err(|_| Error::Handshake("Cookie context was not valid UTF-8".into()))?;
                let mut split = context.split_ascii_whitespace();
                let context = split
                    .next()
                    .ok_or_else(|| Error::Handshake("Missing cookie context name".into()))?;
                let context = CookieContext::try_from(context)?;
                let id = split
                    .next()
                    .ok_or_else(|| Error::Handshake("Missing cookie ID".into()))?;
                let id = id
                    .parse()
                    .map_err(|e| Error::Handshake(format!("Invalid cookie ID `{id}`: {e}")))?;
                let server_challenge = split
                    .next()
                    .ok_or_else(|| Error::Handshake("Missing cookie challenge".into()))?;

                let cookie = Cookie::lookup(&context, id)?.cookie;
                let client_challenge = random_ascii(16);
                let sec = format!("{server_challenge}:{client_challenge}:{cookie}");
                let sha1 = sha1_smol::Sha1::from(sec).hexdigest();
                let data = format!("{client_challenge} {sha1}");
                Ok((
                    ClientHandshakeStep::WaitingForOK,
                    Command::Data(Some(data.into())),
                ))
            }
            _ => Err(Error::Handshake("Unexpected mechanism DATA".into())),
        }
    }

    // REJECTED names the mechanisms the server accepts; keep trying only the
    // ones we were asked to use that the server also offers.
    fn next_mechanism(&mut self, offered: Vec<AuthMechanism>) {
        self.common.mechanisms.pop_front();
        if !offered.is_empty() {
            self.common.mechanisms.retain(|m| offered.contains(m));
        }
        self.step = ClientHandshakeStep::MechanismInit;
    }

    /// Perform the handshake.
    ///
    /// On a successful handshake, you get an [`Authenticated`]. If you need
    /// to send a Bus Hello, this remains to be done.
    pub fn perform(mut self) -> Result<Authenticated> {
        use ClientHandshakeStep::*;
        loop {
            let (next_step, cmd) = match self.step {
                Init => {
                    trace!("Initializing");
                    let ret = self.mechanism_init()?;
                    // The dbus daemon on some platforms requires sending the
                    // zero byte as a separate message with SCM_CREDS.
                    #[cfg(any(target_os = "freebsd", target_os = "dragonfly"))]
                    let written = self
                        .common
                        .socket_write
                        .send_zero_byte()
                        .map_err(|e| {
                            Error::Handshake(format!(
                                "Could not send zero byte with credentials: {e}"
                            ))
                        })
                        .and_then(|n| {
                            n.ok_or_else(|| {
                                Error::Handshake(
                                    "Could not send zero byte with credentials".to_string(),
                                )
                            })
                        })?;

                    // leading 0 is sent separately already for `freebsd` and
                    // `dragonfly` above.
                    #[cfg(not(any(target_os = "freebsd", target_os = "dragonfly")))]
                    let written = self.common.socket_write.sendmsg(&[b'\0'], &[])?;

                    if written != 1 {
                        return Err(Error::Handshake(
                            "Could not send zero byte with credentials".to_string(),
                        ));
                    }

                    ret
                }
                MechanismInit => {
                    trace!("Initializing auth mechanisms");
                    self.mechanism_init()?
                }
                WaitingForData | WaitingForOK => {
                    trace!("Waiting for DATA or OK from server");
                    let reply = self.common.read_command()?;
                    match (self.step, reply) {
                        (_, Command::Data(data)) => {
                            trace!("Received DATA from server");
                            let data = data.ok_or_else(|| {
                                Error::Handshake("Received DATA with no data from server".into())
                            })?;
                            self.mechanism_data(data)?
                        }
                        (_, Command::Rejected(offered)) => {
                            trace!("Received REJECTED from server. Will try next auth mechanism..");
                            self.next_mechanism(offered);
                            continue;
                        }
                        (_, Command::Error(_)) => {
                            trace!("Received ERROR from server; cancelling this mechanism");
                            (WaitingForReject, Command::Cancel)
                        }
                        (WaitingForOK, Command::Ok(guid)) => {
                            trace!("Received OK from server");
                            match &self.server_guid {
                                Some(server_guid) if *server_guid != guid => {
                                    return Err(Error::Handshake(format!(
                                        "Server GUID mismatch: expected {server_guid}, got {guid}",
                                    )));
                                }
                                _ => (),
                            }
                            self.guid = Some(guid);
                            if self.request_unix_fd
                                && self.common.socket_write.can_pass_unix_fd()
                            {
                                (WaitingForAgreeUnixFD, Command::NegotiateUnixFD)
                            } else {
                                (Done, Command::Begin)
                            }
                        }
                        (_, reply) => {
                            return Err(Error::Handshake(format!(
                                "Unexpected server AUTH OK reply: {reply}"
                            )));
                        }
                    }
                }
                WaitingForReject => {
                    trace!("Waiting for REJECTED after CANCEL");
                    let reply = self.common.read_command()?;
                    match reply {
                        Command::Rejected(offered) => {
                            self.next_mechanism(offered);
                            continue;
                        }
                        reply => {
                            return Err(Error::Handshake(format!(
                                "Unexpected server CANCEL reply: {reply}"
                            )));
                        }
                    }
                }
                WaitingForAgreeUnixFD => {
                    trace!("Waiting for Unix FD passing agreement from server");
                    let reply = self.common.read_command()?;
                    match reply {
                        Command::AgreeUnixFD => {
                            trace!("Unix FD passing agreed by server");
                            self.common.cap_unix_fd = true
                        }
                        Command::Error(_) => {
                            trace!("Unix FD passing rejected by server");
                            self.common.cap_unix_fd = false
                        }
                        _ => {
                            return Err(Error::Handshake(format!(
                                "Unexpected server UNIX_FD reply: {reply}"
                            )));
                        }
                    }
                    (Done, Command::Begin)
                }
                Done => {
                    trace!("Handshake done");
                    let guid = self
                        .guid
                        .ok_or_else(|| Error::Handshake("Handshake ended without a GUID".into()))?;
                    return Ok(Authenticated {
                        socket_read: self.common.socket_read,
                        socket_write: self.common.socket_write,
                        cap_unix_fd: self.common.cap_unix_fd,
                        guid,
                        already_received_bytes: self.common.recv_buffer,
                    });
                }
            };
            self.common.write_command(cmd)?;
            self.step = next_step;
        }
    }
}

fn random_ascii(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    use std::iter;

    let mut rng = thread_rng();
    iter::repeat(())
        .map(|()| rng.sample(Alphanumeric))
        .map(char::from)
        .take(len)
        .collect()
}

fn sasl_auth_id() -> String {
    rustix::process::geteuid().as_raw().to_string()
}

fn home_dir() -> Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| Error::Handshake("Failed to determine home directory".into()))
}

#[derive(Debug)]
struct Cookie {
    id: usize,
    cookie: String,
}

impl Cookie {
    fn keyring_path() -> Result<PathBuf> {
        let mut path = home_dir()?;
        path.push(".dbus-keyrings");
        Ok(path)
    }

    fn read_keyring(context: &CookieContext<'_>) -> Result<Vec<Cookie>> {
        let mut path = Cookie::keyring_path()?;
        {
            use std::os::unix::fs::PermissionsExt;

            let perms = std::fs::metadata(&path)?.permissions().mode();
            if perms & 0o066 != 0 {
                return Err(Error::Handshake(
                    "DBus keyring has invalid permissions".into(),
                ));
            }
        }

        path.push(context.0);
        trace!("Reading keyring {:?}", path);

        let lines = std::fs::File::open(&path)
            .map(std::io::BufReader::new)
            .map(std::io::BufReader::lines)?;

        let mut cookies = vec![];
        for (n, line) in lines.enumerate() {
            let line = line?;
            let mut split = line.split_whitespace();
            let id = split
                .next()
                .ok_or_else(|| {
                    Error::Handshake(format!(
                        "DBus cookie `{}` missing ID at line {n}",
                        path.display(),
                    ))
                })?
                .parse()
                .map_err(|e| {
                    Error::Handshake(format!(
                        "Failed to parse cookie ID in file `{}` at line {n}: {e}",
                        path.display(),
                    ))
                })?;
            let _ = split.next().ok_or_else(|| {
                Error::Handshake(format!(
                    "DBus cookie `{}` missing creation time at line {n}",
                    path.display(),
                ))
            })?;
            let cookie = split
                .next()
                .ok_or_else(|| {
                    Error::Handshake(format!(
                        "DBus cookie `{}` missing cookie data at line {n}",
                        path.display(),
                    ))
                })?
                .to_string();
            cookies.push(Cookie { id, cookie })
        }
        trace!("Loaded keyring {:?}", cookies);
        Ok(cookies)
    }

    fn lookup(context: &CookieContext<'_>, id: usize) -> Result<Cookie> {
        let keyring = Self::read_keyring(context)?;
        keyring
            .into_iter()
            .find(|c| c.id == id)
            .ok_or_else(|| Error::Handshake(format!("DBus cookie ID {id} not found")))
    }
}

#[derive(Debug)]
pub(crate) struct CookieContext<'c>(&'c str);

impl<'c> TryFrom<&'c str> for CookieContext<'c> {
    type Error = Error;

    fn try_from(value: &'c str) -> Result<Self> {
        if value.is_empty() {
            return Err(Error::Handshake("Empty cookie context".into()));
        } else if !value.is_ascii() || value.contains(['/', '\\', ' ', '\n', '\r', '\t', '.']) {
            return Err(Error::Handshake(
                "Invalid characters in cookie context".into(),
            ));
        }

        Ok(Self(value))
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mech = match self {
            AuthMechanism::External => "EXTERNAL",
            AuthMechanism::Cookie => "DBUS_COOKIE_SHA1",
            AuthMechanism::Anonymous => "ANONYMOUS",
        };
        write!(f, "{mech}")
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "EXTERNAL" => Ok(AuthMechanism::External),
            "DBUS_COOKIE_SHA1" => Ok(AuthMechanism::Cookie),
            "ANONYMOUS" => Ok(AuthMechanism::Anonymous),
            _ => Err(Error::Handshake(format!("Unknown mechanism: {s}"))),
        }
    }
}

impl From<Command> for Vec<u8> {
    fn from(c: Command) -> Self {
        c.to_string().into()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Auth(mech, resp) => write!(f, "AUTH {mech} {}", hex::encode(resp)),
            Command::Cancel => write!(f, "CANCEL"),
            Command::Begin => write!(f, "BEGIN"),
            Command::Data(data) => match data {
                None => write!(f, "DATA"),
                Some(data) => write!(f, "DATA {}", hex::encode(data)),
            },
            Command::Error(expl) => write!(f, "ERROR {expl}"),
            Command::NegotiateUnixFD => write!(f, "NEGOTIATE_UNIX_FD"),
            Command::Rejected(mechs) => {
                write!(
                    f,
                    "REJECTED {}",
                    mechs
                        .iter()
                        .map(|m| m.to_string())
                        .collect::<Vec<_>>()
                        .join(" ")
                )
            }
            Command::Ok(guid) => write!(f, "OK {guid}"),
            Command::AgreeUnixFD => write!(f, "AGREE_UNIX_FD"),
        }?;
        write!(f, "\r\n")
    }
}

impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_ascii_whitespace();
        let cmd = match words.next() {
            Some("DATA") => {
                let data = match words.next() {
                    Some(data) => Some(hex::decode(data).map_err(|e| {
                        Error::Handshake(format!("Invalid hex in DATA: {e}"))
                    })?),
                    None => None,
                };

                Command::Data(data)
            }
            Some("ERROR") => Command::Error(s.into()),
            Some("REJECTED") => {
                // Mechanisms we do not implement are simply not candidates.
                let mechs = words.filter_map(|m| m.parse().ok()).collect();
                Command::Rejected(mechs)
            }
            Some("OK") => {
                let guid = words
                    .next()
                    .ok_or_else(|| Error::Handshake("Missing OK server GUID!".into()))?;
                Command::Ok(guid.parse()?)
            }
            Some("AGREE_UNIX_FD") => Command::AgreeUnixFD,
            _ => return Err(Error::Handshake(format!("Unknown command: {s}"))),
        };
        Ok(cmd)
    }
}

// Common I/O for the handshake: buffered line reading and command writing.
#[derive(Debug)]
pub(crate) struct HandshakeCommon {
    socket_read: Box<dyn ReadHalf>,
    socket_write: Box<dyn WriteHalf>,
    recv_buffer: Vec<u8>,
    cap_unix_fd: bool,
    // the current AUTH mechanism is front, ordered by priority
    mechanisms: VecDeque<AuthMechanism>,
}

impl HandshakeCommon {
    fn new(
        socket_read: Box<dyn ReadHalf>,
        socket_write: Box<dyn WriteHalf>,
        mechanisms: VecDeque<AuthMechanism>,
    ) -> Self {
        Self {
            socket_read,
            socket_write,
            recv_buffer: Vec::new(),
            cap_unix_fd: false,
            mechanisms,
        }
    }

    fn write_command(&mut self, command: Command) -> Result<()> {
        let mut send_buffer = Vec::<u8>::from(command);
        while !send_buffer.is_empty() {
            let written = self.socket_write.sendmsg(&send_buffer, &[])?;
            send_buffer.drain(..written);
        }
        Ok(())
    }

    fn read_command(&mut self) -> Result<Command> {
        let mut cmd_end = 0;
        loop {
            if let Some(i) = self.recv_buffer[cmd_end..].iter().position(|b| *b == b'\n') {
                if cmd_end + i == 0 || self.recv_buffer.get(cmd_end + i - 1) != Some(&b'\r') {
                    return Err(Error::Handshake("Invalid line ending in handshake".into()));
                }
                cmd_end += i + 1;

                break;
            } else {
                cmd_end = self.recv_buffer.len();
            }

            if cmd_end > MAX_AUTH_LINE {
                return Err(Error::Handshake(
                    "Handshake line exceeds the 16 KiB limit".into(),
                ));
            }

            let mut buf = [0; 64];
            let (read, fds) = self.socket_read.recvmsg(&mut buf)?;
            if !fds.is_empty() {
                return Err(Error::Handshake("Unexpected FDs during handshake".into()));
            }
            if read == 0 {
                return Err(Error::Handshake("Unexpected EOF during handshake".into()));
            }
            self.recv_buffer.extend(&buf[..read]);
        }

        let line_bytes = self.recv_buffer.drain(..cmd_end);
        let line = std::str::from_utf8(line_bytes.as_slice())
            .map_err(|e| Error::Handshake(e.to_string()))?;

        trace!("Reading {line}");
        line.trim_end().parse()
    }

    fn mechanism(&self) -> Result<&AuthMechanism> {
        self.mechanisms
            .front()
            .ok_or_else(|| Error::Handshake("Exhausted available AUTH mechanisms".into()))
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::os::fd::{BorrowedFd, OwnedFd};
    use std::sync::{Arc, Mutex};

    use super::*;

    const GUID: &str = "30f41e50d79bc643a3300f41216732a9";

    #[derive(Debug)]
    struct ScriptRead {
        data: Vec<u8>,
        pos: usize,
        unix: bool,
    }

    impl ScriptRead {
        fn new(lines: &[&str], unix: bool) -> Self {
            let mut data = Vec::new();
            for line in lines {
                data.extend_from_slice(line.as_bytes());
            }
            ScriptRead { data, pos: 0, unix }
        }
    }

    impl ReadHalf for ScriptRead {
        fn recvmsg(&mut self, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok((n, vec![]))
        }

        fn can_pass_unix_fd(&self) -> bool {
            self.unix
        }
    }

    #[derive(Debug)]
    struct ScriptWrite {
        sent: Arc<Mutex<Vec<u8>>>,
        unix: bool,
    }

    impl WriteHalf for ScriptWrite {
        fn sendmsg(&mut self, buffer: &[u8], _fds: &[BorrowedFd<'_>]) -> io::Result<usize> {
            self.sent.lock().unwrap().extend_from_slice(buffer);
            Ok(buffer.len())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn can_pass_unix_fd(&self) -> bool {
            self.unix
        }
    }

    fn run(
        server_lines: &[&str],
        mechanisms: Option<Vec<AuthMechanism>>,
        request_unix_fd: bool,
        unix: bool,
    ) -> (Result<Authenticated>, String) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let read = Box::new(ScriptRead::new(server_lines, unix));
        let write = Box::new(ScriptWrite {
            sent: sent.clone(),
            unix,
        });

        let result =
            ClientHandshake::new(read, write, mechanisms, None, request_unix_fd).perform();
        let sent = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
        (result, sent)
    }

    #[test]
    fn external_with_fd_negotiation() {
        let (result, sent) = run(
            &[&format!("OK {GUID}\r\n"), "AGREE_UNIX_FD\r\n"],
            None,
            true,
            true,
        );

        let auth = result.unwrap();
        assert_eq!(auth.guid.as_str(), GUID);
        assert!(auth.cap_unix_fd);

        let uid_hex = hex::encode(sasl_auth_id());
        assert_eq!(
            sent,
            format!("\0AUTH EXTERNAL {uid_hex}\r\nNEGOTIATE_UNIX_FD\r\nBEGIN\r\n")
        );
    }

    #[test]
    fn fd_negotiation_skipped_over_tcp() {
        let (result, sent) = run(&[&format!("OK {GUID}\r\n")], None, true, false);

        let auth = result.unwrap();
        assert!(!auth.cap_unix_fd);
        assert!(!sent.contains("NEGOTIATE_UNIX_FD"));
        assert!(sent.ends_with("BEGIN\r\n"));
    }

    #[test]
    fn fd_negotiation_refused_still_succeeds() {
        let (result, sent) = run(
            &[&format!("OK {GUID}\r\n"), "ERROR not today\r\n"],
            None,
            true,
            true,
        );

        let auth = result.unwrap();
        assert!(!auth.cap_unix_fd);
        assert!(sent.ends_with("BEGIN\r\n"));
    }

    #[test]
    fn rejected_falls_back_to_next_mechanism() {
        let (result, sent) = run(
            &["REJECTED ANONYMOUS\r\n", &format!("OK {GUID}\r\n")],
            None,
            false,
            true,
        );

        let auth = result.unwrap();
        assert_eq!(auth.guid.as_str(), GUID);

        let anon_hex = hex::encode(b"wirebus");
        assert!(sent.contains("AUTH EXTERNAL"));
        assert!(sent.contains(&format!("AUTH ANONYMOUS {anon_hex}")));
    }

    #[test]
    fn error_is_cancelled_then_next_mechanism() {
        let (result, sent) = run(
            &[
                "ERROR no thanks\r\n",
                "REJECTED ANONYMOUS\r\n",
                &format!("OK {GUID}\r\n"),
            ],
            None,
            false,
            true,
        );

        assert!(result.is_ok());
        assert!(sent.contains("CANCEL\r\n"));
        assert!(sent.contains("AUTH ANONYMOUS"));
    }

    #[test]
    fn all_mechanisms_rejected_fails() {
        let (result, _) = run(
            &["REJECTED \r\n", "REJECTED \r\n"],
            None,
            false,
            true,
        );

        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn rejected_keeps_only_offered_mechanisms() {
        // Server only offers DBUS_COOKIE_SHA1, which we did not request:
        // the handshake runs out of mechanisms immediately.
        let (result, sent) = run(
            &["REJECTED DBUS_COOKIE_SHA1\r\n"],
            Some(vec![AuthMechanism::External, AuthMechanism::Anonymous]),
            false,
            true,
        );

        assert!(matches!(result, Err(Error::Handshake(_))));
        assert!(!sent.contains("ANONYMOUS"));
    }

    #[test]
    fn malformed_command_fails() {
        let (result, _) = run(&["GRANTED\r\n"], None, false, true);
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn bare_newline_fails() {
        let (result, _) = run(&[&format!("OK {GUID}\n")], None, false, true);
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn oversized_line_fails() {
        let long = format!("OK {}\r\n", "a".repeat(17 * 1024));
        let (result, _) = run(&[&long], None, false, true);
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn eof_fails() {
        let (result, _) = run(&[], None, false, true);
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn invalid_guid_fails() {
        let (result, _) = run(&["OK nothex\r\n"], None, false, true);
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn guid_mismatch_fails() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let read = Box::new(ScriptRead::new(&[&format!("OK {GUID}\r\n")], true));
        let write = Box::new(ScriptWrite {
            sent: sent.clone(),
            unix: true,
        });

        let expected: Guid = "ffffffffffffffffffffffffffffffff".parse().unwrap();
        let result =
            ClientHandshake::new(read, write, None, Some(expected), false).perform();
        assert!(matches!(result, Err(Error::Handshake(_))));
    }
}
