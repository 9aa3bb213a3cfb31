use std::io;

/// The error type for all fallible operations in this crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An address is syntactically unsound or unusable for connecting.
    #[error("invalid address: {0}")]
    Address(String),

    /// The transport name in an address is not supported.
    #[error("unsupported transport `{0}`")]
    UnknownTransport(String),

    /// The OS-level connection attempt failed.
    #[error("connection failed: {0}")]
    Connect(#[source] io::Error),

    /// The autolaunch subprocess failed to produce a usable address.
    #[error("launcher failed: {0}")]
    Launcher(String),

    /// The authentication handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Received wire data violates the D-Bus marshaling rules.
    #[error("decode error at offset {offset}: {reason}")]
    Decode { reason: String, offset: usize },

    /// A value cannot be marshaled: signature mismatch, size limit
    /// exceeded, or an invalid name.
    #[error("encode error: {0}")]
    Encode(String),

    /// A bus, interface, member, error or path name failed validation.
    #[error("invalid {kind} `{name}`: {reason}")]
    InvalidName {
        kind: &'static str,
        name: String,
        reason: String,
    },

    /// A raw read or write on the underlying stream failed.
    #[error("I/O error: {0}")]
    InputOutput(#[from] io::Error),

    /// The operation was aborted because the transport was shut down.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn decode(reason: impl Into<String>, offset: usize) -> Self {
        Error::Decode {
            reason: reason.into(),
            offset,
        }
    }
}

/// Alias for a `Result` with the error type [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
