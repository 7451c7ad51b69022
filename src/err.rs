//! This is the module that contains the error types used across the
//! simulator.
//!
//! There are six main types:
//! * [`DeError`] - error while decoding wire input (netlink or control
//!   socket).
//! * [`SerError`] - error while encoding a message.
//! * [`SockError`] - transport-level failures on the netlink or unix
//!   sockets.
//! * [`ConfigError`] - configuration file loading and validation.
//! * [`ApiError`] - control-socket protocol violations.
//! * [`RpcError`] - a status plus message, mirroring what the RPC
//!   transport reports to its callers.
//!
//! # Design decisions
//! All errors implement [`std::error::Error`] so that they compose with
//! [`Result`] and `?` across module boundaries. Everything below fatal
//! initialization is recovered locally at the scheduler callback that
//! observed it; nothing crosses the RPC thread boundary as a panic.

use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

/// Error while decoding bytes received from a socket.
#[derive(Debug)]
pub enum DeError {
    /// The buffer ended before the fixed-size field being read.
    UnexpectedEob(&'static str),
    /// An attribute or header carried a length that does not fit the
    /// enclosing buffer.
    InvalidLength(&'static str),
    /// A required attribute was absent from the message.
    MissingAttribute(&'static str),
    /// A value was present but outside its valid domain.
    InvalidValue(String),
}

impl Display for DeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DeError::UnexpectedEob(what) => {
                write!(f, "unexpected end of buffer while reading {what}")
            }
            DeError::InvalidLength(what) => write!(f, "invalid length for {what}"),
            DeError::MissingAttribute(attr) => write!(f, "missing required attribute {attr}"),
            DeError::InvalidValue(msg) => write!(f, "invalid value: {msg}"),
        }
    }
}

impl Error for DeError {}

/// Error while encoding a message for a socket.
#[derive(Debug)]
pub enum SerError {
    /// A field exceeded the representable size of its wire encoding.
    FieldTooLarge(&'static str),
    /// Wrapped I/O error from the underlying writer.
    Io(io::Error),
}

impl Display for SerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SerError::FieldTooLarge(what) => write!(f, "{what} too large for wire encoding"),
            SerError::Io(e) => write!(f, "I/O error while encoding: {e}"),
        }
    }
}

impl Error for SerError {}

impl From<io::Error> for SerError {
    fn from(e: io::Error) -> Self {
        SerError::Io(e)
    }
}

/// Transport-level socket failure.
#[derive(Debug)]
pub enum SockError {
    /// Wrapped I/O error from a socket syscall.
    Io(io::Error),
    /// The requested generic netlink family is not present.
    FamilyNotFound(String),
    /// The kernel answered with a netlink-level error packet.
    Nlmsgerr(i32),
    /// The peer closed the connection.
    Eof,
}

impl Display for SockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SockError::Io(e) => write!(f, "socket I/O error: {e}"),
            SockError::FamilyNotFound(name) => {
                write!(f, "generic netlink family {name} not found (is the module loaded?)")
            }
            SockError::Nlmsgerr(code) => {
                write!(f, "netlink error: {}", io::Error::from_raw_os_error(-code))
            }
            SockError::Eof => write!(f, "connection closed by peer"),
        }
    }
}

impl Error for SockError {}

impl From<io::Error> for SockError {
    fn from(e: io::Error) -> Self {
        SockError::Io(e)
    }
}

impl From<DeError> for SockError {
    fn from(e: DeError) -> Self {
        SockError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

/// Configuration loading and validation failure.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(String, io::Error),
    /// The file could not be parsed as TOML.
    Parse(String),
    /// Two station entries share one MAC address.
    DuplicateStation(String),
    /// A link override references a MAC with no station entry.
    UnknownLinkPeer(String),
    /// The PER file is malformed.
    PerTable(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read {path}: {e}"),
            ConfigError::Parse(msg) => write!(f, "configuration parse error: {msg}"),
            ConfigError::DuplicateStation(mac) => {
                write!(f, "station {mac} is declared more than once")
            }
            ConfigError::UnknownLinkPeer(mac) => {
                write!(f, "link override references unknown station {mac}")
            }
            ConfigError::PerTable(msg) => write!(f, "PER file error: {msg}"),
        }
    }
}

impl Error for ConfigError {}

/// Control-socket protocol violation.
#[derive(Debug)]
pub enum ApiError {
    /// Wrapped I/O error on the stream.
    Io(io::Error),
    /// The message body length exceeds the protocol maximum.
    Oversize(u32),
    /// The message type is not one this server understands.
    UnknownType(u32),
    /// The body could not be decoded for its stated type.
    De(DeError),
}

impl Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ApiError::Io(e) => write!(f, "control socket I/O error: {e}"),
            ApiError::Oversize(len) => write!(f, "control message body of {len} bytes rejected"),
            ApiError::UnknownType(ty) => write!(f, "unknown control message type {ty}"),
            ApiError::De(e) => write!(f, "control message decode error: {e}"),
        }
    }
}

impl Error for ApiError {}

impl From<io::Error> for ApiError {
    fn from(e: io::Error) -> Self {
        ApiError::Io(e)
    }
}

impl From<DeError> for ApiError {
    fn from(e: DeError) -> Self {
        ApiError::De(e)
    }
}

/// Status taxonomy reported over the RPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    /// Request-side validation failed before reaching the loop.
    InvalidArgument,
    /// The loop rejected the request (unknown station, failed reload).
    FailedPrecondition,
    /// The bridge to the loop is down.
    Unavailable,
}

impl Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RpcStatus::InvalidArgument => write!(f, "INVALID_ARGUMENT"),
            RpcStatus::FailedPrecondition => write!(f, "FAILED_PRECONDITION"),
            RpcStatus::Unavailable => write!(f, "UNAVAILABLE"),
        }
    }
}

/// An RPC failure: a coarse status plus human-readable detail.
#[derive(Debug, Clone)]
pub struct RpcError {
    status: RpcStatus,
    message: String,
}

impl RpcError {
    /// Create an error with the given status and detail message.
    pub fn new<S: Into<String>>(status: RpcStatus, message: S) -> Self {
        RpcError {
            status,
            message: message.into(),
        }
    }

    /// Shorthand for a validation failure.
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        RpcError::new(RpcStatus::InvalidArgument, message)
    }

    /// Shorthand for a loop-side rejection.
    pub fn precondition<S: Into<String>>(message: S) -> Self {
        RpcError::new(RpcStatus::FailedPrecondition, message)
    }

    /// The coarse status for transport mapping.
    pub fn status(&self) -> RpcStatus {
        self.status
    }

    /// The human-readable detail.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl Error for RpcError {}
