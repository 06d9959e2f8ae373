//! Error types.

use core::fmt;

use crate::status::{Status, StatusCode};

/// Transport-level errors, distinct from any call-level status.
///
/// `Unavailable` covers connect and security-handshake failures and is the
/// only variant a caller should treat as retryable by policy.
#[derive(Debug)]
pub enum TransportError {
    /// The remote cannot be reached or the security handshake failed.
    Unavailable(String),
    /// The connection is closed.
    Closed,
    Io(std::io::Error),
    Codec(postcard::Error),
    FrameTooLarge { len: usize, max: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "transport unavailable: {msg}"),
            Self::Closed => write!(f, "transport closed"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<postcard::Error> for TransportError {
    fn from(e: postcard::Error) -> Self {
        Self::Codec(e)
    }
}

/// High-level RPC errors observed by callers.
///
/// Every terminal outcome is inspectable for its code before any payload is
/// trusted: `Status` carries the call-level taxonomy, `Transport` everything
/// below it.
#[derive(Debug)]
pub enum RpcError {
    Transport(TransportError),
    Status(Status),
}

impl RpcError {
    /// The call-level status code, if this is a call-level failure.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Self::Status(status) => Some(status.code),
            Self::Transport(_) => None,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Status(status) => write!(f, "{status}"),
        }
    }
}

impl std::error::Error for RpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Status(_) => None,
        }
    }
}

impl From<TransportError> for RpcError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<Status> for RpcError {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

/// Downgrade an RPC error to a handler-facing status.
///
/// Transport loss under a running handler means the caller went away; the
/// terminal status is undeliverable either way.
impl From<RpcError> for Status {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Status(status) => status,
            RpcError::Transport(e) => Status::cancelled(format!("connection lost: {e}")),
        }
    }
}

/// Startup-time configuration errors, fatal before any call is served.
#[derive(Debug)]
pub enum ConfigError {
    /// A handler is already registered under this method name.
    DuplicateMethod(String),
    /// Security material was present but rejected by the TLS stack.
    Tls(tokio_rustls::rustls::Error),
    /// Security material was missing or malformed.
    InvalidPem(String),
    InvalidServerName(String),
    Io(std::io::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateMethod(method) => {
                write!(f, "method {method:?} is already registered")
            }
            Self::Tls(e) => write!(f, "TLS configuration error: {e}"),
            Self::InvalidPem(msg) => write!(f, "invalid PEM material: {msg}"),
            Self::InvalidServerName(name) => write!(f, "invalid server name: {name:?}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Tls(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio_rustls::rustls::Error> for ConfigError {
    fn from(e: tokio_rustls::rustls::Error) -> Self {
        Self::Tls(e)
    }
}
