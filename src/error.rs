//! Error types shared by the adapters, the bridge and the bindings

use std::fmt;

use thiserror::Error;

/// Ways a handler can break the ordering rules of the full convention
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
    /// Body data was produced before the status callback was invoked
    BodyBeforeHeaders,
    /// The status callback was invoked again without exception info
    HeadersAlreadySet,
    /// The handler finished without ever providing status and headers
    NoStartResponse,
    /// `write()` was called after the handler had returned its body
    WriteAfterReturn,
    /// The handler suspended somewhere other than a `write()` call
    Stalled,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::BodyBeforeHeaders => write!(f, "data yielded without start_response"),
            Violation::HeadersAlreadySet => {
                write!(f, "headers already set and no exception info given")
            }
            Violation::NoStartResponse => write!(f, "application never called start_response"),
            Violation::WriteAfterReturn => write!(
                f,
                "applications must not invoke write() from within their return iterable"
            ),
            Violation::Stalled => write!(f, "application suspended without calling write()"),
        }
    }
}

/// Errors surfaced by this crate
#[derive(Debug, Error)]
pub enum Error {
    /// A handler broke the calling convention
    #[error("protocol violation: {0}")]
    ProtocolViolation(Violation),

    /// A feature was used that the current configuration does not provide
    #[error("not supported: {0}")]
    NotSupported(String),

    /// An adapter or binding was set up incorrectly
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The status line cannot be turned into an HTTP status code
    #[error("invalid status line: {0:?}")]
    InvalidStatus(String),

    /// Building an `http` type failed
    #[error(transparent)]
    Http(#[from] http::Error),

    /// An error raised by a wrapped handler or a close hook, passed through as-is
    #[error(transparent)]
    Application(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap any handler error so it can travel through the adapters
    pub fn application(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Application(err.into())
    }

    /// The violation kind, if this is a protocol violation
    pub fn violation(&self) -> Option<Violation> {
        match self {
            Error::ProtocolViolation(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl From<Violation> for Error {
    fn from(kind: Violation) -> Self {
        Error::ProtocolViolation(kind)
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
