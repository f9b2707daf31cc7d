//! Error type shared by every part of rangeplay.
//!
//! An [`Error`] pairs a coarse [`ErrorKind`] with the error that caused it.
//! The kinds follow the gRPC status codes, so that callers can decide on
//! retries and messages without knowing where an error came from:
//!
//! * No provider accepts a URL, or the resource is gone: `NotFound`
//! * Livestreams and servers without range support: `Unimplemented`
//! * Failed or rejected range requests: `Unavailable`
//! * Redirect loops: `Aborted`, carrying a [`RedirectLoop`]
//! * Retry budget of a fetch session spent: `ResourceExhausted`
//! * Seeking with nothing playing: `FailedPrecondition`
//!
//! # Example
//!
//! ```rust
//! use rangeplay::error::{Error, ErrorKind, Result};
//!
//! fn seek_target(playing: bool) -> Result<()> {
//!     if !playing {
//!         return Err(Error::failed_precondition("no stream to seek"));
//!     }
//!
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;
use url::Url;

/// Cause of an [`Error`], boxed so that any error type fits.
type Source = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,

    /// What went wrong, in detail.
    pub error: Source,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an [`Error`], after the gRPC status codes.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    #[error("operation was cancelled")]
    Cancelled = 1,

    #[error("unknown error")]
    Unknown = 2,

    /// Bad input such as a malformed URL, header or configuration value.
    #[error("invalid argument specified")]
    InvalidArgument = 3,

    #[error("operation timed out")]
    DeadlineExceeded = 4,

    #[error("not found")]
    NotFound = 5,

    #[error("attempt to create what already exists")]
    AlreadyExists = 6,

    #[error("permission denied")]
    PermissionDenied = 7,

    /// A fetch session ran out of retries.
    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    /// The player is not in a state to carry out the request.
    #[error("invalid state")]
    FailedPrecondition = 9,

    /// Gave up on a request, for instance on a redirect loop.
    #[error("operation aborted")]
    Aborted = 10,

    #[error("out of range")]
    OutOfRange = 11,

    /// The resource cannot be streamed by range requests.
    #[error("not implemented")]
    Unimplemented = 12,

    #[error("internal error")]
    Internal = 13,

    /// A server failed or refused a request. Usually transient.
    #[error("service unavailable")]
    Unavailable = 14,

    /// A response body broke off or could not be decoded.
    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

/// A redirect chain that revisits a location it already followed.
///
/// Carried inside an [`ErrorKind::Aborted`] error; retrieve it with
/// [`Error::downcast`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("redirection loop detected at {url}")]
pub struct RedirectLoop {
    /// The location that was visited twice.
    pub url: Url,
}

/// Defines one constructor per error kind.
macro_rules! constructors {
    ($($(#[$doc:meta])* $name:ident => $kind:ident,)*) => {
        impl Error {
            $(
                $(#[$doc])*
                pub fn $name<E>(error: E) -> Self
                where
                    E: Into<Source>,
                {
                    Self::new(ErrorKind::$kind, error)
                }
            )*
        }
    };
}

constructors! {
    /// Gave up on a request. Redirect loops are reported this way.
    aborted => Aborted,
    already_exists => AlreadyExists,
    cancelled => Cancelled,
    data_loss => DataLoss,
    deadline_exceeded => DeadlineExceeded,
    /// The request does not fit the current state, like seeking while
    /// nothing plays.
    failed_precondition => FailedPrecondition,
    /// Something that should not happen during normal operation.
    internal => Internal,
    invalid_argument => InvalidArgument,
    not_found => NotFound,
    out_of_range => OutOfRange,
    permission_denied => PermissionDenied,
    /// Fetch sessions report this when they run out of retries.
    resource_exhausted => ResourceExhausted,
    /// A range request failed at the transport level or was answered with
    /// an error status.
    unavailable => Unavailable,
    unimplemented => Unimplemented,
    unknown => Unknown,
}

impl Error {
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Source>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// The underlying error as `E`, if that is its type.
    ///
    /// Tells a [`RedirectLoop`] apart from other aborts, for instance.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Connection trouble maps to `Unavailable`, which fetch sessions retry.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::deadline_exceeded(err)
        } else if err.is_body() {
            Self::data_loss(err)
        } else if err.is_decode() {
            Self::invalid_argument(err)
        } else if err.is_builder() {
            Self::internal(err)
        } else if err.is_connect() || err.is_request() || err.is_status() {
            Self::unavailable(err)
        } else if err.is_redirect() {
            Self::aborted(err)
        } else {
            Self::unknown(err)
        }
    }
}

/// Mapped like I/O errors: truncated input is `DataLoss`, anything else
/// unexpected `InvalidArgument`.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::internal(e)
    }
}

impl From<http::header::ToStrError> for Error {
    fn from(e: http::header::ToStrError) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Self {
        Self::invalid_argument(e)
    }
}

/// A poisoned lock means another thread panicked while holding it.
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e)
    }
}

impl From<uuid::Error> for Error {
    fn from(e: uuid::Error) -> Self {
        Self::invalid_argument(e)
    }
}
