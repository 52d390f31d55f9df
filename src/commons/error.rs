//! Defines all easyrsa error kinds.
//!
//! There is one crate-wide [`Error`] enum. Components attach their own
//! context strings when wrapping a lower-level failure, but the kind of
//! the failure is preserved so that callers can match on it.

use std::{fmt, io};

use openssl::error::ErrorStack;

//------------ FileIoError ---------------------------------------------------

/// An I/O error with the context in which it occurred.
///
/// The underlying [`io::Error`] is kept so that callers can still inspect
/// the OS error kind if they need to.
#[derive(Debug)]
pub struct FileIoError {
    context: String,
    cause: io::Error,
}

impl FileIoError {
    pub fn new(context: impl Into<String>, cause: io::Error) -> Self {
        FileIoError {
            context: context.into(),
            cause,
        }
    }

    pub fn cause(&self) -> &io::Error {
        &self.cause
    }
}

impl fmt::Display for FileIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.cause)
    }
}

impl std::error::Error for FileIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    /// No artifact exists for the supplied common name or serial.
    NotFound(String),

    /// Malformed PEM, DER or extension data.
    Parse(String),

    /// An underlying filesystem operation failed.
    Io(FileIoError),

    /// An advisory lock could not be acquired within the deadline.
    LockTimeout(String),

    /// The caller supplied an unusable argument.
    InvalidArgument(String),

    /// Key generation, signing or CRL creation failed.
    Crypto(String),
}

/// # Constructor helpers
///
impl Error {
    pub fn not_found(what: impl fmt::Display) -> Self {
        Error::NotFound(what.to_string())
    }

    pub fn parse(msg: impl fmt::Display) -> Self {
        Error::Parse(msg.to_string())
    }

    pub fn io(context: impl Into<String>, cause: io::Error) -> Self {
        Error::Io(FileIoError::new(context, cause))
    }

    pub fn lock_timeout(path: impl fmt::Display) -> Self {
        Error::LockTimeout(path.to_string())
    }

    pub fn invalid(msg: impl fmt::Display) -> Self {
        Error::InvalidArgument(msg.to_string())
    }

    pub fn crypto(msg: impl fmt::Display) -> Self {
        Error::Crypto(msg.to_string())
    }

    /// Returns whether this is a [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound(what) => write!(f, "{} not found", what),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Io(err) => err.fmt(f),
            Error::LockTimeout(path) => {
                write!(f, "could not acquire lock on '{}' in time", path)
            }
            Error::InvalidArgument(msg) => {
                write!(f, "invalid argument: {}", msg)
            }
            Error::Crypto(msg) => write!(f, "crypto error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

//--- From

impl From<FileIoError> for Error {
    fn from(err: FileIoError) -> Self {
        Error::Io(err)
    }
}

impl From<ErrorStack> for Error {
    fn from(err: ErrorStack) -> Self {
        Error::Crypto(err.to_string())
    }
}

//------------ Tests ---------------------------------------------------------
