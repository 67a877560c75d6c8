use std::io;

use nix::errno::Errno;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure categories surfaced by handles, locks and the filesystem mutex.
///
/// The dedicated variants are kept apart from `Os` so that callers can tell
/// "may succeed with more time" (`TimedOut`) from everything terminal.
#[derive(Error, Debug)]
pub enum Error {
    #[error("os error: {0}")]
    Os(#[source] io::Error),

    #[error("deadline elapsed before the operation completed")]
    TimedOut,

    #[error("operation was canceled before completion")]
    Canceled,

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// The POSIX error code equivalent of this error.
    pub fn raw_os_error(&self) -> i32 {
        match self {
            Error::Os(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::TimedOut => libc::ETIMEDOUT,
            Error::Canceled => libc::ECANCELED,
            Error::NotSupported(_) => libc::ENOTSUP,
            Error::NotFound(_) => libc::ENOENT,
            Error::InvalidInput(_) => libc::EINVAL,
        }
    }

    /// True if retrying with a later deadline may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TimedOut)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ETIMEDOUT => Error::TimedOut,
            Errno::ECANCELED => Error::Canceled,
            #[allow(unreachable_patterns)]
            Errno::ENOTSUP | Errno::EOPNOTSUPP => Error::NotSupported("rejected by the operating system"),
            other => Error::Os(io::Error::from_raw_os_error(other as i32)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(code) => Errno::from_raw(code).into(),
            None => Error::Os(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Os(e) => e,
            Error::TimedOut => io::Error::from(io::ErrorKind::TimedOut),
            Error::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            Error::InvalidInput(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            other => io::Error::from_raw_os_error(other.raw_os_error()),
        }
    }
}
