// This file is part of Argus NVR, a security camera network video recorder.
// Copyright (C) 2024 The Argus NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Kind-coded errors used throughout Argus NVR.
//!
//! Every fallible operation returns an [`Error`] which carries an
//! [`ErrorKind`] (a coarse classification callers can dispatch on), an
//! optional human-readable message, and an optional source error. The
//! [`err!`] and [`bail!`] macros are the usual constructors:
//!
//! ```
//! use argus_base::{bail, err, Error, ErrorKind};
//! fn check(user: &str) -> Result<(), Error> {
//!     if user != "admin" {
//!         bail!(Unauthenticated, msg("unknown user: {user}"));
//!     }
//!     Ok(())
//! }
//! assert_eq!(check("eve").unwrap_err().kind(), ErrorKind::Unauthenticated);
//! ```

use std::error::Error as StdError;
use std::fmt;

type BoxedError = Box<dyn StdError + Send + Sync + 'static>;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link
/// for descriptions of each code.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        };
        f.write_str(s)
    }
}

struct ErrorInner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<BoxedError>,
}

/// An error with a kind, an optional message, and an optional source.
///
/// Boxed so that `Result<T, Error>` stays one word wide on the happy path.
pub struct Error(Box<ErrorInner>);

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Error(Box::new(ErrorInner {
            kind,
            msg: None,
            source: None,
        }))
    }

    /// Wraps an arbitrary error, classifying it as `kind`.
    pub fn wrap<E: Into<BoxedError>>(kind: ErrorKind, source: E) -> Self {
        Error::new(kind).source(source)
    }

    #[must_use]
    pub fn msg(mut self, msg: impl Into<String>) -> Self {
        self.0.msg = Some(msg.into());
        self
    }

    #[must_use]
    pub fn source<E: Into<BoxedError>>(mut self, source: E) -> Self {
        self.0.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    /// Returns an object whose `Display` walks the full cause chain,
    /// useful for one-line log statements.
    pub fn chain(&self) -> ErrorChain<'_> {
        ErrorChain(self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.msg {
            Some(msg) => write!(f, "{}: {}", self.0.kind, msg),
            None => match &self.0.source {
                Some(s) => write!(f, "{}: {}", self.0.kind, s),
                None => fmt::Display::fmt(&self.0.kind, f),
            },
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.chain(), f)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        // When there's a msg, the source hasn't been shown by Display yet.
        match (&self.0.msg, &self.0.source) {
            (Some(_), Some(s)) => Some(s.as_ref()),
            _ => None,
        }
    }
}

pub struct ErrorChain<'a>(&'a Error);

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.0, f)?;
        let mut next = StdError::source(self.0);
        while let Some(cur) = next {
            write!(f, ": {cur}")?;
            next = cur.source();
        }
        Ok(())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        let kind = match &e {
            rusqlite::Error::SqliteFailure(f, _) => match f.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    ErrorKind::Unavailable
                }
                rusqlite::ErrorCode::ConstraintViolation => ErrorKind::AlreadyExists,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase => {
                    ErrorKind::DataLoss
                }
                _ => ErrorKind::Internal,
            },
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        };
        Error::wrap(kind, e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                ErrorKind::DeadlineExceeded
            }
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::Unavailable,
        };
        Error::wrap(kind, e)
    }
}

impl From<crate::shutdown::ShutdownError> for Error {
    fn from(e: crate::shutdown::ShutdownError) -> Self {
        Error::wrap(ErrorKind::Cancelled, e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind.
    ///
    /// ```
    /// use argus_base::{ErrorKind, ResultExt as _};
    /// use std::io::Read;
    /// let mut buf = [0u8; 1];
    /// let r = std::io::Cursor::new("").read_exact(&mut buf[..]).err_kind(ErrorKind::Internal);
    /// assert_eq!(r.unwrap_err().kind(), ErrorKind::Internal);
    /// ```
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<BoxedError>,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, e))
    }
}

/// Constructs an [`Error`] from a kind and optional `msg(...)` / `source(...)`
/// arguments, in either order.
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind)
    };
    ($kind:ident, msg($($msg:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$kind).msg(format!($($msg)*))
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).source($src)
    };
    ($kind:ident, msg($($msg:tt)*), source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind).msg(format!($($msg)*)).source($src)
    };
    ($kind:ident, source($src:expr), msg($($msg:tt)*)) => {
        $crate::Error::new($crate::ErrorKind::$kind).msg(format!($($msg)*)).source($src)
    };
}

/// Like [`err!`], but returns from the enclosing function.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_msg() {
        let e = err!(NotFound, msg("no such camera: {}", "Door"));
        assert_eq!(e.to_string(), "Not found: no such camera: Door");
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn chain_walks_sources() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let e = err!(Unavailable, msg("flush failed"), source(io));
        let chain = e.chain().to_string();
        assert!(chain.contains("flush failed"), "{chain}");
        assert!(chain.contains("disk on fire"), "{chain}");
    }

    #[test]
    fn bail_returns_early() {
        fn f() -> Result<(), Error> {
            bail!(Aborted);
        }
        assert_eq!(f().unwrap_err().kind(), ErrorKind::Aborted);
    }
}
