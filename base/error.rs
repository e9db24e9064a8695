// This file is part of Nightjar, an edge camera video event agent.
// Copyright (C) 2026 The Nightjar Authors.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error type carrying a classification kind, an optional message, and an
//! optional source chain, constructed via the [`crate::err`] and
//! [`crate::bail`] macros.

use std::fmt::{self, Display};

/// Error classification.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/master/include/grpcpp/impl/codegen/status_code_enum.h),
/// a nice general-purpose classification of errors.
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

impl Display for ErrorKind {
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

struct Inner {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// An error with a [`ErrorKind`], an optional human-readable message, and an
/// optional source.
///
/// Boxed so that `Result<T, Error>` stays one word on the happy path.
pub struct Error(Box<Inner>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind
    }

    pub fn msg(&self) -> Option<&str> {
        self.0.msg.as_deref()
    }

    /// Returns a `Display` adapter which writes the full source chain,
    /// e.g. for `tracing::error!(err = %e.chain(), ...)`.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.msg {
            Some(msg) => write!(f, "{}: {msg}", self.0.kind),
            None => Display::fmt(&self.0.kind, f),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.chain(), f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0
            .source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// `Display` adapter over an [`Error`] and all its sources.
pub struct Chain<'a>(&'a Error);

impl Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.0, f)?;
        let mut source = std::error::Error::source(self.0);
        while let Some(s) = source {
            write!(f, ": {s}")?;
            source = s.source();
        }
        Ok(())
    }
}

/// Partially constructed [`Error`], used by the `err!`/`bail!` macro
/// expansions. Not typically named directly.
pub struct ErrorBuilder(Box<Inner>);

impl ErrorBuilder {
    pub fn map_msg(mut self, msg: String) -> Self {
        self.0.msg = Some(msg);
        self
    }

    pub fn map_source<S>(mut self, source: S) -> Self
    where
        S: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.0.source = Some(source.into());
        self
    }

    pub fn build(self) -> Error {
        Error(self.0)
    }
}

impl From<ErrorKind> for ErrorBuilder {
    fn from(kind: ErrorKind) -> Self {
        ErrorBuilder(Box::new(Inner {
            kind,
            msg: None,
            source: None,
        }))
    }
}

/// Wrapping an existing `Error` keeps its kind and pushes it onto the source
/// chain; `map_msg` then annotates the new outer layer.
impl From<Error> for ErrorBuilder {
    fn from(e: Error) -> Self {
        ErrorBuilder(Box::new(Inner {
            kind: e.kind(),
            msg: None,
            source: Some(Box::new(e)),
        }))
    }
}

impl From<std::io::Error> for ErrorBuilder {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind as IoKind;
        let kind = match e.kind() {
            IoKind::NotFound => ErrorKind::NotFound,
            IoKind::PermissionDenied => ErrorKind::PermissionDenied,
            IoKind::AlreadyExists => ErrorKind::AlreadyExists,
            IoKind::InvalidInput | IoKind::InvalidData => ErrorKind::InvalidArgument,
            IoKind::TimedOut => ErrorKind::DeadlineExceeded,
            IoKind::ConnectionRefused
            | IoKind::ConnectionReset
            | IoKind::ConnectionAborted
            | IoKind::NotConnected
            | IoKind::BrokenPipe
            | IoKind::UnexpectedEof => ErrorKind::Unavailable,
            IoKind::WouldBlock => ErrorKind::ResourceExhausted,
            _ => ErrorKind::Unknown,
        };
        ErrorBuilder(Box::new(Inner {
            kind,
            msg: None,
            source: Some(Box::new(e)),
        }))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        ErrorBuilder::from(e).build()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        ErrorBuilder::from(kind).build()
    }
}

/// Constructs an [`Error`].
///
/// The first argument is an `ErrorKind` variant name (all variants are in
/// scope within the macro body) or an existing error convertible to
/// [`ErrorBuilder`]. Optional `msg(...)` (with `format!` arguments) and
/// `source(...)` follow, in that order.
///
/// ```
/// use nightjar_base::{err, ErrorKind};
/// let e = err!(InvalidArgument, msg("width {} is odd", 641));
/// assert_eq!(e.kind(), ErrorKind::InvalidArgument);
/// assert_eq!(e.to_string(), "Invalid argument: width 641 is odd");
/// ```
#[macro_export]
macro_rules! err {
    ($builder:expr $(, msg($($msg:tt)*))? $(, source($source:expr))? $(,)?) => {{
        #[allow(unused_imports)]
        use $crate::ErrorKind::*;
        let builder = $crate::ErrorBuilder::from($builder);
        $(let builder = builder.map_msg(format!($($msg)*));)?
        $(let builder = builder.map_source($source);)?
        builder.build()
    }};
}

/// `return Err(err!(...))`.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::err!($($arg)*).into())
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fails_io() -> Result<(), Error> {
        let e = std::io::Error::new(std::io::ErrorKind::TimedOut, "too slow");
        Err(err!(e, msg("reading frame")))
    }

    #[test]
    fn kinds_and_messages() {
        let e = err!(NotFound, msg("no such session {}", "s1"));
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "Not found: no such session s1");
    }

    #[test]
    fn io_kind_mapping() {
        let e = fails_io().unwrap_err();
        assert_eq!(e.kind(), ErrorKind::DeadlineExceeded);
        let chained = e.chain().to_string();
        assert!(chained.contains("reading frame"), "{chained}");
        assert!(chained.contains("too slow"), "{chained}");
    }

    #[test]
    fn wrap_keeps_kind() {
        let inner = err!(Unavailable, msg("connection reset"));
        let outer = err!(inner, msg("store flush"));
        assert_eq!(outer.kind(), ErrorKind::Unavailable);
        assert_eq!(outer.to_string(), "Unavailable: store flush");
        assert!(outer.chain().to_string().contains("connection reset"));
    }

    #[test]
    fn bail_returns() {
        fn f() -> Result<(), Error> {
            bail!(Internal, msg("boom"));
        }
        assert_eq!(f().unwrap_err().kind(), ErrorKind::Internal);
    }
}
