// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2016 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Error type used throughout the crate.
//!
//! Kinds mirror gRPC status codes, which is a convenient taxonomy for a
//! system with many independent subsystems: it distinguishes "caller's
//! fault" from "transient" from "this should never happen" without forcing
//! every module to invent its own enum. SPEC_FULL.md's abstract error
//! kinds (TransientIO, UpstreamGone, InvalidInput, Capacity, PersistError,
//! ConfigurationError, Fatal) map onto these as documented in DESIGN.md.

use std::fmt;

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
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,

    /// A worker pool / ring buffer / tracker table is full. Distinct from
    /// `ResourceExhausted` (which in gRPC usually means quota) to match
    /// spec.md §7's "Capacity" kind exactly: callers drop the newest work
    /// item rather than retrying.
    Capacity,
}

impl ErrorKind {
    fn as_str(self) -> &'static str {
        use ErrorKind::*;
        match self {
            Cancelled => "cancelled",
            Unknown => "unknown",
            InvalidArgument => "invalid argument",
            DeadlineExceeded => "deadline exceeded",
            NotFound => "not found",
            AlreadyExists => "already exists",
            PermissionDenied => "permission denied",
            ResourceExhausted => "resource exhausted",
            FailedPrecondition => "failed precondition",
            Aborted => "aborted",
            OutOfRange => "out of range",
            Unimplemented => "unimplemented",
            Internal => "internal error",
            Unavailable => "unavailable",
            DataLoss => "data loss",
            Capacity => "capacity exceeded",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The crate's error type: a kind, a human-readable message, and an
/// optional boxed source for `?`-composition through std errors.
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(
        kind: ErrorKind,
        msg: Option<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        Error { kind, msg, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Renders the full cause chain, one `: `-joined line, for logging.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut cur: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(self);
        while let Some(e) = cur {
            out.push_str(": ");
            out.push_str(&e.to_string());
            cur = e.source();
        }
        out
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.msg {
            Some(m) => write!(f, "{}", m),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind, None, None)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::new(ErrorKind::Internal, Some("sqlite error".to_owned()), Some(Box::new(e)))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::Unknown,
        };
        Error::new(kind, None, Some(Box::new(e)))
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::new(ErrorKind::Unknown, Some("os error".to_owned()), Some(Box::new(e)))
    }
}

/// Helper extension trait: tag any `Result`'s error with an [`ErrorKind`].
pub trait ResultExt<T> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ResultExt<T> for Result<T, E> {
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new(k, None, Some(Box::new(e))))
    }
}

/// Builds an [`Error`]. Usage mirrors the call sites throughout this crate:
/// `err!(NotFound, msg("recording {id} missing"))`,
/// `err!(Internal, msg("..."), source(e))`.
#[macro_export]
macro_rules! err {
    ($kind:ident) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, None)
    };
    ($kind:ident, msg($($msg:tt)+)) => {
        $crate::Error::new($crate::ErrorKind::$kind, Some(format!($($msg)+)), None)
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new($crate::ErrorKind::$kind, None, Some(Box::new($src)))
    };
    ($kind:ident, msg($($msg:tt)+), source($src:expr)) => {
        $crate::Error::new(
            $crate::ErrorKind::$kind,
            Some(format!($($msg)+)),
            Some(Box::new($src)),
        )
    };
}

/// Like [`err!`] but returns early with the constructed error.
#[macro_export]
macro_rules! bail {
    ($($args:tt)+) => {
        return Err($crate::err!($($args)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_msg_when_present() {
        let e = err!(NotFound, msg("recording {} missing", 42));
        assert_eq!(e.to_string(), "recording 42 missing");
        assert_eq!(e.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn chain_includes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = err!(Internal, msg("flush failed"), source(io));
        assert_eq!(e.chain(), "flush failed: disk full");
    }
}
