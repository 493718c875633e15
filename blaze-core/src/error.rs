//! Error taxonomy for the write pipeline.
//!
//! Every [`Error`] maps onto a copyable [`ErrorKind`], which is what a
//! front-end receives in a failed [`crate::operation::Outcome`]. The kinds
//! split into three groups:
//!
//! - nothing touched: [`ErrorKind::Validation`], [`ErrorKind::Planning`],
//!   [`ErrorKind::DeviceBusy`], [`ErrorKind::NotFound`];
//! - device touched, state indeterminate: [`ErrorKind::Format`],
//!   [`ErrorKind::WriteFault`], [`ErrorKind::Verification`];
//! - device fully written but different from the source:
//!   [`ErrorKind::VerificationMismatch`].
//!
//! The core never retries. Whether to re-issue a write, a verify, or nothing at
//! all is always the caller's decision.
use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Coarse classification of an [`Error`], suitable for matching in a UI.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    FormatUnrecognized,
    Validation,
    /// The requested layout does not fit the device.
    Planning,
    Format,
    WriteFault,
    Verification,
    VerificationMismatch,
    Cancelled,
    DeviceBusy,
    BootInstall,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::FormatUnrecognized => "FormatUnrecognized",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Planning => "PlanningError",
            ErrorKind::Format => "FormatError",
            ErrorKind::WriteFault => "WriteFault",
            ErrorKind::Verification => "VerificationError",
            ErrorKind::VerificationMismatch => "VerificationMismatch",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::DeviceBusy => "DeviceBusy",
            ErrorKind::BootInstall => "BootInstallError",
            ErrorKind::Io => "IoError",
        };
        f.write_str(name)
    }
}

/// Errors for this crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot read {}: {source}", .path.display())]
    NotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No known image signature found in {}", .0.display())]
    FormatUnrecognized(PathBuf),
    #[error("Invalid request: {0}")]
    Validation(String),
    #[error("Insufficient space: {required} bytes required, device has {available} bytes")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("MBR cannot address a partition ending at byte {end}; the limit is {limit} bytes")]
    MbrLimit { end: u64, limit: u64 },
    #[error("Failed to format: {0}")]
    Format(String),
    #[error("Device refused bytes at offset {offset}: {source}")]
    WriteFault {
        offset: u64,
        #[source]
        source: io::Error,
    },
    #[error("Verification could not read back the device: {0}")]
    Verification(#[source] io::Error),
    #[error("Verification failed: device content differs from the source image")]
    VerificationMismatch,
    /// Aborted before completing
    #[error("Operation cancelled by user")]
    Cancelled,
    #[error("Device {} already has an operation in flight", .0.display())]
    DeviceBusy(PathBuf),
    #[error("Failed to install boot code: {0}")]
    BootInstall(String),
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::FormatUnrecognized(_) => ErrorKind::FormatUnrecognized,
            Error::Validation(_) => ErrorKind::Validation,
            Error::InsufficientSpace { .. } | Error::MbrLimit { .. } => ErrorKind::Planning,
            Error::Format(_) => ErrorKind::Format,
            Error::WriteFault { .. } => ErrorKind::WriteFault,
            Error::Verification(_) => ErrorKind::Verification,
            Error::VerificationMismatch => ErrorKind::VerificationMismatch,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::DeviceBusy(_) => ErrorKind::DeviceBusy,
            Error::BootInstall(_) => ErrorKind::BootInstall,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn format(err: impl fmt::Display) -> Self {
        Error::Format(err.to_string())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }
}
