#![forbid(unsafe_code)]
//! Error types for toyfs.
//!
//! Defines `TfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for the kernel-shim reply path.
//!
//! Internal invariant violations (duplicate inode-table inserts, refcount
//! underflow, bad inode-info magic) are programming errors and panic; they
//! never surface as a `TfsError`.

use thiserror::Error;

/// Unified error type for all toyfs operations.
#[derive(Debug, Error)]
pub enum TfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid on-media format: {0}")]
    Format(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("out of memory")]
    NoMemory,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument")]
    Invalid,

    #[error("file too large")]
    FileTooBig,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("name too long")]
    NameTooLong,

    #[error("operation not supported")]
    NotSupported,

    #[error("no data beyond offset")]
    NoData,

    #[error("file exists")]
    Exists,
}

impl TfsError {
    /// Convert this error into a POSIX errno suitable for shim replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Format(_) | Self::Invalid => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory => libc::ENOMEM,
            Self::NotFound(_) => libc::ENOENT,
            Self::FileTooBig => libc::EFBIG,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotSupported => libc::EOPNOTSUPP,
            Self::NoData => libc::ENXIO,
            Self::Exists => libc::EEXIST,
        }
    }
}

/// Result alias using `TfsError`.
pub type Result<T> = std::result::Result<T, TfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(TfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(TfsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(TfsError::NotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(TfsError::FileTooBig.to_errno(), libc::EFBIG);
        assert_eq!(TfsError::NoData.to_errno(), libc::ENXIO);
        assert_eq!(TfsError::NotSupported.to_errno(), libc::EOPNOTSUPP);
    }
}
