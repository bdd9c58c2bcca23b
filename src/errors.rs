//! Crate-wide error types.
//!
//! Everything that can fail in the boot pipeline reports a [`BootError`].
//! Firmware status codes are passed through unchanged in the
//! [`BootError::Firmware`] variant so the original cause stays visible in
//! the logs.

use thiserror::Error;
use uefi::Status;

/// Result alias used throughout the crate.
pub type BootResult<T> = Result<T, BootError>;

/// `CanFail` is a return type for operations that are allowed to fail and
/// don't need to return anything.
pub type CanFail = BootResult<()>;

/// The error kinds surfaced by the boot pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum BootError {
    /// The requested file, path component or resource does not exist.
    #[error("not found")]
    NotFound,

    /// The operation or on-disk layout is recognized but not handled
    /// (e.g. a filesystem we only probe, an ext4 feature we refuse).
    #[error("unsupported")]
    Unsupported,

    /// An allocation or a bounded table ran out of room.
    #[error("out of resources")]
    OutOfResources,

    /// A caller-supplied value failed validation (bad magic, short image,
    /// oversized path).
    #[error("invalid parameter")]
    InvalidParameter,

    /// On-disk structures failed validation past the initial magic check.
    #[error("volume corrupted")]
    VolumeCorrupted,

    /// The firmware refused to load or start an image.
    #[error("load error")]
    LoadError,

    /// The operation was abandoned before completion.
    #[error("aborted")]
    Aborted,

    /// A firmware call failed; the original status code is preserved.
    #[error("firmware error: {0}")]
    Firmware(Status),
}

impl From<uefi::Error> for BootError {
    fn from(err: uefi::Error) -> Self {
        match err.status() {
            Status::NOT_FOUND => Self::NotFound,
            Status::OUT_OF_RESOURCES => Self::OutOfResources,
            Status::UNSUPPORTED => Self::Unsupported,
            status => Self::Firmware(status),
        }
    }
}

impl From<Status> for BootError {
    fn from(status: Status) -> Self {
        match status {
            Status::NOT_FOUND => Self::NotFound,
            Status::OUT_OF_RESOURCES => Self::OutOfResources,
            Status::UNSUPPORTED => Self::Unsupported,
            status => Self::Firmware(status),
        }
    }
}
