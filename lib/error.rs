//! Error taxonomy for the cache core.
//!
//! Every fallible operation in the crate surfaces a [`CacheError`]. The
//! variants map 1:1 onto POSIX errno values (see the `From<&CacheError> for
//! i32` impl), so a mount binding can forward them to the kernel without
//! inspecting the error further.

use std::io;

use thiserror::Error;

/// A structural problem found while decoding an on-disk inode file.
#[derive(Debug, Error)]
pub enum FormatError {
    /// The file does not start with the expected magic bytes.
    #[error("magic number mismatch")]
    MagicMismatch,

    /// The format version is not one this build understands.
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    /// The mode field carries format bits for an inode kind we do not store.
    #[error("unsupported inode format: {0:#o}")]
    UnsupportedFormat(u32),

    /// A length-prefixed string exceeds its limit.
    #[error("string of {len} bytes exceeds limit of {max}")]
    StringTooLong { len: u32, max: u32 },

    /// A directory claims more children than the format allows.
    #[error("too many directory children: {0}")]
    TooManyChildren(u32),

    /// A stored string is not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidString,

    /// The file ended in the middle of a field.
    #[error("truncated inode file")]
    Truncated,
}

/// Error kinds surfaced by the cache layer.
///
/// `NotFound` is a *negative cache hit*: the cache has evidence that the
/// path does not exist. `Unavailable` is the weaker statement that the cache
/// simply has no information (or that the data behind an available-looking
/// read turned out to be missing).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The path is known to not exist (tombstone hit).
    #[error("entry is known to not exist")]
    NotFound,

    /// The operation expected a directory; the inode is another type.
    #[error("not a directory")]
    NotDirectory,

    /// `fetch_link` was called on something other than a symlink.
    #[error("not a symlink")]
    NotSymlink,

    /// Cache miss without evidence of non-existence, an unreachable source,
    /// or a read that ran into an uncached block.
    #[error("data unavailable")]
    Unavailable,

    /// The on-disk inode file failed a magic, version or length check.
    #[error("bad inode format: {0}")]
    BadFormat(#[from] FormatError),

    /// A random or extending write was refused at an unaligned boundary over
    /// an absent block.
    #[error("write must be block aligned")]
    MustBeAligned,

    /// The operation is outside the scope of this cache.
    #[error("operation not implemented")]
    NotImplemented,

    /// An I/O error from the local disk.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl CacheError {
    /// Whether this error means "the data could not be reached right now",
    /// as opposed to a definitive answer. The overlay treats unavailable
    /// source errors as reason to serve from the cache instead.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            Self::Unavailable => true,
            Self::Io(e) => e.raw_os_error().is_none_or(|code| code == libc::EIO),
            _ => false,
        }
    }

    /// The errno equivalent of this error.
    #[must_use]
    pub fn errno(&self) -> i32 {
        self.into()
    }
}

impl From<&CacheError> for i32 {
    fn from(e: &CacheError) -> Self {
        match e {
            CacheError::NotFound => libc::ENOENT,
            CacheError::NotDirectory => libc::ENOTDIR,
            CacheError::NotSymlink => libc::EINVAL,
            CacheError::Unavailable | CacheError::BadFormat(_) => libc::EIO,
            CacheError::MustBeAligned => libc::EINVAL,
            CacheError::NotImplemented => libc::ENOSYS,
            CacheError::Io(io_err) => io_err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Build a `CacheError` from a raw errno, for source-filesystem adapters
/// that receive errors as numbers.
#[must_use]
pub fn from_errno(errno: i32) -> CacheError {
    match errno {
        libc::ENOENT => CacheError::NotFound,
        libc::ENOTDIR => CacheError::NotDirectory,
        libc::ENOSYS => CacheError::NotImplemented,
        libc::EIO => CacheError::Unavailable,
        other => CacheError::Io(io::Error::from_raw_os_error(other)),
    }
}
