//! Filesystem contracts shared by the overlay, the cache and source drivers.
//!
//! Everything here is path-addressed: operations take slash-separated paths
//! rather than inode numbers, and the same [`PathFs`] contract is implemented
//! both by source filesystems (a local subtree walker, an SFTP client) and by
//! the caching [`overlay::Overlay`] itself. A mount binding therefore
//! consumes the overlay through exactly the trait it would use for a raw
//! source.

/// Read path connecting a source filesystem to the cache.
pub mod overlay;

use bitflags::bitflags;
use bytes::Bytes;

use crate::error::CacheError;

bitflags! {
    /// Flags for opening a file, a subset of Unix open(2) flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        /// Open for reading only.
        const RDONLY = libc::O_RDONLY;
        /// Open for writing only.
        const WRONLY = libc::O_WRONLY;
        /// Open for reading and writing.
        const RDWR = libc::O_RDWR;
        /// Do not follow symlinks.
        const NOFOLLOW = libc::O_NOFOLLOW;
        /// Do not update access time (Linux only).
        #[cfg(target_os = "linux")]
        const NOATIME = libc::O_NOATIME;
    }
}

/// File attributes as they travel between source, cache and frontend.
///
/// `mode` carries the full Unix mode word including the `S_IFMT` format
/// bits. Times are seconds since the epoch. `blocks` is the number of 4 KiB
/// blocks *the cache holds* for regular files, not the source's block count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FileStat {
    /// Unix mode word, format bits included.
    pub mode: u32,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Last modification time, seconds since the epoch.
    pub mtime: u64,
    /// Last access time, seconds since the epoch.
    pub atime: u64,
    /// Last status change time, seconds since the epoch.
    pub ctime: u64,
    /// File size in bytes.
    pub size: u64,
    /// Cached 4 KiB blocks for regular files, 0 otherwise.
    pub blocks: u64,
}

impl FileStat {
    /// The `S_IFMT` format bits of the mode word.
    #[must_use]
    pub fn format(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    /// Whether this is a regular file.
    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.format() == libc::S_IFREG
    }

    /// Whether this is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.format() == libc::S_IFDIR
    }

    /// Whether this is a symbolic link.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.format() == libc::S_IFLNK
    }
}

/// A directory entry: a leaf name plus the child's attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name of the entry within its parent, never containing a slash.
    pub name: String,
    /// Attributes of the child.
    pub stat: FileStat,
}

/// A path-addressed, read-only filesystem.
///
/// Errors expose a POSIX-style errno through [`CacheError::errno`]. An
/// *unavailable* error ([`CacheError::is_unavailable`]) means the backing
/// store could not be reached right now; the overlay reacts to those by
/// serving from cache instead of failing the operation.
pub trait PathFs: Send + Sync {
    /// Whether the filesystem can currently serve requests. A source driver
    /// reports its connection state here; the overlay always reports `true`.
    fn is_ready(&self) -> bool;

    /// Join path components the way this filesystem expects.
    fn join(&self, parts: &[&str]) -> String;

    /// Stat a path without following a final symlink.
    fn lstat(&self, path: &str) -> Result<FileStat, CacheError>;

    /// List a directory. Every entry carries a full stat.
    fn open_dir(&self, path: &str) -> Result<Vec<DirEntry>, CacheError>;

    /// Read the destination of a symlink.
    fn readlink(&self, path: &str) -> Result<String, CacheError>;

    /// Open a file for reading.
    fn open_file(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn PathFile>, CacheError>;
}

/// An open file handle on a [`PathFs`].
pub trait PathFile: Send + Sync + std::fmt::Debug {
    /// Read up to `size` bytes at `position`. A result shorter than `size`
    /// means end of file; missing data is an error, not a short read.
    fn read(&self, position: u64, size: usize) -> Result<Bytes, CacheError>;

    /// Release the handle. Called exactly once.
    fn release(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_helpers_match_the_mode_word() {
        let reg = FileStat {
            mode: libc::S_IFREG | 0o644,
            ..FileStat::default()
        };
        assert!(reg.is_regular());
        assert!(!reg.is_dir());
        assert_eq!(reg.format(), libc::S_IFREG);

        let dir = FileStat {
            mode: libc::S_IFDIR | 0o755,
            ..FileStat::default()
        };
        assert!(dir.is_dir());

        let lnk = FileStat {
            mode: libc::S_IFLNK | 0o777,
            ..FileStat::default()
        };
        assert!(lnk.is_symlink());
    }
}
