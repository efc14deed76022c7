//! Disk IO utilities: atomic file replacement and block deallocation.

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt as _;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::warn;

/// Create `path`'s parent directory chain with mode `0700`.
///
/// Storage-key directories must not be readable by other users; the cache
/// may hold data the user could not otherwise access offline.
pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent),
        _ => Ok(()),
    }
}

/// A file that atomically replaces its target on [`SafeFile::commit`].
///
/// Content is written to a temporary file in the same directory as the
/// target. `commit` fsyncs, closes and renames over the target, so a crash
/// at any point leaves either the old file or the new file, never a torn
/// mixture. Dropping an uncommitted `SafeFile` removes the temporary file.
pub struct SafeFile {
    inner: NamedTempFile,
    target: PathBuf,
}

impl SafeFile {
    /// Start writing a replacement for `target`, creating the storage
    /// directory chain if needed.
    pub fn create(target: impl Into<PathBuf>) -> io::Result<Self> {
        let target = target.into();
        ensure_parent_dir(&target)?;
        let dir = target.parent().map_or_else(|| Path::new("."), |p| p);
        let inner = NamedTempFile::new_in(dir)?;
        Ok(Self { inner, target })
    }

    /// Durably replace the target with everything written so far.
    pub fn commit(self) -> io::Result<()> {
        self.inner.as_file().sync_all()?;
        match self.inner.persist(&self.target) {
            Ok(_) => Ok(()),
            Err(e) => {
                // The temp file is still owned by the error; let it clean
                // itself up when dropped.
                warn!(path = %self.target.display(), error = %e.error,
                      "failed to rename safe file over target");
                Err(e.error)
            }
        }
    }
}

impl Write for SafeFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Deallocate `len` bytes at `offset` in `file` without changing its size.
///
/// Reads of the punched range return zeroes; the blockmap entry for the
/// range must already be discarded, so those zeroes are never served.
pub fn punch_hole(file: &File, offset: u64, len: u64) -> io::Result<()> {
    use nix::fcntl::{FallocateFlags, fallocate};

    if len == 0 {
        return Ok(());
    }
    fallocate(
        file,
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        i64::try_from(offset).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?,
        i64::try_from(len).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?,
    )
    .map_err(io::Error::from)
}
