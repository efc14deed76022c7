//! The overlay read path: source in front, cache behind.
//!
//! [`Overlay`] implements [`PathFs`] on top of another `PathFs` (the
//! source) and a [`FileCache`]. While the source is ready, operations pass
//! through it and their results populate the cache; once it stops being
//! ready — or an individual call comes back *unavailable* — the cache
//! serves what it has. A source that definitively reports a path as absent
//! plants a tombstone, so later offline lookups answer `NotFound` instead
//! of a vague I/O error.
//!
//! File reads are admitted block-aligned: the client's arbitrary byte range
//! is widened to the smallest enclosing run of whole blocks, the source is
//! asked for that window, the window lands in the cache, and the client
//! gets its slice of it.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::cache::BLOCK_SIZE;
use crate::cache::file::CacheFile;
use crate::cache::manager::FileCache;
use crate::error::CacheError;
use crate::fs::{DirEntry, FileStat, OpenFlags, PathFile, PathFs};

/// Widen `(position, length)` to the smallest block-aligned window that
/// contains it. Returns `(new_position, new_length, offset)` where
/// `offset` is where the client's range starts inside the window.
#[must_use]
pub fn align_read(position: u64, length: u64, block_size: u64) -> (u64, u64, u64) {
    let new_position = (position / block_size) * block_size;
    let new_length = (position + length).div_ceil(block_size) * block_size - new_position;
    (new_position, new_length, position - new_position)
}

/// A caching overlay over a source filesystem.
pub struct Overlay<S> {
    source: S,
    cache: Arc<FileCache>,
}

impl<S: PathFs> Overlay<S> {
    /// Wrap `source` with `cache`.
    pub fn new(source: S, cache: Arc<FileCache>) -> Self {
        Self { source, cache }
    }

    /// The wrapped source filesystem.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Record a definitive "does not exist" answer from the source.
    fn plant_tombstone(&self, path: &str) {
        if let Err(e) = self.cache.put_non_existent(path) {
            warn!(path, error = %e, "failed to cache non-existence");
        }
    }
}

impl<S: PathFs> PathFs for Overlay<S> {
    /// The overlay itself is always ready: it degrades to cached answers
    /// instead of refusing service.
    fn is_ready(&self) -> bool {
        true
    }

    fn join(&self, parts: &[&str]) -> String {
        self.source.join(parts)
    }

    fn lstat(&self, path: &str) -> Result<FileStat, CacheError> {
        if !self.source.is_ready() {
            return self.cache.fetch_attr(path);
        }
        match self.source.lstat(path) {
            Ok(stat) => {
                if let Err(e) = self.cache.put_attr(path, &stat) {
                    warn!(path, error = %e, "failed to cache attributes");
                }
                Ok(stat)
            }
            Err(e) if e.is_unavailable() => self.cache.fetch_attr(path),
            Err(e) => {
                if matches!(e, CacheError::NotFound) {
                    self.plant_tombstone(path);
                }
                Err(e)
            }
        }
    }

    fn open_dir(&self, path: &str) -> Result<Vec<DirEntry>, CacheError> {
        if !self.source.is_ready() {
            return self.cache.fetch_dir(path);
        }
        match self.source.open_dir(path) {
            Ok(entries) => {
                if let Err(e) = self.cache.put_dir(path, &entries) {
                    warn!(path, error = %e, "failed to cache directory listing");
                }
                Ok(entries)
            }
            Err(e) if e.is_unavailable() => self.cache.fetch_dir(path),
            Err(e) => {
                if matches!(e, CacheError::NotFound) {
                    self.plant_tombstone(path);
                }
                Err(e)
            }
        }
    }

    fn readlink(&self, path: &str) -> Result<String, CacheError> {
        if !self.source.is_ready() {
            return self.cache.fetch_link(path);
        }
        match self.source.readlink(path) {
            Ok(dest) => {
                if let Err(e) = self.cache.put_link(path, &dest) {
                    warn!(path, error = %e, "failed to cache symlink");
                }
                Ok(dest)
            }
            Err(e) if e.is_unavailable() => self.cache.fetch_link(path),
            Err(e) => {
                if matches!(e, CacheError::NotFound) {
                    self.plant_tombstone(path);
                }
                Err(e)
            }
        }
    }

    fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Box<dyn PathFile>, CacheError> {
        let source_file = if self.source.is_ready() {
            match self.source.open_file(path, flags) {
                Ok(f) => Some(f),
                Err(e) if e.is_unavailable() => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let cache_file = match self.cache.open_file(path) {
            Ok(f) => Some(f),
            Err(e) => {
                if source_file.is_none() {
                    // Neither side can serve the file.
                    return Err(if e.is_unavailable() || matches!(e, CacheError::NotFound) {
                        e
                    } else {
                        CacheError::Unavailable
                    });
                }
                debug!(path, error = %e, "reading without cache admission");
                None
            }
        };

        Ok(Box::new(OverlayFile {
            source: source_file,
            cache: cache_file,
        }))
    }
}

/// An open overlay file: an optional source handle plus an optional cache
/// handle. At least one side is present.
pub struct OverlayFile {
    source: Option<Box<dyn PathFile>>,
    cache: Option<Arc<CacheFile>>,
}

impl std::fmt::Debug for OverlayFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayFile")
            .field("source", &self.source.is_some())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

impl OverlayFile {
    fn read_from_cache(
        cache: &CacheFile,
        position: u64,
        size: usize,
    ) -> Result<Bytes, CacheError> {
        let mut buf = vec![0u8; size];
        match cache.fetch_data(&mut buf, position) {
            (n, None) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            (_, Some(e)) => Err(e),
        }
    }
}

impl PathFile for OverlayFile {
    fn read(&self, position: u64, size: usize) -> Result<Bytes, CacheError> {
        let source = match (&self.source, &self.cache) {
            (None, None) => return Err(CacheError::Unavailable),
            (None, Some(cache)) => return Self::read_from_cache(cache, position, size),
            (Some(source), None) => return source.read(position, size),
            (Some(source), Some(_)) => source,
        };
        let cache = self
            .cache
            .as_ref()
            .unwrap_or_else(|| unreachable!("cache side checked above"));

        let (new_position, new_length, offset) = align_read(position, size as u64, BLOCK_SIZE);
        let aligned_size = usize::try_from(new_length)
            .unwrap_or_else(|_| unreachable!("aligned windows fit in usize on 64-bit hosts"));

        let window = match source.read(new_position, aligned_size) {
            Ok(window) => window,
            Err(e) if e.is_unavailable() => {
                debug!(position, "source unavailable mid-read, serving from cache");
                return Self::read_from_cache(cache, position, size);
            }
            Err(e) => return Err(e),
        };

        if !window.is_empty()
            && let Err(e) = cache.put_data(&window, new_position)
        {
            // Admission failures must not break the read.
            warn!(position = new_position, error = %e, "failed to admit read window");
        }

        let offset = usize::try_from(offset)
            .unwrap_or_else(|_| unreachable!("offset is smaller than one block"));
        if window.len() <= offset {
            return Ok(Bytes::new());
        }
        let end = window.len().min(offset + size);
        Ok(window.slice(offset..end))
    }

    fn release(&self) {
        if let Some(source) = &self.source {
            source.release();
        }
        if let Some(cache) = &self.cache {
            cache.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_read_is_identity_for_aligned_ranges() {
        let (pos, len, off) = align_read(4096, 4096, 4096);
        assert_eq!((pos, len, off), (4096, 4096, 0));
    }

    #[test]
    fn align_read_widens_an_unaligned_position() {
        let (pos, len, off) = align_read(128, 4096, 4096);
        assert_eq!((pos, len, off), (0, 8192, 128));
    }

    #[test]
    fn align_read_fits_a_shifted_range_into_one_block() {
        let (pos, len, off) = align_read(128, 4096 - 128, 4096);
        assert_eq!((pos, len, off), (0, 4096, 128));
    }

    #[test]
    fn align_read_widens_an_unaligned_length() {
        let (pos, len, off) = align_read(4096, 63, 4096);
        assert_eq!((pos, len, off), (4096, 4096, 0));
    }

    #[test]
    fn align_read_handles_a_fully_unaligned_range() {
        let (pos, len, off) = align_read(3 * 4096 + 37, 63, 4096);
        assert_eq!((pos, len, off), (3 * 4096, 4096, 37));
    }

    #[test]
    fn align_read_output_always_covers_the_input() {
        for (position, length) in [(0, 1), (1, 1), (4095, 2), (12325, 63), (8192, 12288)] {
            let (new_pos, new_len, offset) = align_read(position, length, 4096);
            assert!(new_pos <= position);
            assert!(new_pos + new_len >= position + length);
            assert_eq!(new_pos % 4096, 0);
            assert_eq!(new_len % 4096, 0);
            assert_eq!(offset, position - new_pos);
        }
    }
}
