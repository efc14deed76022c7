//! Open handles onto cached regular files.
//!
//! A [`CacheFile`] is the read/admit surface for one regular inode. Handles
//! are shared: opening the same path twice yields the same `Arc`, with a
//! refcount kept in the inode. The last close tears the data file down and
//! deregisters the handle from the manager.
//!
//! Quota discipline: block grants are requested *before* the inode mutex is
//! taken and surplus is released *after* it is dropped, so a handle never
//! calls into the manager while holding its inode lock. See the lock
//! hierarchy notes in [`super`].

use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::cache::inode::Inode;
use crate::cache::regular::RegularInode;
use crate::cache::manager::FileCache;
use crate::cache::quota::{Priority, QuotaService as _};
use crate::cache::{BLOCK_SIZE, blocks_for};
use crate::error::CacheError;
use crate::fs::FileStat;

/// An open, refcounted handle onto a cached regular file.
pub struct CacheFile {
    cache: Weak<FileCache>,
    path: String,
    inode: Arc<Mutex<Inode>>,
}

/// What a write changed, for quota accounting.
#[derive(Debug, Default, Clone, Copy)]
struct WriteDelta {
    /// Blocks newly marked available.
    consumed: u64,
    /// Previously-available blocks invalidated by resizing or a short write.
    freed: u64,
}

impl CacheFile {
    pub(crate) fn new(cache: Weak<FileCache>, path: String, inode: Arc<Mutex<Inode>>) -> Self {
        Self { cache, path, inode }
    }

    /// The normalized path this handle was opened for.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn inode(&self) -> &Arc<Mutex<Inode>> {
        &self.inode
    }

    /// Write bytes into the cache at `position`.
    ///
    /// Used by the overlay to admit bytes it has read from the source.
    /// Three cases, dispatched against the current file size:
    ///
    /// - *append* (`position == size`): always accepted, the unaligned tail
    ///   stays valid because end-of-file rounding covers it;
    /// - *write-and-extend* (`position + len > size`): refused with
    ///   [`CacheError::MustBeAligned`] if the first block is unaligned and
    ///   not already available;
    /// - *random write*: additionally refused if the last block is
    ///   unaligned and not available.
    ///
    /// If the quota cannot cover the write, the bytes are silently not
    /// admitted; a cache that cannot grow is not an error for the reader.
    pub fn put_data(&self, data: &[u8], position: u64) -> Result<(), CacheError> {
        self.put_data_with_priority(data, position, Priority::Read)
    }

    /// [`CacheFile::put_data`] with an explicit quota priority.
    pub fn put_data_with_priority(
        &self,
        data: &[u8],
        position: u64,
        priority: Priority,
    ) -> Result<(), CacheError> {
        let end_byte = position + data.len() as u64;

        // Blocks are requested before the inode lock is taken; the peek
        // below is only advisory, and any drift between it and the actual
        // write settles in the accounting pass at the end.
        let needed = {
            let mut guard = self.lock_inode();
            let Inode::Regular(r) = &mut *guard else {
                return Err(CacheError::Unavailable);
            };
            r.blocks_to_admit(position, data.len() as u64)
        };

        let cache = self.cache.upgrade();
        let granted = match &cache {
            Some(c) if needed > 0 => c.request_blocks(needed, priority),
            // The manager is gone; the handle is orphaned but still usable.
            _ => needed,
        };
        if granted < needed {
            if let Some(c) = &cache {
                c.release_blocks(granted);
            }
            debug!(
                path = %self.path,
                needed,
                granted,
                "cache full, skipping admission"
            );
            return Ok(());
        }

        let result = {
            let mut guard = self.lock_inode();
            let Inode::Regular(r) = &mut *guard else {
                // The inode under this handle was replaced by a type change.
                return Err(CacheError::Unavailable);
            };

            let size = r.base.size;
            if position == size {
                Self::append_to_end(r, data, position)
            } else if end_byte > size {
                Self::write_and_extend(r, data, position)
            } else {
                Self::write_random(r, data, position)
            }
        };

        if let Some(c) = &cache {
            match &result {
                Ok(delta) if delta.consumed > granted => {
                    // A concurrent eviction invalidated blocks between the
                    // peek and the write; settle the difference.
                    let _ = c.request_blocks(delta.consumed - granted, priority);
                    c.release_blocks(delta.freed);
                }
                Ok(delta) => c.release_blocks(granted - delta.consumed + delta.freed),
                Err(_) => c.release_blocks(granted),
            }
        }
        result.map(|_| ())
    }

    fn lock_inode(&self) -> std::sync::MutexGuard<'_, Inode> {
        self.inode
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn append_to_end(
        r: &mut RegularInode,
        data: &[u8],
        position: u64,
    ) -> Result<WriteDelta, CacheError> {
        let freed = r.resize(position + data.len() as u64)?;
        let (consumed, short_freed) = r.write_and_mark(data, position);
        Ok(WriteDelta {
            consumed,
            freed: freed + short_freed,
        })
    }

    fn write_and_extend(
        r: &mut RegularInode,
        data: &[u8],
        position: u64,
    ) -> Result<WriteDelta, CacheError> {
        let start_block = position / BLOCK_SIZE;
        let start_aligned = start_block * BLOCK_SIZE == position;
        if !start_aligned && !r.is_available(start_block) {
            return Err(CacheError::MustBeAligned);
        }

        let freed = r.resize(position + data.len() as u64)?;
        let (consumed, short_freed) = r.write_and_mark(data, position);
        Ok(WriteDelta {
            consumed,
            freed: freed + short_freed,
        })
    }

    fn write_random(
        r: &mut RegularInode,
        data: &[u8],
        position: u64,
    ) -> Result<WriteDelta, CacheError> {
        let start_block = position / BLOCK_SIZE;
        let start_aligned = start_block * BLOCK_SIZE == position;
        let end_byte = position + data.len() as u64;
        let end_block = blocks_for(end_byte);
        let end_aligned = end_block * BLOCK_SIZE == end_byte;
        // A write ending exactly at EOF fills its tail block as far as the
        // file goes; the missing remainder can never be read.
        let end_at_eof = end_byte == r.base.size;

        if !start_aligned && !r.is_available(start_block) {
            return Err(CacheError::MustBeAligned);
        }
        if !end_aligned && !end_at_eof && !r.is_available(end_block - 1) {
            return Err(CacheError::MustBeAligned);
        }

        // No resize by definition of this case.
        let (consumed, freed) = r.write_and_mark(data, position);
        Ok(WriteDelta { consumed, freed })
    }

    /// Read cached bytes into `buf` from `position`.
    ///
    /// Returns the number of leading bytes of `buf` that are valid, plus an
    /// error when the read could not be fully served: `Unavailable` when
    /// the bytes at (or after) `position` are simply not cached, `Io` when
    /// the data file itself failed. A read clipped by end-of-file is *not*
    /// an error; the short count alone says everything.
    pub fn fetch_data(&self, buf: &mut [u8], position: u64) -> (usize, Option<CacheError>) {
        use std::os::unix::fs::FileExt as _;

        let mut guard = self.lock_inode();
        let Inode::Regular(r) = &mut *guard else {
            return (0, Some(CacheError::Unavailable));
        };

        let (to_read, at_eof) = r.truncate_read(position, buf.len() as u64);
        if to_read == 0 {
            return (0, Some(CacheError::Unavailable));
        }
        let to_read = usize::try_from(to_read)
            .unwrap_or_else(|_| unreachable!("truncate_read never exceeds the buffer length"));

        let file = match r.ensure_data_file() {
            Ok(f) => f,
            Err(e) => return (0, Some(e)),
        };

        let mut read = 0usize;
        while read < to_read {
            match file.read_at(&mut buf[read..to_read], position + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return (read, Some(CacheError::Io(e))),
            }
        }

        if read < to_read {
            // The blockmap said these bytes exist but the data file came up
            // short; treat the tail as missing rather than serving zeroes.
            warn!(path = %self.path, position, "data file shorter than blockmap promises");
            return (read, Some(CacheError::Unavailable));
        }
        if read < buf.len() && !at_eof {
            return (read, Some(CacheError::Unavailable));
        }
        (read, None)
    }

    /// Attributes of the file behind this handle. They may differ from the
    /// attributes at the opened path if the inode was replaced meanwhile.
    #[must_use]
    pub fn fetch_attr(&self) -> FileStat {
        self.lock_inode().stat_view()
    }

    /// Flush pending data and metadata to disk. Data bytes are synced
    /// before the blockmap, so a crash in between underestimates what is
    /// cached instead of overestimating it.
    pub fn sync(&self) -> Result<(), CacheError> {
        self.lock_inode().sync()
    }

    /// Drop one reference to this handle. The last close syncs the inode,
    /// closes the data file and deregisters the handle from the manager.
    pub fn close(&self) {
        if let Some(cache) = self.cache.upgrade() {
            cache.release_handle(self);
            return;
        }

        // Orphaned handle: the manager is gone, tear down locally.
        let mut guard = self.lock_inode();
        if let Inode::Regular(r) = &mut *guard {
            r.refcount = r.refcount.saturating_sub(1);
            if r.refcount == 0
                && let Err(e) = r.close()
            {
                warn!(path = %self.path, error = %e, "failed to close cached file");
            }
        }
    }
}
