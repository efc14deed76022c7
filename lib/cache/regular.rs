//! The regular-file inode: block accounting over an mmap'd blockmap.
//!
//! A regular inode owns two on-disk artifacts: the metadata file (common
//! header and `REG` extension in the first 128 bytes, blockmap entries
//! after that, padded to whole 4 KiB pages) and a separate `.data` file of
//! raw content bytes. All methods here assume the caller holds the inode's
//! mutex.

use std::ffi::OsString;
use std::fs::File;
use std::os::unix::fs::{FileExt as _, OpenOptionsExt as _};
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::cache::blockmap::{BlockInfo, Blockmap, ENTRY_SIZE, HEADER_SIZE};
use crate::cache::codec;
use crate::cache::inode::InodeBase;
use crate::cache::{BLOCK_SIZE, blocks_for};
use crate::error::CacheError;
use crate::io::{ensure_parent_dir, punch_hole};

/// A regular-file inode with its backing metadata file.
#[derive(Debug)]
pub struct RegularInode {
    pub(crate) base: InodeBase,
    pub(crate) blocks_used: u64,
    meta_file: File,
    map: Option<Blockmap>,
    data_file: Option<File>,
    pub(crate) refcount: u64,
}

impl RegularInode {
    /// Create a fresh inode and its metadata file. Fails if the file
    /// already exists; stale state must be purged first.
    pub(crate) fn create(base: InodeBase) -> Result<Self, CacheError> {
        ensure_parent_dir(&base.storage_path)?;
        let meta_file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&base.storage_path)?;
        Ok(Self {
            base,
            blocks_used: 0,
            meta_file,
            map: None,
            data_file: None,
            refcount: 0,
        })
    }

    /// Rebuild an inode from a decoded header and its open metadata file.
    pub(crate) fn from_parts(base: InodeBase, blocks_used: u64, meta_file: File) -> Self {
        Self {
            base,
            blocks_used,
            meta_file,
            map: None,
            data_file: None,
            refcount: 0,
        }
    }

    /// Path of the companion `.data` file.
    pub(crate) fn data_path(&self) -> PathBuf {
        let mut os: OsString = self.base.storage_path.clone().into_os_string();
        os.push(".data");
        PathBuf::from(os)
    }

    /// The open data file, opening (and creating) it on demand.
    pub(crate) fn ensure_data_file(&mut self) -> Result<&File, CacheError> {
        if self.data_file.is_none() {
            let file = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(0o600)
                .open(self.data_path())?;
            self.data_file = Some(file);
        }
        Ok(self
            .data_file
            .as_ref()
            .unwrap_or_else(|| unreachable!("data_file was just populated")))
    }

    /// Close the data file handle, if open.
    pub(crate) fn close_data(&mut self) {
        self.data_file = None;
    }

    /// Whether a data file handle is currently open.
    pub(crate) fn has_data_file(&self) -> bool {
        self.data_file.is_some()
    }

    /// Sync the data file if it is open. Ordered before any blockmap flush
    /// so that a crash between the two leaves blocks "not yet available"
    /// rather than available-but-torn.
    pub(crate) fn sync_data(&self) -> std::io::Result<()> {
        match &self.data_file {
            Some(f) => f.sync_all(),
            None => Ok(()),
        }
    }

    fn backing_size(&self) -> std::io::Result<u64> {
        Ok(self.meta_file.metadata()?.len())
    }

    /// The blockmap, mapping it on first use.
    ///
    /// # Panics
    ///
    /// Panics if the mapping fails or is too small for the file size; both
    /// mean the metadata file no longer matches the inode and the cache
    /// cannot be trusted.
    fn ensure_mapped(&mut self) -> &mut Blockmap {
        if self.map.is_none() {
            let map = Blockmap::map(&self.meta_file);
            assert!(
                map.len_entries() >= blocks_for(self.base.size),
                "blockmap holds {} entries but the file needs {}",
                map.len_entries(),
                blocks_for(self.base.size),
            );
            self.map = Some(map);
        }
        self.map
            .as_mut()
            .unwrap_or_else(|| unreachable!("map was just populated"))
    }

    fn unmap(&mut self) {
        if let Some(map) = self.map.take()
            && let Err(e) = map.flush()
        {
            warn!(error = %e, "failed to flush blockmap before unmap");
        }
    }

    /// Current file size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.base.size
    }

    /// Number of blocks covered by the current file size.
    #[must_use]
    pub fn size_blocks(&self) -> u64 {
        blocks_for(self.base.size)
    }

    /// How many of the blocks touched by a write of `len` bytes at
    /// `position` are not yet cached. Blocks past the current end of file
    /// count as missing.
    pub(crate) fn blocks_to_admit(&mut self, position: u64, len: u64) -> u64 {
        let start = position / BLOCK_SIZE;
        let end = blocks_for(position + len);
        let nblocks = self.size_blocks();
        (start..end)
            .filter(|&b| b >= nblocks || !self.is_available(b))
            .count() as u64
    }

    /// Whether `block` is present in the data file.
    pub fn is_available(&mut self, block: u64) -> bool {
        if block >= self.size_blocks() {
            return false;
        }
        self.ensure_mapped().get(block).is_available()
    }

    /// Mark blocks `[start, end)` as present, bumping their access
    /// counters. The range is clipped to the file size. Returns the number
    /// of blocks that were not present before.
    ///
    /// If any counter saturates, every counter in the file is halved so
    /// that relative recency stays meaningful.
    pub fn set_written(&mut self, start: u64, end: u64) -> u64 {
        let nblocks = self.size_blocks();
        if start >= nblocks || end <= start {
            return 0;
        }
        let end = end.min(nblocks);

        let map = self.ensure_mapped();
        let mut new_blocks = 0;
        let mut saturated = false;
        for block in start..end {
            let (was_new, now_max) = map.update(block, BlockInfo::touch);
            if was_new {
                new_blocks += 1;
            }
            saturated |= now_max;
        }
        if saturated {
            map.shift_all(nblocks);
        }
        self.blocks_used += new_blocks;
        new_blocks
    }

    /// Bump access counters for a read of blocks `[start, end)`.
    pub fn set_read(&mut self, start: u64, end: u64) -> u64 {
        self.set_written(start, end)
    }

    /// Drop blocks `[start, end)` from the map. Returns how many of them
    /// were present; the range may cover holes.
    pub fn discard(&mut self, start: u64, end: u64) -> u64 {
        if start >= self.size_blocks() || end <= start {
            return 0;
        }
        let map = self.ensure_mapped();
        let mut dropped = 0;
        for block in start..end.min(map.len_entries()) {
            if map.update(block, BlockInfo::discard) {
                dropped += 1;
            }
        }
        self.blocks_used -= dropped;
        dropped
    }

    fn available_in(&mut self, start: u64, end: u64) -> u64 {
        let map = self.ensure_mapped();
        (start..end.min(map.len_entries()))
            .filter(|&b| map.get(b).is_available())
            .count() as u64
    }

    /// Resize the file to `nbytes`, growing or shrinking the blockmap
    /// region (in whole pages) to match. Returns the number of previously
    /// available blocks that became invalid:
    ///
    /// - shrinking drops every block at or past the new end;
    /// - growing a file whose old size was not block-aligned drops the old
    ///   tail block, because the bytes that used to be "after EOF" inside
    ///   it are now part of the file but were never cached.
    pub fn resize(&mut self, nbytes: u64) -> Result<u64, CacheError> {
        let new_blocks = blocks_for(nbytes);
        let old_size = self.base.size;
        let old_blocks = self.size_blocks();
        debug!(old_size, new_size = nbytes, "resizing cached file");

        let mut discarded = 0;
        if new_blocks < old_blocks {
            discarded = self.available_in(new_blocks, old_blocks);
            let map = self.ensure_mapped();
            for block in new_blocks..old_blocks.min(map.len_entries()) {
                map.update(block, BlockInfo::discard);
            }
            self.blocks_used -= discarded;
        } else if nbytes > old_size && old_size > 0 && !old_size.is_multiple_of(BLOCK_SIZE) {
            let map = self.ensure_mapped();
            if map.update(old_blocks - 1, BlockInfo::discard) {
                discarded = 1;
                self.blocks_used -= 1;
            }
        }

        self.base.size = nbytes;
        self.resize_map_to_blocks(new_blocks)?;
        // Keep the data file's logical size equal to the inode size. If no
        // data file exists yet there is nothing to truncate; it is created
        // at the right length by the first write.
        if self.has_data_file() || self.data_path().exists() {
            self.ensure_data_file()?.set_len(nbytes)?;
        }
        self.write_header()?;
        Ok(discarded)
    }

    fn resize_map_to_blocks(&mut self, new_blocks: u64) -> Result<(), CacheError> {
        let new_size = (HEADER_SIZE + new_blocks * ENTRY_SIZE).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        if self.backing_size()? == new_size {
            return Ok(());
        }
        self.unmap();
        self.meta_file.set_len(new_size)?;
        Ok(())
    }

    /// Clip a read at `position` of `size` bytes to the contiguous run of
    /// available data starting there. Returns the readable byte count and
    /// whether the clipped read ends at end-of-file.
    pub fn truncate_read(&mut self, position: u64, size: u64) -> (u64, bool) {
        let filesize = self.base.size;
        if filesize == 0 || position >= filesize {
            return (0, true);
        }

        let start_block = position / BLOCK_SIZE;
        let mut end_byte = position + size;
        let mut at_eof = false;
        // Clipping at EOF first bounds the block scan to blocks that can
        // exist at all.
        if end_byte > filesize {
            end_byte = filesize;
            at_eof = true;
        }
        let end_block = blocks_for(end_byte);

        let mut actual_end_block = end_block;
        for block in start_block..end_block {
            if !self.is_available(block) {
                actual_end_block = block;
                at_eof = false;
                break;
            }
        }

        if actual_end_block <= start_block {
            return (0, false);
        }

        let actual_end_byte = (actual_end_block * BLOCK_SIZE).min(end_byte);
        (actual_end_byte - position, at_eof)
    }

    /// Cached block count as reported through stat: `blocks_used` for a
    /// non-empty file, 0 otherwise.
    #[must_use]
    pub fn blocks(&self) -> u64 {
        if self.size_blocks() == 0 {
            0
        } else {
            self.blocks_used
        }
    }

    /// Lowest access counter among available blocks, if any block is
    /// available. Used for eviction victim selection.
    pub(crate) fn min_available_actr(&mut self) -> Option<u8> {
        let nblocks = self.size_blocks();
        if nblocks == 0 || self.blocks_used == 0 {
            return None;
        }
        let map = self.ensure_mapped();
        (0..nblocks.min(map.len_entries()))
            .map(|b| map.get(b))
            .filter(|e| e.is_available())
            .map(BlockInfo::actr)
            .min()
    }

    /// Evict up to `want` blocks, cheapest (lowest access counter) first.
    ///
    /// Discarded entries are coalesced into contiguous runs and the
    /// matching `.data` regions are hole-punched. Returns the number of
    /// blocks actually freed. The in-place header rewrite keeps
    /// `blocks_used` durable without a full writeback.
    pub(crate) fn evict_blocks(&mut self, want: u64) -> u64 {
        let nblocks = self.size_blocks();
        if want == 0 || nblocks == 0 {
            return 0;
        }

        let mut candidates: Vec<(u8, u64)> = {
            let map = self.ensure_mapped();
            (0..nblocks.min(map.len_entries()))
                .map(|b| (map.get(b), b))
                .filter(|(e, _)| e.is_available())
                .map(|(e, b)| (e.actr(), b))
                .collect()
        };
        candidates.sort_unstable();

        let mut victims: Vec<u64> = candidates
            .into_iter()
            .take(usize::try_from(want).unwrap_or(usize::MAX))
            .map(|(_, b)| b)
            .collect();
        if victims.is_empty() {
            return 0;
        }
        victims.sort_unstable();

        let freed = {
            let map = self.ensure_mapped();
            let mut freed = 0;
            for &block in &victims {
                if map.update(block, BlockInfo::discard) {
                    freed += 1;
                }
            }
            freed
        };
        self.blocks_used -= freed;

        // Deallocate the data regions run by run.
        if let Ok(data) = self.ensure_data_file() {
            let mut run_start = victims[0];
            let mut run_end = victims[0] + 1;
            let mut runs = Vec::new();
            for &block in &victims[1..] {
                if block == run_end {
                    run_end += 1;
                } else {
                    runs.push((run_start, run_end));
                    run_start = block;
                    run_end = block + 1;
                }
            }
            runs.push((run_start, run_end));
            for (start, end) in runs {
                if let Err(e) = punch_hole(data, start * BLOCK_SIZE, (end - start) * BLOCK_SIZE) {
                    warn!(error = %e, start, end, "failed to punch hole for evicted blocks");
                }
            }
        } else {
            warn!("evicted blocks without a reachable data file");
        }

        if let Err(e) = self.write_header() {
            warn!(error = %e, "failed to rewrite header after eviction");
        }
        freed
    }

    /// Rewrite the 128-byte header region in place.
    pub(crate) fn write_header(&mut self) -> Result<(), CacheError> {
        let mut buf = Vec::with_capacity(HEADER_SIZE as usize);
        codec::write_base(&mut buf, &self.base.header())?;
        codec::write_reg_ext(&mut buf, self.blocks_used)?;
        buf.resize(HEADER_SIZE as usize, 0);
        self.meta_file.write_all_at(&buf, 0)?;
        Ok(())
    }

    /// Flush everything durable: data file first, then header and
    /// blockmap, then the metadata file itself.
    pub fn sync(&mut self) -> Result<(), CacheError> {
        self.sync_data()?;
        self.write_header()?;
        if let Some(map) = &self.map {
            map.flush()?;
        }
        self.meta_file.sync_all()?;
        Ok(())
    }

    /// Sync and drop the mapping and data handle.
    pub fn close(&mut self) -> Result<(), CacheError> {
        self.sync()?;
        self.unmap();
        self.close_data();
        Ok(())
    }

    /// Write `data` at `position` in the data file and mark the covered
    /// blocks. A short write discards the partially-written final block.
    /// Returns `(newly_marked, discarded)` for quota accounting.
    pub(crate) fn write_and_mark(&mut self, data: &[u8], position: u64) -> (u64, u64) {
        let end_byte = position + data.len() as u64;
        let mut end_block = blocks_for(end_byte);
        let mut discarded = 0;

        let written = match self.ensure_data_file() {
            Ok(file) => {
                let mut written = 0usize;
                while written < data.len() {
                    match file.write_at(&data[written..], position + written as u64) {
                        Ok(0) => break,
                        Ok(n) => written += n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            warn!(error = %e, position, "short write into cache data file");
                            break;
                        }
                    }
                }
                written
            }
            Err(e) => {
                warn!(error = %e, "cannot open cache data file for writing");
                0
            }
        };

        let actual_end_byte = position + written as u64;
        if actual_end_byte < end_byte {
            // EOF rounding does not apply to an incomplete write; drop the
            // torn tail block entirely.
            end_block = actual_end_byte / BLOCK_SIZE;
            discarded = self.discard(end_block, end_block + 1);
        }

        let marked = self.set_written(position / BLOCK_SIZE, end_block);
        (marked, discarded)
    }
}
