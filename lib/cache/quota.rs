//! Block accounting, admission and eviction.
//!
//! The quota is a single pool of 4 KiB blocks shared by every cached file.
//! Writers request blocks *before* writing and hand surplus back afterward;
//! when the pool runs dry, admission either fails softly (readahead) or
//! evicts colder blocks from other files (read and written data).
//!
//! Eviction selects the victim file whose cheapest available block has the
//! globally lowest access counter, discards that file's blocks cheapest
//! first, and punches holes in its `.data` file to give the space back to
//! the filesystem. Victim inodes are taken with `try_lock`: an inode busy
//! serving a reader is simply skipped, which keeps the manager-then-inode
//! lock order free of deadlock windows.

use std::sync::Arc;

use tracing::debug;

use crate::cache::inode::Inode;
use crate::cache::manager::{CacheInner, FileCache};

/// Retention preference of a block request, lowest first.
///
/// `Readahead` admission must never evict other blocks; `Read` and
/// `Written` may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Speculatively fetched bytes nobody asked for yet.
    Readahead,
    /// Bytes a client actually read.
    Read,
    /// Bytes a client wrote.
    Written,
}

/// The quota record: total blocks permitted and blocks in use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaInfo {
    /// Total blocks the cache may hold. 0 means unlimited.
    pub blocks_total: u64,
    /// Blocks currently accounted to cached files.
    pub blocks_used: u64,
}

/// Manages requests for content blocks.
pub trait QuotaService {
    /// Request `nblocks` blocks at the given priority.
    ///
    /// Returns how many were granted, anywhere in `0..=nblocks`. The caller
    /// must not mark more blocks than were granted and must eventually
    /// return every unused or discarded block with
    /// [`QuotaService::release_blocks`]. This call may be expensive: a
    /// request above `Readahead` priority may trigger eviction.
    fn request_blocks(&self, nblocks: u64, priority: Priority) -> u64;

    /// Return `nblocks` blocks to the pool. Always succeeds.
    fn release_blocks(&self, nblocks: u64);
}

impl QuotaService for FileCache {
    fn request_blocks(&self, nblocks: u64, priority: Priority) -> u64 {
        let mut inner = self.lock_inner();
        if inner.quota.blocks_total == 0 {
            inner.quota.blocks_used += nblocks;
            return nblocks;
        }

        let free = inner
            .quota
            .blocks_total
            .saturating_sub(inner.quota.blocks_used);
        if free < nblocks && priority > Priority::Readahead {
            let freed = evict(&mut inner, nblocks - free);
            debug!(requested = nblocks, free, freed, "evicted for admission");
        }

        let free = inner
            .quota
            .blocks_total
            .saturating_sub(inner.quota.blocks_used);
        let granted = free.min(nblocks);
        inner.quota.blocks_used += granted;
        granted
    }

    fn release_blocks(&self, nblocks: u64) {
        let mut inner = self.lock_inner();
        inner.quota.blocks_used = inner.quota.blocks_used.saturating_sub(nblocks);
    }
}

/// Free up to `want` blocks by discarding available blocks from victim
/// files, coldest first. Runs under the manager lock; victim inode locks
/// are only tried, never waited on.
fn evict(inner: &mut CacheInner, want: u64) -> u64 {
    let mut freed_total = 0;

    while freed_total < want {
        // Pick the file holding the globally coldest available block.
        let mut victim: Option<(String, Arc<std::sync::Mutex<Inode>>, u8)> = None;
        for (path, arc) in &inner.inodes {
            let Ok(mut guard) = arc.try_lock() else {
                continue;
            };
            let Inode::Regular(r) = &mut *guard else {
                continue;
            };
            if let Some(min) = r.min_available_actr()
                && victim.as_ref().is_none_or(|(_, _, best)| min < *best)
            {
                victim = Some((path.clone(), Arc::clone(arc), min));
            }
        }

        let Some((path, arc, _)) = victim else {
            break;
        };
        let Ok(mut guard) = arc.try_lock() else {
            break;
        };
        let Inode::Regular(r) = &mut *guard else {
            break;
        };

        let freed = r.evict_blocks(want - freed_total);
        if freed == 0 {
            break;
        }
        debug!(path, freed, "evicted blocks from victim file");
        freed_total += freed;
        inner.quota.blocks_used = inner.quota.blocks_used.saturating_sub(freed);
    }

    freed_total
}
