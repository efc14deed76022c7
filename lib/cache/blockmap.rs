//! Per-file block availability tracking.
//!
//! A regular inode's metadata file holds, after its 128-byte header region,
//! one 16-bit entry per 4 KiB content block. The entry layout is
//!
//! ```text
//! bit 15      DIRTY (reserved for future write-back, preserved, never set)
//! bits 14..12 reserved
//! bits 11..8  reserved, zero
//! bits  7..0  saturating access counter (ACTR)
//! ```
//!
//! A block's bytes are present in the `.data` file exactly when its access
//! counter is nonzero. The counter doubles as the eviction score: it is
//! bumped on every touch, halved across the whole file when any counter
//! saturates, and zeroed on discard.
//!
//! Entries are **host-endian by design**: the region is memory-mapped and
//! updated in place, and paying a byte swap on every access would defeat
//! the point. The format version byte is the upgrade hook if the cache ever
//! needs to move between hosts.

use std::fs::File;

use bitflags::bitflags;
use memmap2::MmapMut;

/// Byte offset of the first blockmap entry in the metadata file.
pub const HEADER_SIZE: u64 = 128;

/// Size of one blockmap entry in bytes.
pub const ENTRY_SIZE: u64 = 2;

bitflags! {
    /// Flag bits of a blockmap entry (the high nibble).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BlockFlags: u16 {
        /// The block holds bytes not yet written back to the source.
        /// Reserved: readers preserve it, the current core never sets it.
        const DIRTY = 1 << 15;
        /// Reserved.
        const RSVD0 = 1 << 14;
        /// Reserved.
        const RSVD1 = 1 << 13;
        /// Reserved.
        const RSVD2 = 1 << 12;
    }
}

/// One 16-bit blockmap entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockInfo(u16);

impl BlockInfo {
    /// Saturation point of the access counter.
    pub const ACTR_MAX: u8 = 255;

    const ACTR_MASK: u16 = 0x00ff;

    /// Rebuild an entry from its raw wire value.
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// The raw wire value of this entry.
    #[must_use]
    pub fn raw(self) -> u16 {
        self.0
    }

    /// The access counter.
    #[must_use]
    #[expect(clippy::cast_possible_truncation, reason = "masked to the low byte")]
    pub fn actr(self) -> u8 {
        (self.0 & Self::ACTR_MASK) as u8
    }

    fn set_actr(&mut self, value: u8) {
        self.0 = (self.0 & !Self::ACTR_MASK) | u16::from(value);
    }

    /// Whether the block's bytes are present in the data file.
    #[must_use]
    pub fn is_available(self) -> bool {
        self.actr() != 0
    }

    /// Increase the access counter.
    ///
    /// Counters saturate: once at the maximum they stay there. Returns
    /// `(was_new, now_max)` where `was_new` says the counter was zero before
    /// the touch and `now_max` says it is now at its maximum.
    pub fn touch(&mut self) -> (bool, bool) {
        let ctr = self.actr();
        if ctr == Self::ACTR_MAX {
            return (false, true);
        }
        let was_new = ctr == 0;
        let ctr = ctr + 1;
        self.set_actr(ctr);
        (was_new, ctr == Self::ACTR_MAX)
    }

    /// Halve the access counter, keeping nonzero counters nonzero.
    pub fn shift(&mut self) {
        let ctr = self.actr();
        if ctr == 0 {
            return;
        }
        self.set_actr((ctr >> 1).max(1));
    }

    /// Zero the whole entry. Returns whether the block was available.
    pub fn discard(&mut self) -> bool {
        let existed = self.is_available();
        self.0 = 0;
        existed
    }

    /// Set the dirty flag.
    pub fn mark_dirty(&mut self) {
        self.0 |= BlockFlags::DIRTY.bits();
    }

    /// Whether the dirty flag is set.
    #[must_use]
    pub fn is_dirty(self) -> bool {
        self.0 & BlockFlags::DIRTY.bits() != 0
    }
}

/// The memory-mapped blockmap region of a regular inode's metadata file.
///
/// The whole metadata file is mapped; entries start at byte
/// [`HEADER_SIZE`]. The map must be dropped before the file is truncated
/// and re-created afterwards (see `RegularInode::resize`).
#[derive(Debug)]
pub struct Blockmap {
    map: MmapMut,
}

impl Blockmap {
    /// Map `file`'s blockmap region.
    ///
    /// # Panics
    ///
    /// Panics if the mapping fails or if the file is shorter than the
    /// header region. Both mean the metadata file under our feet no longer
    /// matches the inode, and continuing would serve corrupt data.
    #[must_use]
    pub fn map(file: &File) -> Self {
        // SAFETY: the metadata file is created with O_EXCL under a directory
        // of mode 0700 and only mutated through this process; no other
        // mapping of it exists.
        let map = unsafe { MmapMut::map_mut(file) }.unwrap_or_else(|e| {
            panic!("failed to map blockmap into memory: {e}");
        });
        assert!(
            map.len() as u64 >= HEADER_SIZE,
            "metadata file shorter than its header ({} bytes)",
            map.len(),
        );
        Self { map }
    }

    /// Number of entries the mapped region can hold.
    #[must_use]
    pub fn len_entries(&self) -> u64 {
        (self.map.len() as u64 - HEADER_SIZE) / ENTRY_SIZE
    }

    fn offset(index: u64) -> usize {
        usize::try_from(HEADER_SIZE + index * ENTRY_SIZE)
            .unwrap_or_else(|_| unreachable!("blockmap offsets fit in usize on 64-bit hosts"))
    }

    /// Read the entry for `block`.
    #[must_use]
    pub fn get(&self, block: u64) -> BlockInfo {
        let at = Self::offset(block);
        let raw = u16::from_ne_bytes([self.map[at], self.map[at + 1]]);
        BlockInfo::from_raw(raw)
    }

    /// Write the entry for `block`.
    pub fn set(&mut self, block: u64, entry: BlockInfo) {
        let at = Self::offset(block);
        self.map[at..at + 2].copy_from_slice(&entry.raw().to_ne_bytes());
    }

    /// Apply `f` to the entry for `block` and store the result.
    pub fn update<T>(&mut self, block: u64, f: impl FnOnce(&mut BlockInfo) -> T) -> T {
        let mut entry = self.get(block);
        let result = f(&mut entry);
        self.set(block, entry);
        result
    }

    /// Halve every access counter in `[0, nblocks)`.
    pub fn shift_all(&mut self, nblocks: u64) {
        for block in 0..nblocks.min(self.len_entries()) {
            self.update(block, BlockInfo::shift);
        }
    }

    /// Flush the mapped region to disk.
    pub fn flush(&self) -> std::io::Result<()> {
        self.map.flush()
    }
}
