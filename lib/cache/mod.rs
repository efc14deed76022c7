//! The on-disk cache core.
//!
//! A [`manager::FileCache`] maps normalized paths to persistent inodes. Each
//! inode lives in one file under a hashed storage key; regular inodes
//! additionally own a `.data` file of raw content bytes and a memory-mapped
//! blockmap recording which 4 KiB blocks of that content are present.
//!
//! Lock hierarchy, outermost first: the manager mutex (path map, dirty set,
//! quota record, type changes), then any single inode mutex (attributes,
//! children, destination, blockmap and data file). Code must never take the
//! manager mutex while holding an inode mutex.

/// Mmap'd per-file availability map with 16-bit block entries.
pub mod blockmap;
/// Versioned binary codec for inode files.
pub mod codec;
/// Open-handle for reading and admitting file content.
pub mod file;
/// Range-coalescing ID allocator.
pub mod id_range;
/// Inode variants and their persistence.
pub mod inode;
/// The path-keyed cache manager.
pub mod manager;
/// Block accounting, admission and eviction.
pub mod quota;
/// Regular-file inodes: blockmap plus `.data` file.
pub mod regular;

/// Size of one content block in bytes.
///
/// Everything block-granular in the cache (the blockmap, quota accounting,
/// read alignment) is expressed in units of this constant.
pub const BLOCK_SIZE: u64 = 4096;

/// Number of blocks needed to hold `nbytes` bytes.
#[must_use]
pub fn blocks_for(nbytes: u64) -> u64 {
    nbytes.div_ceil(BLOCK_SIZE)
}
