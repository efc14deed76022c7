//! stashfs: a transparent, block-granular overlay cache for hierarchical
//! filesystems.
//!
//! A *source* filesystem (local subtree, SFTP, anything implementing
//! [`fs::PathFs`]) holds the authoritative data; the [`fs::overlay::Overlay`]
//! serves clients from it while it is reachable, feeding everything it sees
//! — directory listings, symlinks, attributes and 4 KiB-aligned file
//! content — into a persistent [`cache::manager::FileCache`]. When the
//! source goes away, reads keep working from the cache, degrading to an I/O
//! error only where the requested data was never cached.

/// The on-disk cache core: inodes, blockmaps, quota.
pub mod cache;
/// TOML-backed configuration.
pub mod config;
/// The crate-wide error taxonomy.
pub mod error;
/// Filesystem contracts and the caching overlay.
pub mod fs;
/// Atomic file replacement and hole punching.
pub mod io;
