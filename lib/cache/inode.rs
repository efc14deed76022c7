//! Inode variants and their persistence.
//!
//! An inode is a tagged variant over regular files, directories, symlinks
//! and tombstones, all sharing an [`InodeBase`] of attributes and the
//! canonical storage path. The path lives *inside* the inode; parents are
//! derived from path prefixes, so there are no back-pointers and no cycles.
//!
//! Persistence differs by kind. Symlinks, directories and tombstones are
//! rewritten wholesale through a [`SafeFile`], so a crash leaves the old
//! version intact. Regular inodes rewrite their fixed-size header in place:
//! their blockmap is mutated through an mmap anyway, and the safe-rename
//! trick cannot apply to a file that is concurrently mapped.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::cache::codec::{self, BaseHeader};
use crate::cache::regular::RegularInode;
use crate::error::{CacheError, FormatError};
use crate::fs::FileStat;
use crate::io::SafeFile;

/// Format bits used for tombstone inodes. Real kinds use `S_IFMT` values,
/// which are always nonzero.
pub const FORMAT_TOMBSTONE: u32 = 0;

/// Attributes shared by every inode kind.
#[derive(Debug, Clone)]
pub struct InodeBase {
    /// Path of the inode's metadata file under the cache root.
    pub(crate) storage_path: PathBuf,
    pub(crate) mode: u32,
    pub(crate) uid: u32,
    pub(crate) gid: u32,
    pub(crate) perms_modified: bool,
    pub(crate) mtime: u64,
    pub(crate) atime: u64,
    pub(crate) ctime: u64,
    pub(crate) times_modified: bool,
    pub(crate) size: u64,
}

impl InodeBase {
    pub(crate) fn new(storage_path: PathBuf, format: u32) -> Self {
        Self {
            storage_path,
            mode: format,
            uid: 0,
            gid: 0,
            perms_modified: false,
            mtime: 0,
            atime: 0,
            ctime: 0,
            times_modified: false,
            size: 0,
        }
    }

    pub(crate) fn from_header(storage_path: PathBuf, header: BaseHeader) -> Self {
        Self {
            storage_path,
            mode: header.mode,
            uid: header.uid,
            gid: header.gid,
            perms_modified: header.perms_modified,
            mtime: header.mtime,
            atime: header.atime,
            ctime: header.ctime,
            times_modified: header.times_modified,
            size: header.size,
        }
    }

    pub(crate) fn header(&self) -> BaseHeader {
        BaseHeader {
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            perms_modified: self.perms_modified,
            mtime: self.mtime,
            atime: self.atime,
            ctime: self.ctime,
            times_modified: self.times_modified,
            size: self.size,
        }
    }

    /// Replace the permission bits, keeping the format bits untouched.
    pub fn chmod(&mut self, perms: u32) {
        const MASK: u32 = (libc::S_IRWXU | libc::S_IRWXG | libc::S_IRWXO) as u32;
        self.mode = (self.mode & !MASK) | (perms & MASK);
    }

    /// Replace the owner.
    pub fn chown(&mut self, uid: u32, gid: u32) {
        self.uid = uid;
        self.gid = gid;
    }
}

/// A symlink inode.
#[derive(Debug)]
pub struct LinkInode {
    pub(crate) base: InodeBase,
    pub(crate) dest: String,
}

/// A directory inode. `children` holds leaf names only; a child's full
/// path is `parent + "/" + name`.
#[derive(Debug)]
pub struct DirInode {
    pub(crate) base: InodeBase,
    pub(crate) children: Vec<String>,
}

/// A persisted statement that the path does not exist on the source.
///
/// Tombstones let a fetch distinguish "known absent" (`NotFound`) from
/// "never observed" (`Unavailable`) after a restart.
#[derive(Debug)]
pub struct TombstoneInode {
    pub(crate) base: InodeBase,
}

/// A cached inode of any kind.
#[derive(Debug)]
pub enum Inode {
    /// A regular file with blockmap and data file.
    Regular(RegularInode),
    /// A directory listing.
    Directory(DirInode),
    /// A symbolic link.
    Symlink(LinkInode),
    /// A negative-cache entry.
    Tombstone(TombstoneInode),
}

impl Inode {
    pub(crate) fn base(&self) -> &InodeBase {
        match self {
            Self::Regular(r) => &r.base,
            Self::Directory(d) => &d.base,
            Self::Symlink(l) => &l.base,
            Self::Tombstone(t) => &t.base,
        }
    }

    pub(crate) fn base_mut(&mut self) -> &mut InodeBase {
        match self {
            Self::Regular(r) => &mut r.base,
            Self::Directory(d) => &mut d.base,
            Self::Symlink(l) => &mut l.base,
            Self::Tombstone(t) => &mut t.base,
        }
    }

    /// The `S_IFMT` format bits, or [`FORMAT_TOMBSTONE`] for tombstones.
    #[must_use]
    pub fn format(&self) -> u32 {
        self.base().mode & libc::S_IFMT
    }

    /// Whether this inode is a negative-cache entry.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone(_))
    }

    /// A stat view of this inode. `blocks` reports *cached* blocks for
    /// regular files and 0 for everything else.
    #[must_use]
    pub fn stat_view(&self) -> FileStat {
        let base = self.base();
        FileStat {
            mode: base.mode,
            uid: base.uid,
            gid: base.gid,
            mtime: base.mtime,
            atime: base.atime,
            ctime: base.ctime,
            size: base.size,
            blocks: match self {
                Self::Regular(r) => r.blocks(),
                _ => 0,
            },
        }
    }

    /// Copy attributes from `stat` into this inode. For regular inodes the
    /// size change goes through `resize`; the returned count is the number
    /// of cached blocks that became invalid and must be handed back to the
    /// quota.
    pub(crate) fn apply_stat(&mut self, stat: &FileStat) -> Result<u64, CacheError> {
        {
            let base = self.base_mut();
            base.chmod(stat.mode);
            base.chown(stat.uid, stat.gid);
            base.mtime = stat.mtime;
            base.atime = stat.atime;
            base.ctime = stat.ctime;
        }
        match self {
            Self::Regular(r) => {
                if r.base.size == stat.size {
                    return Ok(0);
                }
                r.resize(stat.size)
            }
            other => {
                other.base_mut().size = stat.size;
                Ok(0)
            }
        }
    }

    /// Write the inode to its storage path.
    pub fn sync(&mut self) -> Result<(), CacheError> {
        match self {
            Self::Regular(r) => r.sync(),
            Self::Symlink(l) => {
                let mut file = SafeFile::create(&l.base.storage_path)?;
                codec::write_base(&mut file, &l.base.header())?;
                codec::write_link_ext(&mut file, &l.dest)?;
                file.commit()?;
                Ok(())
            }
            Self::Directory(d) => {
                let mut file = SafeFile::create(&d.base.storage_path)?;
                codec::write_base(&mut file, &d.base.header())?;
                codec::write_dir_ext(&mut file, &d.children)?;
                file.commit()?;
                Ok(())
            }
            Self::Tombstone(t) => {
                let mut file = SafeFile::create(&t.base.storage_path)?;
                codec::write_base(&mut file, &t.base.header())?;
                codec::write_neg_ext(&mut file)?;
                file.commit()?;
                Ok(())
            }
        }
    }

    /// Write the inode out and release its handles.
    pub fn close(&mut self) -> Result<(), CacheError> {
        match self {
            Self::Regular(r) => r.close(),
            other => other.sync(),
        }
    }
}

/// Open the inode stored at `storage_path`.
///
/// The metadata file stays open (and owned by the inode) only for regular
/// inodes, which keep using it for the blockmap.
pub fn open_inode(storage_path: &Path) -> Result<Inode, CacheError> {
    let file = File::options().read(true).write(true).open(storage_path)?;
    let mut reader = BufReader::new(&file);

    let header = codec::read_base(&mut reader)?;
    let base = InodeBase::from_header(storage_path.to_path_buf(), header);

    match base.mode & libc::S_IFMT {
        libc::S_IFLNK => {
            let dest = codec::read_link_ext(&mut reader)?;
            Ok(Inode::Symlink(LinkInode { base, dest }))
        }
        libc::S_IFDIR => {
            let children = codec::read_dir_ext(&mut reader)?;
            Ok(Inode::Directory(DirInode { base, children }))
        }
        libc::S_IFREG => {
            let blocks_used = codec::read_reg_ext(&mut reader)?;
            drop(reader);
            Ok(Inode::Regular(RegularInode::from_parts(
                base,
                blocks_used,
                file,
            )))
        }
        FORMAT_TOMBSTONE => {
            codec::read_neg_ext(&mut reader)?;
            Ok(Inode::Tombstone(TombstoneInode { base }))
        }
        other => Err(FormatError::UnsupportedFormat(other).into()),
    }
}

/// Create an in-memory inode of the given format with zeroed attributes.
///
/// For regular inodes this also creates and opens the metadata file with
/// `O_CREAT | O_EXCL`; any stale file must have been purged first.
pub fn create_empty_inode(storage_path: PathBuf, format: u32) -> Result<Inode, CacheError> {
    let base = InodeBase::new(storage_path, format);
    match format {
        libc::S_IFLNK => Ok(Inode::Symlink(LinkInode {
            base,
            dest: String::new(),
        })),
        libc::S_IFDIR => Ok(Inode::Directory(DirInode {
            base,
            children: Vec::new(),
        })),
        libc::S_IFREG => Ok(Inode::Regular(RegularInode::create(base)?)),
        FORMAT_TOMBSTONE => Ok(Inode::Tombstone(TombstoneInode { base })),
        other => Err(FormatError::UnsupportedFormat(other).into()),
    }
}

/// Create an inode with attributes copied from `stat`.
///
/// Regular inodes start at size zero and are resized to `stat.size` as a
/// separate step, so the blockmap region lines up with the size from the
/// beginning.
pub fn create_inode(storage_path: PathBuf, stat: &FileStat) -> Result<Inode, CacheError> {
    let mut inode = create_empty_inode(storage_path, stat.mode & libc::S_IFMT)?;
    inode.apply_stat(stat)?;
    Ok(inode)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn link_inode_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = storage(&tmp, "link");

        let mut inode = create_empty_inode(path.clone(), libc::S_IFLNK).unwrap();
        if let Inode::Symlink(l) = &mut inode {
            l.dest = "../target".to_owned();
            l.base.mtime = 42;
        }
        inode.sync().unwrap();

        let reopened = open_inode(&path).unwrap();
        let Inode::Symlink(l) = &reopened else {
            panic!("expected a symlink inode");
        };
        assert_eq!(l.dest, "../target");
        assert_eq!(l.base.mtime, 42);
    }

    #[test]
    fn dir_inode_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = storage(&tmp, "dir");

        let mut inode = create_empty_inode(path.clone(), libc::S_IFDIR).unwrap();
        if let Inode::Directory(d) = &mut inode {
            d.children = vec!["a".to_owned(), "b".to_owned()];
        }
        inode.sync().unwrap();

        let reopened = open_inode(&path).unwrap();
        let Inode::Directory(d) = &reopened else {
            panic!("expected a directory inode");
        };
        assert_eq!(d.children, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn tombstone_round_trips_through_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = storage(&tmp, "gone");

        let mut inode = create_empty_inode(path.clone(), FORMAT_TOMBSTONE).unwrap();
        inode.sync().unwrap();

        assert!(open_inode(&path).unwrap().is_tombstone());
    }

    #[test]
    fn regular_inode_persists_size_and_blocks() {
        let tmp = tempfile::tempdir().unwrap();
        let path = storage(&tmp, "file");

        let mut inode = create_empty_inode(path.clone(), libc::S_IFREG).unwrap();
        if let Inode::Regular(r) = &mut inode {
            r.resize(8192).unwrap();
            r.set_written(0, 2);
        }
        inode.close().unwrap();
        drop(inode);

        let mut reopened = open_inode(&path).unwrap();
        let Inode::Regular(r) = &mut reopened else {
            panic!("expected a regular inode");
        };
        assert_eq!(r.base.size, 8192);
        assert_eq!(r.blocks(), 2);
        assert!(r.is_available(0));
        assert!(r.is_available(1));
    }

    #[test]
    fn chmod_preserves_format_bits() {
        let mut base = InodeBase::new(PathBuf::from("/x"), libc::S_IFREG);
        base.chmod(0o7777);
        assert_eq!(base.mode & libc::S_IFMT, libc::S_IFREG);
        assert_eq!(base.mode & 0o777, 0o777);

        base.chmod(0o640);
        assert_eq!(base.mode & 0o777, 0o640);
        assert_eq!(base.mode & libc::S_IFMT, libc::S_IFREG);
    }

    #[test]
    fn create_inode_copies_the_stat() {
        let tmp = tempfile::tempdir().unwrap();
        let stat = FileStat {
            mode: libc::S_IFREG | 0o600,
            uid: 7,
            gid: 8,
            mtime: 1,
            atime: 2,
            ctime: 3,
            size: 4097,
            blocks: 99,
        };

        let inode = create_inode(storage(&tmp, "file"), &stat).unwrap();
        let view = inode.stat_view();
        assert_eq!(view.mode, stat.mode);
        assert_eq!(view.uid, 7);
        assert_eq!(view.size, 4097);
        assert_eq!(view.blocks, 0, "no blocks are cached yet");

        let Inode::Regular(r) = &inode else {
            panic!("expected a regular inode");
        };
        assert_eq!(r.size_blocks(), 2, "size must be applied via resize");
    }

    #[test]
    fn unknown_format_bits_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let err = create_empty_inode(storage(&tmp, "sock"), libc::S_IFSOCK).unwrap_err();
        assert!(
            matches!(
                err,
                CacheError::BadFormat(FormatError::UnsupportedFormat(_))
            ),
            "got {err:?}"
        );
    }
}
