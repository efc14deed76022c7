//! The path-keyed cache manager.
//!
//! [`FileCache`] owns the mapping from normalized paths to inodes, the
//! dirty set awaiting writeback, the open-handle registry and the quota
//! record, all behind one coarse mutex. Every public operation normalizes
//! its path, takes that mutex, and ends mutating calls with a synchronous
//! writeback walk, so a fetch issued after a put on the same thread always
//! observes the new state — even across a crash, thanks to the safe-file
//! rename in the inode layer.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest as _, Sha256};
use tracing::{debug, error, warn};

use crate::cache::file::CacheFile;
use crate::cache::inode::{self, FORMAT_TOMBSTONE, Inode};
use crate::cache::quota::QuotaInfo;
use crate::error::CacheError;
use crate::fs::{DirEntry, FileStat};

/// Map the empty path and `"/"` to the canonical root spelling and force a
/// leading slash onto everything else.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    if path.is_empty() || path == "/" {
        return String::new();
    }
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

fn child_path(parent: &str, name: &str) -> String {
    format!("{parent}/{name}")
}

pub(crate) struct HandleEntry {
    file: Arc<CacheFile>,
}

/// Everything guarded by the manager mutex.
pub(crate) struct CacheInner {
    pub(crate) inodes: HashMap<String, Arc<Mutex<Inode>>>,
    pub(crate) dirty: HashSet<String>,
    pub(crate) handles: HashMap<String, HandleEntry>,
    pub(crate) quota: QuotaInfo,
}

/// The on-disk cache: a directory of per-path inode files plus per-file
/// content stores, fronted by an in-memory path map.
pub struct FileCache {
    root_dir: PathBuf,
    pub(crate) inner: Mutex<CacheInner>,
}

impl FileCache {
    /// Open (or create) a cache rooted at `root_dir`, allowed to hold up to
    /// `blocks_total` content blocks. A total of 0 means unlimited.
    pub fn open(
        root_dir: impl Into<PathBuf>,
        blocks_total: u64,
    ) -> Result<Arc<Self>, CacheError> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir)?;
        Ok(Arc::new(Self {
            root_dir,
            inner: Mutex::new(CacheInner {
                inodes: HashMap::new(),
                dirty: HashSet::new(),
                handles: HashMap::new(),
                quota: QuotaInfo {
                    blocks_total,
                    blocks_used: 0,
                },
            }),
        }))
    }

    /// The cache's block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> u64 {
        super::BLOCK_SIZE
    }

    /// A snapshot of the quota record.
    #[must_use]
    pub fn quota(&self) -> QuotaInfo {
        self.lock_inner().quota
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Storage file for `path`: `<3>/<3>/<rest>` of the URL-safe base64
    /// SHA-256 of the path, under the cache root, plus a suffix (`""` for
    /// the inode file, `".data"` for content bytes). Two paths with
    /// colliding hashes would alias; accepted.
    pub(crate) fn storage_path(&self, path: &str, suffix: &str) -> PathBuf {
        let encoded = URL_SAFE_NO_PAD.encode(Sha256::digest(path.as_bytes()));
        let (p1, rest) = encoded.split_at(3);
        let (p2, p3) = rest.split_at(3);
        self.root_dir.join(p1).join(p2).join(format!("{p3}{suffix}"))
    }

    /// Look up or load the inode for `path`.
    ///
    /// A missing storage file maps to [`CacheError::Unavailable`] — the
    /// cache has no information. Undecodable files surface as `BadFormat`.
    fn get_inode(
        &self,
        inner: &mut CacheInner,
        path: &str,
    ) -> Result<Arc<Mutex<Inode>>, CacheError> {
        if let Some(existing) = inner.inodes.get(path) {
            return Ok(Arc::clone(existing));
        }

        let storage = self.storage_path(path, "");
        match inode::open_inode(&storage) {
            Ok(loaded) => {
                if let Inode::Regular(r) = &loaded {
                    inner.quota.blocks_used += r.blocks_used;
                }
                let arc = Arc::new(Mutex::new(loaded));
                inner.inodes.insert(path.to_owned(), Arc::clone(&arc));
                Ok(arc)
            }
            Err(CacheError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::Unavailable)
            }
            Err(e) => {
                warn!(path, error = %e, "failed to load inode");
                Err(e)
            }
        }
    }

    /// Get the inode for `path`, replacing whatever is there if its format
    /// does not match. Directory replacement recursively purges children.
    fn require_inode(
        &self,
        inner: &mut CacheInner,
        path: &str,
        format: u32,
    ) -> Result<Arc<Mutex<Inode>>, CacheError> {
        match self.get_inode(inner, path) {
            Ok(existing) => {
                let existing_format = existing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .format();
                if existing_format == format {
                    return Ok(existing);
                }
                debug!(
                    path,
                    old_format = existing_format,
                    new_format = format,
                    "replacing inode of mismatching format"
                );
                self.purge_inode(inner, path);
            }
            Err(CacheError::Unavailable) => {}
            Err(e) => {
                // A stale or undecodable file stands where the new inode
                // must go; clear it out.
                debug!(path, error = %e, "clearing unreadable inode before replacement");
                self.purge_inode(inner, path);
            }
        }

        let inode = inode::create_empty_inode(self.storage_path(path, ""), format)?;
        let arc = Arc::new(Mutex::new(inode));
        inner.inodes.insert(path.to_owned(), Arc::clone(&arc));
        inner.dirty.insert(path.to_owned());
        Ok(arc)
    }

    /// Remove `path` from the maps and delete its on-disk artifacts,
    /// recursing into directory children.
    fn purge_inode(&self, inner: &mut CacheInner, path: &str) {
        // Load the inode if it is only on disk, so directory children can
        // be purged recursively too.
        let removed = match inner.inodes.remove(path) {
            Some(arc) => Some(arc),
            None => self
                .get_inode(inner, path)
                .ok()
                .and_then(|_| inner.inodes.remove(path)),
        };
        inner.dirty.remove(path);
        inner.handles.remove(path);

        if let Some(arc) = removed {
            let children: Option<Vec<String>> = {
                let guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
                match &*guard {
                    Inode::Directory(d) => Some(d.children.clone()),
                    Inode::Regular(r) => {
                        inner.quota.blocks_used =
                            inner.quota.blocks_used.saturating_sub(r.blocks_used);
                        None
                    }
                    _ => None,
                }
            };
            if let Some(children) = children {
                for child in children {
                    self.purge_inode(inner, &child_path(path, &child));
                }
            }
        }

        for suffix in ["", ".data"] {
            if let Err(e) = std::fs::remove_file(self.storage_path(path, suffix))
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path, suffix, error = %e, "failed to remove inode artifact");
            }
        }
    }

    /// Sync every dirty inode. Failures are logged and the inode stays
    /// dirty for a later retry; they never abort the calling operation.
    fn writeback(&self, inner: &mut CacheInner) {
        let dirty: Vec<String> = inner.dirty.iter().cloned().collect();
        for path in dirty {
            let Some(arc) = inner.inodes.get(&path).map(Arc::clone) else {
                inner.dirty.remove(&path);
                continue;
            };
            let mut guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
            match guard.sync() {
                Ok(()) => {
                    inner.dirty.remove(&path);
                }
                Err(e) => {
                    error!(path, error = %e, "failed to sync inode; keeping it dirty");
                }
            }
        }
    }

    fn put_attr_locked(
        &self,
        inner: &mut CacheInner,
        path: &str,
        stat: &FileStat,
    ) -> Result<(), CacheError> {
        let arc = self.require_inode(inner, path, stat.format())?;
        let discarded = {
            let mut guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
            guard.apply_stat(stat)?
        };
        inner.quota.blocks_used = inner.quota.blocks_used.saturating_sub(discarded);
        inner.dirty.insert(path.to_owned());
        Ok(())
    }

    fn fetch_attr_locked(
        &self,
        inner: &mut CacheInner,
        path: &str,
    ) -> Result<FileStat, CacheError> {
        let arc = self.get_inode(inner, path)?;
        let guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_tombstone() {
            return Err(CacheError::NotFound);
        }
        Ok(guard.stat_view())
    }

    /// Record the attributes observed at `path`. A type change replaces
    /// the previous inode, recursively purging directory children.
    pub fn put_attr(&self, path: &str, stat: &FileStat) -> Result<(), CacheError> {
        let path = normalize_path(path);
        let mut inner = self.lock_inner();
        self.put_attr_locked(&mut inner, &path, stat)?;
        self.writeback(&mut inner);
        Ok(())
    }

    /// Record a symlink destination observed at `path`.
    pub fn put_link(&self, path: &str, dest: &str) -> Result<(), CacheError> {
        let path = normalize_path(path);
        let mut inner = self.lock_inner();
        let arc = self.require_inode(&mut inner, &path, libc::S_IFLNK)?;
        {
            // The inode mutex still serializes against open handles even
            // though the manager lock is held.
            let mut guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
            let Inode::Symlink(l) = &mut *guard else {
                unreachable!("require_inode returned a non-symlink for S_IFLNK");
            };
            l.dest = dest.to_owned();
        }
        inner.dirty.insert(path);
        self.writeback(&mut inner);
        Ok(())
    }

    /// Record a directory listing observed at `path`. Children are stored
    /// by leaf name and each child's attributes are put under
    /// `path + "/" + name`.
    pub fn put_dir(&self, path: &str, entries: &[DirEntry]) -> Result<(), CacheError> {
        let path = normalize_path(path);
        let mut inner = self.lock_inner();
        let arc = self.require_inode(&mut inner, &path, libc::S_IFDIR)?;
        {
            let mut guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
            let Inode::Directory(d) = &mut *guard else {
                unreachable!("require_inode returned a non-directory for S_IFDIR");
            };
            d.children = entries.iter().map(|e| e.name.clone()).collect();
        }
        for entry in entries {
            let child = child_path(&path, &entry.name);
            if let Err(e) = self.put_attr_locked(&mut inner, &child, &entry.stat) {
                warn!(path = %child, error = %e, "failed to cache directory child");
            }
        }
        inner.dirty.insert(path);
        self.writeback(&mut inner);
        Ok(())
    }

    /// Record that `path` does not exist: purge whatever the cache holds
    /// for it and persist a tombstone so the knowledge survives restarts.
    pub fn put_non_existent(&self, path: &str) -> Result<(), CacheError> {
        let path = normalize_path(path);
        let mut inner = self.lock_inner();
        self.purge_inode(&mut inner, &path);

        let inode = inode::create_empty_inode(self.storage_path(&path, ""), FORMAT_TOMBSTONE)?;
        inner
            .inodes
            .insert(path.clone(), Arc::new(Mutex::new(inode)));
        inner.dirty.insert(path);
        self.writeback(&mut inner);
        Ok(())
    }

    /// Attributes of `path`. [`CacheError::NotFound`] on a tombstone,
    /// [`CacheError::Unavailable`] when the cache has no information.
    pub fn fetch_attr(&self, path: &str) -> Result<FileStat, CacheError> {
        let path = normalize_path(path);
        let mut inner = self.lock_inner();
        self.fetch_attr_locked(&mut inner, &path)
    }

    /// Destination of the symlink at `path`. [`CacheError::NotSymlink`]
    /// if the inode is some other kind.
    pub fn fetch_link(&self, path: &str) -> Result<String, CacheError> {
        let path = normalize_path(path);
        let mut inner = self.lock_inner();
        let arc = self.get_inode(&mut inner, &path)?;
        let guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
        match &*guard {
            Inode::Symlink(l) => Ok(l.dest.clone()),
            Inode::Tombstone(_) => Err(CacheError::NotFound),
            other => {
                debug!(path, format = other.format(), "fetch_link on a non-symlink");
                Err(CacheError::NotSymlink)
            }
        }
    }

    /// Entries of the directory at `path`, each materialized from the
    /// child's cached attributes. [`CacheError::NotDirectory`] if the
    /// inode is some other kind.
    pub fn fetch_dir(&self, path: &str) -> Result<Vec<DirEntry>, CacheError> {
        let path = normalize_path(path);
        let mut inner = self.lock_inner();
        let arc = self.get_inode(&mut inner, &path)?;
        let children: Vec<String> = {
            let guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
            match &*guard {
                Inode::Directory(d) => d.children.clone(),
                Inode::Tombstone(_) => return Err(CacheError::NotFound),
                other => {
                    debug!(path, format = other.format(), "fetch_dir on a non-directory");
                    return Err(CacheError::NotDirectory);
                }
            }
        };

        let mut entries = Vec::with_capacity(children.len());
        for name in children {
            // A child that cannot be loaded still appears in the listing,
            // with empty attributes; directory blocks are reported as 0.
            let stat = self
                .fetch_attr_locked(&mut inner, &child_path(&path, &name))
                .unwrap_or_default();
            entries.push(DirEntry {
                name,
                stat: FileStat { blocks: 0, ..stat },
            });
        }
        Ok(entries)
    }

    /// Open the regular file at `path` for reading and admission.
    ///
    /// Opening an already-open path returns the same handle and bumps its
    /// refcount; the two are indistinguishable by design.
    pub fn open_file(self: &Arc<Self>, path: &str) -> Result<Arc<CacheFile>, CacheError> {
        let path = normalize_path(path);
        let mut inner = self.lock_inner();

        let arc = self.get_inode(&mut inner, &path)?;
        {
            let mut guard = arc.lock().unwrap_or_else(PoisonError::into_inner);
            match &mut *guard {
                Inode::Tombstone(_) => return Err(CacheError::NotFound),
                Inode::Regular(r) => {
                    if let Some(entry) = inner.handles.get(&path) {
                        r.refcount += 1;
                        return Ok(Arc::clone(&entry.file));
                    }
                    r.ensure_data_file()?;
                    r.refcount = 1;
                }
                other => {
                    debug!(path, format = other.format(), "open_file on a non-file");
                    return Err(CacheError::NotImplemented);
                }
            }
        }

        let file = Arc::new(CacheFile::new(
            Arc::downgrade(self),
            path.clone(),
            Arc::clone(&arc),
        ));
        inner.handles.insert(
            path,
            HandleEntry {
                file: Arc::clone(&file),
            },
        );
        Ok(file)
    }

    /// Drop one reference from `file`. Called by [`CacheFile::close`]; the
    /// last reference syncs and closes the underlying inode and removes
    /// the registration.
    pub(crate) fn release_handle(&self, file: &CacheFile) {
        let mut inner = self.lock_inner();
        let mut guard = file
            .inode()
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Inode::Regular(r) = &mut *guard else {
            return;
        };

        r.refcount = r.refcount.saturating_sub(1);
        if r.refcount > 0 {
            return;
        }

        if let Err(e) = r.close() {
            warn!(path = file.path(), error = %e, "failed to close cached file");
        }
        // Only deregister if the registry still points at this handle; the
        // path may have been purged and reopened meanwhile.
        if let Some(entry) = inner.handles.get(file.path())
            && std::ptr::eq(Arc::as_ptr(&entry.file), file)
        {
            inner.handles.remove(file.path());
        }
    }

    /// Flush all dirty inodes and tear down open handles.
    pub fn close(&self) {
        let mut inner = self.lock_inner();
        self.writeback(&mut inner);

        let handles: Vec<HandleEntry> = inner.handles.drain().map(|(_, e)| e).collect();
        for entry in handles {
            let mut guard = entry
                .file
                .inode()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Inode::Regular(r) = &mut *guard {
                r.refcount = 0;
                if let Err(e) = r.close() {
                    warn!(path = entry.file.path(), error = %e, "failed to close cached file");
                }
            }
        }
        inner.inodes.clear();
        inner.dirty.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_slash_normalize_to_root() {
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("/"), "");
    }

    #[test]
    fn missing_leading_slash_is_added() {
        assert_eq!(normalize_path("foo/bar"), "/foo/bar");
        assert_eq!(normalize_path("/foo/bar"), "/foo/bar");
    }

    #[test]
    fn storage_paths_shard_by_hash_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::open(tmp.path(), 0).unwrap();

        let storage = cache.storage_path("/some/path", "");
        let relative = storage.strip_prefix(tmp.path()).unwrap();
        let parts: Vec<_> = relative.components().collect();
        assert_eq!(parts.len(), 3, "expected <3>/<3>/<rest> sharding");
        assert_eq!(parts[0].as_os_str().len(), 3);
        assert_eq!(parts[1].as_os_str().len(), 3);

        let data = cache.storage_path("/some/path", ".data");
        assert_eq!(
            data.file_name().unwrap().len(),
            storage.file_name().unwrap().len() + 5
        );
    }

    #[test]
    fn storage_key_is_padding_free_base64() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = FileCache::open(tmp.path(), 0).unwrap();

        let storage = cache.storage_path("/x", "");
        let name = storage.to_string_lossy();
        assert!(!name.contains('='), "trailing padding must be stripped");
        assert!(!name.contains('+') && !name.contains("//"), "must be URL-safe");
    }
}
