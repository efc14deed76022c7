#![allow(clippy::unwrap_used, missing_docs)]

//! Manager-level round trips: put, fetch, restart, replace, tombstone.

use stashfs::cache::manager::FileCache;
use stashfs::error::CacheError;
use stashfs::fs::{DirEntry, FileStat};

fn dir_stat(mtime: u64) -> FileStat {
    FileStat {
        mode: libc::S_IFDIR | 0o755,
        uid: 6789,
        gid: 7890,
        mtime,
        atime: mtime + 1,
        ctime: mtime + 2,
        size: 4567,
        blocks: 1024,
    }
}

fn reg_stat(size: u64) -> FileStat {
    FileStat {
        mode: libc::S_IFREG | 0o644,
        uid: 1000,
        gid: 1000,
        mtime: 11,
        atime: 12,
        ctime: 13,
        size,
        blocks: 7,
    }
}

fn assert_stat_matches(expected: &FileStat, actual: &FileStat) {
    assert_eq!(expected.mode, actual.mode, "mode");
    assert_eq!(expected.mtime, actual.mtime, "mtime");
    assert_eq!(expected.atime, actual.atime, "atime");
    assert_eq!(expected.ctime, actual.ctime, "ctime");
    assert_eq!(expected.size, actual.size, "size");
    assert_eq!(expected.uid, actual.uid, "uid");
    assert_eq!(expected.gid, actual.gid, "gid");
}

#[test]
fn put_and_fetch_attr_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    let stat = dir_stat(1234);
    cache.put_attr("/some/arbitrary/path", &stat).unwrap();

    let fetched = cache.fetch_attr("/some/arbitrary/path").unwrap();
    assert_stat_matches(&stat, &fetched);
    assert_eq!(fetched.blocks, 0, "non-regular inodes report zero blocks");
}

#[test]
fn attrs_survive_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let stat = dir_stat(1234);

    {
        let cache = FileCache::open(tmp.path(), 0).unwrap();
        cache.put_attr("/some/arbitrary/path", &stat).unwrap();
        cache.close();
    }

    let cache = FileCache::open(tmp.path(), 0).unwrap();
    let fetched = cache.fetch_attr("/some/arbitrary/path").unwrap();
    assert_stat_matches(&stat, &fetched);
}

#[test]
fn unknown_path_is_unavailable_not_notfound() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    let err = cache.fetch_attr("/never/seen").unwrap_err();
    assert!(
        matches!(err, CacheError::Unavailable),
        "a path without evidence must be Unavailable, got {err:?}"
    );
}

#[test]
fn put_non_existent_yields_notfound() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    cache.put_attr("/some/path", &dir_stat(1)).unwrap();
    cache.put_non_existent("/some/path").unwrap();

    let err = cache.fetch_attr("/some/path").unwrap_err();
    assert!(
        matches!(err, CacheError::NotFound),
        "observed absence must be NotFound, got {err:?}"
    );
}

#[test]
fn tombstones_survive_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = FileCache::open(tmp.path(), 0).unwrap();
        cache.put_non_existent("/gone").unwrap();
        cache.close();
    }

    let cache = FileCache::open(tmp.path(), 0).unwrap();
    let err = cache.fetch_attr("/gone").unwrap_err();
    assert!(matches!(err, CacheError::NotFound), "got {err:?}");
}

#[test]
fn put_attr_over_a_tombstone_revives_the_path() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    cache.put_non_existent("/flapping").unwrap();
    cache.put_attr("/flapping", &reg_stat(100)).unwrap();

    let fetched = cache.fetch_attr("/flapping").unwrap();
    assert_eq!(fetched.size, 100);
}

#[test]
fn put_link_before_put_attr_works() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    cache.put_link("/some/link", "../other/path").unwrap();
    assert_eq!(cache.fetch_link("/some/link").unwrap(), "../other/path");
}

#[test]
fn put_link_after_put_attr_preserves_attributes() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    let stat = FileStat {
        mode: libc::S_IFLNK | 0o777,
        uid: 5,
        gid: 6,
        mtime: 1234,
        atime: 2345,
        ctime: 3456,
        size: 4567,
        blocks: 0,
    };
    cache.put_attr("/some/link", &stat).unwrap();
    cache.put_link("/some/link", "../other/path").unwrap();

    let fetched = cache.fetch_attr("/some/link").unwrap();
    assert_stat_matches(&stat, &fetched);
    assert_eq!(cache.fetch_link("/some/link").unwrap(), "../other/path");
}

#[test]
fn links_survive_a_restart() {
    let tmp = tempfile::tempdir().unwrap();
    {
        let cache = FileCache::open(tmp.path(), 0).unwrap();
        cache.put_link("/some/link", "../other/path").unwrap();
        cache.close();
    }

    let cache = FileCache::open(tmp.path(), 0).unwrap();
    assert_eq!(cache.fetch_link("/some/link").unwrap(), "../other/path");
}

#[test]
fn fetch_link_on_a_directory_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    cache.put_attr("/dir", &dir_stat(1)).unwrap();
    let err = cache.fetch_link("/dir").unwrap_err();
    assert!(matches!(err, CacheError::NotSymlink), "got {err:?}");
    assert_eq!(err.errno(), libc::EINVAL);
}

fn sample_entries() -> Vec<DirEntry> {
    vec![
        DirEntry {
            name: "foo".to_owned(),
            stat: FileStat {
                mode: libc::S_IFREG | 0o644,
                mtime: 11,
                atime: 12,
                ctime: 13,
                size: 1023,
                uid: 0,
                gid: 0,
                blocks: 1,
            },
        },
        DirEntry {
            name: "bar".to_owned(),
            stat: FileStat {
                mode: libc::S_IFREG | 0o600,
                mtime: 21,
                atime: 22,
                ctime: 23,
                size: 3023,
                uid: 1000,
                gid: 1000,
                blocks: 2,
            },
        },
        DirEntry {
            name: "baz".to_owned(),
            stat: FileStat {
                mode: libc::S_IFREG | 0o644,
                mtime: 31,
                atime: 32,
                ctime: 33,
                size: 10023,
                uid: 0,
                gid: 0,
                blocks: 4,
            },
        },
    ]
}

#[test]
fn put_dir_and_fetch_dir_round_trips() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    let entries = sample_entries();
    cache.put_dir("/some/dir", &entries).unwrap();

    let fetched = cache.fetch_dir("/some/dir").unwrap();
    assert_eq!(fetched.len(), entries.len());
    for (expected, actual) in entries.iter().zip(&fetched) {
        assert_eq!(expected.name, actual.name, "entry order must be preserved");
        assert_stat_matches(&expected.stat, &actual.stat);
        assert_eq!(actual.stat.blocks, 0, "listing entries report zero blocks");
    }
}

#[test]
fn put_dir_also_caches_child_attributes() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    let entries = sample_entries();
    cache.put_dir("/some/dir", &entries).unwrap();

    for entry in &entries {
        let fetched = cache.fetch_attr(&format!("/some/dir/{}", entry.name)).unwrap();
        assert_stat_matches(&entry.stat, &fetched);
    }
}

#[test]
fn dirs_survive_a_restart() {
    // put_dir, close, reopen: fetch_dir and per-child fetch_attr all
    // return the original attributes.
    let tmp = tempfile::tempdir().unwrap();
    let entries = sample_entries();

    {
        let cache = FileCache::open(tmp.path(), 0).unwrap();
        cache.put_dir("/d", &entries).unwrap();
        cache.close();
    }

    let cache = FileCache::open(tmp.path(), 0).unwrap();
    let fetched = cache.fetch_dir("/d").unwrap();
    assert_eq!(fetched.len(), 3);
    for (expected, actual) in entries.iter().zip(&fetched) {
        assert_eq!(expected.name, actual.name);
        assert_stat_matches(&expected.stat, &actual.stat);
    }
    for entry in &entries {
        let fetched = cache.fetch_attr(&format!("/d/{}", entry.name)).unwrap();
        assert_stat_matches(&entry.stat, &fetched);
    }
}

#[test]
fn fetch_dir_on_a_file_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    cache.put_attr("/file", &reg_stat(10)).unwrap();
    let err = cache.fetch_dir("/file").unwrap_err();
    assert!(matches!(err, CacheError::NotDirectory), "got {err:?}");
    assert_eq!(err.errno(), libc::ENOTDIR);
}

#[test]
fn replacing_a_directory_purges_its_children() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    cache.put_dir("/d", &sample_entries()).unwrap();
    assert!(cache.fetch_attr("/d/foo").is_ok());

    // The path changes type: the directory and everything under it go.
    cache.put_attr("/d", &reg_stat(1)).unwrap();

    let err = cache.fetch_attr("/d/foo").unwrap_err();
    assert!(
        matches!(err, CacheError::Unavailable),
        "children of a replaced directory must vanish, got {err:?}"
    );
    assert!(cache.fetch_attr("/d").unwrap().is_regular());
}

#[test]
fn empty_string_and_slash_are_the_same_root() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    cache.put_attr("", &dir_stat(1234)).unwrap();

    assert!(cache.fetch_attr("/").is_ok());
    assert!(cache.fetch_attr("").is_ok());
}

#[test]
fn children_of_root_do_not_double_the_slash() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = FileCache::open(tmp.path(), 0).unwrap();

    let entries = vec![DirEntry {
        name: "top".to_owned(),
        stat: reg_stat(5),
    }];
    cache.put_dir("/", &entries).unwrap();

    assert!(cache.fetch_attr("/top").is_ok());
}
