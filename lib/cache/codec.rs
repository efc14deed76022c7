//! Binary codec for on-disk inode files.
//!
//! Every inode file starts with a common header, followed by exactly one
//! extension selected by the format bits of the mode word:
//!
//! ```text
//! offset  size  field
//!  0      3     magic = 'i','n','o'
//!  3      1     version = 0x01
//!  4      4     mode (format bits included)
//!  8      4     uid
//! 12      4     gid
//! 16      1     perms_modified
//! 17      8     mtime
//! 25      8     atime
//! 33      8     ctime
//! 41      1     times_modified
//! 42      8     size
//! ```
//!
//! All fields are little-endian. The extensions are `LNK` (length-prefixed
//! destination), `DIR` (child count, then length-prefixed names), `REG`
//! (`blocks_used`, zero padding up to offset 128, then the blockmap region,
//! which is host-endian — see [`super::blockmap`]) and `NEG` (a tombstone,
//! no payload).
//!
//! Decoding rejects wrong magic, unsupported versions, overlong strings and
//! child counts, and truncation, all as [`CacheError::BadFormat`].

use std::io::{self, Read, Write};

use crate::error::{CacheError, FormatError};

/// Magic of the common header.
pub const INODE_MAGIC: [u8; 3] = *b"ino";
/// Magic of the symlink extension.
pub const LNK_MAGIC: [u8; 3] = *b"LNK";
/// Magic of the directory extension.
pub const DIR_MAGIC: [u8; 3] = *b"DIR";
/// Magic of the regular-file extension.
pub const REG_MAGIC: [u8; 3] = *b"REG";
/// Magic of the tombstone extension.
pub const NEG_MAGIC: [u8; 3] = *b"NEG";

/// The only format version this build reads or writes.
pub const VERSION: u8 = 1;

/// Longest allowed symlink destination, in bytes.
pub const MAX_LINK_DEST_LEN: u32 = 2048;
/// Most children a directory inode may record.
pub const MAX_DIR_CHILDREN: u32 = 65_535;
/// Longest allowed directory entry name, in bytes.
pub const MAX_DIR_ENTRY_LEN: u32 = 1024;

/// Byte length of the common header.
pub const BASE_HEADER_LEN: u64 = 50;
/// Byte length of the common header plus the `REG` extension, before padding.
pub const REG_HEADER_LEN: u64 = BASE_HEADER_LEN + 12;

/// The common header fields, decoupled from the in-memory inode types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseHeader {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub perms_modified: bool,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
    pub times_modified: bool,
    pub size: u64,
}

fn fill<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), CacheError> {
    r.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            CacheError::BadFormat(FormatError::Truncated)
        } else {
            CacheError::Io(e)
        }
    })
}

fn read_u8<R: Read>(r: &mut R) -> Result<u8, CacheError> {
    let mut b = [0u8; 1];
    fill(r, &mut b)?;
    Ok(b[0])
}

fn read_bool<R: Read>(r: &mut R) -> Result<bool, CacheError> {
    Ok(read_u8(r)? != 0)
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32, CacheError> {
    let mut b = [0u8; 4];
    fill(r, &mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64, CacheError> {
    let mut b = [0u8; 8];
    fill(r, &mut b)?;
    Ok(u64::from_le_bytes(b))
}

/// Read and check an extension or header preamble: 3 magic bytes plus a
/// version byte.
pub fn read_magic_version<R: Read>(r: &mut R, magic: &[u8; 3]) -> Result<(), CacheError> {
    let mut found = [0u8; 3];
    fill(r, &mut found)?;
    if found != *magic {
        return Err(FormatError::MagicMismatch.into());
    }
    let version = read_u8(r)?;
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version).into());
    }
    Ok(())
}

/// Write an extension or header preamble.
pub fn write_magic_version<W: Write>(w: &mut W, magic: &[u8; 3]) -> io::Result<()> {
    w.write_all(magic)?;
    w.write_all(&[VERSION])
}

fn read_len_string<R: Read>(r: &mut R, max_len: u32) -> Result<String, CacheError> {
    let len = read_u32(r)?;
    if len > max_len {
        return Err(FormatError::StringTooLong { len, max: max_len }.into());
    }
    let mut buf = vec![0u8; len as usize];
    fill(r, &mut buf)?;
    String::from_utf8(buf).map_err(|_| FormatError::InvalidString.into())
}

fn write_len_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    #[expect(
        clippy::cast_possible_truncation,
        reason = "string lengths are validated against u32 limits before encoding"
    )]
    let len = s.len() as u32;
    w.write_all(&len.to_le_bytes())?;
    w.write_all(s.as_bytes())
}

/// Read the common header.
pub fn read_base<R: Read>(r: &mut R) -> Result<BaseHeader, CacheError> {
    read_magic_version(r, &INODE_MAGIC)?;
    Ok(BaseHeader {
        mode: read_u32(r)?,
        uid: read_u32(r)?,
        gid: read_u32(r)?,
        perms_modified: read_bool(r)?,
        mtime: read_u64(r)?,
        atime: read_u64(r)?,
        ctime: read_u64(r)?,
        times_modified: read_bool(r)?,
        size: read_u64(r)?,
    })
}

/// Write the common header.
pub fn write_base<W: Write>(w: &mut W, base: &BaseHeader) -> io::Result<()> {
    write_magic_version(w, &INODE_MAGIC)?;
    w.write_all(&base.mode.to_le_bytes())?;
    w.write_all(&base.uid.to_le_bytes())?;
    w.write_all(&base.gid.to_le_bytes())?;
    w.write_all(&[u8::from(base.perms_modified)])?;
    w.write_all(&base.mtime.to_le_bytes())?;
    w.write_all(&base.atime.to_le_bytes())?;
    w.write_all(&base.ctime.to_le_bytes())?;
    w.write_all(&[u8::from(base.times_modified)])?;
    w.write_all(&base.size.to_le_bytes())
}

/// Read the symlink extension.
pub fn read_link_ext<R: Read>(r: &mut R) -> Result<String, CacheError> {
    read_magic_version(r, &LNK_MAGIC)?;
    read_len_string(r, MAX_LINK_DEST_LEN)
}

/// Write the symlink extension.
pub fn write_link_ext<W: Write>(w: &mut W, dest: &str) -> io::Result<()> {
    write_magic_version(w, &LNK_MAGIC)?;
    write_len_string(w, dest)
}

/// Read the directory extension.
pub fn read_dir_ext<R: Read>(r: &mut R) -> Result<Vec<String>, CacheError> {
    read_magic_version(r, &DIR_MAGIC)?;
    let nchildren = read_u32(r)?;
    if nchildren > MAX_DIR_CHILDREN {
        return Err(FormatError::TooManyChildren(nchildren).into());
    }
    let mut children = Vec::with_capacity(nchildren as usize);
    for _ in 0..nchildren {
        children.push(read_len_string(r, MAX_DIR_ENTRY_LEN)?);
    }
    Ok(children)
}

/// Write the directory extension.
pub fn write_dir_ext<W: Write>(w: &mut W, children: &[String]) -> io::Result<()> {
    write_magic_version(w, &DIR_MAGIC)?;
    #[expect(
        clippy::cast_possible_truncation,
        reason = "child counts are capped at MAX_DIR_CHILDREN before encoding"
    )]
    let nchildren = children.len() as u32;
    w.write_all(&nchildren.to_le_bytes())?;
    for child in children {
        write_len_string(w, child)?;
    }
    Ok(())
}

/// Read the regular-file extension. The blockmap region that follows it is
/// not consumed here; it belongs to [`super::blockmap::Blockmap`].
pub fn read_reg_ext<R: Read>(r: &mut R) -> Result<u64, CacheError> {
    read_magic_version(r, &REG_MAGIC)?;
    read_u64(r)
}

/// Write the regular-file extension.
pub fn write_reg_ext<W: Write>(w: &mut W, blocks_used: u64) -> io::Result<()> {
    write_magic_version(w, &REG_MAGIC)?;
    w.write_all(&blocks_used.to_le_bytes())
}

/// Read the tombstone extension.
pub fn read_neg_ext<R: Read>(r: &mut R) -> Result<(), CacheError> {
    read_magic_version(r, &NEG_MAGIC)
}

/// Write the tombstone extension.
pub fn write_neg_ext<W: Write>(w: &mut W) -> io::Result<()> {
    write_magic_version(w, &NEG_MAGIC)
}
