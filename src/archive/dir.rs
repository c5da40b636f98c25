//! Directories.
//!
//! The content of a directory inode is a sequence of entry records
//! followed by a terminating record length of zero. Each record looks like
//! this:
//!
//! ```text
//! record length    u16, the total size of the record
//! name length      varint, one or two octets
//! checksum         u8, an eight bit hash of the name
//! type             u8, the inode type of the child
//! child            u32, the block of the child inode
//! name             name length octets
//! ```
//!
//! A record with a name length of zero is a hole left behind by a deleted
//! entry. New entries are placed in the smallest hole they fit into, which
//! is split if enough space remains. Deleting an entry merges the new hole
//! with holes right before and after it. A hole at the very end is cut off.

use std::borrow::Cow;
use super::block::{read_varint, varint_len, write_varint, MAX_VARINT};
use super::error::{ArchiveError, FsError};
use super::geometry::InodeContext;
use super::inode::{Inode, InodeKind};
use super::volume::Volume;


//------------ Constants -----------------------------------------------------

/// The size of the fixed part of a record header without the name length.
const FIXED_LEN: usize = 8;

/// The largest possible record header.
const MAX_HEADER_LEN: usize = FIXED_LEN + 2;

/// The smallest record, a hole.
pub const MIN_RECORD_LEN: usize = FIXED_LEN + 1;

/// The terminator of the record sequence.
const TERMINATOR: [u8; 2] = [0, 0];


//------------ DirEntry ------------------------------------------------------

/// An entry of a directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    /// The name of the entry.
    pub name: Vec<u8>,

    /// The type of the child inode.
    pub kind: InodeKind,

    /// The block of the child inode.
    pub child: u32,
}

impl DirEntry {
    /// Returns the name for display purposes.
    pub fn name_lossy(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.name)
    }
}


//------------ Dir -----------------------------------------------------------

/// A directory bound to its inode.
///
/// Like [`Inode`], values are meant to be reused and are reset by
/// [`create`][Self::create] and [`open`][Self::open].
#[derive(Debug, Default)]
pub struct Dir {
    /// The directory’s inode.
    inode: Inode,

    /// A buffer for encoding records.
    record: Vec<u8>,

    /// A buffer for reading names.
    name: Vec<u8>,
}

impl Dir {
    /// Creates a new, empty directory.
    pub fn create(
        &mut self, vol: &mut Volume, ctx: &InodeContext
    ) -> Result<(), ArchiveError> {
        self.inode.create(vol, InodeKind::Directory)?;
        self.inode.write_bytes(vol, ctx, 0, &TERMINATOR)
    }

    /// Binds the value to the directory with the inode in `block`.
    ///
    /// Fails with [`FsError::NotADirectory`] if the inode is a file.
    pub fn open(
        &mut self, vol: &mut Volume, ctx: &InodeContext, block: u32
    ) -> Result<(), FsError> {
        self.inode.open(vol, ctx, block)?;
        if !self.inode.kind().is_dir() {
            return Err(FsError::NotADirectory)
        }
        Ok(())
    }

    /// Returns the block of the directory’s inode.
    pub fn block(&self) -> u32 {
        self.inode.block()
    }

    /// Returns the directory’s inode.
    pub fn inode_mut(&mut self) -> &mut Inode {
        &mut self.inode
    }

    /// Looks up the entry with the given name.
    pub fn lookup(
        &mut self, vol: &mut Volume, ctx: &InodeContext, name: &[u8]
    ) -> Result<Option<DirEntry>, ArchiveError> {
        let checksum = name_checksum(name);
        let mut pos = 0;
        while let Some(record) = self.read_record(vol, ctx, pos)? {
            if self.matches(vol, ctx, &record, name, checksum)? {
                return Ok(Some(record.entry(name)?))
            }
            pos = record.end();
        }
        Ok(None)
    }

    /// Adds a new entry.
    ///
    /// Fails with [`FsError::Exists`] if there already is an entry with
    /// that name and with [`FsError::InvalidName`] if the name can’t be
    /// used. In both cases, nothing is changed.
    pub fn insert(
        &mut self,
        vol: &mut Volume,
        ctx: &InodeContext,
        name: &[u8],
        kind: InodeKind,
        child: u32,
    ) -> Result<(), FsError> {
        check_name(name)?;
        let checksum = name_checksum(name);
        let needed = record_len(name);
        let (hole, pos) = self.find_slot(vol, ctx, name, needed)?;
        match hole {
            Some(hole) => {
                let spare = usize::from(hole.len) - needed;
                if spare >= MIN_RECORD_LEN {
                    self.encode_record(needed, name, checksum, kind, child);
                    encode_hole(&mut self.record, spare);
                }
                else {
                    self.encode_record(
                        usize::from(hole.len), name, checksum, kind, child
                    );
                }
                self.inode.write_bytes(vol, ctx, hole.pos, &self.record)?;
            }
            None => {
                self.encode_record(needed, name, checksum, kind, child);
                self.record.extend_from_slice(&TERMINATOR);
                self.inode.write_bytes(vol, ctx, pos, &self.record)?;
            }
        }
        Ok(())
    }

    /// Checks that an entry with the given name can be added.
    ///
    /// Fails with [`FsError::Exists`] if the name is taken and with a
    /// capacity error if the directory can’t grow enough to hold the new
    /// record. Nothing is changed either way.
    pub fn check_insert(
        &mut self, vol: &mut Volume, ctx: &InodeContext, name: &[u8]
    ) -> Result<(), FsError> {
        check_name(name)?;
        let needed = record_len(name);
        if let (None, pos) = self.find_slot(vol, ctx, name, needed)? {
            let limit = ctx.max_file_size_real();
            let end = pos + (needed + TERMINATOR.len()) as u64;
            if end > limit {
                return Err(ArchiveError::Capacity { end, limit }.into())
            }
        }
        Ok(())
    }

    /// Finds the place for a new record of `needed` octets.
    ///
    /// Returns the smallest hole that fits, if any, and the position of
    /// the terminator. Fails if there already is an entry named `name`.
    fn find_slot(
        &mut self,
        vol: &mut Volume,
        ctx: &InodeContext,
        name: &[u8],
        needed: usize,
    ) -> Result<(Option<Record>, u64), FsError> {
        let checksum = name_checksum(name);
        let mut hole: Option<Record> = None;
        let mut pos = 0;
        while let Some(record) = self.read_record(vol, ctx, pos)? {
            if record.is_hole() {
                if usize::from(record.len) >= needed
                    && hole.map(|hole| record.len < hole.len).unwrap_or(true)
                {
                    hole = Some(record)
                }
            }
            else if self.matches(vol, ctx, &record, name, checksum)? {
                return Err(FsError::Exists)
            }
            pos = record.end();
        }
        Ok((hole, pos))
    }

    /// Removes the entry with the given name and returns it.
    ///
    /// Fails with [`FsError::NotFound`] if there is no such entry.
    pub fn delete(
        &mut self, vol: &mut Volume, ctx: &InodeContext, name: &[u8]
    ) -> Result<DirEntry, FsError> {
        let checksum = name_checksum(name);
        let mut prev: Option<Record> = None;
        let mut pos = 0;
        let found = loop {
            let record = match self.read_record(vol, ctx, pos)? {
                Some(record) => record,
                None => return Err(FsError::NotFound)
            };
            if self.matches(vol, ctx, &record, name, checksum)? {
                break record
            }
            pos = record.end();
            prev = Some(record);
        };
        let entry = found.entry(name)?;

        let mut start = found.pos;
        let mut len = usize::from(found.len);
        if let Some(next) = self.read_record(vol, ctx, found.end())? {
            if next.is_hole() && len + usize::from(next.len) <= MAX_RECORD {
                len += usize::from(next.len);
            }
        }
        if let Some(prev) = prev.filter(Record::is_hole) {
            if len + usize::from(prev.len) <= MAX_RECORD {
                start = prev.pos;
                len += usize::from(prev.len);
            }
        }

        let end = start + len as u64;
        if self.read_record(vol, ctx, end)?.is_none() {
            // The hole is last. Cut it off.
            self.inode.write_bytes(vol, ctx, start, &TERMINATOR)?;
            self.inode.truncate(vol, ctx, start + TERMINATOR.len() as u64)?;
        }
        else {
            self.record.clear();
            encode_hole(&mut self.record, len);
            self.record.resize(len, 0);
            self.inode.write_bytes(vol, ctx, start, &self.record)?;
        }
        Ok(entry)
    }

    /// Returns all entries in the order they are stored.
    pub fn entries(
        &mut self, vol: &mut Volume, ctx: &InodeContext
    ) -> Result<Vec<DirEntry>, ArchiveError> {
        let mut res = Vec::new();
        let mut pos = 0;
        while let Some(record) = self.read_record(vol, ctx, pos)? {
            if !record.is_hole() {
                self.read_name(vol, ctx, &record)?;
                res.push(record.entry(&self.name)?);
            }
            pos = record.end();
        }
        Ok(res)
    }

    /// Returns whether the directory has no entries.
    pub fn is_empty(
        &mut self, vol: &mut Volume, ctx: &InodeContext
    ) -> Result<bool, ArchiveError> {
        let mut pos = 0;
        while let Some(record) = self.read_record(vol, ctx, pos)? {
            if !record.is_hole() {
                return Ok(false)
            }
            pos = record.end();
        }
        Ok(true)
    }

    /// Reads the record header at `pos`.
    ///
    /// Returns `None` if the terminator is at `pos`.
    fn read_record(
        &mut self, vol: &mut Volume, ctx: &InodeContext, pos: u64
    ) -> Result<Option<Record>, ArchiveError> {
        let mut buf = [0u8; MAX_HEADER_LEN];
        let read = self.inode.read_bytes(vol, ctx, pos, &mut buf)?;
        let read = read.unwrap_or(0);
        if read < 2 {
            return Err(ArchiveError::Corrupt("unterminated directory"))
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]);
        if len == 0 {
            return Ok(None)
        }
        let (name_len, varint) = read_varint(&buf[2..read]).ok_or(
            ArchiveError::Corrupt("truncated directory entry")
        )?;
        let header_len = FIXED_LEN + varint;
        if read < header_len
            || usize::from(len) < header_len + usize::from(name_len)
        {
            return Err(ArchiveError::Corrupt("invalid directory entry"))
        }
        if pos + u64::from(len) + 2 > self.inode.size() {
            return Err(ArchiveError::Corrupt("directory entry beyond end"))
        }
        let fields = &buf[2 + varint..];
        Ok(Some(Record {
            pos,
            len,
            name_len,
            header_len,
            checksum: fields[0],
            kind: fields[1],
            child: u32::from_be_bytes(
                [fields[2], fields[3], fields[4], fields[5]]
            ),
        }))
    }

    /// Reads the name of a record into the name buffer.
    fn read_name(
        &mut self, vol: &mut Volume, ctx: &InodeContext, record: &Record
    ) -> Result<(), ArchiveError> {
        self.name.clear();
        self.name.resize(usize::from(record.name_len), 0);
        self.inode.read_bytes(
            vol, ctx, record.pos + record.header_len as u64, &mut self.name
        )?;
        Ok(())
    }

    /// Returns whether a record is an entry with the given name.
    fn matches(
        &mut self,
        vol: &mut Volume,
        ctx: &InodeContext,
        record: &Record,
        name: &[u8],
        checksum: u8,
    ) -> Result<bool, ArchiveError> {
        if record.is_hole()
            || usize::from(record.name_len) != name.len()
            || record.checksum != checksum
        {
            return Ok(false)
        }
        self.read_name(vol, ctx, record)?;
        Ok(self.name == name)
    }

    /// Encodes a record into the record buffer.
    fn encode_record(
        &mut self,
        len: usize,
        name: &[u8],
        checksum: u8,
        kind: InodeKind,
        child: u32,
    ) {
        let buf = &mut self.record;
        buf.clear();
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        push_varint(buf, name.len() as u16);
        buf.push(checksum);
        buf.push(kind as u8);
        buf.extend_from_slice(&child.to_be_bytes());
        buf.extend_from_slice(name);
        buf.resize(len, 0);
    }
}


//------------ Record --------------------------------------------------------

/// The header of a record.
#[derive(Clone, Copy, Debug)]
struct Record {
    /// The position of the record in the directory.
    pos: u64,

    /// The record length.
    len: u16,

    name_len: u16,

    /// The length of the header including the name length varint.
    header_len: usize,

    checksum: u8,
    kind: u8,
    child: u32,
}

impl Record {
    fn is_hole(&self) -> bool {
        self.name_len == 0
    }

    /// Returns the position of the next record.
    fn end(&self) -> u64 {
        self.pos + u64::from(self.len)
    }

    fn entry(&self, name: &[u8]) -> Result<DirEntry, ArchiveError> {
        Ok(DirEntry {
            name: name.into(),
            kind: InodeKind::from_u8(self.kind).ok_or(
                ArchiveError::Corrupt("invalid directory entry type")
            )?,
            child: self.child,
        })
    }
}


//------------ Helpers -------------------------------------------------------

/// The largest length of a record.
const MAX_RECORD: usize = u16::MAX as usize;

/// Returns the record length needed for a name.
fn record_len(name: &[u8]) -> usize {
    FIXED_LEN + varint_len(name.len() as u16) + name.len()
}

/// Appends a hole header for a hole of `len` octets.
///
/// Only the header is added, not the rest of the hole.
fn encode_hole(buf: &mut Vec<u8>, len: usize) {
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&[0; MIN_RECORD_LEN - 2]);
}

fn push_varint(buf: &mut Vec<u8>, value: u16) {
    let mut tmp = [0u8; 2];
    let len = write_varint(value, &mut tmp);
    buf.extend_from_slice(&tmp[..len]);
}

/// Returns the checksum of a name.
///
/// This is Bob Jenkins’ one-at-a-time hash truncated to eight bits.
pub fn name_checksum(name: &[u8]) -> u8 {
    let mut hash = 0u32;
    for &ch in name {
        hash = hash.wrapping_add(u32::from(ch));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash = hash.wrapping_add(hash << 15);
    hash as u8
}

/// Checks that a name can be used for a directory entry.
pub fn check_name(name: &[u8]) -> Result<(), FsError> {
    if name.is_empty()
        || name.len() > usize::from(MAX_VARINT)
        || name == b"."
        || name == b".."
        || name.contains(&b'/')
    {
        Err(FsError::InvalidName)
    }
    else {
        Ok(())
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::inode::test::setup;

    fn names(
        dir: &mut Dir, vol: &mut Volume, ctx: &InodeContext
    ) -> Vec<String> {
        dir.entries(vol, ctx).unwrap().iter().map(|entry| {
            entry.name_lossy().into_owned()
        }).collect()
    }

    fn insert(
        dir: &mut Dir, vol: &mut Volume, ctx: &InodeContext, name: &str
    ) {
        dir.insert(vol, ctx, name.as_bytes(), InodeKind::File, 7).unwrap()
    }

    fn delete(
        dir: &mut Dir, vol: &mut Volume, ctx: &InodeContext, name: &str
    ) {
        dir.delete(vol, ctx, name.as_bytes()).unwrap();
    }

    #[test]
    fn checksum() {
        // Known values of the full 32 bit hash are 0xca2e9442 for "a" and
        // 0x519e91f5 for "The quick brown fox jumps over the lazy dog".
        assert_eq!(name_checksum(b"a"), 0x42);
        assert_eq!(
            name_checksum(b"The quick brown fox jumps over the lazy dog"),
            0xf5
        );
        assert_eq!(name_checksum(b""), 0);
    }

    #[test]
    fn names_are_checked() {
        assert!(check_name(b"a").is_ok());
        assert!(check_name(b"...").is_ok());
        assert!(check_name(&[b'x'; 0x7FFF]).is_ok());
        let long = vec![b'x'; 0x8000];
        let bad: [&[u8]; 5] = [b"", b".", b"..", b"a/b", &long];
        for name in bad {
            assert!(matches!(check_name(name), Err(FsError::InvalidName)));
        }
    }

    #[test]
    fn fresh_directory() {
        let (mut vol, ctx) = setup(64);
        let mut dir = Dir::default();
        dir.create(&mut vol, &ctx).unwrap();
        assert_eq!(dir.inode_mut().size(), 2);
        assert!(dir.is_empty(&mut vol, &ctx).unwrap());
        assert!(dir.entries(&mut vol, &ctx).unwrap().is_empty());
        assert_eq!(dir.lookup(&mut vol, &ctx, b"x").unwrap(), None);

        let block = dir.block();
        let mut other = Dir::default();
        other.open(&mut vol, &ctx, block).unwrap();
        assert!(other.is_empty(&mut vol, &ctx).unwrap());
    }

    #[test]
    fn hole_reuse_keeps_order() {
        let (mut vol, ctx) = setup(64);
        let mut dir = Dir::default();
        dir.create(&mut vol, &ctx).unwrap();
        for name in ["aa", "bb", "cc"] {
            insert(&mut dir, &mut vol, &ctx, name);
        }
        assert_eq!(dir.inode_mut().size(), 3 * 11 + 2);
        delete(&mut dir, &mut vol, &ctx, "bb");
        assert_eq!(dir.inode_mut().size(), 3 * 11 + 2);
        insert(&mut dir, &mut vol, &ctx, "dd");
        assert_eq!(dir.inode_mut().size(), 3 * 11 + 2);
        assert_eq!(names(&mut dir, &mut vol, &ctx), ["aa", "dd", "cc"]);
    }

    #[test]
    fn lookup_and_duplicates() {
        let (mut vol, ctx) = setup(64);
        let mut dir = Dir::default();
        dir.create(&mut vol, &ctx).unwrap();
        dir.insert(&mut vol, &ctx, b"file", InodeKind::File, 12).unwrap();
        dir.insert(&mut vol, &ctx, b"sub", InodeKind::Directory, 13).unwrap();
        assert_eq!(
            dir.lookup(&mut vol, &ctx, b"sub").unwrap(),
            Some(DirEntry {
                name: b"sub".to_vec(), kind: InodeKind::Directory, child: 13
            })
        );
        assert_eq!(dir.lookup(&mut vol, &ctx, b"su").unwrap(), None);
        assert!(matches!(
            dir.insert(&mut vol, &ctx, b"file", InodeKind::File, 14),
            Err(FsError::Exists)
        ));
        assert!(matches!(
            dir.insert(&mut vol, &ctx, b"..", InodeKind::File, 14),
            Err(FsError::InvalidName)
        ));
        assert!(matches!(
            dir.delete(&mut vol, &ctx, b"nope"), Err(FsError::NotFound)
        ));
        assert_eq!(
            dir.delete(&mut vol, &ctx, b"file").unwrap().child, 12
        );
        assert!(!dir.is_empty(&mut vol, &ctx).unwrap());
    }

    #[test]
    fn holes_are_split() {
        let (mut vol, ctx) = setup(64);
        let mut dir = Dir::default();
        dir.create(&mut vol, &ctx).unwrap();
        let long = "a".repeat(30);
        insert(&mut dir, &mut vol, &ctx, &long);
        insert(&mut dir, &mut vol, &ctx, "b");
        let size = dir.inode_mut().size();
        assert_eq!(size, 39 + 10 + 2);

        delete(&mut dir, &mut vol, &ctx, &long);
        insert(&mut dir, &mut vol, &ctx, "c");
        insert(&mut dir, &mut vol, &ctx, "dddddddddd");
        insert(&mut dir, &mut vol, &ctx, "e");
        assert_eq!(dir.inode_mut().size(), size);
        assert_eq!(
            names(&mut dir, &mut vol, &ctx), ["c", "dddddddddd", "e", "b"]
        );
    }

    #[test]
    fn small_spare_stays_in_record() {
        let (mut vol, ctx) = setup(64);
        let mut dir = Dir::default();
        dir.create(&mut vol, &ctx).unwrap();
        let long = "a".repeat(30);
        insert(&mut dir, &mut vol, &ctx, &long);
        insert(&mut dir, &mut vol, &ctx, "b");
        delete(&mut dir, &mut vol, &ctx, &long);

        // Needs 34 of the 39 octets, the remaining 5 can’t be a hole.
        let middle = "m".repeat(25);
        insert(&mut dir, &mut vol, &ctx, &middle);
        insert(&mut dir, &mut vol, &ctx, "c");
        assert_eq!(
            names(&mut dir, &mut vol, &ctx), [middle.as_str(), "b", "c"]
        );

        delete(&mut dir, &mut vol, &ctx, &middle);
        insert(&mut dir, &mut vol, &ctx, &long);
        assert_eq!(names(&mut dir, &mut vol, &ctx), [long.as_str(), "b", "c"]);
    }

    #[test]
    fn holes_are_merged() {
        let (mut vol, ctx) = setup(64);
        let mut dir = Dir::default();
        dir.create(&mut vol, &ctx).unwrap();
        for name in ["x", "y", "z", "w"] {
            insert(&mut dir, &mut vol, &ctx, name);
        }
        delete(&mut dir, &mut vol, &ctx, "x");
        delete(&mut dir, &mut vol, &ctx, "z");
        delete(&mut dir, &mut vol, &ctx, "y");

        // One hole of 30 octets now, which fits a 21 octet name exactly.
        let name = "n".repeat(21);
        insert(&mut dir, &mut vol, &ctx, &name);
        assert_eq!(dir.inode_mut().size(), 4 * 10 + 2);
        assert_eq!(names(&mut dir, &mut vol, &ctx), [name.as_str(), "w"]);
    }

    #[test]
    fn trailing_holes_are_trimmed() {
        let (mut vol, ctx) = setup(64);
        let base = vol.superblock().used();
        let mut dir = Dir::default();
        dir.create(&mut vol, &ctx).unwrap();
        let list: Vec<_> = (0..20).map(|i| format!("entry{}", i)).collect();
        for name in &list {
            insert(&mut dir, &mut vol, &ctx, name);
        }
        assert!(!dir.inode_mut().is_inlined());

        delete(&mut dir, &mut vol, &ctx, "entry18");
        let size = dir.inode_mut().size();
        delete(&mut dir, &mut vol, &ctx, "entry19");
        assert_eq!(dir.inode_mut().size(), size - 2 * 16);

        for name in &list[..18] {
            delete(&mut dir, &mut vol, &ctx, name);
        }
        assert_eq!(dir.inode_mut().size(), 2);
        assert!(dir.inode_mut().is_inlined());
        assert_eq!(vol.superblock().used(), base + 1);
        assert!(dir.is_empty(&mut vol, &ctx).unwrap());
    }

    #[test]
    fn files_are_not_directories() {
        let (mut vol, ctx) = setup(64);
        let mut inode = Inode::default();
        inode.create(&mut vol, InodeKind::File).unwrap();
        let mut dir = Dir::default();
        assert!(matches!(
            dir.open(&mut vol, &ctx, inode.block()),
            Err(FsError::NotADirectory)
        ));
    }

    #[test]
    fn full_directory() {
        let (mut vol, _) = setup(64);
        let ctx = InodeContext::new(64, 1000).unwrap();
        let mut dir = Dir::default();
        dir.create(&mut vol, &ctx).unwrap();

        // Each record takes 12 octets, the terminator another two.
        let mut count = 0u32;
        loop {
            let name = format!("{:03}", count);
            match dir.check_insert(&mut vol, &ctx, name.as_bytes()) {
                Ok(()) => {
                    dir.insert(
                        &mut vol, &ctx, name.as_bytes(), InodeKind::File,
                        100 + count
                    ).unwrap();
                    count += 1;
                }
                Err(FsError::Archive(err)) => {
                    assert!(err.is_capacity());
                    break
                }
                Err(err) => panic!("unexpected error {}", err)
            }
        }
        assert_eq!(u64::from(count), (ctx.max_file_size_real() - 2) / 12);
        let size = dir.inode_mut().size();
        assert!(matches!(
            dir.insert(&mut vol, &ctx, b"new", InodeKind::File, 1),
            Err(FsError::Archive(_))
        ));
        assert_eq!(dir.inode_mut().size(), size);
        assert!(matches!(
            dir.check_insert(&mut vol, &ctx, b"000"), Err(FsError::Exists)
        ));

        delete(&mut dir, &mut vol, &ctx, "005");
        dir.check_insert(&mut vol, &ctx, b"new").unwrap();
        insert(&mut dir, &mut vol, &ctx, "new");
        assert_eq!(dir.inode_mut().size(), size);
    }
}
