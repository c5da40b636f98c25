//! Inodes.
//!
//! Every file and directory is represented by an inode occupying one block.
//! The block starts with a header:
//!
//! ```text
//!  0  type                 u8, 1 for a file, 2 for a directory
//!  1  flags                u8, bit 0 set if the content is inlined
//!  2  reserved             u16
//!  4  size                 u64
//! ```
//!
//! Small content is stored right after the header. Once it grows beyond
//! what fits there, the space after the header becomes an array of slot
//! pointers as described by the [`InodeContext`]. Content that shrinks
//! back below the inline capacity moves back into the inode block.
//!
//! Content past the size is always zero, both inline and in data blocks.

use std::{cmp, fmt, mem};
use log::trace;
use serde::Serialize;
use super::error::ArchiveError;
use super::geometry::InodeContext;
use super::unused::BlockKind;
use super::volume::Volume;


//------------ Constants -----------------------------------------------------

/// The size of the inode header.
pub const HEADER_LEN: usize = 12;

const TYPE_POS: usize = 0;
const FLAGS_POS: usize = 1;
const RESERVED_POS: usize = 2;
const SIZE_POS: usize = 4;

const FLAG_INLINED: u8 = 0x01;


//------------ InodeKind -----------------------------------------------------

/// The type of an inode.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum InodeKind {
    #[default]
    File = 1,
    Directory = 2,
}

impl InodeKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(InodeKind::File),
            2 => Some(InodeKind::Directory),
            _ => None
        }
    }

    pub fn is_dir(self) -> bool {
        matches!(self, InodeKind::Directory)
    }
}

impl fmt::Display for InodeKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            InodeKind::File => "file",
            InodeKind::Directory => "dir",
        })
    }
}


//------------ Inode ---------------------------------------------------------

/// An inode bound to its block.
///
/// Values are reused via a pool. They are bound to a block by either
/// [`create`][Self::create] or [`open`][Self::open], both of which reset
/// all state. All other methods must only be called on a bound inode.
#[derive(Debug, Default)]
pub struct Inode {
    /// The block holding the inode.
    block: u32,

    kind: InodeKind,

    /// Is the content stored in the inode block?
    inlined: bool,

    /// The size of the content in bytes.
    size: u64,

    /// A buffer for moving content in and out of the inode block.
    scratch: Vec<u8>,
}

impl Inode {
    /// Creates a new, empty inode in a freshly allocated block.
    pub fn create(
        &mut self, vol: &mut Volume, kind: InodeKind
    ) -> Result<(), ArchiveError> {
        self.block = vol.allocate(BlockKind::Inode)?;
        self.kind = kind;
        self.inlined = true;
        self.size = 0;
        self.write_header(vol)
    }

    /// Binds the value to the inode in `block`.
    pub fn open(
        &mut self, vol: &mut Volume, ctx: &InodeContext, block: u32
    ) -> Result<(), ArchiveError> {
        let data = vol.block(block)?;
        let kind = InodeKind::from_u8(data.get_u8(TYPE_POS)).ok_or(
            ArchiveError::Corrupt("invalid inode type")
        )?;
        let flags = data.get_u8(FLAGS_POS);
        if flags & !FLAG_INLINED != 0 {
            return Err(ArchiveError::Corrupt("invalid inode flags"))
        }
        let inlined = flags & FLAG_INLINED != 0;
        let size = data.get_u64(SIZE_POS);
        if inlined && size > ctx.inline_capacity() {
            return Err(ArchiveError::Corrupt("oversized inlined inode"))
        }
        if size > ctx.max_file_size_real() {
            return Err(ArchiveError::Corrupt("oversized inode"))
        }
        self.block = block;
        self.kind = kind;
        self.inlined = inlined;
        self.size = size;
        Ok(())
    }

    pub fn block(&self) -> u32 {
        self.block
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_inlined(&self) -> bool {
        self.inlined
    }

    /// Reads the byte at `offset`.
    ///
    /// Returns `None` if `offset` is at or beyond the end of the content.
    pub fn read_byte(
        &mut self, vol: &mut Volume, ctx: &InodeContext, offset: u64
    ) -> Result<Option<u8>, ArchiveError> {
        let mut buf = [0u8];
        Ok(self.read_bytes(vol, ctx, offset, &mut buf)?.map(|_| buf[0]))
    }

    /// Reads content starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes read, which is less than the length of
    /// `buf` only if the end of the content was reached. Returns `None` if
    /// `offset` is at or beyond the end of the content.
    pub fn read_bytes(
        &mut self,
        vol: &mut Volume,
        ctx: &InodeContext,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<Option<usize>, ArchiveError> {
        if offset >= self.size {
            return Ok(None)
        }
        let len = cmp::min(buf.len() as u64, self.size - offset) as usize;
        let buf = &mut buf[..len];
        if self.inlined {
            vol.block(self.block)?.get_bytes(
                HEADER_LEN + offset as usize, buf
            );
            return Ok(Some(len))
        }

        let block_size = ctx.block_size();
        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let start = (pos % block_size as u64) as usize;
            let chunk = cmp::min(block_size - start, len - done);
            let target = &mut buf[done..done + chunk];
            match ctx.resolve(vol, self.block, pos)? {
                Some(block) => vol.block(block)?.get_bytes(start, target),
                None => target.fill(0),
            }
            done += chunk;
        }
        Ok(Some(len))
    }

    /// Reads the entire content, appending it to `target`.
    pub fn read_all(
        &mut self,
        vol: &mut Volume,
        ctx: &InodeContext,
        target: &mut Vec<u8>,
    ) -> Result<(), ArchiveError> {
        let start = target.len();
        target.resize(start + self.size as usize, 0);
        self.read_bytes(vol, ctx, 0, &mut target[start..])?;
        Ok(())
    }

    /// Writes a single byte at `offset`.
    pub fn write_byte(
        &mut self,
        vol: &mut Volume,
        ctx: &InodeContext,
        offset: u64,
        value: u8,
    ) -> Result<(), ArchiveError> {
        self.write_bytes(vol, ctx, offset, &[value])
    }

    /// Writes `data` starting at `offset`.
    ///
    /// If the write ends beyond the current size, the content grows. Any
    /// gap between the old size and `offset` reads as zeros. Fails without
    /// changing anything if the write would end beyond the maximum file
    /// size.
    pub fn write_bytes(
        &mut self,
        vol: &mut Volume,
        ctx: &InodeContext,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ArchiveError> {
        let limit = ctx.max_file_size_real();
        let end = offset.checked_add(data.len() as u64).ok_or(
            ArchiveError::Capacity { end: u64::MAX, limit }
        )?;
        if end > limit {
            return Err(ArchiveError::Capacity { end, limit })
        }
        if data.is_empty() {
            return Ok(())
        }
        if self.inlined && end > ctx.inline_capacity() {
            self.undo_inline(vol, ctx)?;
        }
        if self.inlined {
            vol.block_mut(self.block)?.put_bytes(
                HEADER_LEN + offset as usize, data
            );
        }
        else {
            self.write_tree(vol, ctx, offset, data)?;
        }
        if end > self.size {
            self.size = end;
            self.write_header(vol)?;
        }
        Ok(())
    }

    /// Changes the size of the content.
    ///
    /// Growing the content appends zeros. Shrinking drops all data blocks
    /// no longer needed.
    pub fn truncate(
        &mut self, vol: &mut Volume, ctx: &InodeContext, new_size: u64
    ) -> Result<(), ArchiveError> {
        let limit = ctx.max_file_size_real();
        if new_size > limit {
            return Err(ArchiveError::Capacity { end: new_size, limit })
        }
        if new_size == self.size {
            return Ok(())
        }
        if new_size > self.size {
            if self.inlined && new_size > ctx.inline_capacity() {
                self.undo_inline(vol, ctx)?;
            }
        }
        else if self.inlined {
            vol.block_mut(self.block)?.zero(
                HEADER_LEN + new_size as usize..HEADER_LEN + self.size as usize
            );
        }
        else if new_size <= ctx.inline_capacity() {
            self.redo_inline(vol, ctx, new_size)?;
        }
        else {
            ctx.truncate(vol, self.block, new_size)?;
        }
        self.size = new_size;
        self.write_header(vol)
    }

    /// Releases all blocks of the inode including the inode block.
    ///
    /// The value is unbound afterwards.
    pub fn free(
        &mut self, vol: &mut Volume, ctx: &InodeContext
    ) -> Result<(), ArchiveError> {
        if !self.inlined {
            ctx.truncate(vol, self.block, 0)?;
        }
        vol.release(self.block)?;
        self.size = 0;
        Ok(())
    }

    /// Writes data through the pointer tree.
    fn write_tree(
        &mut self,
        vol: &mut Volume,
        ctx: &InodeContext,
        offset: u64,
        data: &[u8],
    ) -> Result<(), ArchiveError> {
        let block_size = ctx.block_size();
        let mut done = 0;
        while done < data.len() {
            let pos = offset + done as u64;
            let start = (pos % block_size as u64) as usize;
            let chunk = cmp::min(block_size - start, data.len() - done);
            let block = ctx.resolve_or_create(vol, self.block, pos)?;
            vol.block_mut(block)?.put_bytes(start, &data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Moves inlined content into the pointer tree.
    fn undo_inline(
        &mut self, vol: &mut Volume, ctx: &InodeContext
    ) -> Result<(), ArchiveError> {
        trace!("Moving inode {} out of line.", self.block);
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();
        scratch.resize(self.size as usize, 0);
        let block = vol.block_mut(self.block)?;
        block.get_bytes(HEADER_LEN, &mut scratch);
        block.zero(HEADER_LEN..ctx.block_size());
        self.inlined = false;
        let res = self.write_tree(vol, ctx, 0, &scratch);
        self.scratch = scratch;
        res?;
        self.write_header(vol)
    }

    /// Moves the first `new_size` bytes back into the inode block.
    fn redo_inline(
        &mut self, vol: &mut Volume, ctx: &InodeContext, new_size: u64
    ) -> Result<(), ArchiveError> {
        trace!("Moving inode {} back inline.", self.block);
        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();
        scratch.resize(new_size as usize, 0);
        let res = self.read_bytes(vol, ctx, 0, &mut scratch).and_then(|_| {
            ctx.truncate(vol, self.block, 0)
        });
        if let Err(err) = res {
            self.scratch = scratch;
            return Err(err)
        }
        let block = vol.block_mut(self.block)?;
        block.zero(HEADER_LEN..ctx.block_size());
        block.put_bytes(HEADER_LEN, &scratch);
        self.scratch = scratch;
        self.inlined = true;
        Ok(())
    }

    /// Writes the header to the inode block.
    fn write_header(&self, vol: &mut Volume) -> Result<(), ArchiveError> {
        let block = vol.block_mut(self.block)?;
        block.put_u8(TYPE_POS, self.kind as u8);
        block.put_u8(FLAGS_POS, if self.inlined { FLAG_INLINED } else { 0 });
        block.put_u16(RESERVED_POS, 0);
        block.put_u64(SIZE_POS, self.size);
        Ok(())
    }
}


//============ Testing =======================================================

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::archive::superblock::Superblock;
    use crate::archive::unused::LayoutKind;

    pub fn setup(block_size: u32) -> (Volume, InodeContext) {
        let max = 1 << 20;
        let vol = Volume::create(
            tempfile::tempfile().unwrap(),
            Superblock::new(block_size, max, LayoutKind::Shared).unwrap(),
            32
        ).unwrap();
        (vol, InodeContext::new(block_size, max).unwrap())
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn read(
        inode: &mut Inode, vol: &mut Volume, ctx: &InodeContext
    ) -> Vec<u8> {
        let mut res = Vec::new();
        inode.read_all(vol, ctx, &mut res).unwrap();
        res
    }

    #[test]
    fn create_and_open() {
        let (mut vol, ctx) = setup(64);
        let mut inode = Inode::default();
        inode.create(&mut vol, InodeKind::Directory).unwrap();
        inode.write_bytes(&mut vol, &ctx, 0, b"hello").unwrap();

        let mut other = Inode::default();
        other.open(&mut vol, &ctx, inode.block()).unwrap();
        assert_eq!(other.kind(), InodeKind::Directory);
        assert_eq!(other.size(), 5);
        assert!(other.is_inlined());
        assert_eq!(read(&mut other, &mut vol, &ctx), b"hello");

        vol.block_mut(inode.block()).unwrap().put_u8(TYPE_POS, 7);
        assert!(matches!(
            other.open(&mut vol, &ctx, inode.block()),
            Err(ArchiveError::Corrupt(_))
        ));
    }

    #[test]
    fn end_of_stream() {
        let (mut vol, ctx) = setup(64);
        let mut inode = Inode::default();
        inode.create(&mut vol, InodeKind::File).unwrap();
        assert_eq!(inode.read_byte(&mut vol, &ctx, 0).unwrap(), None);
        inode.write_byte(&mut vol, &ctx, 0, 42).unwrap();
        assert_eq!(inode.read_byte(&mut vol, &ctx, 0).unwrap(), Some(42));
        assert_eq!(inode.read_byte(&mut vol, &ctx, 1).unwrap(), None);

        let mut buf = [0u8; 10];
        assert_eq!(
            inode.read_bytes(&mut vol, &ctx, 0, &mut buf).unwrap(), Some(1)
        );
        assert_eq!(
            inode.read_bytes(&mut vol, &ctx, 5, &mut buf).unwrap(), None
        );
    }

    #[test]
    fn round_trip_sizes() {
        for block_size in [64u32, 128, 512, 4096] {
            let (mut vol, ctx) = setup(block_size);
            let inline = ctx.inline_capacity() as usize;
            let bs = block_size as usize;
            for len in [
                0, 1, inline - 1, inline, inline + 1, bs, 3 * bs + 7, 40 * bs
            ] {
                let data = content(len);
                let mut inode = Inode::default();
                inode.create(&mut vol, InodeKind::File).unwrap();
                inode.write_bytes(&mut vol, &ctx, 0, &data).unwrap();
                assert_eq!(inode.is_inlined(), len <= inline);
                assert_eq!(inode.size(), len as u64);
                assert_eq!(read(&mut inode, &mut vol, &ctx), data);
                vol.commit().unwrap();
            }
        }
    }

    #[test]
    fn inline_transitions() {
        let (mut vol, ctx) = setup(64);
        let base = vol.superblock().used();
        let data = content(1000);

        let mut inode = Inode::default();
        inode.create(&mut vol, InodeKind::File).unwrap();
        inode.write_bytes(&mut vol, &ctx, 0, &data[..30]).unwrap();
        assert!(inode.is_inlined());
        for chunk in data[30..].chunks(17) {
            let size = inode.size();
            inode.write_bytes(&mut vol, &ctx, size, chunk).unwrap();
        }
        assert!(!inode.is_inlined());
        assert_eq!(read(&mut inode, &mut vol, &ctx), data);

        inode.truncate(&mut vol, &ctx, 300).unwrap();
        assert!(!inode.is_inlined());
        assert_eq!(read(&mut inode, &mut vol, &ctx), &data[..300]);

        inode.truncate(&mut vol, &ctx, 20).unwrap();
        assert!(inode.is_inlined());
        assert_eq!(read(&mut inode, &mut vol, &ctx), &data[..20]);
        assert_eq!(vol.superblock().used(), base + 1);

        // Growing again exposes zeros, not the old content.
        inode.truncate(&mut vol, &ctx, 200).unwrap();
        let mut expected = data[..20].to_vec();
        expected.resize(200, 0);
        assert_eq!(read(&mut inode, &mut vol, &ctx), expected);

        // The same content written directly reads the same.
        let mut direct = Inode::default();
        direct.create(&mut vol, InodeKind::File).unwrap();
        direct.write_bytes(&mut vol, &ctx, 0, &expected).unwrap();
        assert_eq!(read(&mut direct, &mut vol, &ctx), expected);
    }

    #[test]
    fn sparse_writes() {
        let (mut vol, ctx) = setup(64);
        let mut inode = Inode::default();
        inode.create(&mut vol, InodeKind::File).unwrap();
        inode.write_bytes(&mut vol, &ctx, 5000, b"tail").unwrap();
        assert_eq!(inode.size(), 5004);
        let content = read(&mut inode, &mut vol, &ctx);
        assert!(content[..5000].iter().all(|&x| x == 0));
        assert_eq!(&content[5000..], b"tail");

        inode.write_bytes(&mut vol, &ctx, 10, b"head").unwrap();
        assert_eq!(inode.size(), 5004);
        assert_eq!(inode.read_byte(&mut vol, &ctx, 12).unwrap(), Some(b'a'));
    }

    #[test]
    fn capacity_boundary() {
        let (mut vol, ctx) = setup(64);
        let max = ctx.max_file_size_real();
        let mut inode = Inode::default();
        inode.create(&mut vol, InodeKind::File).unwrap();
        inode.write_byte(&mut vol, &ctx, max - 1, 1).unwrap();
        assert_eq!(inode.size(), max);

        let used = vol.superblock().used();
        let err = inode.write_byte(&mut vol, &ctx, max, 1).unwrap_err();
        assert!(err.is_capacity());
        assert!(
            inode.write_bytes(&mut vol, &ctx, max - 1, b"ab").is_err()
        );
        assert!(inode.truncate(&mut vol, &ctx, max + 1).is_err());
        assert_eq!(inode.size(), max);
        assert_eq!(vol.superblock().used(), used);
    }

    #[test]
    fn free_releases_everything() {
        let (mut vol, ctx) = setup(128);
        let base = vol.superblock().used();
        let mut inode = Inode::default();
        inode.create(&mut vol, InodeKind::File).unwrap();
        inode.write_bytes(&mut vol, &ctx, 0, &content(50_000)).unwrap();
        assert!(vol.superblock().used() > base + 390);
        inode.free(&mut vol, &ctx).unwrap();
        assert_eq!(vol.superblock().used(), base);
    }
}
