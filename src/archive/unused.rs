//! The unused map.
//!
//! Free space is tracked by bitmaps. The blocks of the archive are split
//! into groups of equal size. The first block of each group holds the
//! bitmap for the group and is therefore always in use. The last octet of
//! the bitmap block is the skip flag: if it is non-zero, the group had no
//! free block when it was last scanned.
//!
//! How blocks are represented in the bitmap depends on the layout chosen
//! when the archive was created. The layouts implement the
//! [`BitmapLayout`] trait.
//!
//! Blocks beyond the end of the file are free in the bitmap. Allocating
//! such a block grows the file. When all groups are full, a new group is
//! appended.

use std::{fmt, str};
use std::collections::BTreeSet;
use log::debug;
use serde::Serialize;
use super::block::Block;
use super::error::ArchiveError;
use super::volume::BlockIo;


//------------ BlockKind -----------------------------------------------------

/// What a block is allocated for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockKind {
    /// The block holds an inode.
    Inode,

    /// The block holds file or directory data or tree pointers.
    Data,
}


//------------ LayoutKind ----------------------------------------------------

/// The layout of the unused map as stored in the superblock.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum LayoutKind {
    /// One bit per block, shared by all kinds of blocks.
    #[default]
    Shared = 0,

    /// Two bits per block, distinguishing inode blocks.
    Typed = 1,
}

impl LayoutKind {
    /// Returns the layout for the value stored in the superblock.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(LayoutKind::Shared),
            1 => Some(LayoutKind::Typed),
            _ => None,
        }
    }

    /// Creates the bitmap implementation for the given block size.
    pub fn bitmap(self, block_size: u32) -> Box<dyn BitmapLayout> {
        let map_len = block_size as usize - 1;
        match self {
            LayoutKind::Shared => Box::new(SharedBits { map_len }),
            LayoutKind::Typed => Box::new(TypedBits { map_len }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LayoutKind::Shared => "shared",
            LayoutKind::Typed => "typed",
        }
    }
}

impl str::FromStr for LayoutKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shared" => Ok(LayoutKind::Shared),
            "typed" => Ok(LayoutKind::Typed),
            _ => Err(format!("unknown unused map layout '{}'", s))
        }
    }
}

impl fmt::Display for LayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ BitmapLayout --------------------------------------------------

/// The encoding of block states in a group’s bitmap block.
///
/// Slots are positions within the group, with slot 0 being the bitmap
/// block itself. Implementations only ever touch the first
/// `block_size - 1` octets of the block.
pub trait BitmapLayout: fmt::Debug {
    /// Returns the layout kind for the superblock.
    fn kind(&self) -> LayoutKind;

    /// Returns the number of blocks covered by one bitmap.
    fn blocks_per_group(&self) -> u32;

    /// Returns whether the block in `slot` is in use.
    fn is_used(&self, bitmap: &Block, slot: u32) -> bool;

    /// Returns whether the block in `slot` holds an inode.
    ///
    /// Returns `None` if the layout doesn’t record this.
    fn is_inode(&self, bitmap: &Block, slot: u32) -> Option<bool>;

    /// Marks the block in `slot` as used for the given purpose.
    fn mark_used(&self, bitmap: &mut Block, slot: u32, kind: BlockKind);

    /// Marks the block in `slot` as free.
    fn mark_free(&self, bitmap: &mut Block, slot: u32);

    /// Returns the lowest free slot or `None` if the group is full.
    fn first_free(&self, bitmap: &Block) -> Option<u32>;
}


//------------ SharedBits ----------------------------------------------------

/// One bit per block, most significant bit first.
#[derive(Clone, Copy, Debug)]
pub struct SharedBits {
    map_len: usize,
}

impl SharedBits {
    fn position(slot: u32) -> (usize, u8) {
        ((slot / 8) as usize, 0x80 >> (slot % 8))
    }
}

impl BitmapLayout for SharedBits {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Shared
    }

    fn blocks_per_group(&self) -> u32 {
        (self.map_len * 8) as u32
    }

    fn is_used(&self, bitmap: &Block, slot: u32) -> bool {
        let (pos, mask) = Self::position(slot);
        bitmap.get_u8(pos) & mask != 0
    }

    fn is_inode(&self, _bitmap: &Block, _slot: u32) -> Option<bool> {
        None
    }

    fn mark_used(&self, bitmap: &mut Block, slot: u32, _kind: BlockKind) {
        let (pos, mask) = Self::position(slot);
        bitmap.put_u8(pos, bitmap.get_u8(pos) | mask)
    }

    fn mark_free(&self, bitmap: &mut Block, slot: u32) {
        let (pos, mask) = Self::position(slot);
        bitmap.put_u8(pos, bitmap.get_u8(pos) & !mask)
    }

    fn first_free(&self, bitmap: &Block) -> Option<u32> {
        let map = &bitmap.as_slice()[..self.map_len];
        let pos = map.iter().position(|&octet| octet != 0xFF)?;
        Some(pos as u32 * 8 + (!map[pos]).leading_zeros())
    }
}


//------------ TypedBits -----------------------------------------------------

/// Two bits per block: a used bit followed by an inode bit.
#[derive(Clone, Copy, Debug)]
pub struct TypedBits {
    map_len: usize,
}

impl TypedBits {
    const USED: u8 = 0b10;
    const INODE: u8 = 0b01;

    /// Mask with the used bits of all four blocks in an octet.
    const ALL_USED: u8 = 0xAA;

    fn position(slot: u32) -> (usize, u32) {
        ((slot / 4) as usize, 6 - 2 * (slot % 4))
    }

    fn bits(bitmap: &Block, slot: u32) -> u8 {
        let (pos, shift) = Self::position(slot);
        (bitmap.get_u8(pos) >> shift) & 0b11
    }
}

impl BitmapLayout for TypedBits {
    fn kind(&self) -> LayoutKind {
        LayoutKind::Typed
    }

    fn blocks_per_group(&self) -> u32 {
        (self.map_len * 4) as u32
    }

    fn is_used(&self, bitmap: &Block, slot: u32) -> bool {
        Self::bits(bitmap, slot) & Self::USED != 0
    }

    fn is_inode(&self, bitmap: &Block, slot: u32) -> Option<bool> {
        Some(Self::bits(bitmap, slot) & Self::INODE != 0)
    }

    fn mark_used(&self, bitmap: &mut Block, slot: u32, kind: BlockKind) {
        let (pos, shift) = Self::position(slot);
        let bits = match kind {
            BlockKind::Inode => Self::USED | Self::INODE,
            BlockKind::Data => Self::USED,
        };
        let octet = bitmap.get_u8(pos) & !(0b11 << shift);
        bitmap.put_u8(pos, octet | bits << shift)
    }

    fn mark_free(&self, bitmap: &mut Block, slot: u32) {
        let (pos, shift) = Self::position(slot);
        bitmap.put_u8(pos, bitmap.get_u8(pos) & !(0b11 << shift))
    }

    fn first_free(&self, bitmap: &Block) -> Option<u32> {
        let map = &bitmap.as_slice()[..self.map_len];
        let pos = map.iter().position(|&octet| {
            octet & Self::ALL_USED != Self::ALL_USED
        })?;
        let free = !map[pos] & Self::ALL_USED;
        Some(pos as u32 * 4 + free.leading_zeros() / 2)
    }
}


//------------ UnusedMap -----------------------------------------------------

/// The free space allocator.
///
/// Besides the bitmaps stored in the archive, the map keeps two hints in
/// memory: the set of groups known to have free blocks because a block was
/// released there, and the first group that may have free blocks at all.
#[derive(Debug)]
pub struct UnusedMap {
    /// The encoding of the bitmaps.
    layout: Box<dyn BitmapLayout>,

    /// The number of blocks per group.
    per_group: u32,

    /// The position of the skip flag in a bitmap block.
    skip_pos: usize,

    /// Groups that have had blocks released.
    known_free: BTreeSet<u32>,

    /// All groups before this one are full.
    start_group: u32,
}

impl UnusedMap {
    /// Creates a new map for the given layout and block size.
    pub fn new(kind: LayoutKind, block_size: u32) -> Self {
        let layout = kind.bitmap(block_size);
        UnusedMap {
            per_group: layout.blocks_per_group(),
            layout,
            skip_pos: block_size as usize - 1,
            known_free: BTreeSet::new(),
            start_group: 0,
        }
    }

    /// Returns the layout kind.
    pub fn kind(&self) -> LayoutKind {
        self.layout.kind()
    }

    /// Returns the number of blocks per group.
    pub fn blocks_per_group(&self) -> u32 {
        self.per_group
    }

    /// Returns the number of groups in an archive of `total` blocks.
    pub fn group_count(&self, total: u32) -> u32 {
        total / self.per_group + u32::from(total % self.per_group != 0)
    }

    /// Returns whether a block is the bitmap block of its group.
    pub fn is_bitmap_block(&self, index: u32) -> bool {
        index % self.per_group == 0
    }

    /// Forgets the in-memory hints.
    ///
    /// This is necessary whenever the bitmaps have been reset to an
    /// earlier state.
    pub fn reset_hints(&mut self) {
        self.known_free.clear();
        self.start_group = 0;
    }

    /// Allocates the lowest free block.
    ///
    /// Groups with released blocks are tried first, then all groups not
    /// known to be full, in order. If that fails, a new group is appended.
    /// The content of the returned block is undefined.
    pub fn allocate(
        &mut self, io: &mut BlockIo, kind: BlockKind
    ) -> Result<u32, ArchiveError> {
        while let Some(&group) = self.known_free.first() {
            if let Some(index) = self.allocate_in_group(io, group, kind)? {
                return Ok(index)
            }
            self.known_free.remove(&group);
        }

        let group_count = self.group_count(io.total());
        while self.start_group < group_count {
            let group = self.start_group;
            if !self.is_skipped(io, group)? {
                if let Some(index) = self.allocate_in_group(io, group, kind)? {
                    return Ok(index)
                }
            }
            self.start_group += 1;
        }

        let group = self.append_group(io)?;
        self.allocate_in_group(io, group, kind)?.ok_or(
            ArchiveError::Corrupt("fresh group has no free block")
        )
    }

    /// Releases a block.
    ///
    /// Releasing a bitmap block, a block beyond the end of the archive, or
    /// a block that is already free means the archive is corrupt.
    pub fn release(
        &mut self, io: &mut BlockIo, index: u32
    ) -> Result<(), ArchiveError> {
        if self.is_bitmap_block(index) {
            return Err(ArchiveError::Corrupt("release of bitmap block"))
        }
        if index >= io.total() {
            return Err(ArchiveError::Corrupt("release beyond end of archive"))
        }
        let group = index / self.per_group;
        let slot = index % self.per_group;
        let bitmap = group * self.per_group;
        if !self.layout.is_used(io.block(bitmap)?, slot) {
            return Err(ArchiveError::Corrupt("release of free block"))
        }
        let block = io.block_mut(bitmap)?;
        self.layout.mark_free(block, slot);
        block.put_u8(self.skip_pos, 0);
        io.superblock_mut().dec_used()?;
        self.known_free.insert(group);
        Ok(())
    }

    /// Formats the bitmap block of a group.
    ///
    /// The bitmap block must already exist. Afterwards, all blocks but the
    /// bitmap block itself are free.
    pub fn initialize_group(
        &mut self, io: &mut BlockIo, group: u32
    ) -> Result<(), ArchiveError> {
        let bitmap = self.bitmap_block(group)?;
        let block = io.block_zeroed(bitmap)?;
        self.layout.mark_used(block, 0, BlockKind::Data);
        io.superblock_mut().inc_used()?;
        debug!("Initialized unused map group {} at block {}.", group, bitmap);
        Ok(())
    }

    /// Returns whether a block is marked as used.
    pub fn is_used(
        &self, io: &mut BlockIo, index: u32
    ) -> Result<bool, ArchiveError> {
        if index >= io.total() {
            return Ok(false)
        }
        let (bitmap, slot) = self.split(index);
        Ok(self.layout.is_used(io.block(bitmap)?, slot))
    }

    /// Returns whether a block is marked as holding an inode.
    ///
    /// Returns `None` if the layout doesn’t keep track.
    pub fn is_inode(
        &self, io: &mut BlockIo, index: u32
    ) -> Result<Option<bool>, ArchiveError> {
        let (bitmap, slot) = self.split(index);
        Ok(self.layout.is_inode(io.block(bitmap)?, slot))
    }

    /// Returns the bitmap block and slot of a block.
    fn split(&self, index: u32) -> (u32, u32) {
        let slot = index % self.per_group;
        (index - slot, slot)
    }

    /// Returns the index of the bitmap block of a group.
    fn bitmap_block(&self, group: u32) -> Result<u32, ArchiveError> {
        group.checked_mul(self.per_group).ok_or(ArchiveError::Full)
    }

    /// Returns whether the skip flag of a group is set.
    fn is_skipped(
        &self, io: &mut BlockIo, group: u32
    ) -> Result<bool, ArchiveError> {
        let bitmap = self.bitmap_block(group)?;
        Ok(io.block(bitmap)?.get_u8(self.skip_pos) != 0)
    }

    /// Tries to allocate a block in the given group.
    ///
    /// Sets the skip flag and returns `None` if the group is full.
    fn allocate_in_group(
        &mut self, io: &mut BlockIo, group: u32, kind: BlockKind
    ) -> Result<Option<u32>, ArchiveError> {
        let bitmap = self.bitmap_block(group)?;
        let slot = match self.layout.first_free(io.block(bitmap)?) {
            Some(slot) => slot,
            None => {
                io.block_mut(bitmap)?.put_u8(self.skip_pos, 1);
                return Ok(None)
            }
        };
        let index = bitmap.checked_add(slot).ok_or(ArchiveError::Full)?;
        if index >= io.total() {
            if index != io.total() {
                return Err(ArchiveError::Corrupt("used block beyond end"))
            }
            io.grow()?;
        }
        self.layout.mark_used(io.block_mut(bitmap)?, slot, kind);
        io.superblock_mut().inc_used()?;
        Ok(Some(index))
    }

    /// Appends a new group to the end of the archive.
    fn append_group(
        &mut self, io: &mut BlockIo
    ) -> Result<u32, ArchiveError> {
        let group = self.group_count(io.total());
        let bitmap = self.bitmap_block(group)?;
        if bitmap != io.total() {
            return Err(ArchiveError::Corrupt("last group not full"))
        }
        io.grow()?;
        self.initialize_group(io, group)?;
        Ok(group)
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::volume::test::block_io;

    #[test]
    fn shared_bits() {
        let layout = LayoutKind::Shared.bitmap(64);
        assert_eq!(layout.blocks_per_group(), 63 * 8);
        let mut block = Block::new(0, vec![0; 64]);
        assert_eq!(layout.first_free(&block), Some(0));
        layout.mark_used(&mut block, 0, BlockKind::Data);
        layout.mark_used(&mut block, 1, BlockKind::Inode);
        layout.mark_used(&mut block, 9, BlockKind::Data);
        assert_eq!(block.get_u8(0), 0xC0);
        assert_eq!(block.get_u8(1), 0x40);
        assert_eq!(layout.first_free(&block), Some(2));
        assert_eq!(layout.is_inode(&block, 1), None);
        layout.mark_free(&mut block, 1);
        assert!(!layout.is_used(&block, 1));
        assert!(layout.is_used(&block, 9));

        block.zero(0..63);
        block.put_bytes(0, &[0xFF; 63]);
        assert_eq!(layout.first_free(&block), None);
        block.put_u8(62, 0xFE);
        assert_eq!(layout.first_free(&block), Some(62 * 8 + 7));
    }

    #[test]
    fn typed_bits() {
        let layout = LayoutKind::Typed.bitmap(64);
        assert_eq!(layout.blocks_per_group(), 63 * 4);
        let mut block = Block::new(0, vec![0; 64]);
        layout.mark_used(&mut block, 0, BlockKind::Data);
        layout.mark_used(&mut block, 1, BlockKind::Inode);
        layout.mark_used(&mut block, 3, BlockKind::Data);
        assert_eq!(block.get_u8(0), 0b1011_0010);
        assert_eq!(layout.first_free(&block), Some(2));
        assert_eq!(layout.is_inode(&block, 1), Some(true));
        assert_eq!(layout.is_inode(&block, 3), Some(false));
        layout.mark_free(&mut block, 1);
        assert_eq!(block.get_u8(0), 0b1000_0010);
        assert_eq!(layout.first_free(&block), Some(1));

        block.put_bytes(0, &[0xAA; 63]);
        assert_eq!(layout.first_free(&block), None);
    }

    #[test]
    fn layout_names() {
        assert_eq!("typed".parse::<LayoutKind>(), Ok(LayoutKind::Typed));
        assert_eq!("shared".parse::<LayoutKind>(), Ok(LayoutKind::Shared));
        assert!("other".parse::<LayoutKind>().is_err());
        assert_eq!(LayoutKind::Typed.to_string(), "typed");
        assert_eq!(LayoutKind::from_u8(1), Some(LayoutKind::Typed));
        assert_eq!(LayoutKind::from_u8(2), None);
    }

    #[test]
    fn ascending_allocation() {
        for kind in [LayoutKind::Shared, LayoutKind::Typed] {
            let mut io = block_io(64, kind);
            let mut map = UnusedMap::new(kind, 64);
            let per_group = map.blocks_per_group();

            // The first allocation creates group 0 with its bitmap at 0.
            for expected in 1..per_group {
                assert_eq!(
                    map.allocate(&mut io, BlockKind::Data).unwrap(), expected
                );
            }
            assert_eq!(io.total(), per_group);
            assert_eq!(io.superblock().used(), per_group);

            // The group is full now, so the next one is appended.
            assert_eq!(
                map.allocate(&mut io, BlockKind::Data).unwrap(),
                per_group + 1
            );
            assert_eq!(io.total(), per_group + 2);
            assert!(map.is_used(&mut io, per_group).unwrap());
            assert_eq!(io.block(0).unwrap().get_u8(63), 1);
        }
    }

    #[test]
    fn release_and_reallocate() {
        let mut io = block_io(64, LayoutKind::Shared);
        let mut map = UnusedMap::new(LayoutKind::Shared, 64);
        for _ in 0..10 {
            map.allocate(&mut io, BlockKind::Data).unwrap();
        }
        map.release(&mut io, 7).unwrap();
        map.release(&mut io, 4).unwrap();
        assert_eq!(io.superblock().used(), 9);
        assert!(!map.is_used(&mut io, 4).unwrap());
        assert_eq!(map.allocate(&mut io, BlockKind::Data).unwrap(), 4);
        assert_eq!(map.allocate(&mut io, BlockKind::Data).unwrap(), 7);
        assert_eq!(map.allocate(&mut io, BlockKind::Data).unwrap(), 11);
        assert_eq!(io.superblock().used(), 12);
    }

    #[test]
    fn release_in_full_group() {
        let mut io = block_io(64, LayoutKind::Typed);
        let mut map = UnusedMap::new(LayoutKind::Typed, 64);
        let per_group = map.blocks_per_group();
        for _ in 0..per_group {
            map.allocate(&mut io, BlockKind::Inode).unwrap();
        }
        assert_eq!(io.block(0).unwrap().get_u8(63), 1);
        assert_eq!(map.start_group, 1);

        map.release(&mut io, 5).unwrap();
        assert_eq!(io.block(0).unwrap().get_u8(63), 0);
        assert_eq!(map.allocate(&mut io, BlockKind::Data).unwrap(), 5);
        assert_eq!(map.is_inode(&mut io, 5).unwrap(), Some(false));
        assert_eq!(map.is_inode(&mut io, 6).unwrap(), Some(true));

        // Without hints the skip flags still lead to the right block.
        map.release(&mut io, 9).unwrap();
        map.reset_hints();
        assert_eq!(map.allocate(&mut io, BlockKind::Data).unwrap(), 9);
    }

    #[test]
    fn bad_releases() {
        let mut io = block_io(64, LayoutKind::Shared);
        let mut map = UnusedMap::new(LayoutKind::Shared, 64);
        map.allocate(&mut io, BlockKind::Data).unwrap();
        map.allocate(&mut io, BlockKind::Data).unwrap();
        assert!(matches!(
            map.release(&mut io, 0), Err(ArchiveError::Corrupt(_))
        ));
        assert!(matches!(
            map.release(&mut io, 3), Err(ArchiveError::Corrupt(_))
        ));
        map.release(&mut io, 2).unwrap();
        assert!(matches!(
            map.release(&mut io, 2), Err(ArchiveError::Corrupt(_))
        ));
    }
}
