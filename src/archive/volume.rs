//! Block level access to an archive.
//!
//! This module ties together storage, cache, superblock, and unused map.
//! All changes to blocks go through here so that the blocks changed by an
//! operation can be collected and committed or dropped together.

use std::collections::BTreeSet;
use std::fs;
use log::{debug, warn};
use super::block::Block;
use super::cache::{BlockCache, CacheStats};
use super::error::ArchiveError;
use super::storage::Storage;
use super::superblock::Superblock;
use super::unused::{BlockKind, LayoutKind, UnusedMap};


//------------ BlockIo -------------------------------------------------------

/// Access to the blocks and the superblock.
///
/// Keeps track of the blocks handed out for modification since the last
/// commit, the working set.
#[derive(Debug)]
pub struct BlockIo {
    storage: Storage,
    cache: BlockCache,
    superblock: Superblock,

    /// The blocks changed since the last commit.
    working: BTreeSet<u32>,
}

impl BlockIo {
    pub fn new(
        storage: Storage, superblock: Superblock, cache_blocks: usize
    ) -> Self {
        BlockIo {
            storage,
            cache: BlockCache::new(cache_blocks),
            superblock,
            working: BTreeSet::new(),
        }
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    /// Returns the total number of blocks.
    pub fn total(&self) -> u32 {
        self.superblock.total()
    }

    pub fn block_size(&self) -> usize {
        self.storage.block_size()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Returns a block for reading.
    pub fn block(&mut self, index: u32) -> Result<&Block, ArchiveError> {
        self.cache.get(&mut self.storage, index).map(|block| &*block)
    }

    /// Returns a block for modification.
    pub fn block_mut(
        &mut self, index: u32
    ) -> Result<&mut Block, ArchiveError> {
        let block = self.cache.get(&mut self.storage, index)?;
        self.working.insert(index);
        Ok(block)
    }

    /// Returns a block for modification after setting it to all zeros.
    pub fn block_zeroed(
        &mut self, index: u32
    ) -> Result<&mut Block, ArchiveError> {
        let block = self.cache.get_zeroed(&mut self.storage, index)?;
        self.working.insert(index);
        Ok(block)
    }

    /// Adds a block to the end of the archive and returns its index.
    pub fn grow(&mut self) -> Result<u32, ArchiveError> {
        let index = self.superblock.total();
        let total = index.checked_add(1).ok_or(ArchiveError::Full)?;
        self.storage.set_block_count(total)?;
        self.superblock.set_total(total);
        Ok(index)
    }

    /// Writes out all changes made since the last commit.
    ///
    /// The superblock is written before the blocks.
    pub fn commit(&mut self) -> Result<(), ArchiveError> {
        self.superblock.write(&mut self.storage)?;
        self.cache.flush(&mut self.storage, &mut self.working)
    }

    /// Drops all changes made since the last commit.
    ///
    /// Changed blocks are kept in the cache until commit, so nothing of
    /// the dropped changes has reached the file.
    pub fn abort(&mut self) -> Result<(), ArchiveError> {
        self.cache.discard(&mut self.working);
        self.superblock.reload(&mut self.storage)?;
        let total = self.superblock.total();
        if self.storage.block_count() != total {
            debug!("Truncating archive back to {} blocks.", total);
            self.storage.set_block_count(total)?;
        }
        Ok(())
    }

    /// Writes out all pending changes and syncs the file.
    pub fn flush_all(&mut self) -> Result<(), ArchiveError> {
        self.superblock.write(&mut self.storage)?;
        self.cache.flush_all(&mut self.storage)?;
        self.working.clear();
        self.storage.sync()?;
        Ok(())
    }
}


//------------ Volume --------------------------------------------------------

/// The block layer of an archive.
#[derive(Debug)]
pub struct Volume {
    io: BlockIo,
    map: UnusedMap,
}

impl Volume {
    /// Creates an empty volume in the given file.
    ///
    /// The file is truncated and receives a new header. There are no
    /// blocks yet, the first allocation will create the first group.
    pub fn create(
        file: fs::File,
        superblock: Superblock,
        cache_blocks: usize,
    ) -> Result<Self, ArchiveError> {
        file.set_len(0)?;
        let mut storage = Storage::new(file, superblock.block_size(), 0);
        storage.set_block_count(0)?;
        Ok(Self::new(storage, superblock, cache_blocks))
    }

    /// Opens the volume in an existing file.
    pub fn open(
        mut file: fs::File, cache_blocks: usize
    ) -> Result<Self, ArchiveError> {
        let superblock = Superblock::read(&mut file)?;
        let storage = Storage::new(
            file, superblock.block_size(), superblock.total()
        );
        Ok(Self::new(storage, superblock, cache_blocks))
    }

    fn new(
        storage: Storage, superblock: Superblock, cache_blocks: usize
    ) -> Self {
        let map = UnusedMap::new(
            superblock.layout(), superblock.block_size()
        );
        Volume {
            io: BlockIo::new(storage, superblock, cache_blocks),
            map,
        }
    }

    pub fn superblock(&self) -> &Superblock {
        self.io.superblock()
    }

    pub fn block_size(&self) -> usize {
        self.io.block_size()
    }

    pub fn layout(&self) -> LayoutKind {
        self.map.kind()
    }

    /// Returns the block of the root directory’s inode.
    pub fn root(&self) -> u32 {
        self.io.superblock().root()
    }

    pub fn set_root(&mut self, root: u32) {
        self.io.superblock_mut().set_root(root)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.io.cache_stats()
    }

    pub fn map(&self) -> &UnusedMap {
        &self.map
    }

    /// Allocates a new block filled with zeros.
    pub fn allocate(
        &mut self, kind: BlockKind
    ) -> Result<u32, ArchiveError> {
        let index = self.map.allocate(&mut self.io, kind)?;
        self.io.block_zeroed(index)?;
        Ok(index)
    }

    /// Returns a block to the unused map.
    pub fn release(&mut self, index: u32) -> Result<(), ArchiveError> {
        self.map.release(&mut self.io, index)
    }

    pub fn block(&mut self, index: u32) -> Result<&Block, ArchiveError> {
        self.io.block(index)
    }

    pub fn block_mut(
        &mut self, index: u32
    ) -> Result<&mut Block, ArchiveError> {
        self.io.block_mut(index)
    }

    /// Returns whether the unused map has a block marked as used.
    pub fn is_used(&mut self, index: u32) -> Result<bool, ArchiveError> {
        self.map.is_used(&mut self.io, index)
    }

    /// Returns whether the unused map has a block marked as an inode.
    pub fn is_inode(
        &mut self, index: u32
    ) -> Result<Option<bool>, ArchiveError> {
        self.map.is_inode(&mut self.io, index)
    }

    /// Commits the changes of the current operation.
    pub fn commit(&mut self) -> Result<(), ArchiveError> {
        self.io.commit()
    }

    /// Drops the changes of the current operation.
    pub fn abort(&mut self) {
        self.map.reset_hints();
        if let Err(err) = self.io.abort() {
            warn!("Failed to roll back archive changes: {}", err);
        }
    }

    /// Writes all pending changes to disk.
    pub fn flush(&mut self) -> Result<(), ArchiveError> {
        self.io.flush_all()
    }
}


//============ Testing =======================================================

#[cfg(test)]
pub mod test {
    use super::*;

    pub fn block_io(block_size: u32, layout: LayoutKind) -> BlockIo {
        let mut storage = Storage::new(
            tempfile::tempfile().unwrap(), block_size, 0
        );
        storage.set_block_count(0).unwrap();
        BlockIo::new(
            storage,
            Superblock::new(block_size, 1 << 20, layout).unwrap(),
            16
        )
    }

    fn volume(file: fs::File) -> Volume {
        Volume::create(
            file,
            Superblock::new(64, 1 << 20, LayoutKind::Shared).unwrap(),
            8
        ).unwrap()
    }

    #[test]
    fn commit_and_reopen() {
        let file = tempfile::tempfile().unwrap();
        let mut volume = volume(file.try_clone().unwrap());
        let root = volume.allocate(BlockKind::Inode).unwrap();
        assert_eq!(root, 1);
        volume.set_root(root);
        volume.block_mut(root).unwrap().put_u32(0, 0x01020304);
        volume.commit().unwrap();
        assert_eq!(file.metadata().unwrap().len(), 3 * 64);

        let mut volume = Volume::open(file, 8).unwrap();
        assert_eq!(volume.root(), 1);
        assert_eq!(volume.superblock().used(), 2);
        assert_eq!(volume.superblock().total(), 2);
        assert_eq!(volume.block(1).unwrap().get_u32(0), 0x01020304);
        assert!(volume.is_used(1).unwrap());
        assert!(!volume.is_used(2).unwrap());
    }

    #[test]
    fn abort_rolls_back() {
        let file = tempfile::tempfile().unwrap();
        let mut volume = volume(file.try_clone().unwrap());
        volume.allocate(BlockKind::Inode).unwrap();
        volume.commit().unwrap();

        for _ in 0..3 {
            volume.allocate(BlockKind::Data).unwrap();
        }
        volume.block_mut(1).unwrap().put_u8(0, 9);
        assert_eq!(volume.superblock().total(), 5);
        volume.abort();

        assert_eq!(volume.superblock().total(), 2);
        assert_eq!(volume.superblock().used(), 2);
        assert_eq!(file.metadata().unwrap().len(), 3 * 64);
        assert_eq!(volume.block(1).unwrap().get_u8(0), 0);
        assert_eq!(volume.allocate(BlockKind::Data).unwrap(), 2);
    }

    #[test]
    fn abort_with_small_cache() {
        let file = tempfile::tempfile().unwrap();
        let mut volume = Volume::create(
            file.try_clone().unwrap(),
            Superblock::new(64, 1 << 20, LayoutKind::Shared).unwrap(),
            4
        ).unwrap();
        volume.allocate(BlockKind::Inode).unwrap();
        volume.commit().unwrap();

        for _ in 0..20 {
            let index = volume.allocate(BlockKind::Data).unwrap();
            volume.block_mut(index).unwrap().put_u8(0, 0xFF);
        }
        assert_eq!(volume.cache_stats().writes, 2);
        volume.abort();

        assert_eq!(volume.superblock().total(), 2);
        assert_eq!(volume.superblock().used(), 2);
        assert_eq!(file.metadata().unwrap().len(), 3 * 64);
        assert!(volume.is_used(1).unwrap());
        for index in 2..5 {
            assert_eq!(volume.allocate(BlockKind::Data).unwrap(), index);
        }
        volume.commit().unwrap();

        let mut volume = Volume::open(file, 4).unwrap();
        assert_eq!(volume.superblock().total(), 5);
        assert!(volume.is_used(4).unwrap());
        assert!(!volume.is_used(5).unwrap());
    }

    #[test]
    fn allocated_blocks_are_zeroed() {
        let mut volume = volume(tempfile::tempfile().unwrap());
        let index = volume.allocate(BlockKind::Data).unwrap();
        volume.block_mut(index).unwrap().put_bytes(0, &[0xFF; 64]);
        volume.commit().unwrap();
        volume.release(index).unwrap();
        assert_eq!(volume.allocate(BlockKind::Data).unwrap(), index);
        assert!(
            volume.block(index).unwrap().as_slice().iter().all(|&x| x == 0)
        );
    }
}
