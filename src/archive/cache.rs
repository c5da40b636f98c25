//! The block cache.
//!
//! All block access goes through a bounded cache. Blocks are read from the
//! file on first access and written back only when the working set of an
//! operation is flushed.
//!
//! Access order is tracked in a doubly linked list threaded through the
//! map entries themselves. The links are block indexes rather than
//! references so that no entry ever owns or borrows another one.
//!
//! Dirty blocks are never evicted. When eviction runs into one, the block
//! is pinned: it is taken out of the access list and stays in the map until
//! it is flushed or discarded. While an operation has more dirty blocks
//! than fit, the cache holds more blocks than its capacity.

use std::collections::{BTreeSet, HashMap};
use log::trace;
use serde::Serialize;
use super::block::Block;
use super::error::ArchiveError;
use super::storage::Storage;


//------------ Configuration -------------------------------------------------

/// The smallest number of blocks the cache will hold.
///
/// The deepest operation touches a handful of blocks at once, so a smaller
/// cache would only thrash.
pub const MIN_CAPACITY: usize = 4;


//------------ BlockCache ----------------------------------------------------

/// A least-recently-used cache of blocks.
#[derive(Debug)]
pub struct BlockCache {
    /// The maximum number of blocks kept.
    capacity: usize,

    /// The cached blocks.
    entries: HashMap<u32, CacheEntry>,

    /// The most recently used block.
    head: Option<u32>,

    /// The least recently used block.
    tail: Option<u32>,

    /// A buffer left over from an eviction, ready for the next miss.
    spare: Option<Vec<u8>>,

    /// Access statistics.
    stats: CacheStats,
}

/// A block in the cache along with its position in the access list.
#[derive(Debug)]
struct CacheEntry {
    block: Block,

    /// The next more recently used block.
    prev: Option<u32>,

    /// The next less recently used block.
    next: Option<u32>,

    /// The block is dirty and not part of the access list.
    pinned: bool,
}

impl BlockCache {
    /// Creates a new, empty cache holding at most `capacity` blocks.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        BlockCache {
            capacity,
            entries: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
            spare: None,
            stats: Default::default(),
        }
    }

    /// Returns the number of blocks currently cached.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the access statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Returns the block with the given index.
    ///
    /// Reads the block from storage if it isn’t cached yet. Fails if the
    /// index is beyond the end of the storage.
    pub fn get(
        &mut self, storage: &mut Storage, index: u32
    ) -> Result<&mut Block, ArchiveError> {
        if index >= storage.block_count() {
            return Err(ArchiveError::Corrupt("block index out of range"))
        }
        if self.entries.contains_key(&index) {
            self.stats.hits += 1;
            self.unlink(index);
            self.push_front(index);
        }
        else {
            self.stats.misses += 1;
            let mut buf = self.take_buffer(storage)?;
            if let Err(err) = storage.read_block(index, &mut buf) {
                self.spare = Some(buf);
                return Err(err.into())
            }
            self.insert(Block::new(index, buf));
        }
        self.entry_block(index)
    }

    /// Returns the block with the given index after zeroing it.
    ///
    /// The block isn’t read from storage if it isn’t cached. This is used
    /// for freshly allocated blocks whose old content is irrelevant.
    pub fn get_zeroed(
        &mut self, storage: &mut Storage, index: u32
    ) -> Result<&mut Block, ArchiveError> {
        if index >= storage.block_count() {
            return Err(ArchiveError::Corrupt("block index out of range"))
        }
        if self.entries.contains_key(&index) {
            self.unlink(index);
            self.push_front(index);
        }
        else {
            let buf = self.take_buffer(storage)?;
            self.insert(Block::new(index, buf));
        }
        let block = self.entry_block(index)?;
        block.zero_all();
        Ok(block)
    }

    /// Writes back all dirty blocks of the working set.
    ///
    /// Pinned blocks become evictable again. The set is empty afterwards.
    pub fn flush(
        &mut self, storage: &mut Storage, working: &mut BTreeSet<u32>
    ) -> Result<(), ArchiveError> {
        while let Some(index) = working.first().copied() {
            let pinned = match self.entries.get_mut(&index) {
                Some(entry) => {
                    if entry.block.is_dirty() {
                        storage.write_block(index, entry.block.as_slice())?;
                        entry.block.set_clean();
                        self.stats.writes += 1;
                    }
                    entry.pinned
                }
                None => false
            };
            if pinned {
                self.push_front(index);
            }
            working.remove(&index);
        }
        Ok(())
    }

    /// Writes back every dirty block in the cache.
    pub fn flush_all(
        &mut self, storage: &mut Storage
    ) -> Result<(), ArchiveError> {
        let mut dirty: BTreeSet<_> = self.entries.iter().filter_map(
            |(index, entry)| entry.block.is_dirty().then_some(*index)
        ).collect();
        self.flush(storage, &mut dirty)
    }

    /// Drops the blocks of the working set without writing them.
    ///
    /// The set is empty afterwards.
    pub fn discard(&mut self, working: &mut BTreeSet<u32>) {
        while let Some(index) = working.pop_first() {
            if self.entries.contains_key(&index) {
                self.unlink(index);
                if let Some(entry) = self.entries.remove(&index) {
                    self.spare = Some(entry.block.into_buf());
                }
            }
        }
    }

    /// Returns a reference to a cached block.
    fn entry_block(
        &mut self, index: u32
    ) -> Result<&mut Block, ArchiveError> {
        self.entries.get_mut(&index).map(|entry| &mut entry.block).ok_or(
            ArchiveError::Corrupt("block vanished from cache")
        )
    }

    /// Returns a buffer for a new block.
    ///
    /// If the cache is full, evicts the least recently used clean block
    /// first and reuses its buffer.
    fn take_buffer(
        &mut self, storage: &mut Storage
    ) -> Result<Vec<u8>, ArchiveError> {
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        Ok(match self.spare.take() {
            Some(buf) => buf,
            None => vec![0; storage.block_size()],
        })
    }

    /// Evicts the least recently used clean block.
    ///
    /// Dirty blocks found on the way are pinned. If there are only dirty
    /// blocks, nothing is evicted.
    fn evict(&mut self) {
        while let Some(index) = self.tail {
            let dirty = match self.entries.get(&index) {
                Some(entry) => entry.block.is_dirty(),
                None => {
                    // The list is out of sync. Start over with an empty one.
                    self.head = None;
                    self.tail = None;
                    return
                }
            };
            self.unlink(index);
            if dirty {
                trace!("Pinning dirty block {}.", index);
                if let Some(entry) = self.entries.get_mut(&index) {
                    entry.pinned = true;
                }
                continue
            }
            if let Some(entry) = self.entries.remove(&index) {
                self.spare = Some(entry.block.into_buf());
            }
            self.stats.evictions += 1;
            return
        }
    }

    /// Adds a block as the most recently used.
    fn insert(&mut self, block: Block) {
        let index = block.index();
        self.entries.insert(
            index, CacheEntry { block, prev: None, next: None, pinned: false }
        );
        self.push_front(index);
    }

    /// Links an entry in as the most recently used.
    fn push_front(&mut self, index: u32) {
        let old_head = self.head;
        if let Some(entry) = self.entries.get_mut(&index) {
            entry.prev = None;
            entry.next = old_head;
            entry.pinned = false;
        }
        match old_head.and_then(|head| self.entries.get_mut(&head)) {
            Some(head) => head.prev = Some(index),
            None => self.tail = Some(index),
        }
        self.head = Some(index);
    }

    /// Unlinks an entry from the access list.
    ///
    /// Does nothing for pinned entries.
    fn unlink(&mut self, index: u32) {
        let (prev, next) = match self.entries.get_mut(&index) {
            Some(entry) if !entry.pinned => {
                (entry.prev.take(), entry.next.take())
            }
            _ => return
        };
        match prev.and_then(|prev| self.entries.get_mut(&prev)) {
            Some(entry) => entry.next = next,
            None => self.head = next,
        }
        match next.and_then(|next| self.entries.get_mut(&next)) {
            Some(entry) => entry.prev = prev,
            None => self.tail = prev,
        }
    }
}


//------------ CacheStats ----------------------------------------------------

/// Statistics of cache use.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct CacheStats {
    /// The number of lookups that found the block in the cache.
    pub hits: u64,

    /// The number of lookups that had to read the block.
    pub misses: u64,

    /// The number of blocks evicted.
    pub evictions: u64,

    /// The number of blocks written back.
    pub writes: u64,
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    const SIZE: u32 = 64;

    fn storage(blocks: u32) -> Storage {
        let mut res = Storage::new(tempfile::tempfile().unwrap(), SIZE, 0);
        res.set_block_count(blocks).unwrap();
        res
    }

    /// Returns the indexes in access order, most recent first.
    fn order(cache: &BlockCache) -> Vec<u32> {
        let mut res = Vec::new();
        let mut curr = cache.head;
        while let Some(index) = curr {
            res.push(index);
            curr = cache.entries[&index].next;
        }
        res
    }

    #[test]
    fn lru_order_and_eviction() {
        let mut storage = storage(8);
        let mut cache = BlockCache::new(MIN_CAPACITY);
        for i in 0..4 {
            cache.get(&mut storage, i).unwrap();
        }
        assert_eq!(order(&cache), [3, 2, 1, 0]);
        cache.get(&mut storage, 1).unwrap();
        assert_eq!(order(&cache), [1, 3, 2, 0]);
        assert_eq!(cache.tail, Some(0));

        cache.get(&mut storage, 5).unwrap();
        assert_eq!(order(&cache), [5, 1, 3, 2]);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 5);
    }

    #[test]
    fn dirty_blocks_are_pinned() {
        let mut storage = storage(8);
        let mut cache = BlockCache::new(MIN_CAPACITY);
        cache.get(&mut storage, 0).unwrap().put_u32(0, 0xdeadbeef);
        for i in 1..5 {
            cache.get(&mut storage, i).unwrap();
        }
        assert_eq!(order(&cache), [4, 3, 2]);
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().writes, 0);
        let mut buf = vec![0; SIZE as usize];
        storage.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0, 0, 0, 0]);
        assert_eq!(cache.get(&mut storage, 0).unwrap().get_u32(0), 0xdeadbeef);
        assert_eq!(order(&cache), [0, 4, 3, 2]);

        let mut working = BTreeSet::from([0]);
        cache.flush(&mut storage, &mut working).unwrap();
        assert_eq!(cache.stats().writes, 1);
        storage.read_block(0, &mut buf).unwrap();
        assert_eq!(&buf[..4], &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn cache_grows_beyond_capacity_while_dirty() {
        let mut storage = storage(8);
        let mut cache = BlockCache::new(MIN_CAPACITY);
        for i in 0..6 {
            cache.get(&mut storage, i).unwrap().put_u8(0, i as u8 + 1);
        }
        assert_eq!(cache.len(), 6);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.stats().writes, 0);

        let mut working: BTreeSet<u32> = (0..3).collect();
        cache.discard(&mut working);
        let mut working: BTreeSet<u32> = (3..6).collect();
        cache.flush(&mut storage, &mut working).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(order(&cache).len(), 3);
        assert_eq!(cache.get(&mut storage, 0).unwrap().get_u8(0), 0);
        assert_eq!(cache.get(&mut storage, 4).unwrap().get_u8(0), 5);

        // Clean blocks can be evicted again.
        for i in 6..8 {
            cache.get(&mut storage, i).unwrap();
        }
        assert_eq!(cache.len(), MIN_CAPACITY);
        assert_eq!(cache.stats().writes, 3);
    }

    #[test]
    fn flush_and_discard() {
        let mut storage = storage(4);
        let mut cache = BlockCache::new(16);
        cache.get(&mut storage, 1).unwrap().put_u8(0, 1);
        cache.get(&mut storage, 2).unwrap().put_u8(0, 2);

        let mut working = BTreeSet::from([1]);
        cache.flush(&mut storage, &mut working).unwrap();
        assert!(working.is_empty());
        assert!(!cache.get(&mut storage, 1).unwrap().is_dirty());

        let mut working = BTreeSet::from([2]);
        cache.discard(&mut working);
        assert!(working.is_empty());
        assert_eq!(cache.len(), 1);
        assert_eq!(order(&cache), [1]);
        assert_eq!(cache.get(&mut storage, 2).unwrap().get_u8(0), 0);
        assert_eq!(cache.get(&mut storage, 1).unwrap().get_u8(0), 1);
    }

    #[test]
    fn out_of_range() {
        let mut storage = storage(2);
        let mut cache = BlockCache::new(16);
        assert!(matches!(
            cache.get(&mut storage, 2),
            Err(ArchiveError::Corrupt(_))
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn zeroed_blocks_skip_reading() {
        let mut storage = storage(2);
        storage.write_block(1, &[7; SIZE as usize]).unwrap();
        let mut cache = BlockCache::new(16);
        let block = cache.get_zeroed(&mut storage, 1).unwrap();
        assert!(block.is_dirty());
        assert!(block.as_slice().iter().all(|&x| x == 0));
        assert_eq!(cache.stats().misses, 0);
    }
}
