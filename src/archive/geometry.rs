//! The pointer tree geometry.
//!
//! Unless its content is inlined, an inode block holds an array of block
//! pointers, its slots. Each slot has a level. A level 0 slot points
//! directly at a data block. A slot of level L > 0 points to a pointer
//! block whose `block_size / 4` entries each are level L - 1 trees.
//!
//! The levels are chosen when the archive is created so that the configured
//! maximum file size can be reached with the fewest levels. Low offsets
//! are served by level 0 slots, higher offsets by increasingly deeper
//! trees. The byte ranges of the slots are consecutive and together form
//! the real maximum file size, which is at least the configured one.

use std::iter;
use super::error::{ArchiveError, FormatError};
use super::inode::HEADER_LEN;
use super::unused::BlockKind;
use super::volume::Volume;


//------------ Slot ----------------------------------------------------------

/// A pointer slot of an inode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Slot {
    /// The depth of the tree starting at this slot.
    pub level: u32,

    /// The first file offset covered by the slot.
    pub start: u64,

    /// The first file offset no longer covered by the slot.
    pub end: u64,
}


//------------ InodeContext --------------------------------------------------

/// The geometry of the pointer trees of all inodes of an archive.
#[derive(Clone, Debug)]
pub struct InodeContext {
    /// The block size.
    block_size: u64,

    /// The number of pointers in a pointer block.
    ptrs_per_block: u64,

    /// The slots of an inode in order.
    slots: Vec<Slot>,

    /// The number of bytes covered by a tree of each level.
    level_sizes: Vec<u64>,

    /// The maximum file size actually reachable.
    max_file_size_real: u64,
}

impl InodeContext {
    /// Calculates the geometry for an archive.
    ///
    /// Fails if the maximum file size cannot be reached with the number of
    /// slots available in an inode.
    pub fn new(
        block_size: u32, max_file_size: u64
    ) -> Result<Self, FormatError> {
        let slot_count = slot_count(block_size as usize) as u64;
        let block_size = u64::from(block_size);
        let ptrs_per_block = block_size / 4;

        let direct_only = slot_count.saturating_mul(block_size);
        let levels = if direct_only >= max_file_size {
            vec![0; slot_count as usize]
        }
        else {
            Self::find_levels(
                slot_count, block_size, ptrs_per_block, max_file_size
            ).ok_or(FormatError::BadMaxFileSize(max_file_size))?
        };

        let top = levels.last().copied().unwrap_or(0);
        let mut level_sizes = vec![block_size];
        for _ in 0..top {
            let last = level_sizes[level_sizes.len() - 1];
            level_sizes.push(last.saturating_mul(ptrs_per_block));
        }

        let mut slots = Vec::with_capacity(levels.len());
        let mut start = 0u64;
        for level in levels {
            let end = start.saturating_add(level_sizes[level as usize]);
            slots.push(Slot { level, start, end });
            start = end;
        }

        Ok(InodeContext {
            block_size,
            ptrs_per_block,
            slots,
            level_sizes,
            max_file_size_real: start,
        })
    }

    /// Finds the slot levels for a file size beyond the level 0 slots.
    ///
    /// Tries the smallest top level first and within that the smallest
    /// number of top level slots. The remaining slots are one for each
    /// intermediate level and level 0 slots for the rest.
    fn find_levels(
        slot_count: u64, block_size: u64, ptrs_per_block: u64, max: u64
    ) -> Option<Vec<u32>> {
        let mut level_size = block_size;
        // The bytes covered by one slot for each level 1..top.
        let mut intermediate = 0u64;
        for top in 1..slot_count {
            let prev_size = level_size;
            level_size = level_size.saturating_mul(ptrs_per_block);
            if top > 1 {
                intermediate = intermediate.saturating_add(prev_size);
            }
            let fixed = top - 1;
            for count in 1..=(slot_count - fixed) {
                let direct = slot_count - fixed - count;
                let covered = direct.saturating_mul(block_size)
                    .saturating_add(intermediate)
                    .saturating_add(count.saturating_mul(level_size));
                if covered >= max {
                    let mut res = vec![0; direct as usize];
                    res.extend(1..top as u32);
                    res.extend(
                        iter::repeat(top as u32).take(count as usize)
                    );
                    return Some(res)
                }
            }
        }
        None
    }

    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Returns the number of bytes an inlined inode can hold.
    pub fn inline_capacity(&self) -> u64 {
        self.block_size - HEADER_LEN as u64
    }

    /// Returns the largest file size possible.
    pub fn max_file_size_real(&self) -> u64 {
        self.max_file_size_real
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Returns the deepest level of any slot.
    pub fn depth(&self) -> u32 {
        self.slots.last().map(|slot| slot.level).unwrap_or(0)
    }

    /// Returns the index of the slot covering `offset`.
    fn slot_for(&self, offset: u64) -> Result<usize, ArchiveError> {
        if offset >= self.max_file_size_real {
            return Err(ArchiveError::Capacity {
                end: offset.saturating_add(1),
                limit: self.max_file_size_real,
            })
        }
        Ok(self.slots.partition_point(|slot| slot.end <= offset))
    }

    /// Returns the data block holding `offset` if there is one.
    pub fn resolve(
        &self, vol: &mut Volume, inode: u32, offset: u64
    ) -> Result<Option<u32>, ArchiveError> {
        let idx = self.slot_for(offset)?;
        let slot = self.slots[idx];
        let mut ptr = vol.block(inode)?.get_u32(slot_pos(idx));
        let mut rel = offset - slot.start;
        for level in (1..=slot.level).rev() {
            if ptr == 0 {
                return Ok(None)
            }
            let child_size = self.level_sizes[level as usize - 1];
            ptr = vol.block(ptr)?.get_u32(ptr_pos(rel / child_size));
            rel %= child_size;
        }
        Ok((ptr != 0).then_some(ptr))
    }

    /// Returns the data block holding `offset`, creating it if necessary.
    ///
    /// Missing pointer blocks on the way are created, too. All new blocks
    /// are zeroed.
    pub fn resolve_or_create(
        &self, vol: &mut Volume, inode: u32, offset: u64
    ) -> Result<u32, ArchiveError> {
        let idx = self.slot_for(offset)?;
        let slot = self.slots[idx];
        let top = Self::ensure_ptr(vol, inode, slot_pos(idx))?;
        self.descend(vol, top, slot.level, offset - slot.start)
    }

    /// Walks down a tree of `level` to the data block for `rel`.
    fn descend(
        &self, vol: &mut Volume, block: u32, level: u32, rel: u64
    ) -> Result<u32, ArchiveError> {
        if level == 0 {
            return Ok(block)
        }
        let child_size = self.level_sizes[level as usize - 1];
        let child = Self::ensure_ptr(vol, block, ptr_pos(rel / child_size))?;
        self.descend(vol, child, level - 1, rel % child_size)
    }

    /// Returns the pointer at `pos` in `block`, allocating it if missing.
    fn ensure_ptr(
        vol: &mut Volume, block: u32, pos: usize
    ) -> Result<u32, ArchiveError> {
        let ptr = vol.block(block)?.get_u32(pos);
        if ptr != 0 {
            return Ok(ptr)
        }
        let ptr = vol.allocate(BlockKind::Data)?;
        vol.block_mut(block)?.put_u32(pos, ptr);
        Ok(ptr)
    }

    /// Drops all content at and beyond `new_size`.
    ///
    /// Data blocks starting at or after `new_size` are released, the tail
    /// of a data block straddling it is zeroed. Pointer blocks are released
    /// once none of their children remain.
    pub fn truncate(
        &self, vol: &mut Volume, inode: u32, new_size: u64
    ) -> Result<(), ArchiveError> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.end <= new_size {
                continue
            }
            let pos = slot_pos(idx);
            let ptr = vol.block(inode)?.get_u32(pos);
            if ptr == 0 {
                continue
            }
            let emptied = self.truncate_tree(
                vol, ptr, slot.level, slot.start, new_size
            )?;
            if emptied {
                vol.release(ptr)?;
                vol.block_mut(inode)?.put_u32(pos, 0);
            }
        }
        Ok(())
    }

    /// Truncates the tree of `level` in `block` covering from `start`.
    ///
    /// Returns whether nothing remains of the tree and `block` itself can
    /// be released.
    fn truncate_tree(
        &self,
        vol: &mut Volume,
        block: u32,
        level: u32,
        start: u64,
        new_size: u64,
    ) -> Result<bool, ArchiveError> {
        if start >= new_size {
            if level > 0 {
                self.release_children(vol, block, level)?;
            }
            return Ok(true)
        }
        if level == 0 {
            let keep = (new_size - start) as usize;
            if keep < self.block_size as usize {
                vol.block_mut(block)?.zero(keep..self.block_size as usize);
            }
            return Ok(false)
        }

        let child_size = self.level_sizes[level as usize - 1];
        let mut live = false;
        for idx in 0..self.ptrs_per_block {
            let child_start = start.saturating_add(idx * child_size);
            let pos = ptr_pos(idx);
            let child = vol.block(block)?.get_u32(pos);
            if child == 0 {
                continue
            }
            if child_start.saturating_add(child_size) <= new_size {
                live = true;
                continue
            }
            let emptied = self.truncate_tree(
                vol, child, level - 1, child_start, new_size
            )?;
            if emptied {
                vol.release(child)?;
                vol.block_mut(block)?.put_u32(pos, 0);
            }
            else {
                live = true;
            }
        }
        Ok(!live)
    }

    /// Releases all blocks below a pointer block.
    fn release_children(
        &self, vol: &mut Volume, block: u32, level: u32
    ) -> Result<(), ArchiveError> {
        for idx in 0..self.ptrs_per_block {
            let child = vol.block(block)?.get_u32(ptr_pos(idx));
            if child == 0 {
                continue
            }
            if level > 1 {
                self.release_children(vol, child, level - 1)?;
            }
            vol.release(child)?;
        }
        Ok(())
    }

    /// Adds all blocks of an inode’s trees to `target`.
    ///
    /// The inode block itself isn’t included.
    pub fn collect(
        &self, vol: &mut Volume, inode: u32, target: &mut Vec<u32>
    ) -> Result<(), ArchiveError> {
        for (idx, slot) in self.slots.iter().enumerate() {
            let ptr = vol.block(inode)?.get_u32(slot_pos(idx));
            if ptr != 0 {
                self.collect_tree(vol, ptr, slot.level, target)?;
            }
        }
        Ok(())
    }

    fn collect_tree(
        &self, vol: &mut Volume, block: u32, level: u32, target: &mut Vec<u32>
    ) -> Result<(), ArchiveError> {
        target.push(block);
        if level == 0 {
            return Ok(())
        }
        for idx in 0..self.ptrs_per_block {
            let child = vol.block(block)?.get_u32(ptr_pos(idx));
            if child != 0 {
                self.collect_tree(vol, child, level - 1, target)?;
            }
        }
        Ok(())
    }
}


//------------ Helpers -------------------------------------------------------

/// Returns the number of pointer slots in an inode.
pub fn slot_count(block_size: usize) -> usize {
    (block_size - HEADER_LEN) / 4
}

/// Returns the position of a slot pointer in the inode block.
pub fn slot_pos(idx: usize) -> usize {
    HEADER_LEN + 4 * idx
}

/// Returns the position of a pointer in a pointer block.
fn ptr_pos(idx: u64) -> usize {
    4 * idx as usize
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::archive::superblock::Superblock;
    use crate::archive::unused::LayoutKind;

    fn levels(ctx: &InodeContext) -> Vec<u32> {
        ctx.slots().iter().map(|slot| slot.level).collect()
    }

    fn volume(block_size: u32) -> (Volume, u32) {
        let mut vol = Volume::create(
            tempfile::tempfile().unwrap(),
            Superblock::new(block_size, 1 << 20, LayoutKind::Shared).unwrap(),
            16
        ).unwrap();
        let inode = vol.allocate(BlockKind::Inode).unwrap();
        (vol, inode)
    }

    #[test]
    fn direct_only() {
        let ctx = InodeContext::new(64, 500).unwrap();
        assert_eq!(levels(&ctx), [0; 13]);
        assert_eq!(ctx.max_file_size_real(), 13 * 64);
        assert_eq!(ctx.inline_capacity(), 52);
    }

    #[test]
    fn level_selection() {
        let ctx = InodeContext::new(64, 1000).unwrap();
        let mut expected = vec![0; 12];
        expected.push(1);
        assert_eq!(levels(&ctx), expected);
        assert_eq!(ctx.max_file_size_real(), 12 * 64 + 1024);

        let ctx = InodeContext::new(64, 1 << 20).unwrap();
        assert_eq!(levels(&ctx), [0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 3, 3, 3]);
        assert_eq!(ctx.max_file_size_real(), 1_066_432);
        assert_eq!(ctx.depth(), 3);

        let ctx = InodeContext::new(4096, 1 << 30).unwrap();
        assert_eq!(ctx.slots().iter().filter(|s| s.level == 1).count(), 256);
        assert_eq!(ctx.max_file_size_real(), 1_076_875_264);
    }

    #[test]
    fn slots_partition_range() {
        for &(block_size, max) in &[
            (64, 1), (64, 1 << 40), (128, 12345), (512, 1 << 30),
            (4096, 1 << 40), (65536, 1 << 40),
        ] {
            let ctx = InodeContext::new(block_size, max).unwrap();
            let slots = ctx.slots();
            assert_eq!(slots.len(), slot_count(block_size as usize));
            assert_eq!(slots[0].start, 0);
            for pair in slots.windows(2) {
                assert_eq!(pair[0].end, pair[1].start);
                assert!(pair[0].level <= pair[1].level);
            }
            assert_eq!(slots[slots.len() - 1].end, ctx.max_file_size_real());
            assert!(ctx.max_file_size_real() >= max);
        }
    }

    #[test]
    fn resolve_and_create() {
        let ctx = InodeContext::new(64, 1 << 20).unwrap();
        let (mut vol, inode) = volume(64);
        assert_eq!(ctx.resolve(&mut vol, inode, 0).unwrap(), None);

        let first = ctx.resolve_or_create(&mut vol, inode, 10).unwrap();
        assert_eq!(ctx.resolve(&mut vol, inode, 63).unwrap(), Some(first));
        assert_eq!(ctx.resolve_or_create(&mut vol, inode, 0).unwrap(), first);

        // A level 3 offset needs three pointer blocks and a data block.
        let used = vol.superblock().used();
        let far = ctx.resolve_or_create(&mut vol, inode, 500_000).unwrap();
        assert_eq!(vol.superblock().used(), used + 4);
        assert_eq!(ctx.resolve(&mut vol, inode, 500_001).unwrap(), Some(far));
        assert_eq!(ctx.resolve(&mut vol, inode, 500_000 + 64).unwrap(), None);

        let max = ctx.max_file_size_real();
        assert!(ctx.resolve_or_create(&mut vol, inode, max - 1).is_ok());
        assert!(matches!(
            ctx.resolve_or_create(&mut vol, inode, max),
            Err(ArchiveError::Capacity { .. })
        ));
    }

    #[test]
    fn truncate_releases_tail() {
        let ctx = InodeContext::new(64, 1 << 20).unwrap();
        let (mut vol, inode) = volume(64);
        let base = vol.superblock().used();
        for offset in (0..3000).step_by(64) {
            let block = ctx.resolve_or_create(
                &mut vol, inode, offset
            ).unwrap();
            vol.block_mut(block).unwrap().put_bytes(0, &[0xAA; 64]);
        }
        let mut blocks = Vec::new();
        ctx.collect(&mut vol, inode, &mut blocks).unwrap();
        assert_eq!(vol.superblock().used() - base, blocks.len() as u32);

        ctx.truncate(&mut vol, inode, 1000).unwrap();
        let block = ctx.resolve(&mut vol, inode, 999).unwrap().unwrap();
        let data = vol.block(block).unwrap().as_slice().to_vec();
        assert!(data[..40].iter().all(|&x| x == 0xAA));
        assert!(data[40..].iter().all(|&x| x == 0));
        assert_eq!(ctx.resolve(&mut vol, inode, 1000 + 64).unwrap(), None);

        ctx.truncate(&mut vol, inode, 0).unwrap();
        assert_eq!(vol.superblock().used(), base);
        let mut blocks = Vec::new();
        ctx.collect(&mut vol, inode, &mut blocks).unwrap();
        assert!(blocks.is_empty());
    }
}
