//! Fixed-size blocks and their primitive accessors.
//!
//! All integers are stored big-endian. Positions are byte offsets within
//! the block and are computed by the archive itself, so an out-of-range
//! position is a bug and panics just like slice indexing does.

use std::ops::Range;


//------------ Block ---------------------------------------------------------

/// The buffer of a single block of the archive.
///
/// A block knows its index and whether it has been changed since it was
/// last written to the file. Every `put_*` method marks the block dirty.
#[derive(Debug)]
pub struct Block {
    /// The index of the block within the archive.
    index: u32,

    /// The content. Always exactly one block size long.
    data: Vec<u8>,

    /// Has the block been changed since it was loaded or written?
    dirty: bool,
}

impl Block {
    /// Creates a new clean block from a loaded buffer.
    pub fn new(index: u32, data: Vec<u8>) -> Self {
        Block { index, data, dirty: false }
    }

    /// Returns the index of the block.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the size of the block.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns whether the block needs writing.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Marks the block as needing to be written.
    pub fn set_dirty(&mut self) {
        self.dirty = true
    }

    /// Marks the block as written.
    pub fn set_clean(&mut self) {
        self.dirty = false
    }

    /// Returns the content of the block.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Takes the buffer out of the block for reuse.
    pub fn into_buf(self) -> Vec<u8> {
        self.data
    }

    /// Returns the byte at `pos`.
    pub fn get_u8(&self, pos: usize) -> u8 {
        self.data[pos]
    }

    /// Sets the byte at `pos`.
    pub fn put_u8(&mut self, pos: usize, value: u8) {
        self.data[pos] = value;
        self.dirty = true;
    }

    pub fn get_u16(&self, pos: usize) -> u16 {
        u16::from_be_bytes(self.get_array(pos))
    }

    pub fn put_u16(&mut self, pos: usize, value: u16) {
        self.put_bytes(pos, &value.to_be_bytes())
    }

    pub fn get_u32(&self, pos: usize) -> u32 {
        u32::from_be_bytes(self.get_array(pos))
    }

    pub fn put_u32(&mut self, pos: usize, value: u32) {
        self.put_bytes(pos, &value.to_be_bytes())
    }

    pub fn get_u64(&self, pos: usize) -> u64 {
        u64::from_be_bytes(self.get_array(pos))
    }

    pub fn put_u64(&mut self, pos: usize, value: u64) {
        self.put_bytes(pos, &value.to_be_bytes())
    }

    /// Reads a varint starting at `pos`.
    ///
    /// Returns the value and the number of bytes it occupies or `None` if
    /// the block ends in the middle of the varint.
    pub fn get_varint(&self, pos: usize) -> Option<(u16, usize)> {
        read_varint(&self.data[pos..])
    }

    /// Writes a varint at `pos` and returns the number of bytes written.
    pub fn put_varint(&mut self, pos: usize, value: u16) -> usize {
        self.dirty = true;
        write_varint(value, &mut self.data[pos..])
    }

    /// Copies bytes starting at `pos` into `buf`.
    pub fn get_bytes(&self, pos: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data[pos..pos + buf.len()])
    }

    /// Copies `data` into the block starting at `pos`.
    pub fn put_bytes(&mut self, pos: usize, data: &[u8]) {
        self.data[pos..pos + data.len()].copy_from_slice(data);
        self.dirty = true;
    }

    /// Sets all bytes in `range` to zero.
    pub fn zero(&mut self, range: Range<usize>) {
        self.data[range].fill(0);
        self.dirty = true;
    }

    /// Sets the entire block to zero.
    pub fn zero_all(&mut self) {
        self.data.fill(0);
        self.dirty = true;
    }

    fn get_array<const N: usize>(&self, pos: usize) -> [u8; N] {
        let mut res = [0; N];
        self.get_bytes(pos, &mut res);
        res
    }
}


//------------ Varints -------------------------------------------------------
//
// Values below 0x80 are a single octet. Larger values up to 0x7FFF take
// two octets with the high bit of the first one set.

/// The largest value that can be encoded as a varint.
pub const MAX_VARINT: u16 = 0x7FFF;

/// Returns the encoded length of a varint.
pub fn varint_len(value: u16) -> usize {
    if value < 0x80 { 1 } else { 2 }
}

/// Decodes a varint from the start of `data`.
///
/// Returns the value and its encoded length, or `None` if `data` is too
/// short.
pub fn read_varint(data: &[u8]) -> Option<(u16, usize)> {
    let first = *data.first()?;
    if first & 0x80 == 0 {
        Some((u16::from(first), 1))
    }
    else {
        let second = *data.get(1)?;
        Some((u16::from(first & 0x7F) << 8 | u16::from(second), 2))
    }
}

/// Encodes a varint to the start of `target` and returns its length.
///
/// # Panics
///
/// Panics if `value` is larger than [`MAX_VARINT`] or `target` is too
/// short.
pub fn write_varint(value: u16, target: &mut [u8]) -> usize {
    assert!(value <= MAX_VARINT);
    if value < 0x80 {
        target[0] = value as u8;
        1
    }
    else {
        target[0] = 0x80 | (value >> 8) as u8;
        target[1] = value as u8;
        2
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut block = Block::new(7, vec![0; 32]);
        assert!(!block.is_dirty());
        block.put_u16(0, 0x0102);
        block.put_u32(2, 0x03040506);
        block.put_u64(6, 0x0708090a0b0c0d0e);
        assert!(block.is_dirty());
        assert_eq!(
            &block.as_slice()[..14],
            &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14]
        );
        assert_eq!(block.get_u16(0), 0x0102);
        assert_eq!(block.get_u32(2), 0x03040506);
        assert_eq!(block.get_u64(6), 0x0708090a0b0c0d0e);
        assert_eq!(block.index(), 7);
    }

    #[test]
    fn varint_boundaries() {
        let mut buf = [0u8; 2];
        assert_eq!(write_varint(0x7F, &mut buf), 1);
        assert_eq!(buf[0], 0x7F);
        assert_eq!(read_varint(&buf), Some((0x7F, 1)));

        assert_eq!(write_varint(0x80, &mut buf), 2);
        assert_eq!(buf, [0x80, 0x80]);
        assert_eq!(read_varint(&buf), Some((0x80, 2)));

        assert_eq!(write_varint(MAX_VARINT, &mut buf), 2);
        assert_eq!(buf, [0xFF, 0xFF]);
        assert_eq!(read_varint(&buf), Some((MAX_VARINT, 2)));

        assert_eq!(read_varint(&[0x81]), None);
        assert_eq!(read_varint(&[]), None);
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(300), 2);
    }

    #[test]
    fn block_varint() {
        let mut block = Block::new(0, vec![0; 8]);
        assert_eq!(block.put_varint(3, 1000), 2);
        assert_eq!(block.get_varint(3), Some((1000, 2)));
        assert_eq!(block.get_varint(7), Some((0, 1)));
    }

    #[test]
    #[should_panic]
    fn varint_too_large() {
        let mut buf = [0u8; 2];
        write_varint(0x8000, &mut buf);
    }
}
