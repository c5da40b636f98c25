//! Physical access to the host file.
//!
//! The host file starts with a header of one block size followed by the
//! blocks themselves. Block `i` thus lives at `(i + 1) * block_size`.
//! Nothing above this module deals with byte positions in the host file.

use std::{fs, io};
use std::io::{Read, Seek, SeekFrom, Write};


//------------ Storage -------------------------------------------------------

/// The underlying storage of an archive.
#[derive(Debug)]
pub struct Storage {
    /// The physical file.
    file: fs::File,

    /// The size of a block in bytes.
    block_size: usize,

    /// The number of blocks present in the file.
    ///
    /// This does not include the header.
    block_count: u32,
}

impl Storage {
    /// Creates a new storage value using the given file.
    ///
    /// The file must already be at least long enough to hold `block_count`
    /// blocks after the header.
    pub fn new(file: fs::File, block_size: u32, block_count: u32) -> Self {
        Storage {
            file,
            block_size: block_size as usize,
            block_count,
        }
    }

    /// Returns the size of a block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Returns the number of blocks in the file.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// Returns the file position of the block with the given index.
    fn block_pos(&self, index: u32) -> u64 {
        (u64::from(index) + 1) * self.block_size as u64
    }

    /// Reads the block with the given index into `buf`.
    pub fn read_block(
        &mut self, index: u32, buf: &mut [u8]
    ) -> Result<(), io::Error> {
        debug_assert_eq!(buf.len(), self.block_size);
        let pos = self.block_pos(index);
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.read_exact(buf)
    }

    /// Writes `buf` as the block with the given index.
    pub fn write_block(
        &mut self, index: u32, buf: &[u8]
    ) -> Result<(), io::Error> {
        debug_assert_eq!(buf.len(), self.block_size);
        let pos = self.block_pos(index);
        self.file.seek(SeekFrom::Start(pos))?;
        self.file.write_all(buf)
    }

    /// Reads the header block.
    pub fn read_header(&mut self, buf: &mut [u8]) -> Result<(), io::Error> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(buf)
    }

    /// Writes the header block.
    ///
    /// The header must be exactly one block size long.
    pub fn write_header(&mut self, buf: &[u8]) -> Result<(), io::Error> {
        debug_assert_eq!(buf.len(), self.block_size);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(buf)
    }

    /// Changes the number of blocks in the file.
    ///
    /// New blocks read as all zeros.
    pub fn set_block_count(&mut self, count: u32) -> Result<(), io::Error> {
        self.file.set_len(self.block_pos(count))?;
        self.block_count = count;
        Ok(())
    }

    /// Returns the current length of the file in bytes.
    pub fn file_len(&self) -> Result<u64, io::Error> {
        Ok(self.file.metadata()?.len())
    }

    /// Flushes all data to the disk.
    pub fn sync(&mut self) -> Result<(), io::Error> {
        self.file.flush()?;
        self.file.sync_data()
    }
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn blocks_follow_header() {
        let mut storage = Storage::new(tempfile::tempfile().unwrap(), 64, 0);
        storage.set_block_count(2).unwrap();
        assert_eq!(storage.file_len().unwrap(), 3 * 64);

        storage.write_header(&[1; 64]).unwrap();
        storage.write_block(1, &[2; 64]).unwrap();

        let mut buf = [0; 64];
        storage.read_block(0, &mut buf).unwrap();
        assert_eq!(buf, [0; 64]);
        storage.read_block(1, &mut buf).unwrap();
        assert_eq!(buf, [2; 64]);
        storage.read_header(&mut buf).unwrap();
        assert_eq!(buf, [1; 64]);

        storage.set_block_count(1).unwrap();
        assert!(storage.read_block(1, &mut buf).is_err());
    }
}
