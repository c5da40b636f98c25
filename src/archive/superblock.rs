//! The archive header.
//!
//! The first block-size bytes of the host file hold the superblock. Only
//! the first few bytes are used, the rest is zero:
//!
//! ```text
//!  0  magic "FLFS"         4 octets
//!  4  version              u16
//!  6  block size           u32
//! 10  used block count     u32
//! 14  total block count    u32
//! 18  maximum file size    u64
//! 26  root inode block     u32
//! 30  unused map layout    u8
//! ```

use std::{fs, io};
use std::io::Read;
use log::trace;
use super::error::{ArchiveError, FormatError};
use super::storage::Storage;
use super::unused::LayoutKind;


//------------ Constants -----------------------------------------------------

/// The magic cookie at the start of every archive.
pub const MAGIC: [u8; 4] = *b"FLFS";

/// The current format version.
pub const VERSION: u16 = 1;

/// The smallest supported block size.
pub const MIN_BLOCK_SIZE: u32 = 64;

/// The largest supported block size.
pub const MAX_BLOCK_SIZE: u32 = 65536;

/// The absolute ceiling for the maximum file size.
pub const MAX_FILE_SIZE_CEILING: u64 = 1 << 40;

/// The number of octets of the header actually carrying data.
const FIELDS_LEN: usize = 31;


//------------ Superblock ----------------------------------------------------

/// The content of the archive header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Superblock {
    block_size: u32,
    used: u32,
    total: u32,
    max_file_size: u64,
    root: u32,
    layout: LayoutKind,

    /// Has the superblock changed since it was last written?
    dirty: bool,
}

impl Superblock {
    /// Creates the superblock of a new, empty archive.
    pub fn new(
        block_size: u32, max_file_size: u64, layout: LayoutKind
    ) -> Result<Self, FormatError> {
        check_block_size(block_size)?;
        check_max_file_size(max_file_size)?;
        Ok(Superblock {
            block_size,
            used: 0,
            total: 0,
            max_file_size,
            root: 0,
            layout,
            dirty: true,
        })
    }

    /// Reads the superblock from the start of a file.
    ///
    /// Also checks that the file is long enough for all the blocks the
    /// superblock claims.
    pub fn read(file: &mut fs::File) -> Result<Self, ArchiveError> {
        let mut buf = [0u8; FIELDS_LEN];
        if let Err(err) = file.read_exact(&mut buf) {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                return Err(FormatError::Truncated.into())
            }
            return Err(err.into())
        }
        let res = Self::decode(&buf)?;
        if file.metadata()?.len() < res.file_len() {
            return Err(FormatError::Truncated.into())
        }
        Ok(res)
    }

    /// Rereads the superblock from storage.
    ///
    /// This drops all changes not yet written.
    pub fn reload(
        &mut self, storage: &mut Storage
    ) -> Result<(), ArchiveError> {
        let mut buf = [0u8; FIELDS_LEN];
        storage.read_header(&mut buf)?;
        *self = Self::decode(&buf)?;
        Ok(())
    }

    /// Decodes the superblock from the start of a buffer.
    pub fn decode(buf: &[u8]) -> Result<Self, ArchiveError> {
        if buf.len() < FIELDS_LEN {
            return Err(FormatError::Truncated.into())
        }
        if buf[0..4] != MAGIC {
            return Err(FormatError::BadMagic.into())
        }
        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version).into())
        }
        let block_size = be_u32(&buf[6..]);
        check_block_size(block_size)?;
        let used = be_u32(&buf[10..]);
        let total = be_u32(&buf[14..]);
        if used > total {
            return Err(ArchiveError::Corrupt("used blocks exceed total"))
        }
        let mut max_file_size = [0u8; 8];
        max_file_size.copy_from_slice(&buf[18..26]);
        let max_file_size = u64::from_be_bytes(max_file_size);
        check_max_file_size(max_file_size)?;
        let layout = LayoutKind::from_u8(buf[30]).ok_or(
            FormatError::UnsupportedLayout(buf[30])
        )?;
        Ok(Superblock {
            block_size, used, total, max_file_size,
            root: be_u32(&buf[26..]),
            layout,
            dirty: false,
        })
    }

    /// Encodes the superblock into the start of a buffer.
    ///
    /// The rest of the buffer is left alone.
    pub fn encode(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&VERSION.to_be_bytes());
        buf[6..10].copy_from_slice(&self.block_size.to_be_bytes());
        buf[10..14].copy_from_slice(&self.used.to_be_bytes());
        buf[14..18].copy_from_slice(&self.total.to_be_bytes());
        buf[18..26].copy_from_slice(&self.max_file_size.to_be_bytes());
        buf[26..30].copy_from_slice(&self.root.to_be_bytes());
        buf[30] = self.layout as u8;
    }

    /// Writes the superblock to storage if it has changed.
    pub fn write(&mut self, storage: &mut Storage) -> Result<(), io::Error> {
        if !self.dirty {
            return Ok(())
        }
        let mut buf = vec![0u8; self.block_size as usize];
        self.encode(&mut buf);
        storage.write_header(&buf)?;
        trace!(
            "Wrote superblock: {} of {} blocks used.", self.used, self.total
        );
        self.dirty = false;
        Ok(())
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Returns the block of the root directory’s inode.
    pub fn root(&self) -> u32 {
        self.root
    }

    pub fn layout(&self) -> LayoutKind {
        self.layout
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Returns the length of a host file holding all blocks.
    pub fn file_len(&self) -> u64 {
        (u64::from(self.total) + 1) * u64::from(self.block_size)
    }

    /// Counts one more block as used.
    pub fn inc_used(&mut self) -> Result<(), ArchiveError> {
        if self.used >= self.total {
            return Err(ArchiveError::Corrupt("used blocks exceed total"))
        }
        self.used += 1;
        self.dirty = true;
        Ok(())
    }

    /// Counts one block less as used.
    pub fn dec_used(&mut self) -> Result<(), ArchiveError> {
        if self.used == 0 {
            return Err(ArchiveError::Corrupt("used block count underflow"))
        }
        self.used -= 1;
        self.dirty = true;
        Ok(())
    }

    pub fn set_total(&mut self, total: u32) {
        self.total = total;
        self.dirty = true;
    }

    pub fn set_root(&mut self, root: u32) {
        self.root = root;
        self.dirty = true;
    }
}


//------------ Helpers -------------------------------------------------------

/// Checks that a block size is acceptable.
pub fn check_block_size(block_size: u32) -> Result<(), FormatError> {
    if !block_size.is_power_of_two()
        || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size)
    {
        Err(FormatError::BadBlockSize(block_size))
    }
    else {
        Ok(())
    }
}

/// Checks that a maximum file size is acceptable.
pub fn check_max_file_size(size: u64) -> Result<(), FormatError> {
    if size == 0 || size > MAX_FILE_SIZE_CEILING {
        Err(FormatError::BadMaxFileSize(size))
    }
    else {
        Ok(())
    }
}

fn be_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use std::io::{Seek, SeekFrom, Write};
    use super::*;

    fn encoded(sb: &Superblock) -> Vec<u8> {
        let mut buf = vec![0; sb.block_size() as usize];
        sb.encode(&mut buf);
        buf
    }

    fn format_err(res: Result<Superblock, ArchiveError>) -> FormatError {
        match res {
            Err(ArchiveError::Format(err)) => err,
            other => panic!("expected format error, got {:?}", other),
        }
    }

    #[test]
    fn encode_decode() {
        let mut sb = Superblock::new(
            128, 100_000, LayoutKind::Typed
        ).unwrap();
        sb.set_total(7);
        sb.inc_used().unwrap();
        sb.inc_used().unwrap();
        sb.set_root(1);
        let buf = encoded(&sb);
        assert_eq!(&buf[..4], b"FLFS");
        assert_eq!(&buf[4..6], &[0, 1]);
        assert_eq!(&buf[6..10], &[0, 0, 0, 128]);
        assert_eq!(buf[30], 1);

        let decoded = Superblock::decode(&buf).unwrap();
        assert!(!decoded.is_dirty());
        assert_eq!(decoded.used(), 2);
        assert_eq!(decoded.total(), 7);
        assert_eq!(decoded.root(), 1);
        assert_eq!(decoded.max_file_size(), 100_000);
        assert_eq!(decoded.layout(), LayoutKind::Typed);
    }

    #[test]
    fn bad_headers() {
        let sb = Superblock::new(64, 1000, LayoutKind::Shared).unwrap();
        let good = encoded(&sb);

        let mut buf = good.clone();
        buf[0] = b'X';
        assert_eq!(
            format_err(Superblock::decode(&buf)), FormatError::BadMagic
        );

        let mut buf = good.clone();
        buf[5] = 9;
        assert_eq!(
            format_err(Superblock::decode(&buf)),
            FormatError::UnsupportedVersion(9)
        );

        let mut buf = good.clone();
        buf[30] = 7;
        assert_eq!(
            format_err(Superblock::decode(&buf)),
            FormatError::UnsupportedLayout(7)
        );

        let mut buf = good.clone();
        buf[9] = 65;
        assert_eq!(
            format_err(Superblock::decode(&buf)),
            FormatError::BadBlockSize(65)
        );

        assert_eq!(
            format_err(Superblock::decode(&good[..20])),
            FormatError::Truncated
        );

        let mut buf = good;
        buf[13] = 1;
        assert!(matches!(
            Superblock::decode(&buf), Err(ArchiveError::Corrupt(_))
        ));
    }

    #[test]
    fn parameter_limits() {
        assert!(Superblock::new(32, 1, LayoutKind::Shared).is_err());
        assert!(Superblock::new(96, 1, LayoutKind::Shared).is_err());
        assert!(Superblock::new(131072, 1, LayoutKind::Shared).is_err());
        assert!(Superblock::new(65536, 1, LayoutKind::Shared).is_ok());
        assert!(Superblock::new(64, 0, LayoutKind::Shared).is_err());
        assert!(
            Superblock::new(
                64, MAX_FILE_SIZE_CEILING + 1, LayoutKind::Shared
            ).is_err()
        );
    }

    #[test]
    fn used_never_exceeds_total() {
        let mut sb = Superblock::new(64, 1000, LayoutKind::Shared).unwrap();
        assert!(sb.inc_used().is_err());
        assert!(sb.dec_used().is_err());
        sb.set_total(1);
        sb.inc_used().unwrap();
        assert!(sb.inc_used().is_err());
        sb.dec_used().unwrap();
        assert_eq!(sb.used(), 0);
    }

    #[test]
    fn read_checks_file_length() {
        let mut sb = Superblock::new(64, 1000, LayoutKind::Shared).unwrap();
        sb.set_total(2);
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&encoded(&sb)).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(
            format_err(Superblock::read(&mut file)), FormatError::Truncated
        );

        file.set_len(3 * 64).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(Superblock::read(&mut file).unwrap().total(), 2);

        let mut empty = tempfile::tempfile().unwrap();
        assert_eq!(
            format_err(Superblock::read(&mut empty)), FormatError::Truncated
        );
    }
}
