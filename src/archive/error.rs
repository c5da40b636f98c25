//! Error types of the archive.
//!
//! Errors come in two layers. [`ArchiveError`] describes problems with the
//! archive itself: a broken header, corrupt structures, exhausted capacity,
//! or a failing host file. [`FsError`] adds the logical failures of the
//! namespace operations, such as a missing or already existing name. These
//! leave the archive structurally intact.

use std::{error, fmt, io};


//------------ FormatError ---------------------------------------------------

/// The archive header is unusable or doesn’t match expectations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FormatError {
    /// The file is too short to contain the header or its blocks.
    Truncated,

    /// The file doesn’t start with the magic cookie.
    BadMagic,

    /// The archive was written by an unknown format version.
    UnsupportedVersion(u16),

    /// The unused map layout stored in the header is unknown.
    UnsupportedLayout(u8),

    /// The block size isn’t a power of two in the supported range.
    BadBlockSize(u32),

    /// The maximum file size is zero or above the absolute ceiling.
    BadMaxFileSize(u64),

    /// A value stored in the header differs from the requested one.
    Mismatch {
        /// The name of the offending header field.
        field: &'static str,

        /// The value that was asked for.
        expected: u64,

        /// The value stored in the archive.
        found: u64,
    },
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FormatError::Truncated => f.write_str("archive truncated"),
            FormatError::BadMagic => f.write_str("not an archive file"),
            FormatError::UnsupportedVersion(version) => {
                write!(f, "unsupported archive version {}", version)
            }
            FormatError::UnsupportedLayout(layout) => {
                write!(f, "unsupported unused map layout {}", layout)
            }
            FormatError::BadBlockSize(size) => {
                write!(f, "invalid block size {}", size)
            }
            FormatError::BadMaxFileSize(size) => {
                write!(f, "invalid maximum file size {}", size)
            }
            FormatError::Mismatch { field, expected, found } => {
                write!(f,
                    "archive has {} {} but {} was requested",
                    field, found, expected
                )
            }
        }
    }
}

impl error::Error for FormatError { }


//------------ ArchiveError --------------------------------------------------

/// An error happened while trying to access the archive.
#[derive(Debug)]
pub enum ArchiveError {
    /// The header of the archive is broken or doesn’t match.
    Format(FormatError),

    /// The archive is corrupt and cannot be used any more.
    ///
    /// This is also returned for violated internal invariants, such as
    /// out-of-range block indexes, since these can only stem from broken
    /// data on disk or a bug.
    Corrupt(&'static str),

    /// An access reached beyond the maximum file size.
    Capacity {
        /// The end of the attempted access.
        end: u64,

        /// The maximum size a file can have.
        limit: u64,
    },

    /// The archive has run out of addressable blocks.
    Full,

    /// An IO error happened while accessing the underlying file.
    Io(io::Error),
}

impl ArchiveError {
    /// Returns whether the error is a capacity error.
    pub fn is_capacity(&self) -> bool {
        matches!(*self, ArchiveError::Capacity { .. })
    }
}

impl From<io::Error> for ArchiveError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<FormatError> for ArchiveError {
    fn from(err: FormatError) -> Self {
        Self::Format(err)
    }
}

impl fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ArchiveError::Format(ref err) => err.fmt(f),
            ArchiveError::Corrupt(what) => {
                write!(f, "archive corrupted: {}", what)
            }
            ArchiveError::Capacity { end, limit } => {
                write!(f,
                    "access up to {} exceeds maximum file size {}",
                    end, limit
                )
            }
            ArchiveError::Full => f.write_str("archive full"),
            ArchiveError::Io(ref err) => write!(f, "{}", err)
        }
    }
}

impl error::Error for ArchiveError { }


//------------ FsError -------------------------------------------------------

/// An error happened during a namespace operation.
///
/// All variants but [`FsError::Archive`] are logical errors: they are
/// detected before anything is changed and the archive stays valid.
#[derive(Debug)]
pub enum FsError {
    /// A path segment does not exist.
    NotFound,

    /// The name to be created already exists.
    Exists,

    /// A path segment other than the last is a file.
    NotADirectory,

    /// A file was expected but a directory was found.
    IsADirectory,

    /// The directory to be removed still has entries.
    NotEmpty,

    /// The name is empty, too long, or reserved.
    InvalidName,

    /// The path can’t be used for the operation.
    ///
    /// This happens for the root directory where a name is needed and when
    /// a directory would be moved into itself.
    InvalidPath,

    /// Accessing the archive failed.
    Archive(ArchiveError),
}

impl FsError {
    /// Returns whether this is a logical error.
    pub fn is_logical(&self) -> bool {
        !matches!(*self, FsError::Archive(_))
    }
}

impl From<ArchiveError> for FsError {
    fn from(err: ArchiveError) -> Self {
        Self::Archive(err)
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        Self::Archive(err.into())
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FsError::NotFound => f.write_str("no such file or directory"),
            FsError::Exists => f.write_str("name already exists"),
            FsError::NotADirectory => f.write_str("not a directory"),
            FsError::IsADirectory => f.write_str("is a directory"),
            FsError::NotEmpty => f.write_str("directory not empty"),
            FsError::InvalidName => f.write_str("invalid name"),
            FsError::InvalidPath => f.write_str("invalid path"),
            FsError::Archive(ref err) => err.fmt(f),
        }
    }
}

impl error::Error for FsError { }
