//! Error types used by the command line tool.
//!
//! The most important is [`Failed`]. This error indicates that an
//! operation had to be canceled for some reason and callers can assume
//! that all diagnostic information has been logged and they need not do
//! anything further.
//!
//! Secondly, [`ExitError`] is used when the program should be terminated. It
//! provides enough information to determine the exit code of the program.

use log::error;
use crate::archive::{ArchiveError, FsError};


//------------ Failed --------------------------------------------------------

/// An operation has failed to complete.
///
/// This error types is used to indicate that an operation has failed,
/// diagnostic information has been printed or logged, and the caller can’t
/// really do anything to recover.
#[derive(Clone, Copy, Debug)]
pub struct Failed;

impl From<ArchiveError> for Failed {
    fn from(err: ArchiveError) -> Failed {
        error!("Archive error: {}", err);
        Failed
    }
}

impl From<FsError> for Failed {
    fn from(err: FsError) -> Failed {
        match err {
            FsError::Archive(err) => err.into(),
            err => {
                error!("{}", err);
                Failed
            }
        }
    }
}


//------------ ExitError -----------------------------------------------------

/// An error happened that should lead to terminating the program.
#[derive(Clone, Copy, Debug)]
pub enum ExitError {
    /// Something has happened.
    ///
    /// This should be exit status 1.
    Generic,

    /// Verification found the archive to be corrupt.
    ///
    /// This should be exit status 2.
    Corrupt,
}

impl From<Failed> for ExitError {
    fn from(_: Failed) -> ExitError {
        ExitError::Generic
    }
}
