//! Input and output that logs its errors.
//!
//! This module contains variations on some of the functions provided by
//! `std::fs` and `std::io` that instead of returning `std::io::Error` log
//! that error and return our own [`Failed`] instead.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use log::error;
use crate::error::Failed;


//------------ read_file -----------------------------------------------------

/// Reads a file’s entire content into a vec.
///
/// Errors out if the file cannot be opened for reading or reading fails.
pub fn read_file(path: &Path) -> Result<Vec<u8>, Failed> {
    fs::read(path).map_err(|err| {
        error!(
            "Fatal: failed to read file {}: {}",
            path.display(), err
        );
        Failed
    })
}


//------------ write_file ----------------------------------------------------

/// Writes a slice to a file.
///
/// Errors out if the file cannot be opened for writing or writing fails.
/// If the file exists, overwrites the current content.
pub fn write_file(path: &Path, contents: &[u8]) -> Result<(), Failed> {
    fs::write(path, contents).map_err(|err| {
        error!(
            "Fatal: failed to write file {}: {}",
            path.display(), err
        );
        Failed
    })
}


//------------ read_stdin ----------------------------------------------------

/// Reads all of stdin into a vec.
pub fn read_stdin() -> Result<Vec<u8>, Failed> {
    let mut res = Vec::new();
    match io::stdin().lock().read_to_end(&mut res) {
        Ok(_) => Ok(res),
        Err(err) => {
            error!("Fatal: failed to read from stdin: {}", err);
            Err(Failed)
        }
    }
}


//------------ write_stdout --------------------------------------------------

/// Writes a slice to stdout.
pub fn write_stdout(contents: &[u8]) -> Result<(), Failed> {
    let mut stdout = io::stdout().lock();
    stdout.write_all(contents).and_then(|_| stdout.flush()).map_err(|err| {
        error!("Fatal: failed to write to stdout: {}", err);
        Failed
    })
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content");
        write_file(&path, b"some content").unwrap();
        assert_eq!(read_file(&path).unwrap(), b"some content");
        assert!(read_file(&dir.path().join("missing")).is_err());
        assert!(write_file(&dir.path().join("a/b"), b"").is_err());
    }
}
