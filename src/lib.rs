//! The flatfs library.
//!
//! This crate keeps a whole tree of directories and files inside a single
//! host file. The storage engine lives in the [`archive`] module, with
//! [`Archive`] as its entry point. The remaining modules make up the
//! command line tool. The application itself, via `main.rs`, is only a
//! very tiny frontend.

pub use self::archive::{Archive, ArchiveOptions};
pub use self::config::Config;
pub use self::error::{ExitError, Failed};
pub use self::operation::Operation;

pub mod archive;
pub mod config;
pub mod error;
pub mod log;
pub mod operation;
pub mod utils;
