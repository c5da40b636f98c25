//! What flatfs can do for you.
//!
//! This module implements all the commands users can ask flatfs to
//! perform. They are encapsulated in the type [`Operation`] which can
//! determine the command from the command line argumments and then execute
//! it.

use std::path::{Path, PathBuf};
use clap::{Args, ArgMatches, FromArgMatches, Parser};
use log::error;
use crate::archive::{Archive, ArchiveInfo, ArchiveStats, InodeKind};
use crate::config::Config;
use crate::error::{ExitError, Failed};
use crate::log::Logger;
use crate::utils::fatal;


//------------ Operation -----------------------------------------------------

/// The command to execute.
///
/// This type collects all the commands we have defined plus any possible
/// extra configuration they support.
///
/// You can create a value from the command line arguments. First, you add
/// all necessary sub-commands and arguments to a clap `Command` via
/// [`config_args`][Self::config_args] and then process the argument matches
/// into a value in [`from_arg_matches`][Self::from_arg_matches]. Finally,
/// you can execute the created command through the [`run`][Self::run]
/// method.
pub enum Operation {
    Create(Create),
    Info(Info),
    List(List),
    Mkdir(Mkdir),
    Put(Put),
    Get(Get),
    Remove(Remove),
    Rename(Rename),
    Verify(Verify),
    PrintConfig(PrintConfig),
}

impl Operation {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        let app = Create::config_args(app);
        let app = Info::config_args(app);
        let app = List::config_args(app);
        let app = Mkdir::config_args(app);
        let app = Put::config_args(app);
        let app = Get::config_args(app);
        let app = Remove::config_args(app);
        let app = Rename::config_args(app);
        let app = Verify::config_args(app);
        PrintConfig::config_args(app)
    }

    /// Creates a command from clap matches.
    ///
    /// Relative paths of host files are interpreted relative to `cur_dir`.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let mut res = match matches.subcommand() {
            Some(("create", matches)) => {
                Operation::Create(parse_args(matches)?)
            }
            Some(("info", matches)) => {
                Operation::Info(parse_args(matches)?)
            }
            Some(("ls", matches)) => {
                Operation::List(parse_args(matches)?)
            }
            Some(("mkdir", matches)) => {
                Operation::Mkdir(parse_args(matches)?)
            }
            Some(("put", matches)) => {
                Operation::Put(parse_args(matches)?)
            }
            Some(("get", matches)) => {
                Operation::Get(parse_args(matches)?)
            }
            Some(("rm", matches)) => {
                Operation::Remove(parse_args(matches)?)
            }
            Some(("mv", matches)) => {
                Operation::Rename(parse_args(matches)?)
            }
            Some(("verify", matches)) => {
                Operation::Verify(parse_args(matches)?)
            }
            Some(("config", _)) => {
                Operation::PrintConfig(PrintConfig)
            }
            _ => {
                error!(
                    "Failed: a command is required.\n\
                     \nCommonly used commands are:\
                     \n   create  Creates a new archive\
                     \n   ls      Lists the content of a directory\
                     \n   put     Stores a file in an archive\
                     \n   get     Retrieves a file from an archive\
                     \n\
                     \nSee flatfs -h for a usage summary."
                );
                return Err(Failed)
            }
        };
        res.resolve_paths(cur_dir);
        Ok(res)
    }

    /// Makes all host file paths absolute.
    fn resolve_paths(&mut self, cur_dir: &Path) {
        let archive = match *self {
            Operation::Create(ref mut cmd) => &mut cmd.archive,
            Operation::Info(ref mut cmd) => &mut cmd.archive,
            Operation::List(ref mut cmd) => &mut cmd.archive,
            Operation::Mkdir(ref mut cmd) => &mut cmd.archive,
            Operation::Put(ref mut cmd) => {
                if let Some(input) = cmd.input.as_mut() {
                    *input = cur_dir.join(&*input);
                }
                &mut cmd.archive
            }
            Operation::Get(ref mut cmd) => {
                if let Some(output) = cmd.output.as_mut() {
                    *output = cur_dir.join(&*output);
                }
                &mut cmd.archive
            }
            Operation::Remove(ref mut cmd) => &mut cmd.archive,
            Operation::Rename(ref mut cmd) => &mut cmd.archive,
            Operation::Verify(ref mut cmd) => &mut cmd.archive,
            Operation::PrintConfig(_) => return,
        };
        *archive = cur_dir.join(&*archive);
    }

    /// Runs the command.
    ///
    /// Switches logging to the configured target first.
    pub fn run(self, config: Config) -> Result<(), ExitError> {
        Logger::switch_logging(&config)?;
        match self {
            Operation::Create(cmd) => cmd.run(&config),
            Operation::Info(cmd) => cmd.run(&config),
            Operation::List(cmd) => cmd.run(&config),
            Operation::Mkdir(cmd) => cmd.run(&config),
            Operation::Put(cmd) => cmd.run(&config),
            Operation::Get(cmd) => cmd.run(&config),
            Operation::Remove(cmd) => cmd.run(&config),
            Operation::Rename(cmd) => cmd.run(&config),
            Operation::Verify(cmd) => cmd.run(&config),
            Operation::PrintConfig(cmd) => cmd.run(&config),
        }
    }
}


//------------ Create --------------------------------------------------------

/// Creates a new archive.
#[derive(Clone, Debug, Parser)]
pub struct Create {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,
}

impl Create {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Create::augment_args(
                clap::Command::new("create")
                    .about("Creates a new, empty archive")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let archive = Archive::create(
            &self.archive, &config.archive_options()
        ).map_err(Failed::from)?;
        archive.close().map_err(Failed::from)?;
        Ok(())
    }
}


//------------ Info ----------------------------------------------------------

/// Prints information about an archive.
#[derive(Clone, Debug, Parser)]
pub struct Info {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// Print the information as JSON
    #[arg(long)]
    json: bool,
}

impl Info {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Info::augment_args(
                clap::Command::new("info")
                    .about("Prints information about an archive")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let archive = open_archive(&self.archive, config)?;
        let info = archive.info();
        if self.json {
            print_json(&info)?;
        }
        else {
            println!("Archive {}:", self.archive.display());
            print_info(&info);
        }
        Ok(())
    }
}


//------------ List ----------------------------------------------------------

/// Lists the content of a directory.
#[derive(Clone, Debug, Parser)]
pub struct List {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// The directory inside the archive
    #[arg(value_name = "PATH", default_value = "/")]
    path: String,
}

impl List {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            List::augment_args(
                clap::Command::new("ls")
                    .about("Lists the entries of a directory")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let mut archive = open_archive(&self.archive, config)?;
        let entries = archive.list(&self.path).map_err(Failed::from)?;
        for entry in entries {
            match entry.kind {
                InodeKind::Directory => {
                    println!("{:>12}  {}/", "-", entry.name_lossy())
                }
                InodeKind::File => {
                    let path = join_path(&self.path, &entry.name);
                    let len = archive.len(&path).map_err(Failed::from)?;
                    println!("{:>12}  {}", len, entry.name_lossy())
                }
            }
        }
        Ok(())
    }
}


//------------ Mkdir ---------------------------------------------------------

/// Creates a directory.
#[derive(Clone, Debug, Parser)]
pub struct Mkdir {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// The directory to create
    #[arg(value_name = "PATH")]
    path: String,
}

impl Mkdir {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Mkdir::augment_args(
                clap::Command::new("mkdir")
                    .about("Creates a new directory")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let mut archive = open_archive(&self.archive, config)?;
        archive.mkdir(&self.path).map_err(Failed::from)?;
        archive.close().map_err(Failed::from)?;
        Ok(())
    }
}


//------------ Put -----------------------------------------------------------

/// Stores a file in an archive.
#[derive(Clone, Debug, Parser)]
pub struct Put {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// The file inside the archive
    #[arg(value_name = "PATH")]
    path: String,

    /// Read the content from this file instead of stdin
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,
}

impl Put {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Put::augment_args(
                clap::Command::new("put")
                    .about("Stores a file, replacing existing content")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let content = match self.input {
            Some(ref path) => fatal::read_file(path)?,
            None => fatal::read_stdin()?,
        };
        let mut archive = open_archive(&self.archive, config)?;
        archive.put(&self.path, &content).map_err(Failed::from)?;
        archive.close().map_err(Failed::from)?;
        Ok(())
    }
}


//------------ Get -----------------------------------------------------------

/// Retrieves a file from an archive.
#[derive(Clone, Debug, Parser)]
pub struct Get {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// The file inside the archive
    #[arg(value_name = "PATH")]
    path: String,

    /// Write the content to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

impl Get {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Get::augment_args(
                clap::Command::new("get")
                    .about("Prints the content of a file")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let mut archive = open_archive(&self.archive, config)?;
        let content = archive.get(&self.path).map_err(Failed::from)?;
        match self.output {
            Some(ref path) => fatal::write_file(path, &content)?,
            None => fatal::write_stdout(&content)?,
        }
        Ok(())
    }
}


//------------ Remove --------------------------------------------------------

/// Removes a file or empty directory.
#[derive(Clone, Debug, Parser)]
pub struct Remove {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// The file or directory inside the archive
    #[arg(value_name = "PATH")]
    path: String,
}

impl Remove {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Remove::augment_args(
                clap::Command::new("rm")
                    .about("Removes a file or an empty directory")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let mut archive = open_archive(&self.archive, config)?;
        archive.remove(&self.path).map_err(Failed::from)?;
        archive.close().map_err(Failed::from)?;
        Ok(())
    }
}


//------------ Rename --------------------------------------------------------

/// Moves a file or directory.
#[derive(Clone, Debug, Parser)]
pub struct Rename {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// The current path inside the archive
    #[arg(value_name = "FROM")]
    from: String,

    /// The new path inside the archive
    #[arg(value_name = "TO")]
    to: String,
}

impl Rename {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Rename::augment_args(
                clap::Command::new("mv")
                    .about("Moves a file or directory to a new path")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let mut archive = open_archive(&self.archive, config)?;
        archive.rename(&self.from, &self.to).map_err(Failed::from)?;
        archive.close().map_err(Failed::from)?;
        Ok(())
    }
}


//------------ Verify --------------------------------------------------------

/// Checks an archive for consistency.
#[derive(Clone, Debug, Parser)]
pub struct Verify {
    /// Path to the archive file
    #[arg(value_name = "ARCHIVE")]
    archive: PathBuf,

    /// Print the statistics as JSON
    #[arg(long)]
    json: bool,
}

impl Verify {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            Verify::augment_args(
                clap::Command::new("verify")
                    .about("Checks the consistency of an archive")
            )
        )
    }

    fn run(self, config: &Config) -> Result<(), ExitError> {
        let mut archive = open_archive(&self.archive, config)?;
        match archive.verify() {
            Ok(stats) => {
                if self.json {
                    print_json(&stats)?;
                }
                else {
                    println!("Archive {}:", self.archive.display());
                    print_stats(&stats);
                }
                Ok(())
            }
            Err(err) => {
                error!("Archive is corrupt: {}", err);
                Err(ExitError::Corrupt)
            }
        }
    }
}


//------------ PrintConfig ---------------------------------------------------

/// Shows the current configuration.
pub struct PrintConfig;

impl PrintConfig {
    /// Adds the command configuration to a clap app.
    pub fn config_args(app: clap::Command) -> clap::Command {
        app.subcommand(
            clap::Command::new("config")
                .about("Prints the current config and exits")
        )
    }

    /// Prints the current configuration to stdout and exits.
    fn run(self, config: &Config) -> Result<(), ExitError> {
        println!("{}", config);
        Ok(())
    }
}


//------------ Helpers -------------------------------------------------------

/// Creates a command from its subcommand matches.
fn parse_args<T: FromArgMatches>(matches: &ArgMatches) -> Result<T, Failed> {
    T::from_arg_matches(matches).map_err(|err| {
        error!("Failed to process command line arguments: {}", err);
        Failed
    })
}

/// Opens an existing archive.
fn open_archive(path: &Path, config: &Config) -> Result<Archive, Failed> {
    Archive::open_with_cache(path, config.cache_blocks).map_err(|err| {
        error!("Failed to open archive {}: {}", path.display(), err);
        Failed
    })
}

/// Appends an entry name to a directory path.
fn join_path(dir: &str, name: &[u8]) -> Vec<u8> {
    let mut res = Vec::from(dir.trim_end_matches('/'));
    res.push(b'/');
    res.extend_from_slice(name);
    res
}

/// Prints a value as pretty JSON to stdout.
fn print_json<T: serde::Serialize>(value: &T) -> Result<(), Failed> {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            Ok(())
        }
        Err(err) => {
            error!("Failed to produce JSON output: {}", err);
            Err(Failed)
        }
    }
}

fn print_info(info: &ArchiveInfo) {
    println!("  block size: {}", info.block_size);
    println!("  unused map layout: {}", info.layout);
    println!("  blocks: {} used of {}", info.used_blocks, info.total_blocks);
    println!("  file length: {}", info.file_len);
    println!(
        "  maximum file size: {} (requested {})",
        info.max_file_size_real, info.max_file_size
    );
    println!("  pointer tree depth: {}", info.tree_depth);
}

fn print_stats(stats: &ArchiveStats) {
    print_info(&stats.info);
    println!("  directories: {}", stats.directories);
    println!("  files: {}", stats.files);
    println!("  content bytes: {}", stats.content_bytes);
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    fn operation(args: &[&str]) -> Result<Operation, Failed> {
        let matches = Operation::config_args(
            Config::config_args(clap::Command::new("flatfs"))
        ).get_matches_from(args);
        Operation::from_arg_matches(&matches, Path::new("/test"))
    }

    #[test]
    fn check_args() {
        Operation::config_args(
            Config::config_args(clap::Command::new("flatfs"))
        ).debug_assert();
    }

    #[test]
    fn parse_commands() {
        match operation(&["flatfs", "ls", "a.flfs"]).unwrap() {
            Operation::List(cmd) => {
                assert_eq!(cmd.archive, Path::new("/test/a.flfs"));
                assert_eq!(cmd.path, "/");
            }
            _ => panic!("expected ls command")
        }
        match operation(
            &["flatfs", "put", "/a.flfs", "d/f", "-i", "input"]
        ).unwrap() {
            Operation::Put(cmd) => {
                assert_eq!(cmd.archive, Path::new("/a.flfs"));
                assert_eq!(cmd.path, "d/f");
                assert_eq!(cmd.input.unwrap(), Path::new("/test/input"));
            }
            _ => panic!("expected put command")
        }
        match operation(&["flatfs", "mv", "a.flfs", "x", "y"]).unwrap() {
            Operation::Rename(cmd) => {
                assert_eq!(cmd.from, "x");
                assert_eq!(cmd.to, "y");
            }
            _ => panic!("expected mv command")
        }
        assert!(matches!(
            operation(&["flatfs", "config"]).unwrap(),
            Operation::PrintConfig(_)
        ));
        assert!(operation(&["flatfs"]).is_err());
    }

    #[test]
    fn join_paths() {
        assert_eq!(join_path("/", b"a"), b"/a");
        assert_eq!(join_path("d/", b"a"), b"d/a");
        assert_eq!(join_path("d", b"a"), b"d/a");
    }
}
