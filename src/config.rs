//! Configuration.
//!
//! This module primarily contains the type [`Config`] that holds all the
//! configuration used by flatfs. It can be loaded both from a TOML
//! formatted config file and command line options.

use std::{env, fmt, fs};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use clap::{Command, Args, ArgAction, ArgMatches, FromArgMatches, Parser};
use dirs::home_dir;
use log::{LevelFilter, error};
use crate::archive::{
    ArchiveOptions, LayoutKind, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BLOCKS,
    DEFAULT_MAX_FILE_SIZE,
};
use crate::archive::superblock::{check_block_size, check_max_file_size};
use crate::error::Failed;


//------------ Defaults for Some Values --------------------------------------

/// The name of the config file in the home directory.
const HOME_CONFIG: &str = ".flatfs.conf";

/// The smallest number of blocks we allow for the cache.
const MIN_CACHE_BLOCKS: usize = 4;


//------------ Config --------------------------------------------------------

/// flatfs configuration.
///
/// All values are public and can be accessed directly.
///
/// The function [`config_args`][Self::config_args] can be used to add the
/// global options to a clap command. Its matches can then be used to create
/// the config via [`from_arg_matches`][Self::from_arg_matches]. Finally,
/// [`to_toml`][Self::to_toml] produces a TOML value that contains a config
/// file content representing the current configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// The block size for new archives.
    pub block_size: u32,

    /// The maximum file size for new archives.
    pub max_file_size: u64,

    /// The number of blocks to keep in the cache.
    pub cache_blocks: usize,

    /// The unused map layout for new archives.
    pub layout: LayoutKind,

    /// The log level filter for setting up logging.
    pub log_level: LevelFilter,

    /// The target to send log messages to.
    pub log_target: LogTarget,
}


impl Config {
    /// Adds the basic arguments to a clap command.
    ///
    /// The function follows clap’s builder pattern: it takes a command,
    /// adds a bunch of arguments to it and returns it at the end.
    pub fn config_args(app: Command) -> Command {
        GlobalArgs::augment_args(app)
    }

    /// Creates a configuration from command line matches.
    ///
    /// The function attempts to create configuration from the command line
    /// arguments provided via `matches`. It will try to read a config file
    /// if provided via the config file option (`-c` or `--config`) or a
    /// file in `$HOME/.flatfs.conf` otherwise. If the latter doesn’t
    /// exist either, starts with a default configuration.
    ///
    /// All relative paths given in command line arguments will be interpreted
    /// relative to `cur_dir`. Conversely, paths in the config file are
    /// treated as relative to the config file’s directory.
    pub fn from_arg_matches(
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<Self, Failed> {
        let mut res = Self::create_base_config(
            Self::path_value_of(matches, "config", cur_dir)
                .as_ref().map(AsRef::as_ref)
        )?;
        res.apply_arg_matches(matches, cur_dir)?;
        Ok(res)
    }

    /// Applies the command line arguments to a configuration.
    fn apply_arg_matches(
        &mut self,
        matches: &ArgMatches,
        cur_dir: &Path,
    ) -> Result<(), Failed> {
        let args = match GlobalArgs::from_arg_matches(matches) {
            Ok(args) => args,
            Err(err) => {
                error!("Failed to process command line arguments: {}", err);
                return Err(Failed)
            }
        };

        if let Some(size) = args.block_size {
            self.block_size = size
        }
        if let Some(size) = args.max_file_size {
            self.max_file_size = size
        }
        if let Some(count) = args.cache_blocks {
            self.cache_blocks = count
        }
        if let Some(layout) = args.layout {
            self.layout = layout
        }

        // log_level
        if args.verbose > 1 {
            self.log_level = LevelFilter::Debug
        }
        else if args.verbose == 1 {
            self.log_level = LevelFilter::Info
        }
        else if args.quiet > 1 {
            self.log_level = LevelFilter::Off
        }
        else if args.quiet == 1 {
            self.log_level = LevelFilter::Error
        }

        // log_target
        if let Some(file) = args.logfile.as_ref() {
            if file == "-" {
                self.log_target = LogTarget::Stderr
            }
            else {
                self.log_target = LogTarget::File(cur_dir.join(file))
            }
        }

        self.check()
    }

    /// Checks that the archive parameters are usable.
    fn check(&self) -> Result<(), Failed> {
        if let Err(err) = check_block_size(self.block_size) {
            error!("Failed: {}.", err);
            return Err(Failed)
        }
        if let Err(err) = check_max_file_size(self.max_file_size) {
            error!("Failed: {}.", err);
            return Err(Failed)
        }
        if self.cache_blocks < MIN_CACHE_BLOCKS {
            error!(
                "Failed: the cache needs at least {} blocks.",
                MIN_CACHE_BLOCKS
            );
            return Err(Failed)
        }
        Ok(())
    }

    /// Returns a path value in arg matches.
    ///
    /// This expands a relative path based on the given directory.
    fn path_value_of(
        matches: &ArgMatches,
        key: &str,
        dir: &Path
    ) -> Option<PathBuf> {
        matches.get_one::<PathBuf>(key).map(|path| dir.join(path))
    }

    /// Creates the correct base configuration for the given config file path.
    ///
    /// If no config path is given, tries to read the default config in
    /// `$HOME/.flatfs.conf`. If that doesn’t exist, creates a default
    /// config.
    fn create_base_config(path: Option<&Path>) -> Result<Self, Failed> {
        let file = match path {
            Some(path) => {
                match ConfigFile::read(path)? {
                    Some(file) => file,
                    None => {
                        error!("Cannot read config file {}", path.display());
                        return Err(Failed);
                    }
                }
            }
            None => {
                match home_dir() {
                    Some(dir) => match ConfigFile::read(
                                            &dir.join(HOME_CONFIG))? {
                        Some(file) => file,
                        None => return Ok(Self::default()),
                    }
                    None => return Ok(Self::default())
                }
            }
        };
        Self::from_config_file(file)
    }

    /// Creates a base config from a config file.
    fn from_config_file(mut file: ConfigFile) -> Result<Self, Failed> {
        let log_target = Self::log_target_from_config_file(&mut file)?;
        let res = Config {
            block_size: {
                file.take_u32("block-size")?.unwrap_or(DEFAULT_BLOCK_SIZE)
            },
            max_file_size: {
                file.take_u64("max-file-size")?
                    .unwrap_or(DEFAULT_MAX_FILE_SIZE)
            },
            cache_blocks: {
                file.take_usize("cache-blocks")?
                    .unwrap_or(DEFAULT_CACHE_BLOCKS)
            },
            layout: file.take_from_str("layout")?.unwrap_or_default(),
            log_level: {
                file.take_from_str("log-level")?.unwrap_or(LevelFilter::Warn)
            },
            log_target,
        };
        file.check_exhausted()?;
        res.check()?;
        Ok(res)
    }

    /// Determines the logging target from the config file.
    fn log_target_from_config_file(
        file: &mut ConfigFile
    ) -> Result<LogTarget, Failed> {
        let log_target = file.take_string("log")?;
        let log_file = file.take_path("log-file")?;
        match log_target.as_ref().map(AsRef::as_ref) {
            Some("stderr") | None => Ok(LogTarget::Stderr),
            Some("file") => {
                match log_file {
                    Some(file) => Ok(LogTarget::File(file)),
                    None => {
                        error!(
                            "Failed in config file {}: \
                             log target \"file\" requires 'log-file' value.",
                            file.path.display()
                        );
                        Err(Failed)
                    }
                }
            }
            Some(value) => {
                error!(
                    "Failed in config file {}: \
                     invalid log target '{}'",
                     file.path.display(),
                     value
                );
                Err(Failed)
            }
        }
    }

    /// Returns the options for creating or opening archives.
    pub fn archive_options(&self) -> ArchiveOptions {
        ArchiveOptions {
            block_size: self.block_size,
            max_file_size: self.max_file_size,
            cache_blocks: self.cache_blocks,
            layout: self.layout,
        }
    }

    /// Returns a TOML representation of the config.
    pub fn to_toml(&self) -> toml::Value {
        let mut res = toml::value::Table::new();
        res.insert(
            "block-size".into(), i64::from(self.block_size).into()
        );
        res.insert(
            "max-file-size".into(), (self.max_file_size as i64).into()
        );
        res.insert(
            "cache-blocks".into(), (self.cache_blocks as i64).into()
        );
        res.insert("layout".into(), self.layout.as_str().into());
        res.insert("log-level".into(), self.log_level.to_string().into());
        match self.log_target {
            LogTarget::Stderr => {
                res.insert("log".into(), "stderr".into());
            }
            LogTarget::File(ref file) => {
                res.insert("log".into(), "file".into());
                res.insert(
                    "log-file".into(),
                    file.display().to_string().into()
                );
            }
        }
        res.into()
    }
}


//--- Default

impl Default for Config {
    fn default() -> Self {
        Config {
            block_size: DEFAULT_BLOCK_SIZE,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            cache_blocks: DEFAULT_CACHE_BLOCKS,
            layout: LayoutKind::default(),
            log_level: LevelFilter::Warn,
            log_target: LogTarget::default(),
        }
    }
}


//--- Display

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_toml())
    }
}


//------------ LogTarget -----------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum LogTarget {
    /// Stderr.
    #[default]
    Stderr,

    /// A file.
    ///
    /// The argument is the file name.
    File(PathBuf)
}


//------------ GlobalArgs ----------------------------------------------------

/// The global command line arguments.
#[derive(Clone, Debug, Parser)]
struct GlobalArgs {
    /// Read base configuration from this file
    #[arg(short, long, value_name="PATH")]
    config: Option<PathBuf>,

    /// Block size for new archives
    #[arg(short, long, value_name = "BYTES")]
    block_size: Option<u32>,

    /// Maximum file size for new archives
    #[arg(short, long, value_name = "BYTES")]
    max_file_size: Option<u64>,

    /// Number of blocks to keep in memory
    #[arg(long, value_name = "COUNT")]
    cache_blocks: Option<usize>,

    /// Unused map layout for new archives ("shared" or "typed")
    #[arg(long, value_name = "LAYOUT")]
    layout: Option<LayoutKind>,

    /// Log more information, twice for even more
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Log less information, twice for no information
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,

    /// Log to this file
    #[arg(long, value_name = "PATH")]
    logfile: Option<String>,
}


//------------ ConfigFile ----------------------------------------------------

/// The content of a config file.
///
/// This is a thin wrapper around `toml::Table` to make dealing with it more
/// convenient.
#[derive(Clone, Debug)]
struct ConfigFile {
    /// The content of the file.
    content: toml::value::Table,

    /// The path to the config file.
    path: PathBuf,

    /// The directory we found the file in.
    ///
    /// This is used in relative paths.
    dir: PathBuf,
}

impl ConfigFile {
    /// Reads the config file at the given path.
    ///
    /// If there is no such file, returns `None`. If there is a file but it
    /// is broken, aborts.
    fn read(path: &Path) -> Result<Option<Self>, Failed> {
        let mut file = match fs::File::open(path) {
            Ok(file) => file,
            Err(_) => return Ok(None)
        };
        let mut config = String::new();
        if let Err(err) = file.read_to_string(&mut config) {
            error!(
                "Failed to read config file {}: {}",
                path.display(), err
            );
            return Err(Failed);
        }
        Self::parse(&config, path).map(Some)
    }

    /// Parses the content of the file from a string.
    fn parse(content: &str, path: &Path) -> Result<Self, Failed> {
        let content = match toml::from_str(content) {
            Ok(toml::Value::Table(content)) => content,
            Ok(_) => {
                error!(
                    "Failed to parse config file {}: Not a mapping.",
                    path.display()
                );
                return Err(Failed);
            }
            Err(err) => {
                error!(
                    "Failed to parse config file {}: {}",
                    path.display(), err
                );
                return Err(Failed);
            }
        };
        let path = if path.is_relative() {
            match env::current_dir() {
                Ok(dir) => dir.join(path),
                Err(err) => {
                    error!(
                        "Fatal: Can't determine current directory: {}.",
                        err
                    );
                    return Err(Failed);
                }
            }
        }
        else {
            path.into()
        };
        let dir = path.parent().map(Into::into).unwrap_or_default();
        Ok(ConfigFile { content, path, dir })
    }

    /// Takes an unsigned integer value from the config file.
    ///
    /// The value is taken from the given `key`. Returns `Ok(None)` if there
    /// is no such key. Returns an error if the key exists but the value
    /// isn’t an integer or if it is negative.
    fn take_u64(&mut self, key: &str) -> Result<Option<u64>, Failed> {
        match self.content.remove(key) {
            Some(value) => {
                if let toml::Value::Integer(res) = value {
                    if res < 0 {
                        error!(
                            "Failed in config file {}: \
                            '{}' expected to be a positive integer.",
                            self.path.display(), key
                        );
                        Err(Failed)
                    }
                    else {
                        Ok(Some(res as u64))
                    }
                }
                else {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be an integer.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a 32 bit unsigned integer value from the config file.
    fn take_u32(&mut self, key: &str) -> Result<Option<u32>, Failed> {
        match self.take_u64(key)? {
            Some(value) => match u32::try_from(value) {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    error!(
                        "Failed in config file {}: \
                         value for '{}' is too large.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes an unsigned integer value from the config file.
    fn take_usize(&mut self, key: &str) -> Result<Option<usize>, Failed> {
        match self.take_u64(key)? {
            Some(value) => match usize::try_from(value) {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    error!(
                        "Failed in config file {}: \
                         value for '{}' is too large.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a string value from the config file.
    ///
    /// The value is taken from the given `key`. Returns `Ok(None)` if there
    /// is no such key. Returns an error if the key exists but the value
    /// isn’t a string.
    fn take_string(&mut self, key: &str) -> Result<Option<String>, Failed> {
        match self.content.remove(key) {
            Some(value) => {
                if let toml::Value::String(res) = value {
                    Ok(Some(res))
                }
                else {
                    error!(
                        "Failed in config file {}: \
                         '{}' expected to be a string.",
                        self.path.display(), key
                    );
                    Err(Failed)
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a string encoded value from the config file.
    ///
    /// The value is taken from the given `key`. It is expected to be a
    /// string and will be converted to the final type via `FromStr::from_str`.
    ///
    /// Returns `Ok(None)` if the key doesn’t exist. Returns an error if the
    /// key exists but the value isn’t a string or conversion fails.
    fn take_from_str<T>(&mut self, key: &str) -> Result<Option<T>, Failed>
    where T: FromStr, T::Err: fmt::Display {
        match self.take_string(key)? {
            Some(value) => {
                match T::from_str(&value) {
                    Ok(some) => Ok(Some(some)),
                    Err(err) => {
                        error!(
                            "Failed in config file {}: \
                             illegal value in '{}': {}.",
                            self.path.display(), key, err
                        );
                        Err(Failed)
                    }
                }
            }
            None => Ok(None)
        }
    }

    /// Takes a path value from the config file.
    ///
    /// The path is taken from the given `key`. It must be a string value.
    /// It is treated as relative to the directory of the config file.
    fn take_path(&mut self, key: &str) -> Result<Option<PathBuf>, Failed> {
        self.take_string(key).map(|opt| opt.map(|path| self.dir.join(path)))
    }

    /// Checks whether the config file is now empty.
    ///
    /// If it isn’t, logs a complaint and returns an error.
    fn check_exhausted(&self) -> Result<(), Failed> {
        if !self.content.is_empty() {
            let keys: Vec<_> = self.content.keys().map(
                String::as_str
            ).collect();
            error!(
                "Failed in config file {}: Unknown settings {}.",
                self.path.display(), keys.join(",")
            );
            Err(Failed)
        }
        else {
            Ok(())
        }
    }
}


//============ Tests =========================================================
