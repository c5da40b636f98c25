//! Logging.

use std::{fs, io, process};
use std::io::Write;
use std::ops::DerefMut;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use chrono::{DateTime, Local};
use log::{LevelFilter, error};
use crate::config::{Config, LogTarget};
use crate::error::Failed;


//------------ Logger --------------------------------------------------------

/// Format and write log messages.
pub struct Logger {
    /// Where to write messages to.
    target: Mutex<LogBackend>,

    /// The maximum log level.
    log_level: log::LevelFilter,
}

/// The actual target for logging
enum LogBackend {
    File {
        file: fs::File,
        path: PathBuf,
    },
    Stderr {
        stderr: io::Stderr,
    }
}

impl Logger {
    /// Initialize logging.
    ///
    /// All diagnostic output of flatfs is done via logging, never to
    /// stderr directly. Thus, it is important to initialize logging before
    /// doing anything else that may result in such output. This function
    /// does exactly that. It sets a maximum log level of `warn`, leading
    /// only printing important information, and directs all logging to
    /// stderr.
    pub fn init() -> Result<(), Failed> {
        log::set_max_level(LevelFilter::Warn);
        if let Err(err) = log::set_logger(&GLOBAL_LOGGER) {
            eprintln!("Failed to initialize logger: {err}.\nAborting.");
            return Err(Failed)
        }
        Ok(())
    }

    /// Switches logging to the configured target.
    ///
    /// Once the configuration has been successfully loaded, logging should
    /// be switched to whatever the user asked for via this method.
    pub fn switch_logging(config: &Config) -> Result<(), Failed> {
        let logger = Logger::new(config)?;
        GLOBAL_LOGGER.switch(logger);
        log::set_max_level(config.log_level);
        Ok(())
    }

    /// Creates a new logger from config.
    fn new(config: &Config) -> Result<Self, Failed> {
        let target = match config.log_target {
            LogTarget::File(ref path) => {
                Self::new_file_target(path.clone())?
            }
            LogTarget::Stderr => {
                LogBackend::Stderr { stderr: io::stderr() }
            }
        };
        Ok(Self {
            target: Mutex::new(target),
            log_level: config.log_level,
        })
    }

    fn new_file_target(path: PathBuf) -> Result<LogBackend, Failed> {
        Ok(LogBackend::File {
            file: match Self::open_log_file(&path) {
                Ok(file) => file,
                Err(err) => {
                    error!(
                        "Failed to open log file '{}': {}",
                        path.display(), err
                    );
                    return Err(Failed)
                }
            },
            path
        })
    }

    /// Opens a log file.
    fn open_log_file(path: &Path) -> Result<fs::File, io::Error> {
        fs::OpenOptions::new().create(true).append(true).open(path)
    }

    /// Acquires the backend.
    fn backend(&self) -> MutexGuard<LogBackend> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Logs a message.
    ///
    /// This method may exit the whole process if logging fails.
    fn log(&self, record: &log::Record) {
        if self.should_ignore(record) {
            return;
        }
        if let Err(err) = self.try_log(record) {
            self.log_failure(err);
        }
    }

    /// Tries logging a message and returns an error if there is one.
    fn try_log(&self, record: &log::Record) -> Result<(), io::Error> {
        match self.backend().deref_mut() {
            LogBackend::File { ref mut file, .. } => {
                writeln!(
                    file, "[{}] [{}] {}",
                    format_timestamp(Local::now()),
                    record.level(),
                    record.args()
                )
            }
            LogBackend::Stderr { ref mut stderr } => {
                // We never fail when writing to stderr.
                let _ = writeln!(
                    stderr, "[{}] {}", record.level(), record.args()
                );
                Ok(())
            }
        }
    }

    /// Handles an error that happened during logging.
    fn log_failure(&self, err: io::Error) -> ! {
        // We try to write a meaningful message to stderr and then abort.
        if let LogBackend::File { ref path, .. } = *self.backend() {
            eprintln!(
                "Logging to file {} failed: {}. Exiting.",
                path.display(),
                err
            );
        }
        process::exit(1)
    }

    /// Flushes the logging backend.
    fn flush(&self) {
        match self.backend().deref_mut() {
            LogBackend::File { ref mut file, .. } => {
                let _ = file.flush();
            }
            LogBackend::Stderr { ref mut stderr } => {
                let _  = stderr.lock().flush();
            }
        }
    }

    /// Determines whether a log record should be ignored.
    ///
    /// Block level tracing is very chatty. It is only shown when the
    /// trace level was asked for explicitly.
    fn should_ignore(&self, record: &log::Record) -> bool {
        record.level() > log::Level::Debug
            && self.log_level < log::LevelFilter::Trace
    }
}


//------------ GlobalLogger --------------------------------------------------

/// The global logger.
///
/// A value of this type can go into a static. Until a proper logger is
/// installed, it just writes all log output to stderr.
struct GlobalLogger {
    /// The real logger. Can only be set once.
    inner: OnceLock<Logger>,
}

/// The static for the log crate.
static GLOBAL_LOGGER: GlobalLogger = GlobalLogger::new();

impl GlobalLogger {
    /// Creates a new provisional logger.
    const fn new() -> Self {
        GlobalLogger { inner: OnceLock::new() }
    }

    /// Switches to the proper logger.
    fn switch(&self, logger: Logger) {
        if self.inner.set(logger).is_err() {
            panic!("Tried to switch logger more than once.")
        }
    }
}


impl log::Log for GlobalLogger {
    fn enabled(&self, _: &log::Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &log::Record<'_>) {
        match self.inner.get() {
            Some(logger) => logger.log(record),
            None => {
                let _ = writeln!(
                    io::stderr().lock(), "[{}] {}",
                    record.level(), record.args()
                );
            }
        }
    }

    fn flush(&self) {
        if let Some(logger) = self.inner.get() {
            logger.flush()
        }
    }
}


//------------ Helpers -------------------------------------------------------

/// Formats a timestamp for the log file.
fn format_timestamp(when: DateTime<Local>) -> String {
    when.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
}


//============ Testing =======================================================

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use super::*;

    #[test]
    fn timestamps() {
        let when = Local.with_ymd_and_hms(2021, 6, 4, 12, 6, 7).unwrap();
        let res = format_timestamp(when);
        assert!(res.starts_with("2021-06-04T12:06:07.000"), "{}", res);
    }

    #[test]
    fn trace_needs_trace_level() {
        let logger = Logger {
            target: Mutex::new(LogBackend::Stderr { stderr: io::stderr() }),
            log_level: LevelFilter::Debug,
        };
        let trace = log::Record::builder().level(log::Level::Trace).build();
        let debug = log::Record::builder().level(log::Level::Debug).build();
        assert!(logger.should_ignore(&trace));
        assert!(!logger.should_ignore(&debug));
    }
}
