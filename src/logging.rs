use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strum::{FromRepr, IntoStaticStr};

// log macros to check if log and log channel is enabled before performing potentially expensive string formatting
macro_rules! log {
    ($log:expr, $($arg:tt)*) => {
        $log.log(&format!($($arg)*));
    };
}
macro_rules! verbose {
    ($log:expr, $($arg:tt)*) => {
        if $log.verbose_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}
macro_rules! debug {
    ($log:expr, $($arg:tt)*) => {
        if $log.debug_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}

pub(crate) use debug;
pub(crate) use log;
pub(crate) use verbose;

/// Severity of a message collected during a save or a key calculation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromRepr, IntoStaticStr, Serialize, Deserialize)]
#[repr(u8)]
pub enum ELogVerbosity {
    Error = 2,
    Warning = 3,
    Display = 4,
    Log = 5,
    Verbose = 6,
}

/// Message list returned next to a success flag instead of being printed immediately
pub type FMessages = Vec<(ELogVerbosity, String)>;

#[derive(Default)]
pub struct Log {
    verbose: bool,
    debug: bool,
    quiet: bool,
    progress: Arc<Mutex<Option<indicatif::ProgressBar>>>,
}
impl Log {
    pub fn new(verbose: bool, debug: bool) -> Self {
        Self {
            verbose,
            debug,
            ..Default::default()
        }
    }
    /// Log that swallows everything, used by tests and library callers that only want the returned messages
    pub fn no_log() -> Self {
        Self {
            quiet: true,
            ..Default::default()
        }
    }
    pub fn set_progress(&self, progress: Option<&indicatif::ProgressBar>) {
        if let Ok(mut lock) = self.progress.lock() {
            *lock = progress.cloned();
        }
    }
    pub fn log(&self, msg: &str) {
        if self.quiet {
            return;
        }
        match self.progress.lock().ok().as_deref() {
            Some(Some(progress)) => progress.println(msg),
            _ => println!("{msg}"),
        }
    }
    /// Prints a collected message at a level matching its verbosity
    pub fn message(&self, verbosity: ELogVerbosity, msg: &str) {
        match verbosity {
            ELogVerbosity::Error | ELogVerbosity::Warning | ELogVerbosity::Display => {
                let level: &'static str = verbosity.into();
                log!(self, "{level}: {msg}");
            }
            ELogVerbosity::Log => verbose!(self, "{msg}"),
            ELogVerbosity::Verbose => debug!(self, "{msg}"),
        }
    }
    pub fn verbose_enabled(&self) -> bool {
        self.verbose || self.debug
    }
    pub fn debug_enabled(&self) -> bool {
        self.debug
    }
}
