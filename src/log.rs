//! Structured logging for the scheduler.
//!
//! Log levels:
//! - ERROR: Subscriber failures, tasks failing, pool workers dying
//! - WARN: Rejected transitions, stuck batches, misuse that is reported back
//! - INFO: Task lifecycle (created, completed, failed), orchestrator startup/shutdown
//! - DEBUG: Wave dispatch, subscriptions, readiness checks
//! - TRACE: Every emitted signal
//!
//! Each line carries the name of the thread that wrote it, so work running on
//! `conductor-worker-N` can be told apart from the coordinating caller.
//!
//! Nothing is written until `init`/`init_with_path` is called, and the macros
//! skip formatting entirely when their level is filtered out. Debug mode can be
//! enabled by argument or with the `CONDUCTOR_DEBUG=1` env var.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use std::thread;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging to the default location with explicit debug mode.
pub fn init_with_debug(debug: bool) {
    if let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) {
        let _ = std::fs::create_dir_all(&dir);
        init_with_path(dir.join("conductor.log"), debug);
    } else {
        set_level(level_for(debug));
    }
}

/// Initialize logging to an explicit file.
///
/// The file is truncated. The path can only be set once per process; later
/// calls still update the level.
pub fn init_with_path(path: impl AsRef<Path>, debug: bool) {
    set_level(level_for(debug));

    let path = path.as_ref().to_path_buf();
    if LOG_PATH.get().is_none() {
        let _ = std::fs::write(&path, "");
        LOG_PATH.set(path).ok();
    }
}

fn level_for(debug: bool) -> LogLevel {
    let env_debug = std::env::var("CONDUCTOR_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

pub fn set_level(level: LogLevel) {
    LOG_LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn level() -> LogLevel {
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

/// Path of the active log file, if logging was initialized.
pub fn path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}

/// Whether a message at `level` would be written.
pub fn enabled(level: LogLevel) -> bool {
    level <= self::level() && LOG_PATH.get().is_some()
}

/// Write one line at `level`, tagged with the current thread's name.
pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    let Some(path) = LOG_PATH.get() else {
        return;
    };

    let line = format_line(level, thread::current().name().unwrap_or("unnamed"), msg);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
        let _ = writeln!(file, "{}", line);
    }
}

fn format_line(level: LogLevel, thread: &str, msg: &str) -> String {
    let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
    format!("[{}] [{}] [{}] {}", timestamp, thread, level, msg)
}

/// Log at INFO level.
#[macro_export]
macro_rules! clog {
    ($($arg:tt)*) => {
        $crate::clog_at!($crate::log::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! clog_error {
    ($($arg:tt)*) => {
        $crate::clog_at!($crate::log::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! clog_warn {
    ($($arg:tt)*) => {
        $crate::clog_at!($crate::log::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! clog_debug {
    ($($arg:tt)*) => {
        $crate::clog_at!($crate::log::LogLevel::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! clog_trace {
    ($($arg:tt)*) => {
        $crate::clog_at!($crate::log::LogLevel::Trace, $($arg)*)
    };
}

/// Log at an explicit level; the message is only formatted when enabled.
#[macro_export]
macro_rules! clog_at {
    ($level:expr, $($arg:tt)*) => {{
        let level = $level;
        if $crate::log::enabled(level) {
            $crate::log::log_at(level, &format!($($arg)*));
        }
    }};
}
