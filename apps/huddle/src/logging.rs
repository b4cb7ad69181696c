//! Process-wide tracing setup for the CLI.
//!
//! Every library target lives under `huddle::`, so the `--log-level` flag
//! maps onto that prefix while third-party crates stay at info or quieter.
//! `HUDDLE_LOG_FILTER` replaces the computed filter wholesale.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

const FILTER_ENV: &str = "HUDDLE_LOG_FILTER";
const TRACE_DEPS_ENV: &str = "HUDDLE_TRACE_DEPS";

/// Crates whose debug output drowns the session's own events.
const CHATTY_TARGETS: &[&str] = &[
    "tokio_tungstenite",
    "tungstenite",
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
    "interceptor",
    "mio",
];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    fn verbose(self) -> bool {
        self >= LogLevel::Debug
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("cannot open log file {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("invalid HUDDLE_LOG_FILTER: {0}")]
    Filter(String),
    #[error("a global subscriber is already installed: {0}")]
    Subscriber(String),
}

// Set once the subscriber is installed; dropping the guard would stop the
// background writer, so it lives for the whole process.
static WRITER_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Calling it again is a no-op.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if WRITER_GUARD.get().is_some() {
        return Ok(());
    }
    let filter = match std::env::var(FILTER_ENV) {
        Ok(custom) => {
            EnvFilter::try_new(&custom).map_err(|err| InitError::Filter(err.to_string()))?
        }
        Err(_) => EnvFilter::new(directives(config.level, dependency_traces_requested())),
    };
    let (writer, guard) = open_writer(config.file.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level.verbose())
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Subscriber(err.to_string()))?;

    let _ = WRITER_GUARD.set(guard);
    Ok(())
}

fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    let Some(path) = file else {
        return Ok(tracing_appender::non_blocking(io::stderr()));
    };
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| InitError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(tracing_appender::non_blocking(file))
}

/// Filter for `level`. At debug and trace the chatty dependencies are held
/// at warn unless `allow_deps` is set.
fn directives(level: LogLevel, allow_deps: bool) -> String {
    let mut filter = if level.verbose() {
        format!("info,huddle={}", level.directive())
    } else {
        level.directive().to_owned()
    };
    if level.verbose() && !allow_deps {
        for target in CHATTY_TARGETS {
            filter.push_str(&format!(",{target}=warn"));
        }
    }
    filter
}

fn dependency_traces_requested() -> bool {
    std::env::var(TRACE_DEPS_ENV).is_ok_and(|value| !value.is_empty() && value != "0")
}
