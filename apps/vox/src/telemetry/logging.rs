//! Global `tracing` subscriber for the CLI.
//!
//! Verbose levels apply to this crate only; WebRTC and WebSocket internals
//! stay at `info` unless dependency traces are asked for or an explicit
//! filter replaces the computed one.

use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

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
            LogLevel::Debug => "info,vox_client_core=debug,vox=debug",
            LogLevel::Trace => "info,vox_client_core=trace,vox=trace",
        }
    }
}

/// Targets held at `info` under `debug`/`trace`.
const QUIET_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_srtp",
    "webrtc_sctp",
    "webrtc_mdns",
    "interceptor",
    "tokio_tungstenite",
    "tungstenite",
    "mio",
];

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// Full `EnvFilter` directive string; replaces the level-derived one.
    pub filter: Option<String>,
    pub trace_dependencies: bool,
}

impl LogConfig {
    pub fn filter_directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let mut directives = self.level.directive().to_owned();
        if self.level >= LogLevel::Debug && !self.trace_dependencies {
            for target in QUIET_DEPENDENCIES {
                directives.push_str(&format!(",{target}=info"));
            }
        }
        directives
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(String),
    #[error("failed to install logger: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Once one is installed, later calls return
/// `Ok` without touching it.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let filter = EnvFilter::try_new(config.filter_directives())
        .map_err(|err| InitError::Filter(err.to_string()))?;
    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;

    let _ = GUARD.set(guard);
    tracing::debug!(filter = %config.filter_directives(), "logging installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: LogLevel) -> LogConfig {
        LogConfig {
            level,
            ..Default::default()
        }
    }

    #[test]
    fn verbose_levels_keep_dependencies_at_info() {
        let directives = config(LogLevel::Trace).filter_directives();

        assert!(directives.starts_with("info,vox_client_core=trace,vox=trace"));
        assert!(directives.contains(",webrtc_ice=info"));
        assert!(directives.ends_with(",mio=info"));
    }

    #[test]
    fn dependency_traces_lift_the_quiet_list() {
        let mut config = config(LogLevel::Debug);
        config.trace_dependencies = true;

        assert_eq!(config.filter_directives(), "info,vox_client_core=debug,vox=debug");
    }

    #[test]
    fn explicit_filter_wins() {
        let mut config = config(LogLevel::Trace);
        config.filter = Some("webrtc_ice=trace".into());

        assert_eq!(config.filter_directives(), "webrtc_ice=trace");
        assert_eq!(LogConfig::default().filter_directives(), "warn");
    }

    #[test]
    fn bad_filter_is_reported_and_install_happens_once() {
        let mut bad = config(LogLevel::Info);
        bad.filter = Some("vox=loud".into());
        assert!(matches!(init(&bad), Err(InitError::Filter(_))));

        init(&config(LogLevel::Warn)).unwrap();
        init(&config(LogLevel::Trace)).unwrap();
    }
}
