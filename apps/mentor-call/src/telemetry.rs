//! Logging setup for the `mentor-call` binary.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Calling it again is a no-op.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

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

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(config.level.to_filter()))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

fn build_env_filter(level: LevelFilter) -> EnvFilter {
    if let Ok(filter) = std::env::var("MENTOR_CALL_LOG_FILTER") {
        return EnvFilter::new(filter);
    }
    EnvFilter::new(default_filter_for(level))
}

const NOISY_DEPENDENCIES: &[&str] = &["webrtc_ice", "webrtc_mdns", "webrtc_srtp", "tungstenite"];

fn default_filter_for(level: LevelFilter) -> String {
    let base = match level {
        LevelFilter::TRACE => "info,mentor_call_core=trace,mentor_call=trace",
        LevelFilter::DEBUG => "info,mentor_call_core=debug,mentor_call=debug",
        LevelFilter::INFO => "info",
        LevelFilter::WARN => "warn",
        LevelFilter::ERROR => "error",
        LevelFilter::OFF => "off",
    };
    if level < LevelFilter::DEBUG {
        return base.to_owned();
    }
    let mut filter = base.to_owned();
    for target in NOISY_DEPENDENCIES {
        filter.push(',');
        filter.push_str(target);
        filter.push_str("=warn");
    }
    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_filter_quiets_webrtc_internals() {
        let filter = default_filter_for(LevelFilter::DEBUG);
        assert!(filter.starts_with("info,mentor_call_core=debug"));
        assert!(filter.contains("webrtc_ice=warn"));
    }

    #[test]
    fn info_filter_is_plain() {
        assert_eq!(default_filter_for(LevelFilter::INFO), "info");
    }
}
