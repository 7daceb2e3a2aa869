//! Log output for the forwarding engine
//!
//! Device lifecycle and policy loading log at `info!`, per-packet drops at
//! `debug!`/`trace!`. `RUST_LOG` overrides the `[log]` section so a single
//! run can be traced without editing config.toml.

use serde::Deserialize;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Line format written to stderr
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event, span close events included
    Json,
}

impl FromStr for LogFormat {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(()),
        }
    }
}

/// `[log]` in config.toml. Either key may be left out.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default = "default_format")]
    pub format: String,
}

impl LogConfig {
    pub fn new() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }

    pub fn is_known_format(&self) -> bool {
        self.output_format().is_some()
    }

    pub fn is_known_level(&self) -> bool {
        self.max_level().is_some()
    }

    pub fn output_format(&self) -> Option<LogFormat> {
        self.format.parse().ok()
    }

    /// Most verbose level enabled; `off` silences uproxy entirely.
    pub fn max_level(&self) -> Option<LevelFilter> {
        match self.level.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" => Some(LevelFilter::ERROR),
            "warn" => Some(LevelFilter::WARN),
            "info" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

/// Filter from `RUST_LOG` when set, else from `[log] level`.
/// Unknown levels fall back to `info` (validation reports them).
fn build_filter(config: Option<&LogConfig>) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let level = config
        .and_then(LogConfig::max_level)
        .unwrap_or(LevelFilter::INFO);
    EnvFilter::new(level.to_string())
}

/// Install the global subscriber. A second call keeps the first one.
pub fn init_logging(config: Option<&LogConfig>) {
    let filter = build_filter(config);
    let format = config
        .and_then(LogConfig::output_format)
        .unwrap_or_default();

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).try_init(),
    };
    if installed.is_err() {
        tracing::debug!("Logging already initialized");
    }
}
