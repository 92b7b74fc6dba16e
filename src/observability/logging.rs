//! Structured logging configuration.

use crate::config::LoggingSettings;
use serde::Deserialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

impl LogFormat {
    /// Parses a format name, falling back to [`LogFormat::Pretty`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Resolved logging configuration.
#[derive(Debug)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Optional log file.
    pub file: Option<PathBuf>,
    /// Event filter.
    pub filter: EnvFilter,
}

impl LoggingConfig {
    /// Builds the logging configuration.
    ///
    /// `RUST_LOG` wins over the configured filter; without either, the level
    /// is `info`, or `debug` when `verbose` is set.
    #[must_use]
    pub fn from_settings(settings: &LoggingSettings, verbose: bool) -> Self {
        let fallback = if verbose { "debug" } else { "info" };
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| {
                settings
                    .filter
                    .as_deref()
                    .map_or_else(|| EnvFilter::try_new(fallback), EnvFilter::try_new)
            })
            .unwrap_or_else(|_| EnvFilter::new(fallback));

        Self {
            format: settings.format,
            file: settings.file.clone(),
            filter,
        }
    }
}
