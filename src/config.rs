//! Runtime configuration, read from `METRICHUB_*` environment variables.

use std::env;
use std::fs;
use std::path::PathBuf;

use thiserror::Error;

use crate::classifier::ThresholdConfig;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 8080;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_URL: &str = "sqlite:metrichub.db?mode=rwc";

const DEFAULT_MIN_SAMPLES: usize = 5;
const DEFAULT_CACHE_CAPACITY: usize = 256;
const DEFAULT_WINDOW_ALIGNMENT_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse thresholds: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings the engine itself consumes.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Benchmark bands for the classifier.
    pub thresholds: ThresholdConfig,

    /// Samples every metric needs before a window counts as high quality.
    pub min_samples: usize,

    /// Cached metric windows kept before the cache is flushed.
    pub cache_capacity: usize,

    /// Rolling windows end on a multiple of this many seconds, so repeated
    /// polls within the same slot share a cached window.
    pub window_alignment_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            thresholds: ThresholdConfig::default(),
            min_samples: DEFAULT_MIN_SAMPLES,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            window_alignment_secs: DEFAULT_WINDOW_ALIGNMENT_SECS,
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Numeric settings fall back to their defaults when unset or unparsable.
    /// A thresholds file that is named but unreadable or invalid is an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port: u16 = lookup("METRICHUB_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let database_url =
            lookup("METRICHUB_DATABASE_URL").unwrap_or_else(|| DEFAULT_DB_URL.to_string());

        let thresholds = match lookup("METRICHUB_THRESHOLDS_PATH") {
            Some(path) => {
                let path = PathBuf::from(path);
                let json = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
                ThresholdConfig::from_json(&json)?
            }
            None => ThresholdConfig::default(),
        };

        let min_samples = lookup("METRICHUB_MIN_SAMPLES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MIN_SAMPLES);

        let cache_capacity = lookup("METRICHUB_CACHE_CAPACITY")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_CACHE_CAPACITY);

        let window_alignment_secs = lookup("METRICHUB_WINDOW_ALIGNMENT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &i64| *secs > 0)
            .unwrap_or(DEFAULT_WINDOW_ALIGNMENT_SECS);

        Ok(Self {
            port,
            database_url,
            engine: EngineConfig {
                thresholds,
                min_samples,
                cache_capacity,
                window_alignment_secs,
            },
        })
    }
}
