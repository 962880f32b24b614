//! Harvest configuration.
//!
//! Values come from an optional YAML file and are then overridden by any
//! command-line flags (see [`crate::cli::Cli`]). Every field has a default,
//! so a config file only needs the keys it wants to change:
//!
//! ```yaml
//! search_term: rust
//! num_articles: 200
//! directory: ./articles
//! download_workers: 40
//! oldest_date: 2020-01-01
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_parse_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Tag whose archive is harvested.
    pub search_term: String,
    /// Accepted articles to collect before stopping discovery.
    pub num_articles: usize,
    pub directory: PathBuf,
    /// Allow writing into a directory that already has files.
    pub force: bool,
    pub minimum_duration_minutes: u32,
    /// Accept articles whose reading time cannot be determined.
    pub lenient: bool,
    /// Archive days requested per discovery call.
    pub days_per_batch: usize,
    pub download_workers: usize,
    pub parse_workers: usize,
    pub queue_capacity: usize,
    pub queue_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    /// Base delay after a failed discovery call; 0 disables backoff.
    pub source_error_backoff_ms: u64,
    /// Failed items kept in the report; 0 only logs them.
    pub dead_letter_capacity: usize,
    pub oldest_date: Option<NaiveDate>,
    pub base_url: String,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            search_term: String::new(),
            num_articles: 100,
            directory: PathBuf::from("articles"),
            force: false,
            minimum_duration_minutes: 5,
            lenient: false,
            days_per_batch: 5,
            download_workers: 20,
            parse_workers: default_parse_workers(),
            queue_capacity: 100,
            queue_timeout_secs: 5,
            poll_interval_secs: 20,
            request_timeout_secs: 15,
            source_error_backoff_ms: 500,
            dead_letter_capacity: 100,
            oldest_date: None,
            base_url: "https://medium.com".to_string(),
        }
    }
}

impl HarvestConfig {
    /// Load a YAML config file.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(?config, "Loaded config file");
        Ok(config)
    }

    /// Reject settings that would leave the pipeline unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.search_term.trim().is_empty() {
            return invalid("search_term must not be empty");
        }
        if self.num_articles == 0 {
            return invalid("num_articles must be greater than zero");
        }
        if self.download_workers == 0 || self.parse_workers == 0 {
            return invalid("worker counts must be greater than zero");
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be greater than zero");
        }
        if self.days_per_batch == 0 {
            return invalid("days_per_batch must be greater than zero");
        }
        if self.queue_timeout_secs == 0 || self.poll_interval_secs == 0 {
            return invalid("timeouts and poll interval must be greater than zero");
        }
        if let Err(e) = url::Url::parse(&self.base_url) {
            return Err(ConfigError::Invalid(format!("base_url: {e}")));
        }
        Ok(())
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn source_error_backoff(&self) -> Duration {
        Duration::from_millis(self.source_error_backoff_ms)
    }
}

/// Parse a `YYYY-MM-DD` command-line value.
pub fn parse_date(value: &str) -> Result<NaiveDate, Box<dyn Error + Send + Sync>> {
    Ok(NaiveDate::parse_from_str(value, "%Y-%m-%d")?)
}
